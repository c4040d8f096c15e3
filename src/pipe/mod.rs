//! Named-pipe transport.
//!
//! Dialing opens `\\.\pipe\<name>` with overlapped I/O and anonymous-level
//! impersonation, retrying every 10 ms while all instances are busy. The
//! resulting [`PipeConnection`] reads and writes through the overlapped
//! engine with per-direction deadlines.
//!
//! Pipes created in message mode additionally speak a half-close
//! convention this crate defines: [`PipeConnection::close_write`] sends a
//! true zero-length message that the peer reads as end-of-stream. Message
//! boundaries themselves are never exposed; `ERROR_MORE_DATA` is folded
//! into plain byte-stream reads.

mod listener;
mod server;

pub use listener::{listen_pipe, PipeListener};

use crate::conn::{Address, Connection};
use crate::engine::{DeadlineKind, OverlappedFile};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_BROKEN_PIPE, ERROR_MORE_DATA, ERROR_PIPE_BUSY,
    ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, FILE_FLAG_OVERLAPPED, OPEN_EXISTING, SECURITY_ANONYMOUS,
    SECURITY_SQOS_PRESENT,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, DisconnectNamedPipe, GetNamedPipeInfo, PIPE_TYPE_MESSAGE,
};

/// Default dial window when the caller does not provide a deadline.
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry interval while every pipe instance is busy.
const PIPE_BUSY_RETRY_WAIT: Duration = Duration::from_millis(10);

// =============================================================================
// Listener Configuration
// =============================================================================

/// Configuration for [`listen_pipe`].
#[derive(Debug, Clone, Default)]
pub struct PipeListenerConfig {
    /// SDDL for the pipe's ACL. Defaults to the system named-pipe ACL
    /// (`RtlDefaultNpAcl`).
    pub security_descriptor: Option<String>,

    /// Create the pipe in message mode. Either way connections read as
    /// byte streams; message mode additionally enables the zero-length
    /// message half-close convention used by `close_write`.
    pub message_mode: bool,

    /// Kernel input buffer size in bytes; zero lets the kernel choose.
    pub input_buffer_size: u32,

    /// Kernel output buffer size in bytes; zero lets the kernel choose.
    pub output_buffer_size: u32,

    /// Number of listener workers and concurrently unbound pipe instances,
    /// like a `listen(2)` backlog. Zero or one selects the legacy behavior
    /// of at most one unbound instance at a time.
    pub queue_size: u32,
}

// =============================================================================
// Dial
// =============================================================================

/// Connects to a named pipe, waiting up to two seconds for a free
/// instance.
pub async fn dial_pipe(path: &str) -> Result<PipeConnection> {
    dial_pipe_deadline(path, Instant::now() + DEFAULT_DIAL_TIMEOUT).await
}

/// Connects to a named pipe, retrying busy instances until `deadline`.
pub async fn dial_pipe_deadline(path: &str, deadline: Instant) -> Result<PipeConnection> {
    let handle = loop {
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        match open_pipe_handle(path) {
            Ok(handle) => break handle,
            Err(code) if code == ERROR_PIPE_BUSY => {
                if Instant::now() + PIPE_BUSY_RETRY_WAIT >= deadline {
                    return Err(Error::PipeBusy {
                        path: path.to_string(),
                    });
                }
                tokio::time::sleep(PIPE_BUSY_RETRY_WAIT).await;
            }
            Err(code) => {
                return Err(Error::syscall_code("CreateFile", code).wrap("open", path));
            }
        }
    };

    // Message-mode pipes get the zero-length-message EOF adapter.
    let mut flags = 0u32;
    let ok = unsafe {
        GetNamedPipeInfo(
            handle as _,
            &mut flags,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        let err = Error::syscall("GetNamedPipeInfo", std::io::Error::last_os_error());
        unsafe { CloseHandle(handle as _) };
        return Err(err.wrap("open", path));
    }

    let file = match OverlappedFile::wrap(handle) {
        Ok(file) => file,
        Err(err) => {
            unsafe { CloseHandle(handle as _) };
            return Err(err.wrap("open", path));
        }
    };
    let message_mode = (flags & PIPE_TYPE_MESSAGE) != 0;
    tracing::debug!(path, message_mode, "pipe dialed");
    Ok(PipeConnection::new(file, path.to_string(), message_mode))
}

/// One `CreateFileW` attempt; returns the Win32 error code on failure so
/// the dial loop can single out `ERROR_PIPE_BUSY`.
fn open_pipe_handle(path: &str) -> std::result::Result<usize, u32> {
    let wide = server::wide(path);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED | SECURITY_SQOS_PRESENT | SECURITY_ANONYMOUS,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(unsafe { GetLastError() });
    }
    Ok(handle as usize)
}

/// Waits for a client on a freshly created server pipe instance.
pub(crate) async fn connect_pipe(file: &OverlappedFile) -> Result<()> {
    let result = file
        .submit_io(
            DeadlineKind::None,
            "ConnectNamedPipe",
            Vec::new(),
            |handle, optr, _| {
                let ok = unsafe { ConnectNamedPipe(handle as _, optr) };
                if ok != 0 {
                    Ok(())
                } else {
                    Err(unsafe { GetLastError() })
                }
            },
        )
        .await;
    match result {
        Ok((completion, _)) => {
            if completion.code == 0 {
                Ok(())
            } else {
                Err(Error::syscall_code("ConnectNamedPipe", completion.code))
            }
        }
        // The client connected between instance creation and this call.
        Err(err) if err.raw_os_error() == Some(ERROR_PIPE_CONNECTED as i32) => Ok(()),
        Err(err) => Err(err),
    }
}

// =============================================================================
// PipeConnection
// =============================================================================

/// One end of a named-pipe connection.
pub struct PipeConnection {
    file: OverlappedFile,
    path: String,
    message_mode: bool,
    write_closed: AtomicBool,
    read_eof: AtomicBool,
}

impl std::fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConnection")
            .field("path", &self.path)
            .field("message_mode", &self.message_mode)
            .finish_non_exhaustive()
    }
}

impl PipeConnection {
    pub(crate) fn new(file: OverlappedFile, path: String, message_mode: bool) -> Self {
        Self {
            file,
            path,
            message_mode,
            write_closed: AtomicBool::new(false),
            read_eof: AtomicBool::new(false),
        }
    }

    /// Whether this connection speaks the message-mode half-close
    /// convention.
    #[must_use]
    pub fn message_mode(&self) -> bool {
        self.message_mode
    }

    /// The pipe path both endpoints share.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads bytes from the pipe. `Ok(0)` with a non-empty buffer means
    /// the peer closed its write side.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.message_mode && self.read_eof.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let (n, code) = self
            .file
            .read(buf)
            .await
            .map_err(|e| e.wrap("read", &self.path))?;
        match code {
            0 if n == 0 => {
                // A zero-byte transfer on a message pipe is the peer's
                // half-close message; latch EOF for all future reads.
                if self.message_mode {
                    self.read_eof.store(true, Ordering::SeqCst);
                }
                Ok(0)
            }
            0 => Ok(n),
            ERROR_BROKEN_PIPE => {
                if self.message_mode {
                    self.read_eof.store(true, Ordering::SeqCst);
                }
                Ok(0)
            }
            // The message continues past the buffer; this layer presents a
            // byte stream, so a partial message is just a successful read.
            ERROR_MORE_DATA if self.message_mode => Ok(n),
            code => Err(Error::syscall_code("ReadFile", code).wrap("read", &self.path)),
        }
    }

    /// Writes all of `buf`. On message-mode connections zero-byte writes
    /// are ignored; they are reserved for [`close_write`](Self::close_write).
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.message_mode {
            if self.write_closed.load(Ordering::SeqCst) {
                return Err(Error::PipeWriteClosed);
            }
            if buf.is_empty() {
                return Ok(0);
            }
        }
        self.file
            .write(buf)
            .await
            .map_err(|e| e.wrap("write", &self.path))
    }

    /// Half-closes a message-mode connection: flushes, then sends the
    /// zero-length message the peer reads as EOF. Further writes and a
    /// second `close_write` fail with
    /// [`Error::PipeWriteClosed`].
    pub async fn close_write(&self) -> Result<()> {
        if !self.message_mode {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "close_write requires a message-mode pipe",
            )));
        }
        if self.write_closed.load(Ordering::SeqCst) {
            return Err(Error::PipeWriteClosed);
        }
        self.flush().await?;
        self.file
            .write(&[])
            .await
            .map_err(|e| e.wrap("close_write", &self.path))?;
        self.write_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes buffered data to the peer, waiting until the peer has read
    /// everything outstanding.
    ///
    /// `FlushFileBuffers` has no overlapped form and can block until the
    /// peer drains the pipe, so it runs on the blocking pool.
    pub async fn flush(&self) -> Result<()> {
        if self.file.is_closed() {
            return Err(Error::FileClosed);
        }
        let handle = self.file.raw();
        let flushed = tokio::task::spawn_blocking(move || {
            let ok = unsafe { FlushFileBuffers(handle as _) };
            if ok == 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|join| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, join)))?;
        flushed.map_err(|e| Error::syscall("FlushFileBuffers", e).wrap("flush", &self.path))
    }

    /// Server side: forcibly disconnects the client from this instance.
    pub async fn disconnect(&self) -> Result<()> {
        if self.file.is_closed() {
            return Err(Error::FileClosed);
        }
        let ok = unsafe { DisconnectNamedPipe(self.file.raw() as _) };
        if ok == 0 {
            return Err(
                Error::syscall("DisconnectNamedPipe", std::io::Error::last_os_error())
                    .wrap("disconnect", &self.path),
            );
        }
        Ok(())
    }

    /// Cancels outstanding I/O and closes the handle.
    pub async fn close(&self) -> Result<()> {
        self.file.close().await
    }

    /// Sets the deadline for current and future reads.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.file.set_read_deadline(deadline);
    }

    /// Sets the deadline for current and future writes.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.file.set_write_deadline(deadline);
    }
}

#[async_trait]
impl Connection for PipeConnection {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        PipeConnection::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        PipeConnection::write(self, buf).await
    }

    async fn close(&self) -> Result<()> {
        PipeConnection::close(self).await
    }

    fn local_addr(&self) -> Address {
        Address::Pipe(self.path.clone())
    }

    fn remote_addr(&self) -> Address {
        Address::Pipe(self.path.clone())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        PipeConnection::set_read_deadline(self, deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        PipeConnection::set_write_deadline(self, deadline);
    }
}
