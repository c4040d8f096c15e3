//! Overlapped-I/O engine.
//!
//! [`OverlappedFile`] exclusively owns one OS handle bound to the process
//! completion port and turns overlapped kernel I/O into awaitable,
//! deadline-aware, cancellable operations.
//!
//! The submission contract is `prepare → submit → wait`:
//!
//! 1. `prepare` refuses closed handles, joins the drain group, allocates
//!    the packet, and registers its completion route.
//! 2. The caller-supplied closure invokes the kernel function with the
//!    `OVERLAPPED` pointer. Synchronous success and `ERROR_IO_PENDING`
//!    both mean a packet will arrive (the handle is port-bound); any other
//!    error is terminal and the route is withdrawn.
//! 3. `wait` selects on the completion channel and the direction's
//!    deadline. When the deadline fires it issues
//!    `CancelIoEx(handle, overlapped)` and then waits *unconditionally*
//!    for the packet: the kernel owns the packet memory until it confirms,
//!    and releasing early would let it write into freed memory.
//!
//! `close` transitions the handle into its terminal state: it cancels all
//! outstanding operations, waits for the drain group to empty, and only
//! then closes the handle.

mod deadline;
mod port;

pub(crate) use deadline::Deadline;
pub(crate) use port::IoPacket;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use windows_sys::Win32::Foundation::{CloseHandle, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED};
use windows_sys::Win32::Networking::WinSock::{
    closesocket, WSAGetLastError, WSAGetOverlappedResult,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

/// Which deadline governs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeadlineKind {
    Read,
    Write,
    /// Accept/connect style operations; cancelled only by `close`.
    None,
}

/// Final state of one overlapped operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawCompletion {
    /// Bytes transferred.
    pub bytes: usize,
    /// Win32 error the packet carried; zero on success. Transports decide
    /// which nonzero codes are benign (`ERROR_MORE_DATA`, ...).
    pub code: u32,
}

/// Outcome of the kernel submission call: `Ok` for synchronous success,
/// `Err(code)` for everything else (`ERROR_IO_PENDING` means in flight).
pub(crate) type SubmitStatus = std::result::Result<(), u32>;

// =============================================================================
// OverlappedFile
// =============================================================================

struct Inner {
    handle: usize,
    socket: bool,
    closing: AtomicBool,
    closed: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close_lock: tokio::sync::Mutex<()>,
}

/// A handle bound to the process completion port.
#[derive(Clone)]
pub(crate) struct OverlappedFile {
    inner: Arc<Inner>,
}

impl OverlappedFile {
    /// Wraps a file-like handle. On error the caller still owns the handle.
    pub(crate) fn wrap(handle: usize) -> Result<Self> {
        Self::make(handle, false)
    }

    /// Wraps a socket handle. Socket completions are resolved through
    /// `WSAGetOverlappedResult`.
    pub(crate) fn wrap_socket(socket: usize) -> Result<Self> {
        Self::make(socket, true)
    }

    fn make(handle: usize, socket: bool) -> Result<Self> {
        port::bind_handle(handle)?;
        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                socket,
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
                read_deadline: Deadline::new(),
                write_deadline: Deadline::new(),
                close_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// The raw handle, for collaborator syscalls that do not go through the
    /// engine (`shutdown`, `FlushFileBuffers`, ...).
    pub(crate) fn raw(&self) -> usize {
        self.inner.handle
    }

    /// Whether `close` has begun.
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_read_deadline(&self, at: Option<Instant>) {
        self.inner.read_deadline.set(at);
    }

    pub(crate) fn set_write_deadline(&self, at: Option<Instant>) {
        self.inner.write_deadline.set(at);
    }

    /// Submits one overlapped operation and awaits its completion.
    ///
    /// `submit` is handed `(handle, overlapped, staging)` and must return
    /// the kernel's verdict as a [`SubmitStatus`]. The staging buffer is
    /// owned by the engine for the whole kernel lifetime of the operation
    /// and is returned alongside the completion.
    pub(crate) async fn submit_io(
        &self,
        kind: DeadlineKind,
        name: &'static str,
        staging: Vec<u8>,
        submit: impl FnOnce(usize, *mut OVERLAPPED, &mut [u8]) -> SubmitStatus,
    ) -> Result<(RawCompletion, Vec<u8>)> {
        let guard = DrainGuard::enter(&self.inner)?;

        let mut packet = IoPacket::new(staging);
        // Raw pointers stay inside this block so the future remains Send;
        // only the usize key crosses awaits.
        let rx;
        let key = {
            let optr = packet.overlapped_ptr();
            let key = optr as usize;
            let (tx, rx_inner) = oneshot::channel();
            port::register(key, tx);

            if let Err(code) = submit(self.inner.handle, optr, packet.buf_mut()) {
                if code != ERROR_IO_PENDING {
                    port::deregister(key);
                    drop(guard);
                    return Err(Error::syscall_code(name, code));
                }
            }

            // A close that started after the prepare check cancels
            // everything it can see; cover this freshly submitted
            // operation too.
            if self.inner.closing.load(Ordering::SeqCst) {
                unsafe { CancelIoEx(self.inner.handle as _, optr) };
            }
            rx = rx_inner;
            key
        };

        let mut request = IoRequest {
            handle: self.inner.handle,
            key,
            packet: Some(packet),
            rx,
            delivered: false,
            _guard: guard,
        };
        let deadline = match kind {
            DeadlineKind::Read => Some(&self.inner.read_deadline),
            DeadlineKind::Write => Some(&self.inner.write_deadline),
            DeadlineKind::None => None,
        };
        let completion = request.wait(deadline, name, &self.inner).await?;
        let staging = request
            .packet
            .take()
            .expect("packet retained until delivery")
            .into_buf();
        Ok((completion, staging))
    }

    /// Overlapped `ReadFile` into `buf` via the staging buffer.
    ///
    /// Returns `(bytes, code)`; nonzero codes the transport may consider
    /// benign (`ERROR_MORE_DATA`, `ERROR_BROKEN_PIPE`) are passed through
    /// with whatever bytes arrived.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<(usize, u32)> {
        use windows_sys::Win32::Foundation::GetLastError;
        use windows_sys::Win32::Storage::FileSystem::ReadFile;

        let (completion, staging) = self
            .submit_io(
                DeadlineKind::Read,
                "ReadFile",
                vec![0u8; buf.len()],
                |handle, optr, staging| {
                    let mut n = 0u32;
                    let ok = unsafe {
                        ReadFile(
                            handle as _,
                            staging.as_mut_ptr() as _,
                            staging.len() as u32,
                            &mut n,
                            optr,
                        )
                    };
                    if ok != 0 {
                        Ok(())
                    } else {
                        Err(unsafe { GetLastError() })
                    }
                },
            )
            .await?;
        let n = completion.bytes.min(buf.len());
        buf[..n].copy_from_slice(&staging[..n]);
        Ok((n, completion.code))
    }

    /// Overlapped `WriteFile` of all of `buf`.
    pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize> {
        use windows_sys::Win32::Foundation::GetLastError;
        use windows_sys::Win32::Storage::FileSystem::WriteFile;

        let (completion, _) = self
            .submit_io(
                DeadlineKind::Write,
                "WriteFile",
                buf.to_vec(),
                |handle, optr, staging| {
                    let mut n = 0u32;
                    let data = if staging.is_empty() {
                        std::ptr::null()
                    } else {
                        staging.as_ptr()
                    };
                    let ok = unsafe {
                        WriteFile(handle as _, data as _, staging.len() as u32, &mut n, optr)
                    };
                    if ok != 0 {
                        Ok(())
                    } else {
                        Err(unsafe { GetLastError() })
                    }
                },
            )
            .await?;
        if completion.code != 0 {
            return Err(Error::syscall_code("WriteFile", completion.code));
        }
        Ok(completion.bytes)
    }

    /// Closes the handle: cancel all outstanding operations, wait for the
    /// drain group to empty, then release the handle. A second call
    /// reports [`Error::FileClosed`] without any kernel effect.
    pub(crate) async fn close(&self) -> Result<()> {
        let _guard = self.inner.close_lock.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::FileClosed);
        }
        self.inner.closing.store(true, Ordering::SeqCst);
        unsafe { CancelIoEx(self.inner.handle as _, std::ptr::null_mut()) };

        loop {
            let notified = self.inner.drained.notified();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        close_os_handle(self.inner.handle, self.inner.socket);
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::trace!(handle = self.inner.handle, "handle closed");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            // Last reference dropped without close(): cancel and release.
            // Outstanding packets stay alive in the routing map until the
            // kernel posts their aborted completions.
            self.closing.store(true, Ordering::SeqCst);
            unsafe { CancelIoEx(self.handle as _, std::ptr::null_mut()) };
            close_os_handle(self.handle, self.socket);
        }
    }
}

fn close_os_handle(handle: usize, socket: bool) {
    unsafe {
        if socket {
            closesocket(handle);
        } else {
            CloseHandle(handle as _);
        }
    }
}

// =============================================================================
// Drain Group
// =============================================================================

/// Membership in a handle's drain group for one operation.
struct DrainGuard {
    inner: Arc<Inner>,
}

impl DrainGuard {
    fn enter(inner: &Arc<Inner>) -> Result<Self> {
        inner.inflight.fetch_add(1, Ordering::SeqCst);
        if inner.closing.load(Ordering::SeqCst) {
            // Roll back: close() has already begun and must not see us.
            let guard = Self {
                inner: inner.clone(),
            };
            drop(guard);
            return Err(Error::FileClosed);
        }
        Ok(Self {
            inner: inner.clone(),
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

// =============================================================================
// IoRequest
// =============================================================================

/// One in-flight operation: the packet the kernel owns until completion,
/// the channel the dispatcher resolves, and the drain-group membership.
struct IoRequest {
    handle: usize,
    key: usize,
    packet: Option<Box<IoPacket>>,
    rx: oneshot::Receiver<port::Completion>,
    delivered: bool,
    _guard: DrainGuard,
}

impl IoRequest {
    /// Awaits the completion packet, honoring the direction's deadline.
    async fn wait(
        &mut self,
        deadline: Option<&Deadline>,
        name: &'static str,
        inner: &Inner,
    ) -> Result<RawCompletion> {
        let mut timed_out = false;
        let completion = match deadline {
            None => self.recv().await?,
            Some(deadline) => loop {
                let (wake_at, mut replaced) = deadline.observe();
                if let Some(at) = wake_at {
                    tokio::select! {
                        completion = &mut self.rx => {
                            self.delivered = true;
                            break completion.map_err(|_| dispatcher_gone())?;
                        }
                        () = tokio::time::sleep_until(at) => {
                            // Deadline fired. Ask the kernel to abort, then
                            // wait unconditionally for its confirmation.
                            unsafe {
                                CancelIoEx(self.handle as _, self.key as *mut OVERLAPPED)
                            };
                            let completion = self.recv().await?;
                            timed_out = true;
                            break completion;
                        }
                        changed = replaced.changed() => {
                            // Deadline swapped out from under us; re-observe.
                            let _ = changed;
                            continue;
                        }
                    }
                } else {
                    tokio::select! {
                        completion = &mut self.rx => {
                            self.delivered = true;
                            break completion.map_err(|_| dispatcher_gone())?;
                        }
                        changed = replaced.changed() => {
                            let _ = changed;
                            continue;
                        }
                    }
                }
            },
        };

        if completion.code == ERROR_OPERATION_ABORTED {
            if timed_out {
                return Err(Error::Timeout);
            }
            if inner.closing.load(Ordering::SeqCst) {
                return Err(Error::FileClosed);
            }
            return Err(Error::syscall_code(name, ERROR_OPERATION_ABORTED));
        }

        let mut bytes = completion.bytes;
        let mut code = completion.code;
        if code != 0 && inner.socket {
            // The packet's status for sockets is a generic NTSTATUS mapping;
            // the definitive result comes from WSAGetOverlappedResult.
            let mut transferred = 0u32;
            let mut flags = 0u32;
            let ok = unsafe {
                WSAGetOverlappedResult(
                    self.handle,
                    self.key as *const OVERLAPPED,
                    &mut transferred,
                    0,
                    &mut flags,
                )
            };
            if ok != 0 {
                bytes = transferred;
                code = 0;
            } else {
                code = unsafe { WSAGetLastError() } as u32;
            }
        }

        Ok(RawCompletion {
            bytes: bytes as usize,
            code,
        })
    }

    async fn recv(&mut self) -> Result<port::Completion> {
        let completion = (&mut self.rx).await.map_err(|_| dispatcher_gone())?;
        self.delivered = true;
        Ok(completion)
    }
}

impl Drop for IoRequest {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        // Future dropped mid-flight. The kernel may still write into the
        // packet; cancel, then hand the allocation to the routing map until
        // the aborted completion arrives.
        if let Some(packet) = self.packet.take() {
            unsafe { CancelIoEx(self.handle as _, self.key as *mut OVERLAPPED) };
            if let Some(packet) = port::orphan(self.key, packet) {
                // Completion already routed; the memory is ours again.
                drop(packet);
            }
        }
    }
}

fn dispatcher_gone() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "completion dispatcher terminated",
    ))
}
