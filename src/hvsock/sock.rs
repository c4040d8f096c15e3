//! Hvsock listen/accept/dial pipeline on the overlapped engine.

use super::addr::{HvsockAddr, AF_HYPERV, RAW_ADDR_LEN};
use crate::conn::{Address, Connection};
use crate::engine::{DeadlineKind, OverlappedFile};
use crate::error::{Error, Result};
use crate::sockaddr;
use async_trait::async_trait;
use std::ptr::null;
use std::time::Duration;
use tokio::time::Instant;
use windows_sys::Win32::Foundation::{ERROR_CONNECTION_REFUSED, ERROR_CONNECTION_UNAVAIL};
use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSARecv, WSASend, SD_RECEIVE, SD_SEND, SOCKADDR, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAECONNREFUSED, WSAENETUNREACH, WSAETIMEDOUT,
};

/// Hvsock stream sockets use raw protocol 1.
const HV_PROTOCOL_RAW: i32 = 1;
const SOCK_STREAM: i32 = 1;
const LISTEN_BACKLOG: i32 = 16;

/// AcceptEx wants 16 extra bytes per address slot.
const ACCEPT_ADDR_LEN: usize = 16 + RAW_ADDR_LEN;

fn new_hv_socket() -> Result<OverlappedFile> {
    let sock = sockaddr::socket(AF_HYPERV as i32, SOCK_STREAM, HV_PROTOCOL_RAW)?;
    OverlappedFile::wrap_socket(sock).map_err(|err| {
        unsafe { windows_sys::Win32::Networking::WinSock::closesocket(sock) };
        err
    })
}

// =============================================================================
// Listener
// =============================================================================

/// A socket listener for the `AF_HYPERV` address family.
pub struct HvsockListener {
    sock: OverlappedFile,
    addr: HvsockAddr,
}

/// Listens for hvsock connections on `addr`.
pub fn listen_hvsock(addr: &HvsockAddr) -> Result<HvsockListener> {
    let wrap = |e: Error| e.wrap("listen", addr.to_string());
    let sock = new_hv_socket().map_err(wrap)?;
    sockaddr::bind(sock.raw(), &addr.to_raw()).map_err(wrap)?;
    sockaddr::listen(sock.raw(), LISTEN_BACKLOG).map_err(wrap)?;
    tracing::debug!(addr = %addr, "hvsock listener started");
    Ok(HvsockListener { sock, addr: *addr })
}

impl HvsockListener {
    /// The listener's bound address.
    #[must_use]
    pub fn addr(&self) -> HvsockAddr {
        self.addr
    }

    /// Waits for the next connection.
    ///
    /// The accepted connection's local address is reported as this
    /// listener's bound address. `getsockname` on the accepted socket is
    /// deliberately not consulted: what it returns there differs between
    /// OS builds (sometimes the listener's own service ID, sometimes an
    /// incremented variant), while the bound address is stable.
    pub async fn accept(&self) -> Result<HvsockConnection> {
        let wrap = |e: Error| e.wrap("accept", self.addr.to_string());

        let accepted = new_hv_socket().map_err(wrap)?;
        let accept_ex = sockaddr::accept_ex(self.sock.raw()).map_err(wrap)?;
        let accepted_raw = accepted.raw();

        let (completion, buffer) = self
            .sock
            .submit_io(
                DeadlineKind::None,
                "AcceptEx",
                vec![0u8; 2 * ACCEPT_ADDR_LEN],
                |handle, optr, buf| {
                    let mut received = 0u32;
                    let ok = unsafe {
                        accept_ex(
                            handle,
                            accepted_raw,
                            buf.as_mut_ptr().cast(),
                            0,
                            ACCEPT_ADDR_LEN as u32,
                            ACCEPT_ADDR_LEN as u32,
                            &mut received,
                            optr,
                        )
                    };
                    if ok != 0 {
                        Ok(())
                    } else {
                        Err(unsafe { WSAGetLastError() } as u32)
                    }
                },
            )
            .await
            .map_err(wrap)?;
        if completion.code != 0 {
            return Err(wrap(Error::syscall_code("acceptex", completion.code)));
        }

        let remote =
            HvsockAddr::from_raw(&buffer[ACCEPT_ADDR_LEN..ACCEPT_ADDR_LEN + RAW_ADDR_LEN])
                .map_err(wrap)?;

        // Inherit the listening socket's properties so shutdown() works on
        // the accepted socket.
        let listener_handle = self.sock.raw().to_ne_bytes();
        sockaddr::set_sock_opt(accepted.raw(), SO_UPDATE_ACCEPT_CONTEXT, &listener_handle)
            .map_err(wrap)?;

        tracing::debug!(local = %self.addr, remote = %remote, "hvsock accepted");
        Ok(HvsockConnection {
            sock: accepted,
            local: self.addr,
            remote,
        })
    }

    /// Closes the listener; pending `accept` calls fail with
    /// [`Error::FileClosed`].
    pub async fn close(&self) -> Result<()> {
        self.sock.close().await
    }
}

// =============================================================================
// Dialer
// =============================================================================

/// Dials hvsock addresses with optional deadline and retry policy.
#[derive(Debug, Clone, Default)]
pub struct HvsockDialer {
    /// Absolute instant by which the connection must be established.
    pub deadline: Option<Instant>,
    /// Additional attempts after a retriable connect failure.
    pub retries: u32,
    /// Pause between attempts.
    pub retry_wait: Duration,
}

impl HvsockDialer {
    /// A dialer with no deadline and no retries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the absolute connect deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the number of retries after retriable failures.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the pause between attempts.
    #[must_use]
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    /// Connects to `addr`.
    pub async fn dial(&self, addr: &HvsockAddr) -> Result<HvsockConnection> {
        let wrap = |e: Error| e.wrap("dial", addr.to_string());

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }

        let sock = new_hv_socket().map_err(wrap)?;
        // ConnectEx requires a bound socket; the wildcard address lets the
        // kernel pick the local endpoint.
        sockaddr::bind(sock.raw(), &HvsockAddr::default().to_raw()).map_err(wrap)?;
        if let Some(deadline) = self.deadline {
            sock.set_write_deadline(Some(deadline));
        }
        let connect_ex = sockaddr::connect_ex(sock.raw()).map_err(wrap)?;

        let attempts = 1 + self.retries;
        let mut attempt = 1;
        loop {
            let outcome = sock
                .submit_io(
                    DeadlineKind::Write,
                    "ConnectEx",
                    addr.to_raw().to_vec(),
                    |handle, optr, buf| {
                        let mut sent = 0u32;
                        let ok = unsafe {
                            connect_ex(
                                handle,
                                buf.as_ptr() as *const SOCKADDR,
                                buf.len() as i32,
                                null(),
                                0,
                                &mut sent,
                                optr,
                            )
                        };
                        if ok != 0 {
                            Ok(())
                        } else {
                            Err(unsafe { WSAGetLastError() } as u32)
                        }
                    },
                )
                .await;
            let err = match outcome {
                Ok((completion, _)) if completion.code == 0 => break,
                Ok((completion, _)) => Error::syscall_code("connectex", completion.code),
                Err(err) => err,
            };
            if attempt < attempts && can_redial(&err) {
                tracing::debug!(addr = %addr, attempt, error = %err, "redialing");
                self.redial_wait().await?;
                attempt += 1;
                continue;
            }
            return Err(wrap(err));
        }

        // Update the socket so shutdown/getsockname behave on it.
        sockaddr::set_sock_opt(sock.raw(), SO_UPDATE_CONNECT_CONTEXT, &[]).map_err(wrap)?;
        let local_raw = sockaddr::get_sock_name(sock.raw(), RAW_ADDR_LEN).map_err(wrap)?;
        let local = HvsockAddr::from_raw(&local_raw).map_err(wrap)?;

        // The dialer deadline only governed the connect.
        sock.set_write_deadline(None);
        tracing::debug!(local = %local, remote = %addr, "hvsock dialed");
        Ok(HvsockConnection {
            sock,
            local,
            remote: *addr,
        })
    }

    /// Waits `retry_wait` without overrunning the deadline.
    async fn redial_wait(&self) -> Result<()> {
        if self.retry_wait.is_zero() {
            return Ok(());
        }
        match self.deadline {
            None => {
                tokio::time::sleep(self.retry_wait).await;
                Ok(())
            }
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep(self.retry_wait) => Ok(()),
                    () = tokio::time::sleep_until(deadline) => Err(Error::Timeout),
                }
            }
        }
    }
}

/// Connect failures worth retrying: refused, unreachable, timed out.
fn can_redial(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == WSAECONNREFUSED
            || code == WSAENETUNREACH
            || code == WSAETIMEDOUT
            || code == ERROR_CONNECTION_REFUSED as i32
            || code == ERROR_CONNECTION_UNAVAIL as i32
    )
}

// =============================================================================
// Connection
// =============================================================================

/// A connected `AF_HYPERV` socket.
pub struct HvsockConnection {
    sock: OverlappedFile,
    local: HvsockAddr,
    remote: HvsockAddr,
}

impl std::fmt::Debug for HvsockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvsockConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl HvsockConnection {
    /// Reads bytes from the socket; `Ok(0)` with a non-empty buffer means
    /// the peer shut down its write side.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (completion, staging) = self
            .sock
            .submit_io(
                DeadlineKind::Read,
                "WSARecv",
                vec![0u8; buf.len()],
                |handle, optr, staging| {
                    let mut wsabuf = WSABUF {
                        len: staging.len() as u32,
                        buf: staging.as_mut_ptr(),
                    };
                    let mut received = 0u32;
                    let mut flags = 0u32;
                    let rc = unsafe {
                        WSARecv(handle, &mut wsabuf, 1, &mut received, &mut flags, optr, None)
                    };
                    if rc == 0 {
                        Ok(())
                    } else {
                        Err(unsafe { WSAGetLastError() } as u32)
                    }
                },
            )
            .await
            .map_err(|e| e.wrap("read", self.remote.to_string()))?;
        if completion.code != 0 {
            return Err(
                Error::syscall_code("wsarecv", completion.code)
                    .wrap("read", self.remote.to_string()),
            );
        }
        let n = completion.bytes.min(buf.len());
        buf[..n].copy_from_slice(&staging[..n]);
        Ok(n)
    }

    /// Writes all of `buf`, submitting as many sends as it takes.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write_once(&buf[written..]).await?;
            written += n;
        }
        Ok(written)
    }

    async fn write_once(&self, buf: &[u8]) -> Result<usize> {
        let (completion, _) = self
            .sock
            .submit_io(
                DeadlineKind::Write,
                "WSASend",
                buf.to_vec(),
                |handle, optr, staging| {
                    let mut wsabuf = WSABUF {
                        len: staging.len() as u32,
                        buf: staging.as_mut_ptr(),
                    };
                    let mut sent = 0u32;
                    let rc =
                        unsafe { WSASend(handle, &mut wsabuf, 1, &mut sent, 0, optr, None) };
                    if rc == 0 {
                        Ok(())
                    } else {
                        Err(unsafe { WSAGetLastError() } as u32)
                    }
                },
            )
            .await
            .map_err(|e| e.wrap("write", self.remote.to_string()))?;
        if completion.code != 0 {
            return Err(
                Error::syscall_code("wsasend", completion.code)
                    .wrap("write", self.remote.to_string()),
            );
        }
        Ok(completion.bytes)
    }

    fn shutdown(&self, how: i32) -> Result<()> {
        if self.sock.is_closed() {
            return Err(Error::FileClosed);
        }
        sockaddr::shutdown(self.sock.raw(), how)
    }

    /// Shuts down the read side; future reads fail.
    pub fn close_read(&self) -> Result<()> {
        self.shutdown(SD_RECEIVE as i32)
            .map_err(|e| e.wrap("close_read", self.remote.to_string()))
    }

    /// Shuts down the write side; the peer observes EOF.
    pub fn close_write(&self) -> Result<()> {
        self.shutdown(SD_SEND as i32)
            .map_err(|e| e.wrap("close_write", self.remote.to_string()))
    }

    /// Cancels outstanding I/O and closes the socket.
    pub async fn close(&self) -> Result<()> {
        self.sock.close().await
    }

    /// Whether `close` has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sock.is_closed()
    }

    /// The local address (for accepted sockets, the listener's bound
    /// address).
    #[must_use]
    pub fn local_addr(&self) -> HvsockAddr {
        self.local
    }

    /// The peer's address.
    #[must_use]
    pub fn remote_addr(&self) -> HvsockAddr {
        self.remote
    }

    /// Sets the deadline for current and future reads.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.sock.set_read_deadline(deadline);
    }

    /// Sets the deadline for current and future writes.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.sock.set_write_deadline(deadline);
    }
}

#[async_trait]
impl Connection for HvsockConnection {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        HvsockConnection::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        HvsockConnection::write(self, buf).await
    }

    async fn close(&self) -> Result<()> {
        HvsockConnection::close(self).await
    }

    fn local_addr(&self) -> Address {
        Address::Hvsock(self.local)
    }

    fn remote_addr(&self) -> Address {
        Address::Hvsock(self.remote)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        HvsockConnection::set_read_deadline(self, deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        HvsockConnection::set_write_deadline(self, deadline);
    }
}
