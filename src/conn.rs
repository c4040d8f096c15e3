//! Connection interface shared by the pipe and hvsock transports.

use crate::error::Result;
use crate::hvsock::HvsockAddr;
use async_trait::async_trait;
use std::fmt;
use tokio::time::Instant;

/// A transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Named-pipe path, e.g. `\\.\pipe\name`.
    Pipe(String),
    /// Hyper-V socket address.
    Hvsock(HvsockAddr),
}

impl Address {
    /// The address's network name.
    #[must_use]
    pub fn network(&self) -> &'static str {
        match self {
            Address::Pipe(_) => "pipe",
            Address::Hvsock(_) => "hvsock",
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Pipe(path) => f.write_str(path),
            Address::Hvsock(addr) => write!(f, "{addr}"),
        }
    }
}

/// A bidirectional byte-stream connection with per-direction deadlines.
///
/// Deadlines are absolute instants; `None` disarms. Setting a deadline in
/// the past fails in-flight and subsequent operations with
/// [`Error::Timeout`](crate::Error::Timeout) until the deadline is moved or
/// cleared. Close is idempotent in effect; a second `close` reports
/// [`Error::FileClosed`](crate::Error::FileClosed) without touching the
/// kernel.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Reads into `buf`, returning the number of bytes read. `Ok(0)` with a
    /// non-empty `buf` means the peer finished writing.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf`, returning the number of bytes written.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Cancels outstanding I/O, waits for it to drain, and closes the
    /// underlying handle.
    async fn close(&self) -> Result<()>;

    /// The local endpoint address.
    fn local_addr(&self) -> Address;

    /// The remote endpoint address.
    fn remote_addr(&self) -> Address;

    /// Sets both the read and write deadlines.
    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Sets the deadline for current and future reads.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Sets the deadline for current and future writes.
    fn set_write_deadline(&self, deadline: Option<Instant>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hvsock::{vsock_service_id, VMID_LOOPBACK};

    #[test]
    fn address_networks() {
        let pipe = Address::Pipe(r"\\.\pipe\svc".to_string());
        assert_eq!(pipe.network(), "pipe");
        assert_eq!(pipe.to_string(), r"\\.\pipe\svc");

        let hv = Address::Hvsock(HvsockAddr::new(VMID_LOOPBACK, vsock_service_id(80)));
        assert_eq!(hv.network(), "hvsock");
        assert!(hv.to_string().contains("facb-11e6"));
    }
}
