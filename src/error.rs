//! Error types for host-integration transports.

use std::io;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport and codec layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation exceeded its deadline and was cancelled in the kernel.
    #[error("i/o deadline exceeded")]
    Timeout,

    /// Operation observed its handle in the closed state.
    #[error("file has already been closed")]
    FileClosed,

    /// Accept observed the listener shutting down.
    #[error("pipe listener has been closed")]
    PipeListenerClosed,

    /// Write on the half-closed side of a message-mode pipe.
    #[error("pipe has been closed for write")]
    PipeWriteClosed,

    /// Every pipe instance was in use for the whole dial window.
    #[error("pipe busy: all instances of {path} in use")]
    PipeBusy {
        /// Pipe path that was dialed.
        path: String,
    },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Reparse buffer was rejected by the codec.
    #[error("malformed reparse buffer: {reason}")]
    MalformedReparse {
        /// What the codec objected to.
        reason: String,
    },

    // =========================================================================
    // Raw Sockaddr Contract Errors
    // =========================================================================
    /// Raw socket address carried the wrong address family.
    #[error("address family: got {got}, want {want}")]
    AddrFamily {
        /// Family found in the buffer.
        got: u16,
        /// Family the decoder required.
        want: u16,
    },

    /// Raw socket address buffer was the wrong size.
    #[error("sockaddr buffer size: got {got}, want {want}")]
    BufferSize {
        /// Bytes provided.
        got: usize,
        /// Bytes required.
        want: usize,
    },

    /// Raw socket address pointer was null.
    #[error("invalid sockaddr pointer")]
    InvalidPointer,

    // =========================================================================
    // OS Errors
    // =========================================================================
    /// A Win32 call failed; carries the originating syscall name.
    #[error("{name}: {source}")]
    Syscall {
        /// Name of the syscall that failed.
        name: &'static str,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    // =========================================================================
    // Net-Path Wrapper
    // =========================================================================
    /// Failure annotated with the operation and endpoint it belongs to.
    #[error("{op} {addr}: {source}")]
    Net {
        /// Operation name ("dial", "accept", "read", ...).
        op: &'static str,
        /// Pipe path or hvsock address.
        addr: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps a failed syscall with its name.
    pub(crate) fn syscall(name: &'static str, source: io::Error) -> Self {
        Error::Syscall { name, source }
    }

    /// Wraps a failed syscall with a raw Win32 error code.
    #[cfg(windows)]
    pub(crate) fn syscall_code(name: &'static str, code: u32) -> Self {
        Error::Syscall {
            name,
            source: io::Error::from_raw_os_error(code as i32),
        }
    }

    /// Annotates this error with the operation and endpoint it belongs to.
    ///
    /// Sentinel errors pass through unwrapped so callers can still match on
    /// them after propagation through the net layer.
    pub(crate) fn wrap(self, op: &'static str, addr: impl AsRef<str>) -> Self {
        match self {
            Error::Timeout
            | Error::FileClosed
            | Error::PipeListenerClosed
            | Error::PipeWriteClosed => self,
            other => Error::Net {
                op,
                addr: addr.as_ref().to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether the operation failed because a deadline expired.
    ///
    /// Covers both kernel-cancelled operations and dial attempts that spent
    /// their entire window retrying a busy pipe.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout | Error::PipeBusy { .. } => true,
            Error::Net { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the operation observed a closed handle or listener.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::FileClosed | Error::PipeListenerClosed => true,
            Error::Net { source, .. } => source.is_closed(),
            _ => false,
        }
    }

    /// The raw OS error code, if this error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Syscall { source, .. } | Error::Io(source) => source.raw_os_error(),
            Error::Net { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_pass_through_wrap() {
        let err = Error::Timeout.wrap("read", r"\\.\pipe\x");
        assert!(matches!(err, Error::Timeout));

        let err = Error::FileClosed.wrap("read", r"\\.\pipe\x");
        assert!(matches!(err, Error::FileClosed));
    }

    #[test]
    fn net_wrapper_formats_op_and_addr() {
        let inner = Error::syscall("connectex", io::Error::from_raw_os_error(10061));
        let err = inner.wrap("dial", "vm:svc");
        let msg = format!("{err}");
        assert!(msg.contains("dial"), "missing op: {msg}");
        assert!(msg.contains("vm:svc"), "missing addr: {msg}");
    }

    #[test]
    fn timeout_detection_spans_wrappers() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::PipeBusy { path: "p".into() }.is_timeout());
        assert!(Error::Timeout.wrap("dial", "p").is_timeout());
        assert!(!Error::FileClosed.is_timeout());
    }

    #[test]
    fn raw_os_error_spans_wrappers() {
        let err = Error::syscall("wsarecv", io::Error::from_raw_os_error(10054)).wrap("read", "a");
        assert_eq!(err.raw_os_error(), Some(10054));
        assert_eq!(Error::Timeout.raw_os_error(), None);
    }
}
