//! # hvlink
//!
//! **Windows host-integration transports for container and VM plumbing**
//!
//! This crate provides network-semantic endpoints over the two transports
//! Windows offers for talking to container runtimes, utility VMs, and
//! other local services - named pipes and Hyper-V sockets (`AF_HYPERV`) -
//! together with the binary codecs (reparse points, backup streams,
//! extended attributes) that ride on those transports.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             hvlink                                 │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐        ┌───────────────────────────┐     │
//! │  │   Named pipes        │        │   Hyper-V sockets         │     │
//! │  │   dial / listen      │        │   dial / listen / accept  │     │
//! │  │   queue-based accept │        │   half-close, retries     │     │
//! │  └──────────┬───────────┘        └──────────────┬────────────┘     │
//! │             │         Connection trait          │                  │
//! │  ┌──────────┴──────────────────────────────────┴────────────┐     │
//! │  │                  Overlapped I/O engine                    │     │
//! │  │  one completion port · dedicated dispatcher thread        │     │
//! │  │  deadlines · cancellation · drain-on-close                │     │
//! │  └───────────────────────────────────────────────────────────┘     │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  Codecs: reparse points · backup streams · extended attributes     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every blocking-looking call is an `await` point: reads, writes,
//! accepts, and dials submit overlapped operations to one process-wide
//! completion port and suspend until the dispatcher thread routes the
//! completion back. Deadlines (`set_read_deadline` / `set_write_deadline`)
//! cancel in-flight kernel operations and retarget live waiters when
//! replaced mid-operation.
//!
//! # Example
//!
//! ```rust,ignore
//! use hvlink::pipe::{dial_pipe, listen_pipe, PipeListenerConfig};
//!
//! #[tokio::main]
//! async fn main() -> hvlink::Result<()> {
//!     let listener = listen_pipe(r"\\.\pipe\demo", PipeListenerConfig::default())?;
//!     let server = tokio::spawn(async move {
//!         let conn = listener.accept().await?;
//!         let mut buf = [0u8; 16];
//!         let n = conn.read(&mut buf).await?;
//!         conn.write(&buf[..n]).await?;
//!         Ok::<_, hvlink::Error>(())
//!     });
//!
//!     let client = dial_pipe(r"\\.\pipe\demo").await?;
//!     client.write(b"hello").await?;
//!     server.await.unwrap()?;
//!     Ok(())
//! }
//! ```
//!
//! The codec modules ([`reparse`], [`backup`], [`ea`], [`guid`], and the
//! hvsock address types) are portable so they can be exercised anywhere;
//! everything that touches a Windows handle is compiled only on Windows.

// =============================================================================
// Internal Modules
// =============================================================================

#[cfg(windows)]
mod engine;
#[cfg(windows)]
mod sockaddr;

// =============================================================================
// Public Modules
// =============================================================================

/// Backup-stream codec and `BackupRead`/`BackupWrite` bridges.
pub mod backup;

/// The `Connection` trait and endpoint addresses.
pub mod conn;

/// Extended-attribute codec.
pub mod ea;

/// Error types.
pub mod error;

/// GUID value type and codec.
pub mod guid;

/// Hyper-V socket transport and addressing.
pub mod hvsock;

/// Named-pipe transport.
#[cfg(windows)]
pub mod pipe;

/// Reparse-point codec and FSCTL bridges.
pub mod reparse;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use conn::{Address, Connection};
pub use error::{Error, Result};
pub use guid::Guid;
pub use hvsock::{vsock_service_id, HvsockAddr};

#[cfg(windows)]
pub use hvsock::{listen_hvsock, HvsockConnection, HvsockDialer, HvsockListener};
#[cfg(windows)]
pub use pipe::{
    dial_pipe, dial_pipe_deadline, listen_pipe, PipeConnection, PipeListener, PipeListenerConfig,
};
