//! Hyper-V socket (`AF_HYPERV`) transport.
//!
//! Hvsock is the host↔guest byte-stream transport used to talk to VMs and
//! container silos without a network stack. Addressing and the raw
//! sockaddr codec are portable ([`addr`]); the socket pipeline itself
//! (listen/accept/dial on the overlapped engine) is Windows-only, as is
//! the [`register_service`]/[`unregister_service`] registry surface that
//! makes a service ID visible to guests.

mod addr;

pub use addr::{
    vsock_service_id, HvsockAddr, AF_HYPERV, RAW_ADDR_LEN, VMID_BROADCAST, VMID_CHILDREN,
    VMID_LOOPBACK, VMID_PARENT, VMID_SILO_HOST, VMID_WILDCARD,
};

#[cfg(windows)]
mod service;
#[cfg(windows)]
mod sock;

#[cfg(windows)]
pub use service::{register_service, unregister_service};
#[cfg(windows)]
pub use sock::{listen_hvsock, HvsockConnection, HvsockDialer, HvsockListener};
