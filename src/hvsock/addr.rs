//! Hyper-V socket addresses.
//!
//! An `AF_HYPERV` endpoint is a `(VM ID, service ID)` pair of GUIDs. The
//! raw sockaddr handed to the kernel is:
//!
//! ```text
//! u16 family;     // AF_HYPERV (34)
//! u16 reserved;
//! guid vm_id;     // Windows mixed-endian layout
//! guid service_id;
//! ```
//!
//! The well-known VM IDs below are kernel ABI and must stay bit-exact.

use crate::error::{Error, Result};
use crate::guid::{Guid, GUID_LEN};
use std::fmt;

/// The `AF_HYPERV` address family.
pub const AF_HYPERV: u16 = 34;

/// Encoded size of a raw hvsock sockaddr.
pub const RAW_ADDR_LEN: usize = 4 + 2 * GUID_LEN;

// =============================================================================
// Well-Known VM IDs
// =============================================================================

/// Wildcard VM ID: accept connections from all partitions.
pub const VMID_WILDCARD: Guid = Guid::zero();

/// Broadcast VM ID: send to all partitions.
pub const VMID_BROADCAST: Guid = Guid::new(
    0xffffffff,
    0xffff,
    0xffff,
    [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
);

/// Loopback VM ID: connections within the connector's own partition.
pub const VMID_LOOPBACK: Guid = Guid::new(
    0xe0e16197,
    0xdd56,
    0x4a10,
    [0x91, 0x95, 0x5e, 0xe7, 0xa1, 0x55, 0xa8, 0x38],
);

/// Child-partitions VM ID: accept connections from the connector's children.
pub const VMID_CHILDREN: Guid = Guid::new(
    0x90db8b89,
    0x0d35,
    0x4f79,
    [0x8c, 0xe9, 0x49, 0xea, 0x0a, 0xc8, 0xb7, 0xcd],
);

/// Parent-partition VM ID: accept connections from the connector's parent.
pub const VMID_PARENT: Guid = Guid::new(
    0xa42e7cda,
    0xd03f,
    0x480c,
    [0x9c, 0xc2, 0xa4, 0xde, 0x20, 0xab, 0xb8, 0x78],
);

/// Silo-host VM ID: the host partition of a silo.
pub const VMID_SILO_HOST: Guid = Guid::new(
    0x36bd0c5c,
    0x7276,
    0x4223,
    [0x88, 0xba, 0x7d, 0x03, 0xb6, 0x54, 0xc5, 0x68],
);

/// Service GUID template for the VSOCK compatibility protocol; `data1`
/// carries the port number.
const VSOCK_SERVICE_TEMPLATE: Guid = Guid::new(
    0x00000000,
    0xfacb,
    0x11e6,
    [0xbd, 0x58, 0x64, 0x00, 0x6a, 0x79, 0x86, 0xd3],
);

/// Derives the hvsock service ID for an `AF_VSOCK`-style port number.
#[must_use]
pub fn vsock_service_id(port: u32) -> Guid {
    let mut g = VSOCK_SERVICE_TEMPLATE;
    g.data1 = port;
    g
}

// =============================================================================
// HvsockAddr
// =============================================================================

/// An address for an `AF_HYPERV` socket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HvsockAddr {
    /// Target partition.
    pub vm_id: Guid,
    /// Target service within the partition.
    pub service_id: Guid,
}

impl HvsockAddr {
    /// Creates an address from its two components.
    #[must_use]
    pub const fn new(vm_id: Guid, service_id: Guid) -> Self {
        Self { vm_id, service_id }
    }

    /// The address's network name, `"hvsock"`.
    #[must_use]
    pub fn network(&self) -> &'static str {
        "hvsock"
    }

    /// Encodes the raw sockaddr passed to `bind`/`ConnectEx`.
    #[must_use]
    pub fn to_raw(&self) -> [u8; RAW_ADDR_LEN] {
        let mut b = [0u8; RAW_ADDR_LEN];
        b[0..2].copy_from_slice(&AF_HYPERV.to_le_bytes());
        // bytes 2..4 reserved
        b[4..20].copy_from_slice(&self.vm_id.to_bytes_le());
        b[20..36].copy_from_slice(&self.service_id.to_bytes_le());
        b
    }

    /// Decodes a raw sockaddr, validating size and address family.
    pub fn from_raw(b: &[u8]) -> Result<Self> {
        if b.len() < RAW_ADDR_LEN {
            return Err(Error::BufferSize {
                got: b.len(),
                want: RAW_ADDR_LEN,
            });
        }
        let family = u16::from_le_bytes([b[0], b[1]]);
        if family != AF_HYPERV {
            return Err(Error::AddrFamily {
                got: family,
                want: AF_HYPERV,
            });
        }
        Ok(Self {
            vm_id: Guid::from_bytes_le(&b[4..20]),
            service_id: Guid::from_bytes_le(&b[20..36]),
        })
    }

    /// Decodes a raw sockaddr from a kernel-populated buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `len` readable bytes (or be null, which
    /// is reported as [`Error::InvalidPointer`]).
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Result<Self> {
        if ptr.is_null() {
            return Err(Error::InvalidPointer);
        }
        if len < 1 {
            return Err(Error::BufferSize { got: len, want: 1 });
        }
        Self::from_raw(std::slice::from_raw_parts(ptr, len))
    }
}

impl fmt::Display for HvsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vm_id, self.service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_vm_ids_are_bit_exact() {
        assert_eq!(VMID_WILDCARD.to_string(), "00000000-0000-0000-0000-000000000000");
        assert_eq!(VMID_BROADCAST.to_string(), "ffffffff-ffff-ffff-ffff-ffffffffffff");
        assert_eq!(VMID_LOOPBACK.to_string(), "e0e16197-dd56-4a10-9195-5ee7a155a838");
        assert_eq!(VMID_CHILDREN.to_string(), "90db8b89-0d35-4f79-8ce9-49ea0ac8b7cd");
        assert_eq!(VMID_PARENT.to_string(), "a42e7cda-d03f-480c-9cc2-a4de20abb878");
        assert_eq!(VMID_SILO_HOST.to_string(), "36bd0c5c-7276-4223-88ba-7d03b654c568");
    }

    #[test]
    fn vsock_service_id_splices_port_into_template() {
        assert_eq!(
            vsock_service_id(0x2329).to_string(),
            "00002329-facb-11e6-bd58-64006a7986d3"
        );
        assert_eq!(
            vsock_service_id(0).to_string(),
            "00000000-facb-11e6-bd58-64006a7986d3"
        );
        assert_eq!(
            vsock_service_id(u32::MAX).to_string(),
            "ffffffff-facb-11e6-bd58-64006a7986d3"
        );
    }

    #[test]
    fn raw_round_trip() {
        let addr = HvsockAddr::new(VMID_LOOPBACK, vsock_service_id(4097));
        let raw = addr.to_raw();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), AF_HYPERV);
        assert_eq!(raw[2], 0);
        assert_eq!(raw[3], 0);
        assert_eq!(HvsockAddr::from_raw(&raw).unwrap(), addr);
    }

    #[test]
    fn from_raw_rejects_short_buffer() {
        let err = HvsockAddr::from_raw(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferSize {
                got: 10,
                want: RAW_ADDR_LEN
            }
        ));
    }

    #[test]
    fn from_raw_rejects_wrong_family() {
        let addr = HvsockAddr::new(VMID_LOOPBACK, vsock_service_id(1));
        let mut raw = addr.to_raw();
        raw[0..2].copy_from_slice(&2u16.to_le_bytes()); // AF_INET
        let err = HvsockAddr::from_raw(&raw).unwrap_err();
        assert!(matches!(err, Error::AddrFamily { got: 2, want: AF_HYPERV }));
    }

    #[test]
    fn from_raw_parts_rejects_null() {
        let err = unsafe { HvsockAddr::from_raw_parts(std::ptr::null(), RAW_ADDR_LEN) };
        assert!(matches!(err.unwrap_err(), Error::InvalidPointer));
    }

    #[test]
    fn display_pairs_vm_and_service() {
        let addr = HvsockAddr::new(VMID_LOOPBACK, vsock_service_id(0x400));
        assert_eq!(
            addr.to_string(),
            "e0e16197-dd56-4a10-9195-5ee7a155a838:00000400-facb-11e6-bd58-64006a7986d3"
        );
        assert_eq!(addr.network(), "hvsock");
    }
}
