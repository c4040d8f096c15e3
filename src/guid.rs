//! GUID value type and codec.
//!
//! Hyper-V addresses VMs and services by GUID, and the raw `AF_HYPERV`
//! sockaddr carries two of them in the Windows (mixed-endian) layout:
//! `data1`/`data2`/`data3` little-endian, `data4` as-is.

use std::fmt;
use std::str::FromStr;

/// Size of an encoded GUID in bytes.
pub const GUID_LEN: usize = 16;

/// A Windows GUID.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    /// First 32 bits.
    pub data1: u32,
    /// Next 16 bits.
    pub data2: u16,
    /// Next 16 bits.
    pub data3: u16,
    /// Final 64 bits, byte order independent of host endianness.
    pub data4: [u8; 8],
}

impl Guid {
    /// Creates a GUID from its four components.
    #[must_use]
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// The all-zero GUID.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0, 0, [0; 8])
    }

    /// Encodes into the Windows in-memory layout.
    #[must_use]
    pub fn to_bytes_le(&self) -> [u8; GUID_LEN] {
        let mut b = [0u8; GUID_LEN];
        b[0..4].copy_from_slice(&self.data1.to_le_bytes());
        b[4..6].copy_from_slice(&self.data2.to_le_bytes());
        b[6..8].copy_from_slice(&self.data3.to_le_bytes());
        b[8..16].copy_from_slice(&self.data4);
        b
    }

    /// Decodes from the Windows in-memory layout.
    ///
    /// # Panics
    ///
    /// Panics if `b` is shorter than [`GUID_LEN`]; callers validate sizes at
    /// the sockaddr boundary.
    #[must_use]
    pub fn from_bytes_le(b: &[u8]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&b[8..16]);
        Self {
            data1: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            data2: u16::from_le_bytes(b[4..6].try_into().unwrap()),
            data3: u16::from_le_bytes(b[6..8].try_into().unwrap()),
            data4,
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

/// Error parsing a GUID string.
#[derive(Debug, thiserror::Error)]
#[error("invalid GUID: {0}")]
pub struct GuidParseError(String);

impl FromStr for Guid {
    type Err = GuidParseError;

    /// Parses the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || GuidParseError(s.to_string());
        if s.len() != 36 || !s.bytes().all(|c| c.is_ascii_hexdigit() || c == b'-') {
            return Err(bad());
        }
        let b = s.as_bytes();
        if b[8] != b'-' || b[13] != b'-' || b[18] != b'-' || b[23] != b'-' {
            return Err(bad());
        }

        let hex_u32 = |r: &str| u32::from_str_radix(r, 16).map_err(|_| bad());
        let hex_u16 = |r: &str| u16::from_str_radix(r, 16).map_err(|_| bad());
        let hex_u8 = |r: &str| u8::from_str_radix(r, 16).map_err(|_| bad());

        let data1 = hex_u32(&s[0..8])?;
        let data2 = hex_u16(&s[9..13])?;
        let data3 = hex_u16(&s[14..18])?;
        let mut data4 = [0u8; 8];
        data4[0] = hex_u8(&s[19..21])?;
        data4[1] = hex_u8(&s[21..23])?;
        for (i, d) in data4[2..].iter_mut().enumerate() {
            let at = 24 + i * 2;
            *d = hex_u8(&s[at..at + 2])?;
        }
        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_canonical_form() {
        let g = Guid::new(
            0xe0e16197,
            0xdd56,
            0x4a10,
            [0x91, 0x95, 0x5e, 0xe7, 0xa1, 0x55, 0xa8, 0x38],
        );
        assert_eq!(g.to_string(), "e0e16197-dd56-4a10-9195-5ee7a155a838");
    }

    #[test]
    fn parse_round_trips() {
        let text = "90db8b89-0d35-4f79-8ce9-49ea0ac8b7cd";
        let g: Guid = text.parse().unwrap();
        assert_eq!(g.data1, 0x90db8b89);
        assert_eq!(g.data2, 0x0d35);
        assert_eq!(g.data3, 0x4f79);
        assert_eq!(g.data4, [0x8c, 0xe9, 0x49, 0xea, 0x0a, 0xc8, 0xb7, 0xcd]);
        assert_eq!(g.to_string(), text);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("".parse::<Guid>().is_err());
        assert!("90db8b89-0d35-4f79-8ce9".parse::<Guid>().is_err());
        assert!("90db8b89x0d35-4f79-8ce9-49ea0ac8b7cd".parse::<Guid>().is_err());
        assert!("90db8b89-0d35-4f79-8ce9-49ea0ac8b7cg".parse::<Guid>().is_err());
    }

    #[test]
    fn wire_encoding_is_mixed_endian() {
        let g = Guid::new(0x01020304, 0x0506, 0x0708, [9, 10, 11, 12, 13, 14, 15, 16]);
        let b = g.to_bytes_le();
        assert_eq!(
            b,
            [4, 3, 2, 1, 6, 5, 8, 7, 9, 10, 11, 12, 13, 14, 15, 16]
        );
        assert_eq!(Guid::from_bytes_le(&b), g);
    }
}
