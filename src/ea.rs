//! Extended-attribute (EA) codec.
//!
//! NTFS extended attributes travel in `FILE_FULL_EA_INFORMATION` buffers:
//!
//! ```text
//! u32 next_entry_offset;  // bytes from this entry to the next, 0 = last
//! u8  flags;
//! u8  name_length;        // excluding the NUL terminator
//! u16 value_length;
//! <name bytes> NUL <value bytes>
//! ```
//!
//! Entries after the first are 4-byte aligned. The same buffers appear in
//! the EA-data records of a backup stream, and [`get_file_ea`] /
//! [`set_file_ea`] exchange them with the kernel for an open handle.

use crate::error::Result;
use std::io;

const EA_HEADER_LEN: usize = 8;

/// A single extended attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAttribute {
    /// Attribute name. The kernel stores names case-insensitively upper-cased.
    pub name: String,
    /// Attribute value.
    pub value: Vec<u8>,
    /// `FILE_FULL_EA_INFORMATION` flags byte.
    pub flags: u8,
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn parse_entry(b: &[u8]) -> io::Result<(ExtendedAttribute, usize)> {
    if b.len() < EA_HEADER_LEN {
        return Err(invalid("extended attribute entry truncated"));
    }
    let next_offset = u32::from_le_bytes(b[0..4].try_into().unwrap()) as usize;
    let flags = b[4];
    let name_len = b[5] as usize;
    let value_len = u16::from_le_bytes(b[6..8].try_into().unwrap()) as usize;

    let name_end = EA_HEADER_LEN + name_len;
    let value_end = name_end + 1 + value_len; // NUL between name and value
    if value_end > b.len() {
        return Err(invalid("extended attribute data exceeds buffer"));
    }
    let name = std::str::from_utf8(&b[EA_HEADER_LEN..name_end])
        .map_err(|_| invalid("extended attribute name is not valid UTF-8"))?
        .to_string();
    let value = b[name_end + 1..value_end].to_vec();

    if next_offset != 0 && (next_offset < value_end || next_offset > b.len()) {
        return Err(invalid("bad next-entry offset"));
    }
    Ok((
        ExtendedAttribute { name, value, flags },
        next_offset,
    ))
}

/// Decodes every extended attribute in a `FILE_FULL_EA_INFORMATION` buffer.
pub fn decode_extended_attributes(buf: &[u8]) -> Result<Vec<ExtendedAttribute>> {
    let mut eas = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (ea, next) = parse_entry(rest)?;
        eas.push(ea);
        if next == 0 {
            break;
        }
        rest = &rest[next..];
    }
    Ok(eas)
}

/// Encodes extended attributes into a `FILE_FULL_EA_INFORMATION` buffer.
///
/// Entries are 4-byte aligned; the last entry's next-offset is zero.
pub fn encode_extended_attributes(eas: &[ExtendedAttribute]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (i, ea) in eas.iter().enumerate() {
        if ea.name.len() > u8::MAX as usize {
            return Err(invalid("extended attribute name too long").into());
        }
        if ea.value.len() > u16::MAX as usize {
            return Err(invalid("extended attribute value too long").into());
        }
        let start = buf.len();
        let entry_len = EA_HEADER_LEN + ea.name.len() + 1 + ea.value.len();
        let last = i == eas.len() - 1;
        let next = if last {
            0
        } else {
            (entry_len + 3) & !3 // pad to 4-byte alignment
        };

        buf.extend_from_slice(&(next as u32).to_le_bytes());
        buf.push(ea.flags);
        buf.push(ea.name.len() as u8);
        buf.extend_from_slice(&(ea.value.len() as u16).to_le_bytes());
        buf.extend_from_slice(ea.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&ea.value);
        if !last {
            buf.resize(start + next, 0);
        }
    }
    Ok(buf)
}

// =============================================================================
// OS Bridge
// =============================================================================

#[cfg(windows)]
pub use os::{get_file_ea, set_file_ea};

#[cfg(windows)]
mod os {
    use super::*;
    use crate::error::Error;
    use std::ffi::c_void;
    use std::os::windows::io::RawHandle;
    use std::ptr::null;
    use std::sync::OnceLock;
    use windows_sys::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, ERROR_MORE_DATA};
    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

    /// Starting size for the query buffer; doubled until the EA set fits.
    const INITIAL_EA_BUFFER: usize = 1024;

    /// `STATUS_NO_EAS_ON_FILE`: the handle simply has no extended
    /// attributes, which is an empty result, not a failure.
    const STATUS_NO_EAS_ON_FILE: i32 = 0x8000_0012u32 as i32;

    #[repr(C)]
    struct IoStatusBlock {
        status: usize,
        information: usize,
    }

    type NtQueryEaFileFn = unsafe extern "system" fn(
        handle: usize,
        io_status: *mut IoStatusBlock,
        buffer: *mut u8,
        length: u32,
        return_single_entry: u8,
        ea_list: *const c_void,
        ea_list_length: u32,
        ea_index: *const u32,
        restart_scan: u8,
    ) -> i32;

    type NtSetEaFileFn = unsafe extern "system" fn(
        handle: usize,
        io_status: *mut IoStatusBlock,
        buffer: *const u8,
        length: u32,
    ) -> i32;

    type RtlNtStatusToDosErrorNoTebFn = unsafe extern "system" fn(status: i32) -> u32;

    struct Ntdll {
        nt_query_ea_file: NtQueryEaFileFn,
        nt_set_ea_file: NtSetEaFileFn,
        rtl_nt_status_to_dos_error: RtlNtStatusToDosErrorNoTebFn,
    }

    fn ntdll() -> Result<&'static Ntdll> {
        static NTDLL: OnceLock<Option<Ntdll>> = OnceLock::new();
        NTDLL
            .get_or_init(|| unsafe {
                let name: Vec<u16> = "ntdll.dll".encode_utf16().chain(std::iter::once(0)).collect();
                let module = GetModuleHandleW(name.as_ptr());
                if module.is_null() {
                    return None;
                }
                macro_rules! import {
                    ($name:literal) => {{
                        let f = GetProcAddress(module, concat!($name, "\0").as_ptr())?;
                        std::mem::transmute(f)
                    }};
                }
                Some(Ntdll {
                    nt_query_ea_file: import!("NtQueryEaFile"),
                    nt_set_ea_file: import!("NtSetEaFile"),
                    rtl_nt_status_to_dos_error: import!("RtlNtStatusToDosErrorNoTeb"),
                })
            })
            .as_ref()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "required ntdll entry points unavailable",
                ))
            })
    }

    fn nt_status_code(ntdll: &Ntdll, status: i32) -> u32 {
        unsafe { (ntdll.rtl_nt_status_to_dos_error)(status) }
    }

    /// Reads every extended attribute attached to an open handle.
    ///
    /// The query buffer starts small and doubles while the kernel reports
    /// it cannot fit the EA set.
    pub fn get_file_ea(handle: RawHandle) -> Result<Vec<ExtendedAttribute>> {
        let ntdll = ntdll()?;
        let mut buf = vec![0u8; INITIAL_EA_BUFFER];
        loop {
            let mut io_status = IoStatusBlock {
                status: 0,
                information: 0,
            };
            let status = unsafe {
                (ntdll.nt_query_ea_file)(
                    handle as usize,
                    &mut io_status,
                    buf.as_mut_ptr(),
                    buf.len() as u32,
                    0,
                    null(),
                    0,
                    null(),
                    1,
                )
            };
            if status >= 0 {
                return decode_extended_attributes(&buf[..io_status.information]);
            }
            if status == STATUS_NO_EAS_ON_FILE {
                return Ok(Vec::new());
            }
            let code = nt_status_code(ntdll, status);
            if code == ERROR_INSUFFICIENT_BUFFER || code == ERROR_MORE_DATA {
                let doubled = buf.len() * 2;
                buf.resize(doubled, 0);
                continue;
            }
            return Err(Error::syscall_code("NtQueryEaFile", code));
        }
    }

    /// Attaches extended attributes to an open handle.
    pub fn set_file_ea(handle: RawHandle, eas: &[ExtendedAttribute]) -> Result<()> {
        let ntdll = ntdll()?;
        let buf = encode_extended_attributes(eas)?;
        let mut io_status = IoStatusBlock {
            status: 0,
            information: 0,
        };
        let status = unsafe {
            (ntdll.nt_set_ea_file)(
                handle as usize,
                &mut io_status,
                buf.as_ptr(),
                buf.len() as u32,
            )
        };
        if status < 0 {
            return Err(Error::syscall_code(
                "NtSetEaFile",
                nt_status_code(ntdll, status),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A buffer captured from BackupRead on a file with a single
    // "$KERNEL.PURGE.APPXFICACHE" attribute; regression data for layout
    // drift.
    const SINGLE_EA: &[u8] = &[
        0, 0, 0, 0, 0, 25, 26, 0, 36, 75, 69, 82, 78, 69, 76, 46, 80, 85, 82, 71, 69, 46, 65, 80,
        80, 88, 70, 73, 67, 65, 67, 72, 69, 0, 108, 82, 97, 241, 66, 127, 209, 1, 100, 94, 90, 16,
        0, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];

    #[test]
    fn decode_single_captured_buffer() {
        let eas = decode_extended_attributes(SINGLE_EA).unwrap();
        assert_eq!(eas.len(), 1);
        assert_eq!(eas[0].name, "$KERNEL.PURGE.APPXFICACHE");
        assert_eq!(eas[0].value.len(), 26);
        assert_eq!(eas[0].flags, 0);
    }

    #[test]
    fn round_trip_multiple() {
        let eas = vec![
            ExtendedAttribute {
                name: "FOO".to_string(),
                value: b"hello".to_vec(),
                flags: 0,
            },
            ExtendedAttribute {
                name: "BAR.BAZ".to_string(),
                value: vec![0, 1, 2, 3, 0xff],
                flags: 0x80,
            },
            ExtendedAttribute {
                name: "EMPTY".to_string(),
                value: Vec::new(),
                flags: 0,
            },
        ];
        let buf = encode_extended_attributes(&eas).unwrap();
        assert_eq!(decode_extended_attributes(&buf).unwrap(), eas);
    }

    #[test]
    fn entries_are_four_byte_aligned() {
        let eas = vec![
            ExtendedAttribute {
                name: "A".to_string(),
                value: b"x".to_vec(),
                flags: 0,
            },
            ExtendedAttribute {
                name: "B".to_string(),
                value: b"y".to_vec(),
                flags: 0,
            },
        ];
        let buf = encode_extended_attributes(&eas).unwrap();
        let next = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(next % 4, 0);
        assert_eq!(decode_extended_attributes(&buf).unwrap(), eas);
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        let eas = vec![ExtendedAttribute {
            name: "NAME".to_string(),
            value: b"value".to_vec(),
            flags: 0,
        }];
        let mut buf = encode_extended_attributes(&eas).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(decode_extended_attributes(&buf).is_err());
    }

    #[test]
    fn encode_rejects_oversized_name() {
        let eas = vec![ExtendedAttribute {
            name: "N".repeat(300),
            value: Vec::new(),
            flags: 0,
        }];
        assert!(encode_extended_attributes(&eas).is_err());
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        assert!(decode_extended_attributes(&[]).unwrap().is_empty());
    }
}
