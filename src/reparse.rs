//! Reparse-point buffer codec.
//!
//! NTFS represents symlinks and mount points (junctions) as tagged reparse
//! buffers. The kernel hands these out and takes them back verbatim through
//! `FSCTL_GET_REPARSE_POINT` / `FSCTL_SET_REPARSE_POINT`; this module is the
//! codec for the two tags this crate understands, plus the Windows
//! `DeviceIoControl` bridge.
//!
//! Buffer layout (all little-endian):
//!
//! ```text
//! u32 tag; u16 data_length; u16 reserved;
//! u16 substitute_name_offset; u16 substitute_name_length;
//! u16 print_name_offset;      u16 print_name_length;
//! [u32 flags]                  // symlink only, bit 0 = relative target
//! <UTF-16LE path buffer>       // offsets/lengths are bytes into this buffer
//! ```

use crate::error::{Error, Result};

/// Reparse tag for symbolic links.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Reparse tag for mount points (junctions).
pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;

/// Symlink flag bit: target is relative to the link's directory.
const SYMLINK_FLAG_RELATIVE: u32 = 1;

/// Fixed header: tag + data length + reserved.
const HEADER_LEN: usize = 8;

/// The four name fields common to both variants.
const NAME_FIELDS_LEN: usize = 8;

/// NT namespace prefix stripped from decoded targets.
const NT_PREFIX: &str = r"\??\";

/// A decoded symlink or mount-point reparse point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparsePoint {
    /// Link target path.
    pub target: String,
    /// Mount point (junction) rather than symlink.
    pub is_mount_point: bool,
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedReparse {
        reason: reason.into(),
    }
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Whether a target path is relative (not rooted and not drive-qualified).
fn is_relative_path(target: &str) -> bool {
    if target.starts_with('\\') {
        return false;
    }
    let b = target.as_bytes();
    !(b.len() >= 2 && b[1] == b':' && b[0].is_ascii_alphabetic())
}

/// Decodes a reparse buffer produced by `FSCTL_GET_REPARSE_POINT`.
///
/// The substitute name is preferred when non-empty, the print name
/// otherwise; a leading `\??\` NT prefix is stripped from the result.
pub fn decode_reparse_point(buf: &[u8]) -> Result<ReparsePoint> {
    if buf.len() < HEADER_LEN {
        return Err(malformed(format!("buffer too short: {} bytes", buf.len())));
    }
    let tag = read_u32(buf, 0);
    let is_mount_point = match tag {
        IO_REPARSE_TAG_MOUNT_POINT => true,
        IO_REPARSE_TAG_SYMLINK => false,
        other => return Err(malformed(format!("unsupported reparse tag {other:#010x}"))),
    };

    let data_length = read_u16(buf, 4) as usize;
    let data = &buf[HEADER_LEN..];
    if data_length > data.len() {
        return Err(malformed(format!(
            "declared data length {data_length} exceeds buffer ({} bytes)",
            data.len()
        )));
    }
    let data = &data[..data_length];

    let fixed = if is_mount_point {
        NAME_FIELDS_LEN
    } else {
        NAME_FIELDS_LEN + 4 // trailing u32 flags
    };
    if data.len() < fixed {
        return Err(malformed("variant header truncated"));
    }

    let sub_offset = read_u16(data, 0) as usize;
    let sub_length = read_u16(data, 2) as usize;
    let print_offset = read_u16(data, 4) as usize;
    let print_length = read_u16(data, 6) as usize;

    let path_buf = &data[fixed..];
    let (offset, length) = if sub_length > 0 {
        (sub_offset, sub_length)
    } else {
        (print_offset, print_length)
    };
    if length % 2 != 0 {
        return Err(malformed("odd name length"));
    }
    let end = offset
        .checked_add(length)
        .ok_or_else(|| malformed("name range overflow"))?;
    if end > path_buf.len() {
        return Err(malformed(format!(
            "name range {offset}..{end} exceeds path buffer ({} bytes)",
            path_buf.len()
        )));
    }

    let units: Vec<u16> = path_buf[offset..end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let mut target =
        String::from_utf16(&units).map_err(|_| malformed("invalid UTF-16 in target"))?;
    if let Some(stripped) = target.strip_prefix(NT_PREFIX) {
        target = stripped.to_string();
    }

    Ok(ReparsePoint {
        target,
        is_mount_point,
    })
}

/// Encodes a reparse point into the buffer form `FSCTL_SET_REPARSE_POINT`
/// expects.
///
/// The target is written for both the substitute and print names,
/// NUL-terminated with the declared lengths excluding the terminator.
/// Mount-point targets must be absolute.
pub fn encode_reparse_point(rp: &ReparsePoint) -> Result<Vec<u8>> {
    let relative = is_relative_path(&rp.target);
    if rp.is_mount_point && relative {
        return Err(malformed(format!(
            "mount point target must be absolute: {}",
            rp.target
        )));
    }

    let name: Vec<u16> = rp.target.encode_utf16().collect();
    let name_bytes = name.len() * 2;
    let fixed = if rp.is_mount_point {
        NAME_FIELDS_LEN
    } else {
        NAME_FIELDS_LEN + 4
    };
    // Two copies of the name, each with a NUL terminator.
    let data_length = fixed + 2 * (name_bytes + 2);

    let mut buf = Vec::with_capacity(HEADER_LEN + data_length);
    let tag = if rp.is_mount_point {
        IO_REPARSE_TAG_MOUNT_POINT
    } else {
        IO_REPARSE_TAG_SYMLINK
    };
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(data_length as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // reserved

    buf.extend_from_slice(&0u16.to_le_bytes()); // substitute offset
    buf.extend_from_slice(&(name_bytes as u16).to_le_bytes());
    buf.extend_from_slice(&((name_bytes + 2) as u16).to_le_bytes()); // print offset
    buf.extend_from_slice(&(name_bytes as u16).to_le_bytes());
    if !rp.is_mount_point {
        let flags = if relative { SYMLINK_FLAG_RELATIVE } else { 0 };
        buf.extend_from_slice(&flags.to_le_bytes());
    }
    for _ in 0..2 {
        for unit in &name {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        buf.extend_from_slice(&0u16.to_le_bytes());
    }
    Ok(buf)
}

#[cfg(windows)]
pub use windows::{delete_reparse_point, get_reparse_point, set_reparse_point};

#[cfg(windows)]
mod windows {
    use super::*;
    use std::os::windows::io::RawHandle;
    use std::ptr::null_mut;
    use windows_sys::Win32::System::IO::DeviceIoControl;

    const FSCTL_GET_REPARSE_POINT: u32 = 0x000900A8;
    const FSCTL_SET_REPARSE_POINT: u32 = 0x000900A4;
    const FSCTL_DELETE_REPARSE_POINT: u32 = 0x000900AC;

    /// `MAXIMUM_REPARSE_DATA_BUFFER_SIZE`.
    const MAX_REPARSE_BUFFER: usize = 16 * 1024;

    /// Fetches the raw reparse buffer attached to an open handle.
    pub fn get_reparse_point(handle: RawHandle) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_REPARSE_BUFFER];
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                handle as _,
                FSCTL_GET_REPARSE_POINT,
                null_mut(),
                0,
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut returned,
                null_mut(),
            )
        };
        if ok == 0 {
            return Err(Error::syscall(
                "DeviceIoControl",
                std::io::Error::last_os_error(),
            ));
        }
        buf.truncate(returned as usize);
        Ok(buf)
    }

    /// Attaches a raw reparse buffer to an open handle.
    pub fn set_reparse_point(handle: RawHandle, buf: &[u8]) -> Result<()> {
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                handle as _,
                FSCTL_SET_REPARSE_POINT,
                buf.as_ptr() as *mut _,
                buf.len() as u32,
                null_mut(),
                0,
                &mut returned,
                null_mut(),
            )
        };
        if ok == 0 {
            return Err(Error::syscall(
                "DeviceIoControl",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    /// Removes the reparse point with the given tag from an open handle.
    pub fn delete_reparse_point(handle: RawHandle, tag: u32) -> Result<()> {
        // REPARSE_DATA_BUFFER header with zero-length data.
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&tag.to_le_bytes());
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                handle as _,
                FSCTL_DELETE_REPARSE_POINT,
                header.as_mut_ptr().cast(),
                header.len() as u32,
                null_mut(),
                0,
                &mut returned,
                null_mut(),
            )
        };
        if ok == 0 {
            return Err(Error::syscall(
                "DeviceIoControl",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}
