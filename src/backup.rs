//! Backup-stream codec.
//!
//! `BackupRead` serializes a file's data plus all of its NTFS metadata as a
//! concatenation of tagged records, each introduced by a `WIN32_STREAM_ID`
//! header:
//!
//! ```text
//! u32 stream_id; u32 attributes; i64 size; u32 name_length;
//! <name UTF-16LE, name_length bytes>
//! <data, size bytes>
//! ```
//!
//! Sparse data runs use a sub-protocol: the `Data` record carries
//! `STREAM_SPARSE_ATTRIBUTE` and zero size, and is followed by
//! `SparseBlock` records whose payload is prefixed with an 8-byte absolute
//! file offset. The codec folds that prefix into [`BackupHeader::offset`]
//! and reproduces it bit-exactly on write, so buffers written here feed
//! straight back into `BackupWrite`.
//!
//! [`BackupStreamReader`] / [`BackupStreamWriter`] run over any
//! `Read`/`Write`; the `BackupFileReader` / `BackupFileWriter` bridges to
//! the OS-native calls are Windows-only.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};

// =============================================================================
// Stream IDs and Attributes
// =============================================================================

/// Identifies the content of a backup-stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BackupStreamId {
    /// Standard file data (`::$DATA`).
    Data = 1,
    /// Extended attribute data.
    EaData = 2,
    /// Security descriptor data.
    Security = 3,
    /// Alternate data stream.
    AlternateData = 4,
    /// Hard link information.
    Link = 5,
    /// Property data.
    PropertyData = 6,
    /// Object identifier.
    ObjectId = 7,
    /// Reparse point data.
    Reparse = 8,
    /// One run of a sparse file.
    SparseBlock = 9,
    /// Transactional NTFS data.
    TxfsData = 10,
}

impl BackupStreamId {
    /// Maps a wire value to a known stream ID.
    #[must_use]
    pub fn from_wire(id: u32) -> Option<Self> {
        Some(match id {
            1 => Self::Data,
            2 => Self::EaData,
            3 => Self::Security,
            4 => Self::AlternateData,
            5 => Self::Link,
            6 => Self::PropertyData,
            7 => Self::ObjectId,
            8 => Self::Reparse,
            9 => Self::SparseBlock,
            10 => Self::TxfsData,
            _ => return None,
        })
    }
}

/// Stream attribute: data was modified while being read.
pub const STREAM_MODIFIED_WHEN_READ: u32 = 1;
/// Stream attribute: record carries security data.
pub const STREAM_CONTAINS_SECURITY: u32 = 2;
/// Stream attribute: record belongs to a sparse file.
pub const STREAM_SPARSE_ATTRIBUTE: u32 = 8;

/// Fixed portion of a `WIN32_STREAM_ID` header.
const STREAM_HEADER_LEN: usize = 20;

// =============================================================================
// BackupHeader
// =============================================================================

/// One record header in a backup stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHeader {
    /// Raw stream ID. Use [`BackupStreamId::from_wire`] to classify.
    pub id: u32,
    /// `STREAM_*` attribute bits.
    pub attributes: u32,
    /// Number of data bytes following the header (excluding the sparse
    /// offset prefix, which the codec folds into `offset`).
    pub size: i64,
    /// Stream name; empty for most records, `:name:$DATA` for alternate
    /// data streams.
    pub name: String,
    /// Absolute file offset of a sparse block; zero elsewhere.
    pub offset: i64,
}

impl BackupHeader {
    /// A plain record with no name or offset.
    #[must_use]
    pub fn new(id: BackupStreamId, size: i64) -> Self {
        Self {
            id: id as u32,
            attributes: 0,
            size,
            name: String::new(),
            offset: 0,
        }
    }
}

// =============================================================================
// BackupStreamReader
// =============================================================================

/// Reads a backup stream record by record.
///
/// Call [`next_header`](Self::next_header) to advance; between calls the
/// reader's `Read` impl is bounded to exactly the current record's `size`
/// bytes. Unread remainder is skipped on the next advance.
pub struct BackupStreamReader<R> {
    inner: R,
    bytes_left: u64,
}

impl<R: Read> BackupStreamReader<R> {
    /// Wraps a raw backup stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_left: 0,
        }
    }

    /// Advances to the next record, returning its header, or `None` at a
    /// clean end of stream.
    pub fn next_header(&mut self) -> Result<Option<BackupHeader>> {
        // Skip whatever the caller left unread.
        if self.bytes_left > 0 {
            io::copy(&mut self.by_ref_limited(), &mut io::sink())?;
            self.bytes_left = 0;
        }

        let mut fixed = [0u8; STREAM_HEADER_LEN];
        match read_full_or_eof(&mut self.inner, &mut fixed)? {
            false => return Ok(None),
            true => {}
        }

        let id = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
        let attributes = u32::from_le_bytes(fixed[4..8].try_into().unwrap());
        let mut size = i64::from_le_bytes(fixed[8..16].try_into().unwrap());
        let name_len = u32::from_le_bytes(fixed[16..20].try_into().unwrap()) as usize;
        if size < 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "negative stream size",
            )));
        }

        let mut name = String::new();
        if name_len > 0 {
            if name_len % 2 != 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "odd stream name length",
                )));
            }
            let mut raw = vec![0u8; name_len];
            self.inner.read_exact(&mut raw)?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            name = String::from_utf16(&units).map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "stream name is not valid UTF-16",
                ))
            })?;
        }

        let mut offset = 0i64;
        if id == BackupStreamId::SparseBlock as u32 {
            // Sparse blocks carry their absolute file offset as the first
            // eight bytes of data.
            let mut raw = [0u8; 8];
            self.inner.read_exact(&mut raw)?;
            offset = i64::from_le_bytes(raw);
            size -= 8;
            if size < 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "sparse block shorter than its offset prefix",
                )));
            }
        }

        self.bytes_left = size as u64;
        Ok(Some(BackupHeader {
            id,
            attributes,
            size,
            name,
            offset,
        }))
    }

    fn by_ref_limited(&mut self) -> io::Take<&mut R> {
        (&mut self.inner).take(self.bytes_left)
    }
}

impl<R: Read> Read for BackupStreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.bytes_left == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.bytes_left as usize);
        let n = self.inner.read(&mut buf[..cap])?;
        if n == 0 && cap > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backup stream truncated mid-record",
            ));
        }
        self.bytes_left -= n as u64;
        Ok(n)
    }
}

/// Reads `buf` fully, or returns `false` on a clean EOF before any byte.
fn read_full_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated stream header",
            )));
        }
        filled += n;
    }
    Ok(true)
}

// =============================================================================
// BackupStreamWriter
// =============================================================================

/// Writes a backup stream record by record.
pub struct BackupStreamWriter<W> {
    inner: W,
    bytes_left: u64,
}

impl<W: Write> BackupStreamWriter<W> {
    /// Wraps a sink for raw backup-stream bytes.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_left: 0,
        }
    }

    /// Emits a record header. The previous record must have been written in
    /// full.
    pub fn write_header(&mut self, hdr: &BackupHeader) -> Result<()> {
        if self.bytes_left > 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("previous stream is short {} bytes", self.bytes_left),
            )));
        }
        let name: Vec<u16> = hdr.name.encode_utf16().collect();
        let sparse = hdr.id == BackupStreamId::SparseBlock as u32;
        let wire_size = if sparse { hdr.size + 8 } else { hdr.size };

        let mut fixed = [0u8; STREAM_HEADER_LEN];
        fixed[0..4].copy_from_slice(&hdr.id.to_le_bytes());
        fixed[4..8].copy_from_slice(&hdr.attributes.to_le_bytes());
        fixed[8..16].copy_from_slice(&wire_size.to_le_bytes());
        fixed[16..20].copy_from_slice(&((name.len() * 2) as u32).to_le_bytes());
        self.inner.write_all(&fixed)?;
        for unit in &name {
            self.inner.write_all(&unit.to_le_bytes())?;
        }
        if sparse {
            self.inner.write_all(&hdr.offset.to_le_bytes())?;
        }
        self.bytes_left = hdr.size as u64;
        Ok(())
    }

    /// Consumes the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BackupStreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() as u64 > self.bytes_left {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "too many bytes for the current stream",
            ));
        }
        let n = self.inner.write(buf)?;
        self.bytes_left -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// =============================================================================
// OS Bridges
// =============================================================================

#[cfg(windows)]
pub use os::{BackupFileReader, BackupFileWriter};

#[cfg(windows)]
mod os {
    use super::*;
    use std::os::windows::io::RawHandle;
    use std::ptr::null_mut;
    use windows_sys::Win32::Storage::FileSystem::{BackupRead, BackupWrite};

    /// Streams the native backup serialization of a file.
    ///
    /// Wraps `BackupRead` on a borrowed handle; the caller keeps ownership
    /// of the handle and must keep it open for the reader's lifetime.
    pub struct BackupFileReader {
        handle: RawHandle,
        include_security: bool,
        ctx: *mut core::ffi::c_void,
    }

    // The context pointer is only touched through &mut self.
    unsafe impl Send for BackupFileReader {}

    impl BackupFileReader {
        /// Creates a reader for `handle`; `include_security` adds security
        /// descriptor records to the stream.
        pub fn new(handle: RawHandle, include_security: bool) -> Self {
            Self {
                handle,
                include_security,
                ctx: null_mut(),
            }
        }

        /// Releases the kernel backup context without closing the handle.
        pub fn close(&mut self) -> io::Result<()> {
            if !self.ctx.is_null() {
                let ok = unsafe {
                    BackupRead(self.handle as _, null_mut(), 0, null_mut(), 1, 0, &mut self.ctx)
                };
                self.ctx = null_mut();
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }
    }

    impl Read for BackupFileReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut read = 0u32;
            let ok = unsafe {
                BackupRead(
                    self.handle as _,
                    buf.as_mut_ptr(),
                    buf.len() as u32,
                    &mut read,
                    0,
                    self.include_security as i32,
                    &mut self.ctx,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(read as usize)
        }
    }

    impl Drop for BackupFileReader {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }

    /// Restores a file from its native backup serialization.
    ///
    /// Wraps `BackupWrite` on a borrowed handle.
    pub struct BackupFileWriter {
        handle: RawHandle,
        include_security: bool,
        ctx: *mut core::ffi::c_void,
    }

    unsafe impl Send for BackupFileWriter {}

    impl BackupFileWriter {
        /// Creates a writer for `handle`; `include_security` restores
        /// security descriptor records too.
        pub fn new(handle: RawHandle, include_security: bool) -> Self {
            Self {
                handle,
                include_security,
                ctx: null_mut(),
            }
        }

        /// Releases the kernel restore context without closing the handle.
        pub fn close(&mut self) -> io::Result<()> {
            if !self.ctx.is_null() {
                let ok = unsafe {
                    BackupWrite(self.handle as _, null_mut(), 0, null_mut(), 1, 0, &mut self.ctx)
                };
                self.ctx = null_mut();
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }
    }

    impl Write for BackupFileWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut written = 0u32;
            let ok = unsafe {
                BackupWrite(
                    self.handle as _,
                    buf.as_ptr() as *mut _,
                    buf.len() as u32,
                    &mut written,
                    0,
                    self.include_security as i32,
                    &mut self.ctx,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(written as usize)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for BackupFileWriter {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_stream(records: &[(BackupHeader, &[u8])]) -> Vec<u8> {
        let mut w = BackupStreamWriter::new(Vec::new());
        for (hdr, data) in records {
            w.write_header(hdr).unwrap();
            w.write_all(data).unwrap();
        }
        w.into_inner()
    }

    #[test]
    fn round_trip_data_and_alternate_stream() {
        let data = b"testing 1 2 3\n";
        let alt = b"alternate stream\n";
        let buf = write_stream(&[
            (BackupHeader::new(BackupStreamId::Data, data.len() as i64), data),
            (
                BackupHeader {
                    name: ":ads.txt:$DATA".to_string(),
                    ..BackupHeader::new(BackupStreamId::AlternateData, alt.len() as i64)
                },
                alt,
            ),
        ]);

        let mut r = BackupStreamReader::new(Cursor::new(buf));

        let hdr = r.next_header().unwrap().unwrap();
        assert_eq!(hdr.id, BackupStreamId::Data as u32);
        assert_eq!(hdr.name, "");
        assert_eq!(hdr.size, data.len() as i64);
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, data);

        let hdr = r.next_header().unwrap().unwrap();
        assert_eq!(hdr.id, BackupStreamId::AlternateData as u32);
        assert_eq!(hdr.name, ":ads.txt:$DATA");
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, alt);

        assert!(r.next_header().unwrap().is_none());
    }

    #[test]
    fn sparse_block_offset_round_trips() {
        let run = b"more data later\n";
        let buf = write_stream(&[
            (
                BackupHeader {
                    attributes: STREAM_SPARSE_ATTRIBUTE,
                    ..BackupHeader::new(BackupStreamId::Data, 0)
                },
                &[],
            ),
            (
                BackupHeader {
                    attributes: STREAM_SPARSE_ATTRIBUTE,
                    offset: 1_000_000,
                    ..BackupHeader::new(BackupStreamId::SparseBlock, run.len() as i64)
                },
                run,
            ),
        ]);

        // The sparse-block header must declare size + 8 on the wire.
        let sparse_start = STREAM_HEADER_LEN;
        let wire_size = i64::from_le_bytes(
            buf[sparse_start + 8..sparse_start + 16].try_into().unwrap(),
        );
        assert_eq!(wire_size, run.len() as i64 + 8);

        let mut r = BackupStreamReader::new(Cursor::new(buf));
        let hdr = r.next_header().unwrap().unwrap();
        assert_eq!(hdr.size, 0);
        assert_eq!(hdr.attributes, STREAM_SPARSE_ATTRIBUTE);

        let hdr = r.next_header().unwrap().unwrap();
        assert_eq!(hdr.id, BackupStreamId::SparseBlock as u32);
        assert_eq!(hdr.offset, 1_000_000);
        assert_eq!(hdr.size, run.len() as i64);
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, run);
    }

    #[test]
    fn next_header_skips_unread_data() {
        let buf = write_stream(&[
            (BackupHeader::new(BackupStreamId::Data, 5), b"01234"),
            (BackupHeader::new(BackupStreamId::Security, 3), b"abc"),
        ]);
        let mut r = BackupStreamReader::new(Cursor::new(buf));
        r.next_header().unwrap().unwrap();
        // Do not read the data; the reader discards it on advance.
        let hdr = r.next_header().unwrap().unwrap();
        assert_eq!(hdr.id, BackupStreamId::Security as u32);
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abc");
    }

    #[test]
    fn reader_is_bounded_to_record_size() {
        let buf = write_stream(&[
            (BackupHeader::new(BackupStreamId::Data, 4), b"data"),
            (BackupHeader::new(BackupStreamId::EaData, 4), b"more"),
        ]);
        let mut r = BackupStreamReader::new(Cursor::new(buf));
        r.next_header().unwrap().unwrap();
        let mut got = vec![0u8; 64];
        let n = r.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"data");
        assert_eq!(r.read(&mut got).unwrap(), 0, "reads past the record return 0");
    }

    #[test]
    fn writer_rejects_overlong_write() {
        let mut w = BackupStreamWriter::new(Vec::new());
        w.write_header(&BackupHeader::new(BackupStreamId::Data, 2))
            .unwrap();
        assert!(w.write_all(b"too much").is_err());
    }

    #[test]
    fn writer_rejects_header_after_short_record() {
        let mut w = BackupStreamWriter::new(Vec::new());
        w.write_header(&BackupHeader::new(BackupStreamId::Data, 10))
            .unwrap();
        w.write_all(b"short").unwrap();
        assert!(w.write_header(&BackupHeader::new(BackupStreamId::Data, 1)).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut buf = write_stream(&[(BackupHeader::new(BackupStreamId::Data, 8), b"12345678")]);
        buf.truncate(buf.len() - 3);
        let mut r = BackupStreamReader::new(Cursor::new(buf));
        r.next_header().unwrap().unwrap();
        let mut got = Vec::new();
        assert!(r.read_to_end(&mut got).is_err());
    }

    #[test]
    fn known_ids_map_from_wire() {
        assert_eq!(BackupStreamId::from_wire(1), Some(BackupStreamId::Data));
        assert_eq!(BackupStreamId::from_wire(9), Some(BackupStreamId::SparseBlock));
        assert_eq!(BackupStreamId::from_wire(11), None);
    }
}
