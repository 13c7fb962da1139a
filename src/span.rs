//! Sectors, spans and the append-only span allocator.
//!
//! The file is divided into fixed-size sectors.  A [`Span`] is a contiguous
//! run of sectors; a logical stream ([`BlockDescriptor`]) is a chain of spans
//! where every non-final span gives up its last [`TAG_SIZE`] bytes to a
//! chaining tag naming the next span.
//!
//! Allocation always happens at the current end of file and nothing is ever
//! freed.  Sector 0 holds the file header, so a span with `first_sector == 0`
//! doubles as "no span".
//!
//! All integers are little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::error::{MediaError, Result};

/// Size of an on-disk span / chaining tag: `first_sector:u32, sector_count:u32`.
pub const TAG_SIZE: u64 = 8;
/// Size of an on-disk block descriptor: `length:u64` followed by a span.
pub const DESCRIPTOR_SIZE: u64 = 16;

/// Anything a container can live on.
pub trait MediaIo: Read + Write + Seek {}

impl<T: Read + Write + Seek> MediaIo for T {}

// ── Span ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub first_sector: u32,
    pub sector_count: u32,
}

impl Span {
    pub const NONE: Span = Span { first_sector: 0, sector_count: 0 };

    pub fn new(first_sector: u32, sector_count: u32) -> Self {
        Self { first_sector, sector_count }
    }

    pub fn is_valid(&self) -> bool {
        self.first_sector != 0
    }

    /// A chaining tag is only trusted when it names a real, non-empty span
    /// other than the one it was read from.
    pub fn can_jump_to(&self, next: &Span) -> bool {
        next.first_sector != 0 && next.sector_count != 0 && next.first_sector != self.first_sector
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.first_sector)?;
        writer.write_u32::<LittleEndian>(self.sector_count)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            first_sector: reader.read_u32::<LittleEndian>()?,
            sector_count: reader.read_u32::<LittleEndian>()?,
        })
    }
}

// ── BlockDescriptor ──────────────────────────────────────────────────────────

/// `(length, first_span)` of one logical stream, as embedded in the file
/// header (section directory) or in a directory record (sections).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub length:     u64,
    pub first_span: Span,
}

impl BlockDescriptor {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.length)?;
        self.first_span.write(writer)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let length = reader.read_u64::<LittleEndian>()?;
        let first_span = Span::read(reader)?;
        Ok(Self { length, first_span })
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE as usize] {
        let mut out = [0u8; DESCRIPTOR_SIZE as usize];
        out[..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.first_span.first_sector.to_le_bytes());
        out[12..].copy_from_slice(&self.first_span.sector_count.to_le_bytes());
        out
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

/// The one file handle every stream of a container shares.
pub type SharedStorage<F> = Rc<RefCell<Storage<F>>>;

/// The underlying file plus the file-global sector size.  Owns the span
/// allocator.  Single-threaded by contract: streams reach it through
/// `Rc<RefCell<..>>` and never hold the borrow across calls.
pub struct Storage<F> {
    file:        F,
    sector_size: u32,
}

impl<F: MediaIo> Storage<F> {
    pub fn new(file: F, sector_size: u32) -> Self {
        Self { file, sector_size }
    }

    pub fn shared(self) -> SharedStorage<F> {
        Rc::new(RefCell::new(self))
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub(crate) fn set_sector_size(&mut self, sector_size: u32) {
        self.sector_size = sector_size;
    }

    pub fn file_size(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    /// Byte offset of the first byte of `span`.
    pub fn span_offset(&self, span: Span) -> u64 {
        span.first_sector as u64 * self.sector_size as u64
    }

    /// Raw capacity of `span`, chaining tag included.
    pub fn span_capacity(&self, span: Span) -> u64 {
        span.sector_count as u64 * self.sector_size as u64
    }

    /// Allocate one new span at the end of the file, large enough for
    /// `size_needed` bytes.  The file is grown by touching the last byte of
    /// the new extent; the rest of it is left to the filesystem to zero.
    pub fn allocate_span(&mut self, size_needed: u64) -> Result<Span> {
        let sector = self.sector_size as u64;
        let file_size = self.file_size()?;

        let first = (file_size + sector - 1) / sector;
        let count = (size_needed.saturating_add(sector - 1) / sector).max(1);

        if first > u32::MAX as u64 || count > u32::MAX as u64 || first + count > u32::MAX as u64 {
            return Err(MediaError::LimitExceeded(format!(
                "span of {count} sectors at sector {first} exceeds 32-bit sector addressing"
            )));
        }

        let span = Span::new(first as u32, count as u32);
        let last_byte = (first + count) * sector - 1;
        self.file.seek(SeekFrom::Start(last_byte))?;
        self.file.write_all(&[0u8])?;

        tracing::trace!(
            first_sector = span.first_sector,
            sector_count = span.sector_count,
            size_needed,
            "allocated span"
        );
        Ok(span)
    }

    /// Read as many bytes as the file holds at `offset`, up to `buf.len()`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.read(&mut buf[done..]) {
                Ok(0)  => break,
                Ok(n)  => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Like [`read_at`](Self::read_at) but a short read is corruption: the
    /// structure says the bytes are there.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let got = self.read_at(offset, buf)?;
        if got != buf.len() {
            return Err(MediaError::corrupted(format!(
                "short read at offset {offset}: wanted {} bytes, got {got}",
                buf.len()
            )));
        }
        Ok(())
    }

    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn read_tag(&mut self, offset: u64) -> Result<Span> {
        let mut raw = [0u8; TAG_SIZE as usize];
        self.read_exact_at(offset, &mut raw)?;
        Ok(Span::read(&raw[..])?)
    }

    pub fn write_tag(&mut self, offset: u64, next: Span) -> Result<()> {
        let mut raw = [0u8; TAG_SIZE as usize];
        next.write(&mut raw[..])?;
        self.write_all_at(offset, &raw)
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn storage_with_header(sector_size: u32) -> Storage<Cursor<Vec<u8>>> {
        Storage::new(Cursor::new(vec![0u8; 32]), sector_size)
    }

    #[test]
    fn first_allocation_skips_header_sector() {
        let mut st = storage_with_header(256);
        let span = st.allocate_span(10).unwrap();
        assert_eq!(span, Span::new(1, 1));
        assert_eq!(st.file_size().unwrap(), 512);
    }

    #[test]
    fn allocations_are_append_only_and_grow_whole_extent() {
        let mut st = storage_with_header(256);
        let a = st.allocate_span(600).unwrap();
        assert_eq!(a, Span::new(1, 3));
        assert_eq!(st.file_size().unwrap(), 4 * 256);

        let b = st.allocate_span(1).unwrap();
        assert_eq!(b, Span::new(4, 1));
        assert!(b.first_sector > a.first_sector);
    }

    #[test]
    fn unaligned_file_end_rounds_up() {
        let mut st = Storage::new(Cursor::new(vec![0u8; 300]), 256);
        let span = st.allocate_span(256).unwrap();
        assert_eq!(span.first_sector, 2);
    }

    #[test]
    fn sector_overflow_is_limit_exceeded() {
        let mut st = storage_with_header(256);
        let err = st.allocate_span(u64::MAX / 2).unwrap_err();
        assert!(matches!(err, MediaError::LimitExceeded(_)));
    }

    #[test]
    fn chain_jump_rules() {
        let span = Span::new(3, 1);
        assert!(span.can_jump_to(&Span::new(4, 2)));
        assert!(!span.can_jump_to(&Span::new(0, 2)));
        assert!(!span.can_jump_to(&Span::new(4, 0)));
        assert!(!span.can_jump_to(&Span::new(3, 1)));
    }

    #[test]
    fn descriptor_bytes_match_writer() {
        let desc = BlockDescriptor { length: 0x0102_0304, first_span: Span::new(7, 9) };
        let mut via_writer = Vec::new();
        desc.write(&mut via_writer).unwrap();
        assert_eq!(via_writer, desc.to_bytes());
        assert_eq!(BlockDescriptor::read(&via_writer[..]).unwrap(), desc);
    }

    #[test]
    fn short_read_is_corruption() {
        let mut st = storage_with_header(256);
        let mut buf = [0u8; 16];
        let err = st.read_exact_at(24, &mut buf).unwrap_err();
        assert!(err.is_corruption());
    }
}
