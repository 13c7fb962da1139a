//! Typed views of the two record kinds stored in record logs.
//!
//! Both the section directory and the metadata table are append-only logs of
//! variable-length records.  Each record starts with a 16-bit length whose
//! high bit marks a tombstone; the body that follows is padded with zeros to
//! a 32-byte boundary.
//!
//! ```text
//! section record (32-byte header):
//!  0  desc_len      u16   bit 15 = tombstone
//!  2  name_crc16    u16
//!  4  compression   [u8;4]
//!  8  data_length   u64
//! 16  block         BlockDescriptor
//! 32  desc          [u8; desc_len]  "name=<name>,..."  + zero pad to 32
//!
//! metadata record (4-byte header):
//!  0  data_len      u16   bit 15 = tombstone
//!  2  key_crc16     u16
//!  4  data          [u8; data_len]  "<key>=<value>"     + zero pad to 32
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{MediaError, Result};
use crate::span::BlockDescriptor;

pub const RECORD_ALIGN:  usize = 32;
pub const TOMBSTONE_BIT: u16   = 0x8000;

pub const NO_COMPRESSION: [u8; 4] = [0; 4];

pub(crate) static ZEROS: [u8; RECORD_ALIGN] = [0; RECORD_ALIGN];

/// Round `len` up to the record alignment.
pub fn padded_len(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

fn eof_is_corruption(what: &'static str) -> impl Fn(io::Error) -> MediaError {
    move |e| match e.kind() {
        io::ErrorKind::UnexpectedEof => MediaError::corrupted(format!("truncated {what}")),
        _                            => MediaError::from(e),
    }
}

// ── LengthField ──────────────────────────────────────────────────────────────

/// The leading `u16` of every record: a body length plus the tombstone bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthField(u16);

impl LengthField {
    pub fn live(len: u16) -> Self {
        debug_assert!(len & TOMBSTONE_BIT == 0);
        LengthField(len)
    }

    pub fn from_raw(raw: u16) -> Self {
        LengthField(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_tombstone(self) -> bool {
        self.0 & TOMBSTONE_BIT != 0
    }

    pub fn tombstoned(self) -> Self {
        LengthField(self.0 | TOMBSTONE_BIT)
    }

    /// Body length with the tombstone bit cleared.
    pub fn len(self) -> usize {
        (self.0 & !TOMBSTONE_BIT) as usize
    }

    /// Body length as laid out on disk.
    pub fn padded(self) -> usize {
        padded_len(self.len())
    }
}

// ── Section records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRecordHeader {
    pub desc_len:    LengthField,
    pub name_crc16:  u16,
    pub compression: [u8; 4],
    pub data_length: u64,
    pub block:       BlockDescriptor,
}

impl SectionRecordHeader {
    pub const SIZE:               u64 = 32;
    pub const DATA_LENGTH_OFFSET: u64 = 8;
    pub const BLOCK_OFFSET:       u64 = 16;

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.desc_len.raw())?;
        writer.write_u16::<LittleEndian>(self.name_crc16)?;
        writer.write_all(&self.compression)?;
        writer.write_u64::<LittleEndian>(self.data_length)?;
        self.block.write(&mut writer)
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let corrupt = eof_is_corruption("section record header");
        let desc_len = LengthField::from_raw(reader.read_u16::<LittleEndian>().map_err(&corrupt)?);
        let name_crc16 = reader.read_u16::<LittleEndian>().map_err(&corrupt)?;
        let mut compression = [0u8; 4];
        reader.read_exact(&mut compression).map_err(&corrupt)?;
        let data_length = reader.read_u64::<LittleEndian>().map_err(&corrupt)?;
        let block = BlockDescriptor::read(&mut reader).map_err(&corrupt)?;
        Ok(Self { desc_len, name_crc16, compression, data_length, block })
    }
}

/// A parsed section description, `"name=<name>[,<attrs>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDesc {
    pub desc: String,
    pub name: String,
}

impl SectionDesc {
    pub fn for_name(name: &str) -> Self {
        Self { desc: format!("name={name}"), name: name.to_string() }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let desc = String::from_utf8(raw.to_vec())
            .map_err(|_| MediaError::corrupted("section description is not UTF-8"))?;
        let value = desc.split_once('=')
            .map(|(_, rest)| rest)
            .ok_or_else(|| MediaError::corrupted("section description has no '='"))?;
        let name = value.split(',').next().unwrap_or_default().to_string();
        Ok(Self { desc, name })
    }
}

// ── Metadata records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecordHeader {
    pub data_len:  LengthField,
    pub key_crc16: u16,
}

impl MetadataRecordHeader {
    pub const SIZE: u64 = 4;

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.data_len.raw())?;
        writer.write_u16::<LittleEndian>(self.key_crc16)
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let corrupt = eof_is_corruption("metadata record header");
        let data_len = LengthField::from_raw(reader.read_u16::<LittleEndian>().map_err(&corrupt)?);
        let key_crc16 = reader.read_u16::<LittleEndian>().map_err(&corrupt)?;
        Ok(Self { data_len, key_crc16 })
    }
}

/// Split a `"<key>=<value>"` body at its first `=`.
pub fn parse_metadata_body(raw: &[u8]) -> Result<(String, String)> {
    let body = String::from_utf8(raw.to_vec())
        .map_err(|_| MediaError::corrupted("metadata entry is not UTF-8"))?;
    let (key, value) = body.split_once('=')
        .ok_or_else(|| MediaError::corrupted("metadata entry has no '='"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Read a record body of `len` bytes and skip its padding.
pub(crate) fn read_body<R: Read>(mut reader: R, field: LengthField) -> Result<Vec<u8>> {
    let mut body = vec![0u8; field.len()];
    reader.read_exact(&mut body).map_err(eof_is_corruption("record body"))?;
    let pad = (field.padded() - field.len()) as u64;
    let skipped = io::copy(&mut reader.by_ref().take(pad), &mut io::sink())?;
    if skipped != pad {
        return Err(MediaError::corrupted("truncated record padding"));
    }
    Ok(body)
}

/// Write a record body followed by its zero padding.
pub(crate) fn write_body<W: Write>(mut writer: W, body: &[u8]) -> io::Result<()> {
    writer.write_all(body)?;
    writer.write_all(&ZEROS[..padded_len(body.len()) - body.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    #[test]
    fn padding_and_tombstone_are_separate_steps() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(32), 32);
        assert_eq!(padded_len(33), 64);

        let live = LengthField::live(40);
        assert!(!live.is_tombstone());
        assert_eq!(live.padded(), 64);

        let dead = live.tombstoned();
        assert!(dead.is_tombstone());
        assert_eq!(dead.raw(), 0x8000 | 40);
        assert_eq!(dead.len(), 40);
        assert_eq!(dead.padded(), 64);
    }

    #[test]
    fn padding_near_the_length_limit() {
        let max = LengthField::live(crate::header::SECTION_DESC_MAX_LENGTH as u16);
        assert_eq!(max.padded(), 32736);
        let top = LengthField::from_raw(0xFFFF);
        assert!(top.is_tombstone());
        assert_eq!(top.len(), 0x7FFF);
        assert_eq!(top.padded(), 0x8000);
    }

    #[test]
    fn section_header_field_offsets() {
        let header = SectionRecordHeader {
            desc_len:    LengthField::live(12),
            name_crc16:  0xBEEF,
            compression: NO_COMPRESSION,
            data_length: 77,
            block:       BlockDescriptor { length: 77, first_span: Span::new(5, 2) },
        };
        let mut raw = Vec::new();
        header.write(&mut raw).unwrap();
        assert_eq!(raw.len() as u64, SectionRecordHeader::SIZE);

        let dl = SectionRecordHeader::DATA_LENGTH_OFFSET as usize;
        let bo = SectionRecordHeader::BLOCK_OFFSET as usize;
        assert_eq!(&raw[dl..dl + 8], &77u64.to_le_bytes());
        assert_eq!(&raw[bo..bo + 16], &header.block.to_bytes());
        assert_eq!(SectionRecordHeader::read(&raw[..]).unwrap(), header);
    }

    #[test]
    fn truncated_header_is_corruption() {
        let err = SectionRecordHeader::read(&[0u8; 10][..]).unwrap_err();
        assert!(err.is_corruption());
        let err = MetadataRecordHeader::read(&[0u8; 3][..]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn desc_parsing() {
        let d = SectionDesc::parse(b"name=tex.png,format=rgba").unwrap();
        assert_eq!(d.name, "tex.png");
        assert_eq!(d.desc, "name=tex.png,format=rgba");

        assert_eq!(SectionDesc::parse(b"name=plain").unwrap().name, "plain");
        assert!(SectionDesc::parse(b"garbage").unwrap_err().is_corruption());
    }

    #[test]
    fn metadata_body_splits_at_first_equals() {
        let (k, v) = parse_metadata_body(b"media.authored_using=name=zmf,version=1").unwrap();
        assert_eq!(k, "media.authored_using");
        assert_eq!(v, "name=zmf,version=1");
        assert!(parse_metadata_body(b"novalue").is_err());
    }

    #[test]
    fn body_round_trip_skips_padding() {
        let mut raw = Vec::new();
        write_body(&mut raw, b"key=value").unwrap();
        raw.extend_from_slice(b"NEXT");
        assert_eq!(raw.len(), 32 + 4);

        let mut cursor = &raw[..];
        let body = read_body(&mut cursor, LengthField::live(9)).unwrap();
        assert_eq!(body, b"key=value");
        assert_eq!(cursor, b"NEXT");
    }
}
