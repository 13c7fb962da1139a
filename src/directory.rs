//! Section directory: the record log mapping section names to streams.
//!
//! The directory is itself a [`BlockStream`] whose descriptor lives in the
//! file header.  Records are scanned linearly from the start; tombstoned
//! records are stepped over by their padded length without parsing.  Names
//! are matched by CRC16 first and then by full comparison.

use serde::Serialize;
use std::cell::RefCell;
use std::io::Write;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::block_stream::{BlockStream, DescriptorSlot};
use crate::crc16::crc16_ccitt;
use crate::error::{MediaError, Result};
use crate::header::SECTION_DESC_MAX_LENGTH;
use crate::record::{
    padded_len, read_body, write_body, LengthField, SectionDesc, SectionRecordHeader,
    NO_COMPRESSION,
};
use crate::span::{BlockDescriptor, MediaIo};

/// What a section-iteration visitor sees for each live record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    pub name_crc16:  u16,
    pub name:        String,
    pub desc:        String,
    pub compression: [u8; 4],
    pub data_length: u64,
    /// Logical length of the section's block.
    pub length:      u64,
}

impl SectionInfo {
    /// `"none"` for the zero tag, the tag itself when printable, hex otherwise.
    pub fn compression_tag(&self) -> String {
        if self.compression == NO_COMPRESSION {
            "none".to_string()
        } else if self.compression.iter().all(|b| b.is_ascii_graphic()) {
            String::from_utf8_lossy(&self.compression).into_owned()
        } else {
            hex::encode(self.compression)
        }
    }
}

/// Whether an iteration ran to the end or was stopped by its visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStatus {
    Completed,
    Stopped,
}

/// One step of a directory scan.
enum Entry {
    Live {
        at:     u64,
        header: SectionRecordHeader,
        desc:   SectionDesc,
    },
    Tombstone {
        padded: usize,
    },
}

pub struct SectionDirectory<F: MediaIo> {
    stream: Rc<RefCell<BlockStream<F>>>,
}

impl<F: MediaIo> SectionDirectory<F> {
    pub fn new(stream: BlockStream<F>) -> Self {
        Self { stream: Rc::new(RefCell::new(stream)) }
    }

    pub fn len(&self) -> u64 {
        self.stream.borrow().len()
    }

    pub fn flush(&self) -> Result<()> {
        self.stream.borrow_mut().flush_descriptor()
    }

    /// Append a new record for `name` (or reuse a tombstoned slot of the same
    /// padded size) and return a fresh, empty stream bound to it.  Does not
    /// check for an existing section of the same name.
    pub fn create_section(&self, name: &str, read_only: bool) -> Result<BlockStream<F>> {
        if read_only {
            return Err(MediaError::ReadOnly);
        }
        validate_name(name)?;

        let desc = SectionDesc::for_name(name);
        if desc.desc.len() > SECTION_DESC_MAX_LENGTH {
            return Err(MediaError::LimitExceeded(format!(
                "section description is {} bytes, limit is {SECTION_DESC_MAX_LENGTH}",
                desc.desc.len()
            )));
        }
        let padded = padded_len(desc.desc.len());

        let mut dir = self.stream.borrow_mut();
        dir.rewind_to_start();

        let mut reuse = None;
        while !dir.is_eof() {
            let at = dir.position();
            if let Entry::Tombstone { padded: old } = next_entry(&mut dir)? {
                if old == padded {
                    reuse = Some(at);
                    break;
                }
            }
        }
        let at = match reuse {
            Some(at) => {
                tracing::debug!(name, at, "reusing tombstoned directory slot");
                at
            }
            None => dir.len(),
        };

        let header = SectionRecordHeader {
            desc_len:    LengthField::live(desc.desc.len() as u16),
            name_crc16:  crc16_ccitt(name.as_bytes()),
            compression: NO_COMPRESSION,
            data_length: 0,
            block:       BlockDescriptor::default(),
        };
        let mut record = Vec::with_capacity(SectionRecordHeader::SIZE as usize + padded);
        header.write(&mut record)?;
        write_body(&mut record, desc.desc.as_bytes())?;

        dir.set_pos(at)?;
        dir.write_all(&record)?;
        dir.flush_descriptor()?;
        tracing::debug!(name, at, "created section");

        let storage = Rc::clone(dir.storage());
        drop(dir);

        Ok(BlockStream::new(
            storage,
            false,
            BlockDescriptor::default(),
            DescriptorSlot::Record {
                directory:     Rc::clone(&self.stream),
                record_offset: at,
                name:          name.to_owned(),
            },
        ))
    }

    /// Find the first live record named `name`.
    pub fn open_section(&self, name: &str, read_only: bool) -> Result<Option<BlockStream<F>>> {
        let crc = crc16_ccitt(name.as_bytes());

        let mut dir = self.stream.borrow_mut();
        dir.rewind_to_start();

        while !dir.is_eof() {
            if let Entry::Live { at, header, desc } = next_entry(&mut dir)? {
                if header.name_crc16 == crc && desc.name == name {
                    let storage = Rc::clone(dir.storage());
                    drop(dir);
                    return Ok(Some(BlockStream::new(
                        storage,
                        read_only,
                        header.block,
                        DescriptorSlot::Record {
                            directory:     Rc::clone(&self.stream),
                            record_offset: at,
                            name:          name.to_owned(),
                        },
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Visit every live record in directory order.
    pub fn iterate<V>(&self, mut visitor: V) -> Result<IterStatus>
    where
        V: FnMut(&SectionInfo) -> ControlFlow<()>,
    {
        let mut dir = self.stream.borrow_mut();
        dir.rewind_to_start();

        while !dir.is_eof() {
            if let Entry::Live { header, desc, .. } = next_entry(&mut dir)? {
                let info = SectionInfo {
                    name_crc16:  header.name_crc16,
                    name:        desc.name,
                    desc:        desc.desc,
                    compression: header.compression,
                    data_length: header.data_length,
                    length:      header.block.length,
                };
                if visitor(&info).is_break() {
                    return Ok(IterStatus::Stopped);
                }
            }
        }
        Ok(IterStatus::Completed)
    }

    /// Tombstone the first live record named `name`.  Its spans stay
    /// allocated and unreachable.
    pub fn tombstone_section(&self, name: &str, read_only: bool) -> Result<bool> {
        if read_only {
            return Err(MediaError::ReadOnly);
        }
        let crc = crc16_ccitt(name.as_bytes());

        let mut dir = self.stream.borrow_mut();
        dir.rewind_to_start();

        while !dir.is_eof() {
            if let Entry::Live { at, header, desc } = next_entry(&mut dir)? {
                if header.name_crc16 == crc && desc.name == name {
                    let raw = header.desc_len.tombstoned().raw();
                    dir.write_at(at, &raw.to_le_bytes())?;
                    tracing::debug!(name, at, "tombstoned section record");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn next_entry<F: MediaIo>(dir: &mut BlockStream<F>) -> Result<Entry> {
    let at = dir.position();
    let header = SectionRecordHeader::read(&mut *dir)?;

    if header.desc_len.is_tombstone() {
        let padded = header.desc_len.padded();
        dir.skip(padded as u64)
            .map_err(|_| MediaError::corrupted("tombstoned record runs past end of directory"))?;
        return Ok(Entry::Tombstone { padded });
    }

    let body = read_body(&mut *dir, header.desc_len)?;
    let desc = SectionDesc::parse(&body)?;
    Ok(Entry::Live { at, header, desc })
}

/// A name is cut at the first `,` when its description is parsed back.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.contains(',') || name.contains('\0') {
        return Err(MediaError::InvalidName(format!(
            "section name {name:?} must not contain ',' or NUL"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Storage, Span};
    use std::io::{Cursor, Read};

    type Dir = SectionDirectory<Cursor<Vec<u8>>>;

    fn directory() -> Dir {
        let storage = Storage::new(Cursor::new(vec![0u8; 32]), 256).shared();
        SectionDirectory::new(BlockStream::new(
            storage,
            false,
            BlockDescriptor::default(),
            DescriptorSlot::Header { offset: 16 },
        ))
    }

    fn names(dir: &Dir) -> Vec<String> {
        let mut out = Vec::new();
        dir.iterate(|info| {
            out.push(info.name.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
        out
    }

    #[test]
    fn create_then_open() {
        let dir = directory();
        {
            let mut s = dir.create_section("tex.png", false).unwrap();
            s.write_all(b"0123456789").unwrap();
        }
        let mut s = dir.open_section("tex.png", false).unwrap().expect("section exists");
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
        assert!(dir.open_section("missing", false).unwrap().is_none());
    }

    #[test]
    fn records_are_header_plus_padded_desc() {
        let dir = directory();
        dir.create_section("a", false).unwrap();
        assert_eq!(dir.len(), 32 + 32);
        dir.create_section(&"x".repeat(40), false).unwrap();
        assert_eq!(dir.len(), 64 + 32 + 64);
    }

    #[test]
    fn drop_writes_length_and_mirror() {
        let dir = directory();
        {
            let mut s = dir.create_section("blob", false).unwrap();
            s.write_all(&[1u8; 300]).unwrap();
        }
        let mut seen = None;
        dir.iterate(|info| {
            seen = Some(info.clone());
            ControlFlow::Break(())
        })
        .unwrap();
        let info = seen.unwrap();
        assert_eq!(info.length, 300);
        assert_eq!(info.data_length, 300);
        assert_eq!(info.compression_tag(), "none");
        assert_eq!(info.desc, "name=blob");
    }

    #[test]
    fn iteration_can_stop_early() {
        let dir = directory();
        for n in ["a", "b", "c"] {
            dir.create_section(n, false).unwrap();
        }
        let mut count = 0;
        let status = dir
            .iterate(|_| {
                count += 1;
                if count == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })
            .unwrap();
        assert_eq!(status, IterStatus::Stopped);
        assert_eq!(count, 2);
        assert_eq!(names(&dir), vec!["a", "b", "c"]);
    }

    #[test]
    fn tombstoned_records_are_skipped_and_slot_reused() {
        let dir = directory();
        dir.create_section("first", false).unwrap();
        dir.create_section("second", false).unwrap();
        let len = dir.len();

        assert!(dir.tombstone_section("first", false).unwrap());
        assert_eq!(names(&dir), vec!["second"]);
        assert!(dir.open_section("first", false).unwrap().is_none());

        // Same padded size: the dead slot is reused, the directory does not grow.
        dir.create_section("third", false).unwrap();
        assert_eq!(dir.len(), len);
        assert_eq!(names(&dir), vec!["third", "second"]);
    }

    #[test]
    fn limits_and_read_only() {
        let dir = directory();
        let long = "n".repeat(SECTION_DESC_MAX_LENGTH);
        assert!(matches!(dir.create_section(&long, false), Err(MediaError::LimitExceeded(_))));
        assert!(matches!(dir.create_section("x", true), Err(MediaError::ReadOnly)));
        assert!(matches!(dir.create_section("a,b", false), Err(MediaError::InvalidName(_))));
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn garbage_record_is_corruption() {
        let dir = directory();
        {
            let mut s = dir.stream.borrow_mut();
            let header = SectionRecordHeader {
                desc_len:    LengthField::live(4),
                name_crc16:  0,
                compression: NO_COMPRESSION,
                data_length: 0,
                block:       BlockDescriptor { length: 0, first_span: Span::NONE },
            };
            let mut raw = Vec::new();
            header.write(&mut raw).unwrap();
            write_body(&mut raw, b"oops").unwrap();
            s.write_all(&raw).unwrap();
        }
        let err = dir.open_section("oops", false).err().unwrap();
        assert!(err.is_corruption());
    }
}
