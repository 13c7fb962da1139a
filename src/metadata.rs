//! Metadata table: `key=value` strings stored as a record log inside the
//! reserved `media.Metadata` section.
//!
//! Updates overwrite in place when the new record pads to the same size as
//! the old one.  Otherwise the old record is tombstoned and the new one is
//! appended; the dead record's space is never reclaimed.

use serde::Serialize;
use std::io::Write;
use std::ops::ControlFlow;

use crate::block_stream::BlockStream;
use crate::crc16::crc16_ccitt;
use crate::directory::IterStatus;
use crate::error::{MediaError, Result};
use crate::header::METADATA_MAX_ENTRY_LENGTH;
use crate::record::{
    padded_len, parse_metadata_body, read_body, write_body, LengthField, MetadataRecordHeader,
};
use crate::span::MediaIo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataEntry {
    pub key_crc16: u16,
    pub key:       String,
    pub value:     String,
}

enum Entry {
    Live {
        at:     u64,
        header: MetadataRecordHeader,
        key:    String,
        value:  String,
    },
    Tombstone,
}

pub struct MetadataTable<F: MediaIo> {
    stream: BlockStream<F>,
}

impl<F: MediaIo> MetadataTable<F> {
    pub fn new(stream: BlockStream<F>) -> Self {
        Self { stream }
    }

    /// Logical length of the backing section.
    pub fn len(&self) -> u64 {
        self.stream.len()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush_descriptor()
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        let crc = crc16_ccitt(key.as_bytes());
        let mut found = None;
        self.iterate(|entry| {
            if entry.key_crc16 == crc && entry.key == key {
                found = Some(entry.value.clone());
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.stream.is_read_only() {
            return Err(MediaError::ReadOnly);
        }
        if key.contains('=') {
            return Err(MediaError::InvalidName(format!("metadata key {key:?} must not contain '='")));
        }

        let data = format!("{key}={value}");
        if data.len() > METADATA_MAX_ENTRY_LENGTH {
            return Err(MediaError::LimitExceeded(format!(
                "metadata entry is {} bytes, limit is {METADATA_MAX_ENTRY_LENGTH}",
                data.len()
            )));
        }
        let crc = crc16_ccitt(key.as_bytes());
        let padded = padded_len(data.len());

        self.stream.rewind_to_start();
        let mut target = None;

        while !self.stream.is_eof() {
            let Entry::Live { at, header, key: rd_key, .. } = next_entry(&mut self.stream)? else {
                continue;
            };
            if header.key_crc16 != crc || rd_key != key {
                continue;
            }
            if header.data_len.padded() == padded {
                target = Some(at);
                break;
            }
            let next = self.stream.position();
            let raw = header.data_len.tombstoned().raw();
            self.stream.write_at(at, &raw.to_le_bytes())?;
            self.stream.set_pos(next)?;
            tracing::debug!(key, at, "tombstoned metadata record");
        }

        let at = target.unwrap_or_else(|| self.stream.len());
        let header = MetadataRecordHeader {
            data_len:  LengthField::live(data.len() as u16),
            key_crc16: crc,
        };
        let mut record = Vec::with_capacity(MetadataRecordHeader::SIZE as usize + padded);
        header.write(&mut record)?;
        write_body(&mut record, data.as_bytes())?;

        self.stream.set_pos(at)?;
        self.stream.write_all(&record)?;
        self.stream.flush_descriptor()?;
        tracing::trace!(key, at, in_place = target.is_some(), "stored metadata entry");
        Ok(())
    }

    pub fn iterate<V>(&mut self, mut visitor: V) -> Result<IterStatus>
    where
        V: FnMut(&MetadataEntry) -> ControlFlow<()>,
    {
        self.stream.rewind_to_start();
        while !self.stream.is_eof() {
            if let Entry::Live { header, key, value, .. } = next_entry(&mut self.stream)? {
                let entry = MetadataEntry { key_crc16: header.key_crc16, key, value };
                if visitor(&entry).is_break() {
                    return Ok(IterStatus::Stopped);
                }
            }
        }
        Ok(IterStatus::Completed)
    }
}

fn next_entry<F: MediaIo>(stream: &mut BlockStream<F>) -> Result<Entry> {
    let at = stream.position();
    let header = MetadataRecordHeader::read(&mut *stream)?;

    if header.data_len.is_tombstone() {
        stream.skip(header.data_len.padded() as u64)
            .map_err(|_| MediaError::corrupted("tombstoned metadata record runs past end"))?;
        return Ok(Entry::Tombstone);
    }

    let body = read_body(&mut *stream, header.data_len)?;
    let (key, value) = parse_metadata_body(&body)?;
    Ok(Entry::Live { at, header, key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_stream::DescriptorSlot;
    use crate::span::{BlockDescriptor, Storage};
    use std::io::Cursor;

    fn table() -> MetadataTable<Cursor<Vec<u8>>> {
        let storage = Storage::new(Cursor::new(vec![0u8; 32]), 256).shared();
        MetadataTable::new(BlockStream::new(
            storage,
            false,
            BlockDescriptor::default(),
            DescriptorSlot::Detached,
        ))
    }

    fn live(t: &mut MetadataTable<Cursor<Vec<u8>>>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        t.iterate(|e| {
            out.push((e.key.clone(), e.value.clone()));
            ControlFlow::Continue(())
        })
        .unwrap();
        out
    }

    #[test]
    fn get_and_set() {
        let mut t = table();
        assert_eq!(t.get("media.authored_by").unwrap(), None);
        t.set("media.authored_by", "someone").unwrap();
        t.set("media.original_name", "map.zmf").unwrap();
        assert_eq!(t.get("media.authored_by").unwrap().as_deref(), Some("someone"));
        assert_eq!(t.get("media.original_name").unwrap().as_deref(), Some("map.zmf"));
    }

    #[test]
    fn records_are_header_plus_padded_body() {
        let mut t = table();
        t.set("k", "v").unwrap();
        assert_eq!(t.len(), 4 + 32);
    }

    #[test]
    fn same_padded_size_updates_in_place() {
        let mut t = table();
        t.set("k", "short").unwrap();
        let len = t.len();
        t.set("k", "longer but still padded alike").unwrap();
        assert_eq!(t.len(), len);
        assert_eq!(live(&mut t), vec![("k".into(), "longer but still padded alike".into())]);
    }

    #[test]
    fn different_size_tombstones_and_appends() {
        let mut t = table();
        t.set("k", "v1").unwrap();
        t.set("other", "x").unwrap();
        t.set("k", &"v2".repeat(40)).unwrap();

        assert_eq!(
            live(&mut t),
            vec![("other".into(), "x".into()), ("k".into(), "v2".repeat(40))]
        );
        assert_eq!(t.get("k").unwrap(), Some("v2".repeat(40)));
        assert_eq!(t.len(), 36 + 36 + 4 + 96);
    }

    #[test]
    fn values_may_contain_equals() {
        let mut t = table();
        t.set("media.authored_using", "name=zmf,version=0.1.0").unwrap();
        assert_eq!(
            t.get("media.authored_using").unwrap().as_deref(),
            Some("name=zmf,version=0.1.0")
        );
    }

    #[test]
    fn rejects_bad_keys_and_oversized_entries() {
        let mut t = table();
        assert!(matches!(t.set("a=b", "c"), Err(MediaError::InvalidName(_))));
        let huge = "v".repeat(METADATA_MAX_ENTRY_LENGTH);
        assert!(matches!(t.set("k", &huge), Err(MediaError::LimitExceeded(_))));
        assert_eq!(t.len(), 0);
    }
}
