//! Logical, growable byte streams stored as chains of spans.
//!
//! A [`BlockStream`] presents one [`BlockDescriptor`] as an ordinary
//! `Read + Write + Seek` stream.  Physically the bytes live in a chain of
//! spans; every span that has a successor sacrifices its last 8 bytes to a
//! chaining tag, so its usable payload is `capacity - 8`.  Whether a span has
//! a successor is never stored: it is implied by the stream length reaching
//! past the span's raw capacity.
//!
//! # Positioning
//! `seek` only moves the logical cursor and forgets the physical one.  The
//! next read or write walks the chain from the first span to find the
//! position again, so a reseek costs O(chain length).  Sequential I/O keeps
//! the physical cursor and never rewalks.
//!
//! # Growing
//! Writing past the usable end of the last span allocates a new span at the
//! end of the file and links it with a chaining tag.  Any live bytes that
//! were sitting in the last 8 bytes of the old span (legal while it had no
//! successor) are moved to the head of the new span before the tag
//! overwrites them.
//!
//! # Descriptor write-back
//! When the stream's length or first span changes, the descriptor must be
//! written back to wherever it is embedded: the file header for the section
//! directory, a directory record for sections.  [`DescriptorSlot`] names that
//! place; [`BlockStream::flush_descriptor`] writes it and `Drop` does the same
//! on every exit path.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::error::{MediaError, Result};
use crate::crc16::crc16_ccitt;
use crate::record::{read_body, SectionDesc, SectionRecordHeader};
use crate::span::{BlockDescriptor, MediaIo, SharedStorage, Span, TAG_SIZE};

// ── DescriptorSlot ───────────────────────────────────────────────────────────

/// Where a stream's descriptor lives on disk.  The stream knows where to
/// write but owns neither the header nor the record.
pub enum DescriptorSlot<F: MediaIo> {
    /// Raw file offset, used for the section directory's descriptor in the
    /// file header.
    Header { offset: u64 },
    /// A section record inside the directory stream.  Both `block` and the
    /// mirrored `data_length` field are updated, unless the record has since
    /// been removed or handed to another section.
    Record {
        directory:     Rc<RefCell<BlockStream<F>>>,
        record_offset: u64,
        name:          String,
    },
    /// Scratch streams that are never persisted.
    Detached,
}

impl<F: MediaIo> DescriptorSlot<F> {
    /// Write `desc` to the slot.  `stored` is what this stream last wrote
    /// there; a record that no longer holds it belongs to someone else.
    fn store(
        &self,
        storage: &SharedStorage<F>,
        stored: &BlockDescriptor,
        desc: &BlockDescriptor,
    ) -> Result<()> {
        match self {
            DescriptorSlot::Header { offset } => {
                storage.borrow_mut().write_all_at(*offset, &desc.to_bytes())
            }
            DescriptorSlot::Record { directory, record_offset, name } => {
                let mut dir = directory.try_borrow_mut().map_err(|_| {
                    MediaError::WriteFailed("section directory is busy".into())
                })?;
                if !record_is_live_for(&mut dir, *record_offset, name, stored)? {
                    return Err(MediaError::WriteFailed(format!(
                        "section '{name}' was removed; descriptor not written"
                    )));
                }
                dir.write_at(
                    record_offset + SectionRecordHeader::DATA_LENGTH_OFFSET,
                    &desc.length.to_le_bytes(),
                )?;
                dir.write_at(record_offset + SectionRecordHeader::BLOCK_OFFSET, &desc.to_bytes())?;
                Ok(())
            }
            DescriptorSlot::Detached => Ok(()),
        }
    }
}

/// Whether the record at `at` is still the live record for `name` holding
/// `stored`.
fn record_is_live_for<F: MediaIo>(
    dir: &mut BlockStream<F>,
    at: u64,
    name: &str,
    stored: &BlockDescriptor,
) -> Result<bool> {
    dir.set_pos(at)?;
    let header = SectionRecordHeader::read(&mut *dir)?;
    if header.desc_len.is_tombstone()
        || header.name_crc16 != crc16_ccitt(name.as_bytes())
        || header.block != *stored
    {
        return Ok(false);
    }
    let body = read_body(&mut *dir, header.desc_len)?;
    Ok(SectionDesc::parse(&body)?.name == name)
}

// ── BlockStream ──────────────────────────────────────────────────────────────

/// Resolved physical position: a span, the logical offset its first byte
/// maps to, and the offset inside it.
#[derive(Debug, Clone, Copy)]
struct SpanCursor {
    span:   Span,
    start:  u64,
    offset: u64,
}

pub struct BlockStream<F: MediaIo> {
    storage:   SharedStorage<F>,
    read_only: bool,
    slot:      DescriptorSlot<F>,

    desc:      BlockDescriptor,
    /// Last descriptor written to the slot.
    stored:    BlockDescriptor,
    dirty:     bool,

    pos:       u64,
    cursor:    Option<SpanCursor>,
}

impl<F: MediaIo> BlockStream<F> {
    pub fn new(
        storage:   SharedStorage<F>,
        read_only: bool,
        desc:      BlockDescriptor,
        slot:      DescriptorSlot<F>,
    ) -> Self {
        Self {
            storage,
            read_only,
            slot,
            desc,
            stored: desc,
            dirty:  false,
            pos:    0,
            cursor: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.desc.length
    }

    pub fn is_empty(&self) -> bool {
        self.desc.length == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.desc.length
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn descriptor(&self) -> BlockDescriptor {
        self.desc
    }

    pub(crate) fn storage(&self) -> &SharedStorage<F> {
        &self.storage
    }

    /// Move the logical cursor.  Positions past the end are rejected; the
    /// physical position is resolved lazily by the next read or write.
    pub fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos > self.desc.length {
            return Err(MediaError::corrupted(format!(
                "seek to {pos} past end of stream ({} bytes)",
                self.desc.length
            )));
        }
        self.pos = pos;
        self.cursor = None;
        Ok(())
    }

    pub fn rewind_to_start(&mut self) {
        self.pos = 0;
        self.cursor = None;
    }

    /// Skip `n` bytes forward.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.set_pos(self.pos + n)
    }

    /// Every span of the chain in order.  Diagnostic; walks the whole chain.
    pub fn spans(&self) -> Result<Vec<Span>> {
        let mut out = Vec::new();
        if self.desc.length == 0 || !self.desc.first_span.is_valid() {
            return Ok(out);
        }
        let mut storage = self.storage.borrow_mut();
        let mut span = self.desc.first_span;
        let mut start = 0u64;
        loop {
            out.push(span);
            let capacity = storage.span_capacity(span);
            if start + capacity >= self.desc.length {
                return Ok(out);
            }
            let usable = chained_usable(capacity)?;
            let tag_at = storage.span_offset(span) + usable;
            let next = storage.read_tag(tag_at)?;
            if !span.can_jump_to(&next) {
                return Err(MediaError::corrupted("invalid chaining tag"));
            }
            start += usable;
            span = next;
        }
    }

    /// Write the descriptor back to its slot if it changed.
    pub fn flush_descriptor(&mut self) -> Result<()> {
        if self.dirty {
            self.slot.store(&self.storage, &self.stored, &self.desc)?;
            self.stored = self.desc;
            self.dirty = false;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the cursor.  Returns fewer only at the
    /// end of the stream.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let count = (buf.len() as u64).min(self.desc.length.saturating_sub(self.pos)) as usize;
        let mut done = 0usize;

        while done < count {
            let mut cur = match self.cursor {
                Some(c) => c,
                None    => self.resolve()?,
            };
            let mut storage = self.storage.borrow_mut();
            let capacity = storage.span_capacity(cur.span);
            let chained = cur.start + capacity < self.desc.length;
            let usable = if chained { chained_usable(capacity)? } else { capacity };
            let avail = usable.saturating_sub(cur.offset);

            if avail > 0 {
                let n = avail.min((count - done) as u64) as usize;
                let at = storage.span_offset(cur.span) + cur.offset;
                storage.read_exact_at(at, &mut buf[done..done + n])?;
                cur.offset += n as u64;
                self.pos += n as u64;
                done += n;
                self.cursor = Some(cur);
            } else {
                if !chained {
                    return Err(MediaError::corrupted("stream ends before its recorded length"));
                }
                let tag_at = storage.span_offset(cur.span) + usable;
                let next = storage.read_tag(tag_at)?;
                if !cur.span.can_jump_to(&next) {
                    return Err(MediaError::corrupted(format!(
                        "bad chaining tag after sector {}: {:?}",
                        cur.span.first_sector, next
                    )));
                }
                self.cursor = Some(SpanCursor { span: next, start: cur.start + usable, offset: 0 });
            }
        }
        Ok(done)
    }

    /// Write all of `buf` at the cursor, growing the stream as needed.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let (done, result) = self.write_partial(buf);
        result.map(|()| done)
    }

    /// Write as much of `buf` as possible.  Returns the bytes written before
    /// any failure; the stream's position and length account for exactly
    /// those bytes.
    fn write_partial(&mut self, buf: &[u8]) -> (usize, Result<()>) {
        if self.read_only {
            return (0, Err(MediaError::ReadOnly));
        }
        let mut done = 0usize;
        let result = self.write_from(buf, &mut done);
        if result.is_err() {
            self.cursor = None;
        }
        (done, result)
    }

    fn write_from(&mut self, buf: &[u8], done: &mut usize) -> Result<()> {
        while *done < buf.len() {
            let remaining = (buf.len() - *done) as u64;

            let mut cur = match self.cursor {
                Some(c) => c,
                None if self.desc.length == 0 => {
                    let span = self.storage.borrow_mut().allocate_span(remaining)?;
                    self.desc.first_span = span;
                    self.dirty = true;
                    SpanCursor { span, start: 0, offset: 0 }
                }
                None => self.resolve()?,
            };

            let mut storage = self.storage.borrow_mut();
            let capacity = storage.span_capacity(cur.span);
            let span_end = cur.start + capacity;
            let new_length = self.desc.length.max(self.pos + remaining);
            let chained_after = span_end < new_length;
            let usable = if chained_after { chained_usable(capacity)? } else { capacity };

            // Everything left fits in this span.
            if usable >= cur.offset + remaining {
                let at = storage.span_offset(cur.span) + cur.offset;
                storage.write_all_at(at, &buf[*done..])?;
                cur.offset += remaining;
                self.pos += remaining;
                *done = buf.len();
                self.cursor = Some(cur);
                grow(&mut self.desc, &mut self.dirty, self.pos);
                break;
            }

            // Fill the rest of this span's payload.
            if usable > cur.offset {
                let n = (usable - cur.offset) as usize;
                let at = storage.span_offset(cur.span) + cur.offset;
                storage.write_all_at(at, &buf[*done..*done + n])?;
                cur.offset += n as u64;
                self.pos += n as u64;
                *done += n;
                self.cursor = Some(cur);
                grow(&mut self.desc, &mut self.dirty, self.pos);
            }

            let boundary = cur.start + usable;
            let tag_at = storage.span_offset(cur.span) + usable;

            if self.desc.length > span_end {
                // Already chained: follow the existing tag.
                let next = storage.read_tag(tag_at)?;
                if !cur.span.can_jump_to(&next) {
                    return Err(MediaError::corrupted(format!(
                        "bad chaining tag after sector {}: {:?}",
                        cur.span.first_sector, next
                    )));
                }
                self.cursor = Some(SpanCursor {
                    span:   next,
                    start:  boundary,
                    offset: self.pos - boundary,
                });
                continue;
            }

            // Last span: live bytes in the tag region must move to the new span.
            let tail_len = self.desc.length.saturating_sub(boundary) as usize;
            let mut tail = [0u8; TAG_SIZE as usize];
            if tail_len > 0 {
                storage.read_exact_at(tag_at, &mut tail[..tail_len])?;
            }

            // Copy the tail before the tag overwrites it.
            let next = storage.allocate_span(new_length - boundary)?;
            if tail_len > 0 {
                let head = storage.span_offset(next);
                storage.write_all_at(head, &tail[..tail_len])?;
            }
            storage.write_tag(tag_at, next)?;
            tracing::debug!(
                from_sector = cur.span.first_sector,
                to_sector   = next.first_sector,
                sectors     = next.sector_count,
                moved_tail  = tail_len,
                "chained new span"
            );

            self.cursor = Some(SpanCursor { span: next, start: boundary, offset: self.pos - boundary });
        }
        Ok(())
    }

    /// Overwrite or extend at an absolute position, leaving the cursor after
    /// the written bytes.
    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.set_pos(pos)?;
        self.write_bytes(buf)?;
        Ok(())
    }

    /// Walk the chain from the first span to the span holding `pos`.
    fn resolve(&mut self) -> Result<SpanCursor> {
        if self.pos > self.desc.length {
            return Err(MediaError::corrupted("cursor past end of stream"));
        }
        if !self.desc.first_span.is_valid() {
            return Err(MediaError::corrupted("non-empty stream without a first span"));
        }

        let mut storage = self.storage.borrow_mut();
        let mut span = self.desc.first_span;
        let mut start = 0u64;
        loop {
            let capacity = storage.span_capacity(span);
            let chained = start + capacity < self.desc.length;
            let usable = if chained { chained_usable(capacity)? } else { capacity };

            if self.pos <= start + usable {
                let cursor = SpanCursor { span, start, offset: self.pos - start };
                self.cursor = Some(cursor);
                return Ok(cursor);
            }

            let tag_at = storage.span_offset(span) + usable;
            let next = storage.read_tag(tag_at)?;
            if !span.can_jump_to(&next) {
                return Err(MediaError::corrupted(format!(
                    "bad chaining tag after sector {}: {:?}",
                    span.first_sector, next
                )));
            }
            start += usable;
            span = next;
        }
    }
}

fn grow(desc: &mut BlockDescriptor, dirty: &mut bool, pos: u64) {
    if pos > desc.length {
        desc.length = pos;
        *dirty = true;
    }
}

fn chained_usable(capacity: u64) -> Result<u64> {
    if capacity <= TAG_SIZE {
        return Err(MediaError::corrupted("chained span too small to hold a tag"));
    }
    Ok(capacity - TAG_SIZE)
}

impl<F: MediaIo> Drop for BlockStream<F> {
    fn drop(&mut self) {
        if let Err(e) = self.flush_descriptor() {
            tracing::warn!(error = %e, "failed to write back block descriptor");
        }
    }
}

// ── std::io ──────────────────────────────────────────────────────────────────

impl<F: MediaIo> Read for BlockStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl<F: MediaIo> Write for BlockStream<F> {
    /// Reports partial progress as a short write; the failure surfaces on
    /// the next call.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_partial(buf) {
            (done, Ok(())) => Ok(done),
            (done, Err(e)) if done > 0 => {
                tracing::debug!(written = done, error = %e, "short write");
                Ok(done)
            }
            (_, Err(e)) => Err(e.into()),
        }
    }

    /// Writes the descriptor back and flushes the shared file.
    fn flush(&mut self) -> io::Result<()> {
        self.flush_descriptor()?;
        self.storage.borrow_mut().sync()
    }
}

impl<F: MediaIo> Seek for BlockStream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n)   => Some(n),
            SeekFrom::End(d)     => self.desc.length.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(n) if n <= self.desc.length => {
                self.pos = n;
                self.cursor = None;
                Ok(n)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the stream; block streams cannot grow by seeking",
            )),
        }
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}
