//! Rewrite a container without its dead weight.
//!
//! Nothing inside a container is ever freed: tombstoned records keep their
//! directory bytes, their spans stay allocated, and superseded metadata
//! entries stay in the log.  Compaction copies every reachable section and
//! every live metadata entry into a fresh container.  Sections shadowed by an
//! earlier section of the same name are dropped since nothing can open them.

use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::Path;

use crate::container::{MediaFile, MediaOptions};
use crate::error::{MediaError, Result};
use crate::header::METADATA_SECTION_NAME;
use crate::span::MediaIo;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    pub sections:         usize,
    pub shadowed:         usize,
    pub metadata_entries: usize,
    pub bytes_copied:     u64,
    pub size_before:      u64,
    pub size_after:       u64,
}

/// Copy the live content of `src` into `dest`, which should be empty.
pub fn compact_into<S: MediaIo, D: MediaIo>(
    src:  &mut MediaFile<S>,
    dest: &mut MediaFile<D>,
) -> Result<CompactStats> {
    let mut stats = CompactStats { size_before: src.file_size()?, ..CompactStats::default() };
    let mut seen = HashSet::new();

    for info in src.sections()? {
        if info.name == METADATA_SECTION_NAME {
            continue;
        }
        if !seen.insert(info.name.clone()) {
            stats.shadowed += 1;
            continue;
        }
        let Some(mut from) = src.open_section(&info.name)? else {
            continue;
        };
        let mut to = dest.create_section(&info.name)?;
        stats.bytes_copied += io::copy(&mut from, &mut to)?;
        to.flush_descriptor()?;
        stats.sections += 1;
    }

    for entry in src.metadata()? {
        dest.set_metadata(&entry.key, &entry.value)?;
        stats.metadata_entries += 1;
    }

    dest.flush()?;
    stats.size_after = dest.file_size()?;
    tracing::info!(
        sections = stats.sections,
        shadowed = stats.shadowed,
        metadata = stats.metadata_entries,
        before   = stats.size_before,
        after    = stats.size_after,
        "compacted media file"
    );
    Ok(stats)
}

impl<F: MediaIo> MediaFile<F> {
    /// Compact into a new file at `path` with the same sector size.  Refuses
    /// to overwrite an existing file.
    pub fn compact_to<P: AsRef<Path>>(&mut self, path: P) -> Result<CompactStats> {
        let path = path.as_ref();
        if path.exists() {
            return Err(MediaError::OpenFailed(format!(
                "'{}' already exists; refusing to overwrite",
                path.display()
            )));
        }
        let opts = MediaOptions {
            read_only:   false,
            can_create:  true,
            sector_size: self.sector_size(),
        };
        let mut dest = MediaFile::open_with(path, opts)?;
        let stats = compact_into(self, &mut dest)?;
        dest.close()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn mem(buf: &mut Vec<u8>) -> MediaFile<Cursor<&mut Vec<u8>>> {
        let opts = MediaOptions { sector_size: 256, ..MediaOptions::default() };
        MediaFile::open_stream_with(Cursor::new(buf), opts).unwrap()
    }

    #[test]
    fn drops_tombstones_and_superseded_entries() {
        let mut src_buf = Vec::new();
        let mut dst_buf = Vec::new();

        let mut src = mem(&mut src_buf);
        src.create_section("keep").unwrap().write_all(&[1u8; 1000]).unwrap();
        src.create_section("gone").unwrap().write_all(&[2u8; 4000]).unwrap();
        src.create_section("keep").unwrap().write_all(b"shadowed").unwrap();
        src.remove_section("gone").unwrap();
        src.set_metadata("k", "v").unwrap();
        src.set_metadata("k", &"w".repeat(100)).unwrap();

        let mut dst = mem(&mut dst_buf);
        let stats = compact_into(&mut src, &mut dst).unwrap();
        assert_eq!(stats.sections, 1);
        assert_eq!(stats.shadowed, 1);
        assert_eq!(stats.metadata_entries, 1);
        assert_eq!(stats.bytes_copied, 1000);
        assert!(stats.size_after < stats.size_before);

        assert_eq!(dst.read_section("keep").unwrap(), Some(vec![1u8; 1000]));
        assert_eq!(dst.read_section("gone").unwrap(), None);
        assert_eq!(dst.get_metadata("k").unwrap(), Some("w".repeat(100)));
    }
}
