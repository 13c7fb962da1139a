//! High-level [`MediaFile`] API, the embedding surface of the crate.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use zmf::MediaFile;
//!
//! // Write
//! let mut mf = MediaFile::create("model.zmf")?;
//! mf.set_metadata("media.authored_by", "someone")?;
//! mf.create_section("ntile.ModelMeshes")?.write_all(b"mesh data")?;
//! mf.close()?;
//!
//! // Read
//! let mut mf = MediaFile::open("model.zmf", true, false)?;
//! let mut meshes = Vec::new();
//! mf.open_section("ntile.ModelMeshes")?.expect("present").read_to_end(&mut meshes)?;
//! assert_eq!(meshes, b"mesh data");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Threading
//! Single-threaded.  Every stream handed out shares the container's file
//! handle through `Rc`, so none of them is `Send`.  Opening the same section
//! twice and writing through both handles is not supported.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;

use crate::block_stream::{BlockStream, DescriptorSlot};
use crate::directory::{IterStatus, SectionDirectory, SectionInfo};
use crate::error::{MediaError, Result};
use crate::header::{
    self, validate_sector_size, MediaHeader, DEFAULT_SECTOR_SIZE, HEADER_SIZE,
    METADATA_SECTION_NAME, MIN_HEADER_SIZE, OFFSET_SECTION_MAP,
};
use crate::metadata::{MetadataEntry, MetadataTable};
use crate::span::{MediaIo, SharedStorage, Storage};

// ── MediaOptions ─────────────────────────────────────────────────────────────

/// Configuration for [`MediaFile::open_with`] and [`MediaFile::open_stream_with`].
#[derive(Debug, Clone)]
pub struct MediaOptions {
    pub read_only:   bool,
    /// Create (and initialise) the file when it does not exist.
    pub can_create:  bool,
    /// Only used when a new container is initialised.
    pub sector_size: u32,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            read_only:   false,
            can_create:  true,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

// ── MediaFile ────────────────────────────────────────────────────────────────

pub struct MediaFile<F: MediaIo = File> {
    storage:    SharedStorage<F>,
    directory:  SectionDirectory<F>,
    /// Opened on first use.
    metadata:   Option<MetadataTable<F>>,
    read_only:  bool,
    bitstream:  u32,
    error_desc: String,
    poisoned:   bool,
    closed:     bool,
}

impl MediaFile<File> {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open `path`; when it does not exist or is empty and
    /// `can_create && !read_only`, a new container with the default sector
    /// size is initialised.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, can_create: bool) -> Result<Self> {
        Self::open_with(path, MediaOptions { read_only, can_create, ..MediaOptions::default() })
    }

    /// Open `path` read-write, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, MediaOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, opts: MediaOptions) -> Result<Self> {
        let path = path.as_ref();
        validate_sector_size(opts.sector_size)?;

        match OpenOptions::new().read(true).write(!opts.read_only).open(path) {
            Ok(file) => {
                let len = file.metadata()
                    .map_err(|e| MediaError::OpenFailed(format!("'{}': {e}", path.display())))?
                    .len();
                // Only a zero-length file counts as new; anything else must
                // carry a valid header.
                if len == 0 && opts.can_create && !opts.read_only {
                    tracing::debug!(path = %path.display(), sector_size = opts.sector_size, "initialising empty file");
                    Self::init(file, opts.sector_size)
                } else {
                    Self::adopt(file, opts.read_only)
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound && opts.can_create && !opts.read_only => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map_err(|e| MediaError::OpenFailed(format!(
                        "failed to create '{}': {e}", path.display()
                    )))?;
                tracing::debug!(path = %path.display(), sector_size = opts.sector_size, "creating media file");
                Self::init(file, opts.sector_size)
            }
            Err(e) => Err(MediaError::OpenFailed(format!("'{}': {e}", path.display()))),
        }
    }
}

impl<F: MediaIo> MediaFile<F> {
    /// Adopt an already-open stream.  A writable stream shorter than the
    /// minimal header is initialised as a fresh container.
    pub fn open_stream(stream: F, read_only: bool) -> Result<Self> {
        Self::open_stream_with(stream, MediaOptions { read_only, ..MediaOptions::default() })
    }

    pub fn open_stream_with(mut stream: F, opts: MediaOptions) -> Result<Self> {
        validate_sector_size(opts.sector_size)?;
        let size = stream.seek(SeekFrom::End(0))?;
        if size >= MIN_HEADER_SIZE {
            return Self::adopt(stream, opts.read_only);
        }
        if opts.read_only {
            return Err(MediaError::OpenFailed("stream is empty and read-only".into()));
        }
        Self::init(stream, opts.sector_size)
    }

    /// Write a fresh header: magic, bitstream, sector size, empty directory.
    fn init(mut file: F, sector_size: u32) -> Result<Self> {
        let header = MediaHeader::new(sector_size);
        file.seek(SeekFrom::Start(0))?;
        header.write(&mut file)
            .map_err(|e| MediaError::WriteFailed(format!("failed to write file header: {e}")))?;
        Ok(Self::assemble(file, false, &header))
    }

    fn adopt(mut file: F, read_only: bool) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let header = MediaHeader::read(&mut file)?;
        tracing::debug!(
            sector_size = header.sector_size,
            directory_len = header.section_map.length,
            "opened media file"
        );
        Ok(Self::assemble(file, read_only, &header))
    }

    fn assemble(file: F, read_only: bool, header: &MediaHeader) -> Self {
        let storage = Storage::new(file, header.sector_size).shared();
        let directory = SectionDirectory::new(BlockStream::new(
            storage.clone(),
            read_only,
            header.section_map,
            DescriptorSlot::Header { offset: OFFSET_SECTION_MAP },
        ));
        Self {
            storage,
            directory,
            metadata:   None,
            read_only,
            bitstream:  header.bitstream,
            error_desc: String::new(),
            poisoned:   false,
            closed:     false,
        }
    }

    // ── Error bookkeeping ────────────────────────────────────────────────────

    fn guard(&self) -> Result<()> {
        if self.poisoned {
            return Err(MediaError::Poisoned);
        }
        if self.closed {
            return Err(MediaError::OpenFailed("container is closed".into()));
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.error_desc = e.to_string();
            if e.is_corruption() {
                tracing::warn!(error = %e, "media file corrupted; refusing further operations");
                self.poisoned = true;
            }
        }
        result
    }

    /// Description of the most recent failure, empty if none.
    pub fn error_desc(&self) -> &str {
        &self.error_desc
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    // ── Properties ───────────────────────────────────────────────────────────

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn sector_size(&self) -> u32 {
        self.storage.borrow().sector_size()
    }

    pub fn bitstream(&self) -> u32 {
        self.bitstream
    }

    pub fn bitstream_type(&self) -> String {
        header::bitstream_type(self.bitstream)
    }

    pub fn file_size(&mut self) -> Result<u64> {
        let r = self.storage.borrow_mut().file_size().map_err(MediaError::from);
        self.track(r)
    }

    /// Change the sector size.  Only legal while nothing but the header has
    /// been written.
    pub fn set_sector_size(&mut self, sector_size: u32) -> Result<()> {
        let r = self.set_sector_size_inner(sector_size);
        self.track(r)
    }

    fn set_sector_size_inner(&mut self, sector_size: u32) -> Result<()> {
        self.guard()?;
        validate_sector_size(sector_size)?;
        if self.read_only {
            return Err(MediaError::ReadOnly);
        }
        let mut storage = self.storage.borrow_mut();
        if self.directory.len() != 0 || storage.file_size()? > HEADER_SIZE {
            return Err(MediaError::SectorSizeLocked);
        }
        storage.write_all_at(8, &sector_size.to_le_bytes())?;
        storage.set_sector_size(sector_size);
        Ok(())
    }

    // ── Sections ─────────────────────────────────────────────────────────────

    /// Append a new, empty section.  A second section with an existing name
    /// is allowed but unreachable by name.
    pub fn create_section(&mut self, name: &str) -> Result<BlockStream<F>> {
        let r = self.guard().and_then(|_| self.directory.create_section(name, self.read_only));
        self.track(r)
    }

    pub fn open_section(&mut self, name: &str) -> Result<Option<BlockStream<F>>> {
        let r = self.guard().and_then(|_| self.directory.open_section(name, self.read_only));
        self.track(r)
    }

    pub fn open_or_create_section(&mut self, name: &str) -> Result<BlockStream<F>> {
        let r = self.guard().and_then(|_| {
            match self.directory.open_section(name, self.read_only)? {
                Some(stream) => Ok(stream),
                None         => self.directory.create_section(name, self.read_only),
            }
        });
        self.track(r)
    }

    pub fn iterate_sections<V>(&mut self, visitor: V) -> Result<IterStatus>
    where
        V: FnMut(&SectionInfo) -> ControlFlow<()>,
    {
        let r = self.guard().and_then(|_| self.directory.iterate(visitor));
        self.track(r)
    }

    pub fn sections(&mut self) -> Result<Vec<SectionInfo>> {
        let mut out = Vec::new();
        self.iterate_sections(|info| {
            out.push(info.clone());
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Tombstone a section's directory record.  The section's data stays in
    /// the file, unreachable; only [`compact`](crate::compact) gets it back.
    pub fn remove_section(&mut self, name: &str) -> Result<bool> {
        let r = self.guard().and_then(|_| {
            if name == METADATA_SECTION_NAME {
                self.metadata = None;
            }
            self.directory.tombstone_section(name, self.read_only)
        });
        self.track(r)
    }

    /// Convenience: read a whole section into memory.
    pub fn read_section(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(mut stream) = self.open_section(name)? else {
            return Ok(None);
        };
        // The recorded length is untrusted: let the read grow the buffer.
        let mut out = Vec::new();
        let r = stream.read_to_end(&mut out).map_err(MediaError::from);
        self.track(r)?;
        Ok(Some(out))
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    /// Open the metadata section if needed.  Returns `None` when it does not
    /// exist and `create` is false (or the container is read-only).
    fn metadata_table(&mut self, create: bool) -> Result<Option<&mut MetadataTable<F>>> {
        if self.metadata.is_none() {
            let stream = match self.directory.open_section(METADATA_SECTION_NAME, self.read_only)? {
                Some(stream)                     => stream,
                None if create && !self.read_only => {
                    self.directory.create_section(METADATA_SECTION_NAME, false)?
                }
                None                             => return Ok(None),
            };
            self.metadata = Some(MetadataTable::new(stream));
        }
        Ok(self.metadata.as_mut())
    }

    pub fn get_metadata(&mut self, key: &str) -> Result<Option<String>> {
        let r = self.guard().and_then(|_| match self.metadata_table(false)? {
            Some(table) => table.get(key),
            None        => Ok(None),
        });
        self.track(r)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        let r = self.guard().and_then(|_| {
            if self.read_only {
                return Err(MediaError::ReadOnly);
            }
            match self.metadata_table(true)? {
                Some(table) => table.set(key, value),
                None        => Err(MediaError::corrupted("metadata section unavailable")),
            }
        });
        self.track(r)
    }

    pub fn iterate_metadata<V>(&mut self, visitor: V) -> Result<IterStatus>
    where
        V: FnMut(&MetadataEntry) -> ControlFlow<()>,
    {
        let r = self.guard().and_then(|_| match self.metadata_table(false)? {
            Some(table) => table.iterate(visitor),
            None        => Ok(IterStatus::Completed),
        });
        self.track(r)
    }

    pub fn metadata(&mut self) -> Result<Vec<MetadataEntry>> {
        let mut out = Vec::new();
        self.iterate_metadata(|entry| {
            out.push(entry.clone());
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Flush descriptors without closing.
    pub fn flush(&mut self) -> Result<()> {
        let r = self.flush_inner();
        self.track(r)
    }

    fn flush_inner(&mut self) -> Result<()> {
        if let Some(table) = self.metadata.as_mut() {
            table.flush()?;
        }
        self.directory.flush()?;
        self.storage.borrow_mut().sync()?;
        Ok(())
    }

    /// Release the metadata table, then the directory, then the file.
    /// Section streams still held by the caller keep the file open until
    /// they are dropped.
    pub fn close(mut self) -> Result<()> {
        let r = self.close_inner();
        self.track(r)
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut table) = self.metadata.take() {
            table.flush()?;
        }
        self.directory.flush()?;
        self.storage.borrow_mut().sync()?;
        Ok(())
    }
}

impl<F: MediaIo> Drop for MediaFile<F> {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            tracing::warn!(error = %e, "error while closing media file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    type Mem<'a> = MediaFile<Cursor<&'a mut Vec<u8>>>;

    fn small(buf: &mut Vec<u8>) -> Mem<'_> {
        let opts = MediaOptions { sector_size: 256, ..MediaOptions::default() };
        MediaFile::open_stream_with(Cursor::new(buf), opts).unwrap()
    }

    #[test]
    fn empty_stream_is_initialised() {
        let mut buf = Vec::new();
        {
            let mut mf = MediaFile::open_stream(Cursor::new(&mut buf), false).unwrap();
            assert_eq!(mf.sector_size(), DEFAULT_SECTOR_SIZE);
            assert_eq!(mf.bitstream_type(), "BINARY-101h");
            assert_eq!(mf.file_size().unwrap(), HEADER_SIZE);
            mf.close().unwrap();
        }
        assert_eq!(&buf[..4], b"ZMF2");
        assert_eq!(buf.len() as u64, HEADER_SIZE);
    }

    #[test]
    fn empty_read_only_stream_is_refused() {
        let mut buf = Vec::new();
        let err = MediaFile::open_stream(Cursor::new(&mut buf), true).err().unwrap();
        assert!(matches!(err, MediaError::OpenFailed(_)));
    }

    #[test]
    fn sections_and_metadata_survive_reopen() {
        let mut buf = Vec::new();
        {
            let mut mf = small(&mut buf);
            mf.create_section("tex.png").unwrap().write_all(&[7u8; 600]).unwrap();
            mf.set_metadata("media.original_name", "scene.zmf").unwrap();
            mf.close().unwrap();
        }
        let mut mf = MediaFile::open_stream(Cursor::new(&mut buf), true).unwrap();
        assert_eq!(mf.sector_size(), 256);
        assert_eq!(mf.read_section("tex.png").unwrap(), Some(vec![7u8; 600]));
        assert_eq!(
            mf.get_metadata("media.original_name").unwrap().as_deref(),
            Some("scene.zmf")
        );
        let names: Vec<_> = mf.sections().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["tex.png", METADATA_SECTION_NAME]);
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut buf = Vec::new();
        small(&mut buf).close().unwrap();

        let mut mf = MediaFile::open_stream(Cursor::new(&mut buf), true).unwrap();
        assert!(mf.is_read_only());
        assert!(matches!(mf.create_section("x"), Err(MediaError::ReadOnly)));
        assert!(matches!(mf.set_metadata("k", "v"), Err(MediaError::ReadOnly)));
        assert!(matches!(mf.set_sector_size(512), Err(MediaError::ReadOnly)));
        assert_eq!(mf.get_metadata("k").unwrap(), None);
        assert!(mf.sections().unwrap().is_empty());
        assert!(!mf.is_poisoned());
        assert_eq!(mf.error_desc(), MediaError::ReadOnly.to_string());
    }

    #[test]
    fn sector_size_locks_after_first_allocation() {
        let mut buf = Vec::new();
        let mut mf = small(&mut buf);
        assert!(matches!(mf.set_sector_size(300), Err(MediaError::InvalidSectorSize(_))));
        mf.set_sector_size(4096).unwrap();
        assert_eq!(mf.sector_size(), 4096);

        mf.create_section("a").unwrap().write_all(b"x").unwrap();
        assert!(matches!(mf.set_sector_size(512), Err(MediaError::SectorSizeLocked)));
        mf.close().unwrap();

        let mf = MediaFile::open_stream(Cursor::new(&mut buf), true).unwrap();
        assert_eq!(mf.sector_size(), 4096);
    }

    #[test]
    fn open_or_create_and_remove() {
        let mut buf = Vec::new();
        let mut mf = small(&mut buf);
        mf.open_or_create_section("a").unwrap().write_all(b"one").unwrap();
        mf.open_or_create_section("a").unwrap().write_all(b"ONE").unwrap();
        assert_eq!(mf.read_section("a").unwrap(), Some(b"ONE".to_vec()));
        assert_eq!(mf.sections().unwrap().len(), 1);

        assert!(mf.remove_section("a").unwrap());
        assert!(!mf.remove_section("a").unwrap());
        assert_eq!(mf.read_section("a").unwrap(), None);
    }

    #[test]
    fn corruption_poisons_the_container() {
        let mut buf = Vec::new();
        {
            let mut mf = small(&mut buf);
            mf.create_section("a").unwrap();
            mf.close().unwrap();
        }
        // Directory lives in sector 1; its first record's description
        // starts right after the 32-byte record header.
        buf[256 + 32..256 + 38].copy_from_slice(b"garbag");

        let mut mf = MediaFile::open_stream(Cursor::new(&mut buf), false).unwrap();
        assert!(mf.open_section("a").err().unwrap().is_corruption());
        assert!(mf.is_poisoned());
        assert!(mf.error_desc().contains("corrupted"));
        assert!(matches!(mf.sections(), Err(MediaError::Poisoned)));
        assert!(matches!(mf.set_metadata("k", "v"), Err(MediaError::Poisoned)));
    }

    #[test]
    fn foreign_data_is_not_a_media_file() {
        let mut buf = b"PK\x03\x04 definitely not a container".to_vec();
        let err = MediaFile::open_stream(Cursor::new(&mut buf), false).err().unwrap();
        assert!(matches!(err, MediaError::NotAMediaFile));
    }
}
