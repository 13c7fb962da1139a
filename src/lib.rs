//! Block-stream media container (`ZMF2`).
//!
//! A container is a single file of fixed-size sectors holding named,
//! independently growable byte streams ("sections") plus a small
//! `key=value` metadata table.  See [`MediaFile`] for the embedding API.

pub mod error;
pub mod crc16;
pub mod span;
pub mod header;
pub mod record;
pub mod block_stream;
pub mod directory;
pub mod metadata;
pub mod container;
pub mod compact;

pub use error::{MediaError, Result};
pub use span::{BlockDescriptor, MediaIo, Span};
pub use header::{bitstream_type, DEFAULT_SECTOR_SIZE, METADATA_SECTION_NAME};
pub use block_stream::BlockStream;
pub use directory::{IterStatus, SectionInfo};
pub use metadata::MetadataEntry;
pub use container::{MediaFile, MediaOptions};
pub use compact::{compact_into, CompactStats};
