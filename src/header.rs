//! Fixed file header at offset 0.
//!
//! ```text
//!  0  magic        [u8;4]  "ZMF2"
//!  4  bitstream    u32     (BITSTREAM_VER << 16) | BITSTREAM_BINARY
//!  8  sector_size  u32     power of two in [SECTOR_MIN, SECTOR_MAX]
//! 12  ctl_sector   u32     reserved, always 0
//! 16  section map  BlockDescriptor (length:u64, first_sector:u32, sector_count:u32)
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{MediaError, Result};
use crate::span::BlockDescriptor;

pub const MAGIC: &[u8; 4] = b"ZMF2";

pub const BITSTREAM_BINARY: u32 = 0x0A89;
pub const BITSTREAM_VER:    u32 = 0x0101;
pub const BITSTREAM:        u32 = (BITSTREAM_VER << 16) | BITSTREAM_BINARY;

pub const HEADER_SIZE:        u64 = 32;
/// Files shorter than this are treated as blank when adopting a stream.
pub const MIN_HEADER_SIZE:    u64 = 16;
pub const OFFSET_SECTION_MAP: u64 = 16;

pub const SECTOR_MIN:          u32 = 256;
pub const SECTOR_MAX:          u32 = (1 << 30) - 1;
pub const DEFAULT_SECTOR_SIZE: u32 = 1024;

pub const SECTION_DESC_MAX_LENGTH:   usize = 32767 - 31;
pub const METADATA_MAX_ENTRY_LENGTH: usize = 32767 - 31;

/// Reserved section holding the metadata table.
pub const METADATA_SECTION_NAME: &str = "media.Metadata";

pub fn validate_sector_size(sector_size: u32) -> Result<()> {
    if !(SECTOR_MIN..=SECTOR_MAX).contains(&sector_size) {
        return Err(MediaError::InvalidSectorSize(format!(
            "sector size must be between {SECTOR_MIN} and {SECTOR_MAX} bytes, inclusive (got {sector_size})"
        )));
    }
    if !sector_size.is_power_of_two() {
        return Err(MediaError::InvalidSectorSize(format!(
            "sector size must be a power of 2 (got {sector_size})"
        )));
    }
    Ok(())
}

/// `"BINARY-101h"` for the known binary bitstream, `"UNKNOWN-???"` otherwise.
pub fn bitstream_type(bitstream: u32) -> String {
    if bitstream & 0xFFFF == BITSTREAM_BINARY {
        format!("BINARY-{:x}h", bitstream >> 16)
    } else {
        "UNKNOWN-???".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHeader {
    pub bitstream:   u32,
    pub sector_size: u32,
    pub ctl_sector:  u32,
    pub section_map: BlockDescriptor,
}

impl MediaHeader {
    pub fn new(sector_size: u32) -> Self {
        Self {
            bitstream:   BITSTREAM,
            sector_size,
            ctl_sector:  0,
            section_map: BlockDescriptor::default(),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.bitstream)?;
        writer.write_u32::<LittleEndian>(self.sector_size)?;
        writer.write_u32::<LittleEndian>(self.ctl_sector)?;
        self.section_map.write(&mut writer)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
            return Err(MediaError::NotAMediaFile);
        }
        let bitstream = reader.read_u32::<LittleEndian>()
            .map_err(|_| MediaError::NotAMediaFile)?;
        if bitstream != BITSTREAM {
            return Err(MediaError::UnsupportedBitstream(bitstream));
        }

        let truncated = |_| MediaError::corrupted("failed to read file header");
        let sector_size = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let ctl_sector  = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let section_map = BlockDescriptor::read(&mut reader).map_err(truncated)?;

        validate_sector_size(sector_size)
            .map_err(|e| MediaError::corrupted(format!("header: {e}")))?;

        Ok(Self { bitstream, sector_size, ctl_sector, section_map })
    }
}
