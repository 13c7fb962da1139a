//! CRC16-CCITT, reflected form (polynomial 0x8408, seed 0xFFFF, no final
//! xor).  Stored next to every section name and metadata key as a cheap
//! pre-filter; a match must always be confirmed by a full string compare.

use crc::{Crc, CRC_16_MCRF4XX};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}
