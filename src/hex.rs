//! Intel HEX images.
//!
//! [`HexParser`] turns the ASCII text into address resolved records and
//! [`Chunker`] glues consecutive data records back together into buffers
//! sized for the packet layer, leaving room at the front of each buffer for a
//! caller defined header.

mod chunker;
mod parser;

pub use chunker::{Chunk, ChunkItem, Chunker};
pub use parser::{HexParser, HexWarning};

/// Entry address used when an image does not report one.
pub const DEFAULT_START_ADDRESS: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordType {
    pub fn from_code(code: u8) -> Option<Self> {
        use RecordType::*;
        Some(match code {
            0x00 => Data,
            0x01 => EndOfFile,
            0x02 => ExtendedSegmentAddress,
            0x03 => StartSegmentAddress,
            0x04 => ExtendedLinearAddress,
            0x05 => StartLinearAddress,
            _ => return None,
        })
    }
}

/// One record of the image.
///
/// For data records `address` is the absolute load address of the first
/// byte. Address records carry the resolved base in `address`, start records
/// the entry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub kind: RecordType,
    pub address: u32,
    pub data: Vec<u8>,
}
