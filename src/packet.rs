//! Framing of packets on the serial line.
//!
//! A frame on the wire looks like this:
//!
//! ```text
//! AA AA AA | 00 | varint(seq) | varint(cmd) | varint(len) | payload | crc32 (BE) | 55
//! ```
//!
//! The three signal bytes (re)synchronize the receiver. Between the separator
//! and the end of the CRC, every pair of consecutive `0xAA` bytes is followed
//! by a stuffing `0x00` so that a real signal sequence can never appear inside
//! a frame. The CRC covers the separator through the payload, including any
//! stuffing bytes emitted before the CRC itself.
//!
//! Variable length integers are MIDI style: 7 bits per byte, most significant
//! group first, bit 7 set on every byte but the last.

mod decoder;
mod encoder;

pub use decoder::PacketDecoder;
pub use encoder::{encode, encode_into};

/// Resynchronization byte, sent three times to start a frame.
pub const SIGNAL_BYTE: u8 = 0xAA;
/// First byte after the signal.
pub const SEPARATOR_BYTE: u8 = 0x00;
/// Inserted after two consecutive signal bytes inside a frame.
pub const STUFF_BYTE: u8 = 0x00;
/// Last byte of a frame.
pub const TERMINATOR_BYTE: u8 = 0x55;

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub cmd: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u32, cmd: u32, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            seq,
            cmd,
            payload: payload.into(),
        }
    }
}
