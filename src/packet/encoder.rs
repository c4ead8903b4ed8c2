//! Packet encoder.

use super::{SEPARATOR_BYTE, SIGNAL_BYTE, STUFF_BYTE, TERMINATOR_BYTE};
use crate::crc32;

/// Encode a frame into a new buffer.
pub fn encode(seq: u32, cmd: u32, payload: &[u8]) -> Vec<u8> {
    // signal + separator + 3 varints + crc + terminator, plus some stuffing
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 24);
    encode_into(&mut out, seq, cmd, payload);
    out
}

/// Append the encoded frame to `out`.
pub fn encode_into(out: &mut Vec<u8>, seq: u32, cmd: u32, payload: &[u8]) {
    out.extend_from_slice(&[SIGNAL_BYTE; 3]);

    let mut writer = StuffingWriter {
        out,
        crc: crc32::start(),
        signal_bytes: 0,
    };

    writer.write(SEPARATOR_BYTE);
    writer.write_varint(seq);
    writer.write_varint(cmd);
    writer.write_varint(payload.len() as u32);
    for &b in payload {
        writer.write(b);
    }

    let crc = crc32::finish(writer.crc);
    for b in crc.to_be_bytes() {
        writer.write(b);
    }

    out.push(TERMINATOR_BYTE);
}

// =============================================================================
// Private stuff
// =============================================================================

struct StuffingWriter<'a> {
    out: &'a mut Vec<u8>,
    crc: u32,
    signal_bytes: u8,
}

impl StuffingWriter<'_> {
    fn write(&mut self, byte: u8) {
        self.out.push(byte);
        self.crc = crc32::update(self.crc, byte);

        if byte != SIGNAL_BYTE {
            self.signal_bytes = 0;
            return;
        }
        self.signal_bytes += 1;
        if self.signal_bytes == 2 {
            self.out.push(STUFF_BYTE);
            self.crc = crc32::update(self.crc, STUFF_BYTE);
            self.signal_bytes = 0;
        }
    }

    fn write_varint(&mut self, value: u32) {
        let mut groups = [0u8; 5];
        let mut n = 0;
        let mut v = value;
        loop {
            groups[n] = (v & 0x7F) as u8;
            n += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            let more = if i > 0 { 0x80 } else { 0 };
            self.write(groups[i] | more);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn empty_ping() {
    let bytes = encode(1, 0, &[]);
    let crc = crc32::checksum(&[0x00, 0x01, 0x00, 0x00]);
    let mut expected = vec![0xAA, 0xAA, 0xAA, 0x00, 0x01, 0x00, 0x00];
    expected.extend_from_slice(&crc.to_be_bytes());
    expected.push(TERMINATOR_BYTE);
    assert_eq!(bytes, expected);
}

#[test]
fn varint_is_msb_first() {
    // 300 = 0b10_0101100 -> 0x82 0x2C
    let bytes = encode(300, 6, &[]);
    assert_eq!(&bytes[3..7], &[0x00, 0x82, 0x2C, 0x06]);
}

#[test]
fn stuffs_after_two_signal_bytes() {
    let bytes = encode(2, 3, &[0xAA, 0xAA, 0xAA, 0x01]);
    // header: 00 02 03 04, then AA AA 00 AA 01
    assert_eq!(&bytes[3..7], &[0x00, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[7..12], &[0xAA, 0xAA, 0x00, 0xAA, 0x01]);

    // CRC covers the stuffing byte
    let crc = crc32::checksum(&[0x00, 0x02, 0x03, 0x04, 0xAA, 0xAA, 0x00, 0xAA, 0x01]);
    assert_eq!(&bytes[12..16], &crc.to_be_bytes());
    assert_eq!(bytes.last(), Some(&TERMINATOR_BYTE));
}

#[test]
fn no_signal_sequence_inside_frame() {
    let payload = vec![0xAA; 64];
    let bytes = encode(0x3FFF, 11, &payload);
    for window in bytes[3..].windows(3) {
        assert_ne!(window, &[0xAA, 0xAA, 0xAA]);
    }
}
