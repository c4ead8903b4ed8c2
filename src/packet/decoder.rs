//! Byte at a time packet decoder.
//!
//! The decoder is fed bytes as they come off the transport and hands back a
//! complete [`Frame`] once the terminator has been seen, or a [`FrameError`]
//! when the frame in progress had to be dropped. Errors never poison the
//! decoder: it goes back to waiting for the next signal sequence.

use log::trace;

use super::{Frame, SEPARATOR_BYTE, SIGNAL_BYTE, STUFF_BYTE, TERMINATOR_BYTE};
use crate::{crc32, error::FrameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingSignal,
    ExpectSeparator,
    ExpectSeq,
    ExpectCmd,
    ExpectLength,
    ExpectData,
    ExpectCrc,
    ExpectTerminator,
}

/// Streaming decoder for the framing described in the [module](super) docs.
#[derive(Debug)]
pub struct PacketDecoder {
    max_payload: usize,
    state: State,
    signal_bytes_seen: u8,
    seq: u32,
    cmd: u32,
    length: u32,
    count: usize,
    payload: Vec<u8>,
    crc_calc: u32,
    crc_recv: u32,
    noise: usize,
}

impl PacketDecoder {
    /// Create a decoder accepting payloads of at most `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        PacketDecoder {
            max_payload,
            state: State::WaitingSignal,
            signal_bytes_seen: 0,
            seq: 0,
            cmd: 0,
            length: 0,
            count: 0,
            payload: Vec::with_capacity(max_payload),
            crc_calc: crc32::start(),
            crc_recv: 0,
            noise: 0,
        }
    }

    /// Feed one byte to the decoder.
    ///
    /// # Returns
    /// - `Some(Ok(frame))` when a frame has been completed
    /// - `Some(Err(e))` when the frame in progress was discarded
    /// - `None` if more data is needed
    pub fn feed(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        // The signal is watched for in every state, a new one drops whatever
        // was in progress.
        if byte == SIGNAL_BYTE {
            if self.signal_bytes_seen < 3 {
                self.signal_bytes_seen += 1;
            }
            if self.signal_bytes_seen == 3 {
                let interrupted = !matches!(
                    self.state,
                    State::WaitingSignal | State::ExpectSeparator
                );
                if self.state == State::WaitingSignal {
                    // the first two signal bytes were counted as noise
                    self.noise = self.noise.saturating_sub(2);
                }
                self.start_frame();
                return interrupted.then(|| Err(FrameError::NewPacket));
            }
        } else {
            if self.signal_bytes_seen == 2 {
                self.signal_bytes_seen = 0;
                if byte != STUFF_BYTE {
                    return self.fail(FrameError::InvalidStuffByte(byte));
                }
                // Stuffing inside the CRC bytes came after the checksum was
                // computed by the sender.
                if self.state != State::ExpectCrc || self.count == 0 {
                    self.crc_calc = crc32::update(self.crc_calc, byte);
                }
                return None;
            }
            self.signal_bytes_seen = 0;
        }

        match self.state {
            State::WaitingSignal => {
                self.noise += 1;
                None
            }
            State::ExpectSeparator => {
                if byte != SEPARATOR_BYTE {
                    return self.fail(FrameError::InvalidSeparator(byte));
                }
                self.seq = 0;
                self.cmd = 0;
                self.length = 0;
                self.crc_calc = crc32::update(crc32::start(), byte);
                self.state = State::ExpectSeq;
                None
            }
            State::ExpectSeq => {
                if accumulate(&mut self.seq, byte) {
                    self.state = State::ExpectCmd;
                }
                self.crc_calc = crc32::update(self.crc_calc, byte);
                None
            }
            State::ExpectCmd => {
                if accumulate(&mut self.cmd, byte) {
                    self.state = State::ExpectLength;
                }
                self.crc_calc = crc32::update(self.crc_calc, byte);
                None
            }
            State::ExpectLength => {
                self.crc_calc = crc32::update(self.crc_calc, byte);
                if !accumulate(&mut self.length, byte) {
                    return None;
                }
                if self.length as usize > self.max_payload {
                    return self.fail(FrameError::TooLarge {
                        length: self.length,
                        max: self.max_payload,
                    });
                }
                self.payload.clear();
                self.count = 0;
                self.state = if self.length == 0 {
                    State::ExpectCrc
                } else {
                    State::ExpectData
                };
                None
            }
            State::ExpectData => {
                self.crc_calc = crc32::update(self.crc_calc, byte);
                self.payload.push(byte);
                if self.payload.len() == self.length as usize {
                    self.count = 0;
                    self.state = State::ExpectCrc;
                }
                None
            }
            State::ExpectCrc => {
                self.crc_recv = (self.crc_recv << 8) | byte as u32;
                self.count += 1;
                if self.count < 4 {
                    return None;
                }
                let computed = crc32::finish(self.crc_calc);
                if computed != self.crc_recv {
                    return self.fail(FrameError::ChecksumMismatch {
                        received: self.crc_recv,
                        computed,
                    });
                }
                self.state = State::ExpectTerminator;
                None
            }
            State::ExpectTerminator => {
                self.state = State::WaitingSignal;
                if byte != TERMINATOR_BYTE {
                    return Some(Err(FrameError::InvalidTerminator(byte)));
                }
                let payload = std::mem::take(&mut self.payload);
                Some(Ok(Frame {
                    seq: self.seq,
                    cmd: self.cmd,
                    payload,
                }))
            }
        }
    }

    /// Feed a whole buffer, collecting every outcome.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Result<Frame, FrameError>> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    /// Number of bytes dropped while waiting for a signal since the last
    /// call.
    pub fn take_noise(&mut self) -> usize {
        std::mem::take(&mut self.noise)
    }

    /// Drop any frame in progress.
    pub fn reset(&mut self) {
        self.state = State::WaitingSignal;
        self.signal_bytes_seen = 0;
        self.payload.clear();
        self.count = 0;
    }

    fn start_frame(&mut self) {
        if self.noise > 0 {
            trace!("dropped {} bytes before signal", self.noise);
        }
        self.state = State::ExpectSeparator;
        self.count = 0;
        self.payload.clear();
    }

    /// Abandon the frame in progress. Errors are only reported once a
    /// signal has been seen.
    fn fail(&mut self, err: FrameError) -> Option<Result<Frame, FrameError>> {
        let was_waiting = self.state == State::WaitingSignal;
        self.state = State::WaitingSignal;
        self.payload.clear();
        if was_waiting {
            self.noise += 1;
            None
        } else {
            Some(Err(err))
        }
    }
}

/// Fold a varint byte into `value`, returning true on the last byte.
fn accumulate(value: &mut u32, byte: u8) -> bool {
    *value = (*value << 7) | (byte & 0x7F) as u32;
    byte & 0x80 == 0
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode;

    fn decode_one(bytes: &[u8]) -> Vec<Result<Frame, FrameError>> {
        PacketDecoder::new(1024).feed_all(bytes)
    }

    #[test]
    fn decodes_encoded_frames() {
        for len in [0usize, 1, 2, 127, 128, 1000, 1024] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let out = decode_one(&encode(129, 6, &payload));
            assert_eq!(out, vec![Ok(Frame::new(129, 6, payload))]);
        }
    }

    #[test]
    fn signal_pairs_in_payload_are_transparent() {
        let payload = vec![0x01, 0xAA, 0xAA, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0x55];
        let out = decode_one(&encode(7, 3, &payload));
        assert_eq!(out, vec![Ok(Frame::new(7, 3, payload))]);
    }

    #[test]
    fn signal_bytes_in_header_and_trailer() {
        // seq encodes as AA AA (stuffed) 2A, the payload ends on a stuffed pair
        let seq = (0x2A << 14) | (0x2A << 7) | 0x2A;
        let payload = vec![0xAA, 0xAA];
        let bytes = encode(seq, 0xAA, &payload);
        assert_eq!(&bytes[4..8], &[0xAA, 0xAA, 0x00, 0x2A]);
        let out = decode_one(&bytes);
        assert_eq!(out, vec![Ok(Frame::new(seq, 0xAA, payload))]);
    }

    #[test]
    fn leading_noise_is_dropped_silently() {
        let mut decoder = PacketDecoder::new(64);
        let mut bytes = vec![0x13, 0x37, 0xAA, 0xAA, 0x42, 0x00, 0x55];
        bytes.extend(encode(1, 1, b"ok"));
        let out = decoder.feed_all(&bytes);
        assert_eq!(out, vec![Ok(Frame::new(1, 1, b"ok".to_vec()))]);
        assert_eq!(decoder.take_noise(), 7);
        assert_eq!(decoder.take_noise(), 0);
    }

    #[test]
    fn extra_signal_bytes_are_tolerated() {
        let mut bytes = vec![0xAA];
        bytes.extend(encode(9, 0, &[]));
        assert_eq!(decode_one(&bytes), vec![Ok(Frame::new(9, 0, Vec::new()))]);
    }

    #[test]
    fn corruption_discards_frame_and_recovers() {
        let good = encode(5, 3, b"hello world");
        let next = encode(6, 3, b"next");
        // Flip each byte of the CRC covered span in turn.
        for i in 3..good.len() - 5 {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            let mut stream = bad;
            stream.extend_from_slice(&next);
            let out = decode_one(&stream);
            assert_eq!(out.last(), Some(&Ok(Frame::new(6, 3, b"next".to_vec()))));
            assert!(
                out[..out.len() - 1].iter().all(|r| r.is_err()),
                "corrupted byte {} produced a frame",
                i
            );
        }
    }

    #[test]
    fn checksum_mismatch_is_reported() {
        let mut bytes = encode(5, 3, b"abc");
        let crc_at = bytes.len() - 2;
        bytes[crc_at] ^= 0xFF;
        let out = decode_one(&bytes);
        assert!(matches!(out[..], [Err(FrameError::ChecksumMismatch { .. })]));
    }

    #[test]
    fn bad_separator() {
        let out = decode_one(&[0xAA, 0xAA, 0xAA, 0x01, 0x02]);
        assert_eq!(out, vec![Err(FrameError::InvalidSeparator(0x01))]);
    }

    #[test]
    fn bad_terminator() {
        let mut bytes = encode(5, 3, b"abc");
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert_eq!(decode_one(&bytes), vec![Err(FrameError::InvalidTerminator(0xFF))]);
    }

    #[test]
    fn payload_too_large() {
        let bytes = encode(5, 3, &[0u8; 65]);
        let out = PacketDecoder::new(64).feed_all(&bytes);
        assert_eq!(
            out,
            vec![Err(FrameError::TooLarge {
                length: 65,
                max: 64
            })]
        );
    }

    #[test]
    fn invalid_stuff_byte() {
        let out = decode_one(&[0xAA, 0xAA, 0xAA, 0x00, 0xAA, 0xAA, 0x01]);
        assert_eq!(out, vec![Err(FrameError::InvalidStuffByte(0x01))]);
    }

    #[test]
    fn new_signal_interrupts_frame() {
        let mut stream = encode(1, 3, b"truncated");
        stream.truncate(9);
        stream.extend(encode(2, 3, b"complete"));
        let out = decode_one(&stream);
        assert_eq!(
            out,
            vec![
                Err(FrameError::NewPacket),
                Ok(Frame::new(2, 3, b"complete".to_vec()))
            ]
        );
    }

    #[test]
    fn resync_after_error_state() {
        let mut stream = vec![0xAA, 0xAA, 0xAA, 0x07];
        stream.extend(encode(3, 1, &[]));
        let out = decode_one(&stream);
        assert_eq!(
            out,
            vec![
                Err(FrameError::InvalidSeparator(0x07)),
                Ok(Frame::new(3, 1, Vec::new()))
            ]
        );
    }
}
