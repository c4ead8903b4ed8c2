//! Table driven CRC-32 (the Ethernet / PKZIP flavour).
//!
//! The checksum is accumulated one byte at a time so the packet encoder and
//! decoder can fold bytes in as they stream past:
//!
//! ```
//! use piboot::crc32;
//!
//! let mut crc = crc32::start();
//! for &b in b"123456789" {
//!     crc = crc32::update(crc, b);
//! }
//! assert_eq!(crc32::finish(crc), 0xCBF4_3926);
//! ```

const POLYNOMIAL: u32 = 0x04C1_1DB7;

static TABLE: [u32; 256] = build_table();

// =============================================================================
// Public Interface
// =============================================================================

/// Initial accumulator value.
pub const fn start() -> u32 {
    0xFFFF_FFFF
}

/// Fold one byte into the accumulator.
#[inline]
pub fn update(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ TABLE[((crc ^ byte as u32) & 0xFF) as usize]
}

/// Final value of the checksum.
pub const fn finish(crc: u32) -> u32 {
    crc ^ 0xFFFF_FFFF
}

/// CRC-32 of a whole buffer.
pub fn checksum(data: &[u8]) -> u32 {
    finish(data.iter().fold(start(), |crc, &b| update(crc, b)))
}

// =============================================================================
// Private stuff
// =============================================================================

const fn reflect(mut value: u32, bits: u32) -> u32 {
    let mut result = 0;
    let mut i = 0;
    while i < bits {
        result = (result << 1) | (value & 1);
        value >>= 1;
        i += 1;
    }
    result
}

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = reflect(i as u32, 8) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = reflect(crc, 32);
        i += 1;
    }
    table
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn check_value() {
    assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
}

#[test]
fn empty_input() {
    assert_eq!(finish(start()), 0);
    assert_eq!(checksum(&[]), 0);
}

#[test]
fn table_matches_reflected_polynomial() {
    assert_eq!(TABLE[0], 0);
    assert_eq!(TABLE[1], 0x7707_3096);
    assert_eq!(TABLE[255], 0x2D02_EF8D);
}

#[test]
fn incremental_matches_whole_buffer() {
    let data = b"The quick brown fox jumps over the lazy dog";
    let crc = data.iter().fold(start(), |crc, &b| update(crc, b));
    assert_eq!(finish(crc), checksum(data));
    assert_eq!(checksum(data), 0x414F_A339);
}
