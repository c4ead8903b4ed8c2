//! Record level parser.

use std::io::{BufReader, Bytes, Read};

use log::warn;

use super::{HexRecord, RecordType, DEFAULT_START_ADDRESS};
use crate::error::HexError;

/// Non fatal findings, available once the input is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexWarning {
    /// No start address record, [`DEFAULT_START_ADDRESS`] applies.
    NoStartAddress,
}

/// Streaming Intel HEX parser.
///
/// Anything outside a record (before the `:` marker) is ignored, whitespace
/// inside a record is skipped. A checksum failure is reported for the
/// offending record only: the parser is positioned on the next record and
/// the caller may keep reading or give up.
pub struct HexParser<R: Read> {
    input: Bytes<BufReader<R>>,
    line: usize,
    base: u32,
    start: Option<u32>,
    seen_eof: bool,
    finished: bool,
    warnings: Vec<HexWarning>,
}

impl<R: Read> HexParser<R> {
    pub fn new(reader: R) -> Self {
        HexParser {
            input: BufReader::new(reader).bytes(),
            line: 1,
            base: 0,
            start: None,
            seen_eof: false,
            finished: false,
            warnings: Vec::new(),
        }
    }

    /// Read the next record, `Ok(None)` once the input is exhausted.
    pub fn read(&mut self) -> Result<Option<HexRecord>, HexError> {
        if self.finished {
            return Ok(None);
        }

        // Skip to the start marker.
        loop {
            match self.next_char()? {
                Some(b':') => break,
                Some(_) => continue,
                None => return self.finish().map(|_| None),
            }
        }

        let line = self.line;
        let mut checksum: u8 = 0;
        let mut byte = |parser: &mut Self| -> Result<u8, HexError> {
            let b = parser.read_byte(line)?;
            checksum = checksum.wrapping_add(b);
            Ok(b)
        };

        let length = byte(self)? as usize;
        let offset = u16::from_be_bytes([byte(self)?, byte(self)?]);
        let code = byte(self)?;
        let mut data = Vec::with_capacity(length);
        for _ in 0..length {
            data.push(byte(self)?);
        }
        let expected = (!checksum).wrapping_add(1);
        let found = self.read_byte(line)?;
        if found != expected {
            return Err(HexError::ChecksumMismatch {
                line,
                expected,
                found,
            });
        }

        let kind = RecordType::from_code(code).ok_or(HexError::UnknownRecordType { line, kind: code })?;
        if self.seen_eof {
            return Err(HexError::DataAfterEof { line });
        }

        let check_length = |wanted: usize| {
            if data.len() == wanted {
                Ok(())
            } else {
                Err(HexError::InvalidRecordLength {
                    line,
                    kind: code,
                    length: data.len(),
                })
            }
        };

        let address = match kind {
            RecordType::Data => self.base.wrapping_add(offset as u32),
            RecordType::EndOfFile => {
                self.seen_eof = true;
                0
            }
            RecordType::ExtendedSegmentAddress => {
                check_length(2)?;
                self.base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                self.base
            }
            RecordType::ExtendedLinearAddress => {
                check_length(2)?;
                self.base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                self.base
            }
            RecordType::StartSegmentAddress => {
                check_length(4)?;
                let cs = u16::from_be_bytes([data[0], data[1]]) as u32;
                let ip = u16::from_be_bytes([data[2], data[3]]) as u32;
                self.set_start(line, (cs << 4).wrapping_add(ip))?
            }
            RecordType::StartLinearAddress => {
                check_length(4)?;
                self.set_start(line, u32::from_be_bytes([data[0], data[1], data[2], data[3]]))?
            }
        };

        Ok(Some(HexRecord {
            kind,
            address,
            data,
        }))
    }

    /// Start address reported by the image, if any.
    pub fn start_address(&self) -> Option<u32> {
        self.start
    }

    /// Where execution should begin: the reported start address or
    /// [`DEFAULT_START_ADDRESS`].
    pub fn entry_address(&self) -> u32 {
        self.start.unwrap_or(DEFAULT_START_ADDRESS)
    }

    pub fn warnings(&self) -> &[HexWarning] {
        &self.warnings
    }

    fn set_start(&mut self, line: usize, address: u32) -> Result<u32, HexError> {
        if self.start.is_some() {
            return Err(HexError::DuplicateStartAddress { line });
        }
        self.start = Some(address);
        Ok(address)
    }

    fn finish(&mut self) -> Result<(), HexError> {
        if !self.seen_eof {
            return Err(HexError::MissingEof);
        }
        self.finished = true;
        if self.start.is_none() {
            warn!("hex image has no start address, assuming default");
            self.warnings.push(HexWarning::NoStartAddress);
        }
        Ok(())
    }

    fn next_char(&mut self) -> Result<Option<u8>, HexError> {
        match self.input.next() {
            Some(Ok(c)) => {
                if c == b'\n' {
                    self.line += 1;
                }
                Ok(Some(c))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn read_nibble(&mut self, line: usize) -> Result<u8, HexError> {
        loop {
            let c = self.next_char()?.ok_or(HexError::Truncated { line })?;
            match c {
                b'0'..=b'9' => return Ok(c - b'0'),
                b'A'..=b'F' => return Ok(c - b'A' + 10),
                b'a'..=b'f' => return Ok(c - b'a' + 10),
                b' ' | b'\t' | b'\r' | b'\n' => continue,
                _ => {
                    return Err(HexError::InvalidCharacter {
                        line: self.line,
                        ch: c as char,
                    })
                }
            }
        }
    }

    fn read_byte(&mut self, line: usize) -> Result<u8, HexError> {
        Ok(self.read_nibble(line)? << 4 | self.read_nibble(line)?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse_all(text: &str) -> (Vec<HexRecord>, Result<(), HexError>, HexParser<&[u8]>) {
        let mut parser = HexParser::new(text.as_bytes());
        let mut records = Vec::new();
        let result = loop {
            match parser.read() {
                Ok(Some(r)) => records.push(r),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        (records, result, parser)
    }

    #[test]
    fn data_and_eof() {
        let text = ":0400100001020304E2\n:00000001FF\n";
        let (records, result, parser) = parse_all(text);
        assert!(result.is_ok());
        assert_eq!(
            records,
            vec![
                HexRecord {
                    kind: RecordType::Data,
                    address: 0x10,
                    data: vec![1, 2, 3, 4]
                },
                HexRecord {
                    kind: RecordType::EndOfFile,
                    address: 0,
                    data: vec![]
                },
            ]
        );
        assert_eq!(parser.warnings(), &[HexWarning::NoStartAddress]);
        assert_eq!(parser.entry_address(), DEFAULT_START_ADDRESS);
    }

    #[test]
    fn whitespace_and_junk_between_records() {
        let text = "junk\r\n  :04 0010 00 01020304 E2 \r\n# comment\n:00000001ff";
        let (records, result, _) = parse_all(text);
        assert!(result.is_ok());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn address_bases() {
        let text = "\
:020000021000EC
:0100040042B9
:02000004800278
:0100080055A2
:0400000500080000EF
:00000001FF
";
        let (records, result, parser) = parse_all(text);
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(records[1].address, 0x1_0004);
        assert_eq!(records[2].address, 0x8002_0000);
        assert_eq!(records[3].address, 0x8002_0008);
        assert_eq!(parser.start_address(), Some(0x0008_0000));
        assert!(parser.warnings().is_empty());
    }

    #[test]
    fn start_segment_address() {
        let (_, result, parser) = parse_all(":0400000312345678E5\n:00000001FF\n");
        assert!(result.is_ok());
        assert_eq!(parser.start_address(), Some((0x1234 << 4) + 0x5678));
    }

    #[test]
    fn checksum_error_is_recoverable() {
        let text = ":0400100001020304E3\n:0100000011EE\n:00000001FF\n";
        let mut parser = HexParser::new(text.as_bytes());
        assert!(matches!(
            parser.read(),
            Err(HexError::ChecksumMismatch {
                line: 1,
                expected: 0xE2,
                found: 0xE3
            })
        ));
        let next = parser.read().unwrap().unwrap();
        assert_eq!(next.data, vec![0x11]);
    }

    #[test]
    fn invalid_character() {
        let (_, result, _) = parse_all(":04001000010G0304E2\n");
        assert!(matches!(
            result,
            Err(HexError::InvalidCharacter { ch: 'G', .. })
        ));
    }

    #[test]
    fn duplicate_start_address() {
        let text = ":0400000500080000EF\n:0400000500080000EF\n:00000001FF\n";
        let (_, result, _) = parse_all(text);
        assert!(matches!(
            result,
            Err(HexError::DuplicateStartAddress { line: 2 })
        ));
    }

    #[test]
    fn data_after_eof() {
        let (_, result, _) = parse_all(":00000001FF\n:0100000011EE\n");
        assert!(matches!(result, Err(HexError::DataAfterEof { line: 2 })));
    }

    #[test]
    fn missing_eof() {
        let (records, result, _) = parse_all(":0100000011EE\n");
        assert_eq!(records.len(), 1);
        assert!(matches!(result, Err(HexError::MissingEof)));
    }

    #[test]
    fn truncated_record() {
        let (_, result, _) = parse_all(":04001000010203");
        assert!(matches!(result, Err(HexError::Truncated { line: 1 })));
    }

    #[test]
    fn bad_address_record_length() {
        let (_, result, _) = parse_all(":0100000410EB\n");
        assert!(matches!(
            result,
            Err(HexError::InvalidRecordLength {
                kind: 4,
                length: 1,
                ..
            })
        ));
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, ":0400100001020304E2\n:00000001FF\n").unwrap();
        let mut parser = HexParser::new(std::fs::File::open(file.path()).unwrap());
        assert_eq!(parser.read().unwrap().unwrap().address, 0x10);
        assert_eq!(parser.read().unwrap().unwrap().kind, RecordType::EndOfFile);
        assert!(parser.read().unwrap().is_none());
    }
}
