//! Coalescing of data records into transport sized chunks.

use std::io::Read;

use super::{HexParser, HexRecord, RecordType};
use crate::error::HexError;

/// Contiguous image bytes, preceded by `header_size` reserved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Load address of the first data byte.
    pub address: u32,
    pub header_size: usize,
    /// Header followed by the data.
    pub buffer: Vec<u8>,
}

impl Chunk {
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.header_size]
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[self.header_size..]
    }
}

/// What the chunker hands back: coalesced data, or any other record passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkItem {
    Chunk(Chunk),
    Record(HexRecord),
}

/// Wraps a [`HexParser`] and merges address contiguous data records into
/// chunks of at most `max_chunk_size` bytes, header included.
///
/// A chunk is emitted when the next data record is not contiguous, when it
/// is full, or before any non-data record. Records that do not fit are split
/// and the remainder starts the next chunk.
pub struct Chunker<R: Read> {
    parser: HexParser<R>,
    header_size: usize,
    available: usize,
    address: u32,
    buffer: Vec<u8>,
    carry: Option<HexRecord>,
}

impl<R: Read> Chunker<R> {
    /// Fails with [`HexError::ChunkTooSmall`] if the header leaves no room
    /// for data.
    pub fn new(parser: HexParser<R>, max_chunk_size: usize, header_size: usize) -> Result<Self, HexError> {
        if max_chunk_size <= header_size {
            return Err(HexError::ChunkTooSmall {
                max_chunk_size,
                header_size,
            });
        }
        Ok(Chunker {
            parser,
            header_size,
            available: max_chunk_size - header_size,
            address: 0,
            buffer: Self::fresh_buffer(header_size, max_chunk_size),
            carry: None,
        })
    }

    /// The underlying parser, for the start address and warnings.
    pub fn parser(&self) -> &HexParser<R> {
        &self.parser
    }

    pub fn read(&mut self) -> Result<Option<ChunkItem>, HexError> {
        loop {
            let record = match self.carry.take() {
                Some(record) => record,
                None => match self.parser.read()? {
                    Some(record) => record,
                    None => return Ok(self.flush().map(ChunkItem::Chunk)),
                },
            };

            if record.kind != RecordType::Data {
                if self.used() > 0 {
                    self.carry = Some(record);
                    return Ok(self.flush().map(ChunkItem::Chunk));
                }
                return Ok(Some(ChunkItem::Record(record)));
            }

            if record.data.is_empty() {
                continue;
            }

            let used = self.used();
            if used > 0 && self.address.wrapping_add(used as u32) != record.address {
                self.carry = Some(record);
                return Ok(self.flush().map(ChunkItem::Chunk));
            }
            if used == 0 {
                self.address = record.address;
            }

            let room = self.available - used;
            if record.data.len() > room {
                self.buffer.extend_from_slice(&record.data[..room]);
                self.carry = Some(HexRecord {
                    kind: RecordType::Data,
                    address: record.address.wrapping_add(room as u32),
                    data: record.data[room..].to_vec(),
                });
            } else {
                self.buffer.extend_from_slice(&record.data);
            }

            if self.used() == self.available {
                return Ok(self.flush().map(ChunkItem::Chunk));
            }
        }
    }

    fn used(&self) -> usize {
        self.buffer.len() - self.header_size
    }

    fn flush(&mut self) -> Option<Chunk> {
        if self.used() == 0 {
            return None;
        }
        let capacity = self.header_size + self.available;
        let buffer = std::mem::replace(
            &mut self.buffer,
            Self::fresh_buffer(self.header_size, capacity),
        );
        Some(Chunk {
            address: self.address,
            header_size: self.header_size,
            buffer,
        })
    }

    fn fresh_buffer(header_size: usize, capacity: usize) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize(header_size, 0);
        buffer
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<ChunkItem, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex::{HexWarning, DEFAULT_START_ADDRESS};

    /// Build a data record line with a valid checksum.
    fn data_line(address: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, 0];
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |s, b| s.wrapping_add(*b));
        bytes.push((!sum).wrapping_add(1));
        let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}\n", hex)
    }

    fn chunk(text: &str, max: usize, header: usize) -> Vec<ChunkItem> {
        Chunker::new(HexParser::new(text.as_bytes()), max, header)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn chunks_only(items: &[ChunkItem]) -> Vec<&Chunk> {
        items
            .iter()
            .filter_map(|i| match i {
                ChunkItem::Chunk(c) => Some(c),
                ChunkItem::Record(_) => None,
            })
            .collect()
    }

    #[test]
    fn eof_only_yields_no_chunks() {
        let mut chunker = Chunker::new(HexParser::new(":00000001FF\n".as_bytes()), 16, 4).unwrap();
        let items: Vec<_> = chunker.by_ref().collect::<Result<_, _>>().unwrap();
        assert!(chunks_only(&items).is_empty());
        assert!(matches!(
            &items[..],
            [ChunkItem::Record(HexRecord {
                kind: RecordType::EndOfFile,
                ..
            })]
        ));
        assert_eq!(chunker.parser().warnings(), &[HexWarning::NoStartAddress]);
        assert_eq!(chunker.parser().entry_address(), DEFAULT_START_ADDRESS);
    }

    #[test]
    fn contiguous_records_coalesce() {
        let text = data_line(0x100, &[1, 2, 3, 4])
            + &data_line(0x104, &[5, 6, 7, 8])
            + &data_line(0x200, &[9, 10])
            + ":00000001FF\n";
        let items = chunk(&text, 12, 4);
        let chunks = chunks_only(&items);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].address, 0x100);
        assert_eq!(chunks[0].data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(chunks[0].buffer.len(), 12);
        assert_eq!(chunks[1].address, 0x200);
        assert_eq!(chunks[1].data(), &[9, 10]);
        assert!(matches!(items.last(), Some(ChunkItem::Record(_))));
    }

    #[test]
    fn gap_flushes_partial_chunk() {
        let text = data_line(0x0, &[1, 2])
            + &data_line(0x2, &[3])
            + &data_line(0x10, &[4])
            + ":00000001FF\n";
        let items = chunk(&text, 64, 4);
        let chunks = chunks_only(&items);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data(), &[1, 2, 3]);
        assert_eq!(chunks[0].buffer.len(), 4 + 3);
        assert_eq!(chunks[1].address, 0x10);
    }

    #[test]
    fn overflowing_record_is_split() {
        let data: Vec<u8> = (0..10).collect();
        let text = data_line(0x40, &data) + ":00000001FF\n";
        let items = chunk(&text, 8, 4);
        let chunks = chunks_only(&items);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].address, chunks[0].data()), (0x40, &[0, 1, 2, 3][..]));
        assert_eq!((chunks[1].address, chunks[1].data()), (0x44, &[4, 5, 6, 7][..]));
        assert_eq!((chunks[2].address, chunks[2].data()), (0x48, &[8, 9][..]));
    }

    #[test]
    fn non_data_records_flush_first() {
        let text = data_line(0x0, &[1, 2])
            + ":020000040001F9\n"
            + &data_line(0x2, &[3])
            + ":00000001FF\n";
        let items = chunk(&text, 64, 0);
        assert_eq!(items.len(), 4);
        assert!(matches!(&items[0], ChunkItem::Chunk(c) if c.address == 0 && c.data() == &[1, 2]));
        assert!(matches!(
            &items[1],
            ChunkItem::Record(HexRecord {
                kind: RecordType::ExtendedLinearAddress,
                address: 0x1_0000,
                ..
            })
        ));
        assert!(matches!(&items[2], ChunkItem::Chunk(c) if c.address == 0x1_0002));
        assert!(matches!(
            &items[3],
            ChunkItem::Record(HexRecord {
                kind: RecordType::EndOfFile,
                ..
            })
        ));
    }

    #[test]
    fn header_is_writable() {
        let text = data_line(0x8000, &[0xAB]) + ":00000001FF\n";
        let mut items = chunk(&text, 16, 4);
        match &mut items[0] {
            ChunkItem::Chunk(c) => {
                let address = c.address;
                c.header_mut().copy_from_slice(&address.to_le_bytes());
                assert_eq!(c.buffer, vec![0x00, 0x80, 0x00, 0x00, 0xAB]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_errors_propagate() {
        let text = data_line(0x0, &[1]) + ":0100000011EF\n:00000001FF\n";
        let result: Result<Vec<_>, _> = Chunker::new(HexParser::new(text.as_bytes()), 16, 4)
            .unwrap()
            .collect();
        assert!(matches!(result, Err(HexError::ChecksumMismatch { .. })));
    }

    #[test]
    fn header_must_leave_room_for_data() {
        let text = ":00000001FF\n";
        assert!(matches!(
            Chunker::new(HexParser::new(text.as_bytes()), 4, 4),
            Err(HexError::ChunkTooSmall {
                max_chunk_size: 4,
                header_size: 4
            })
        ));
        assert!(Chunker::new(HexParser::new(text.as_bytes()), 5, 4).is_ok());
    }
}
