//! Whole-file operations: flashing images, pushing and pulling files.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    time::{Instant, SystemTime},
};

use chrono::{DateTime, Local, TimeZone, Utc};
use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    hex::{ChunkItem, Chunker, HexParser, RecordType, DEFAULT_START_ADDRESS},
    packet_layer::{FatTimestamp, PacketLayer, PullHeader, PushCommit, ResponseHandler, DATA_HEADER_SIZE},
    transport::Transport,
};

/// FAT archive attribute, set on every pushed file.
const ATTR_ARCHIVE: u8 = 0x20;

/// Bytes in front of the data of a push packet: token and offset.
const PUSH_HEADER_SIZE: usize = 8;

/// How far a transfer got, in payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    /// Unknown for hex images.
    pub total: Option<u64>,
}

/// Result of writing an image to device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSummary {
    /// Program bytes written.
    pub bytes: u64,
    pub packets: u32,
    /// Where execution starts, `None` for the device default.
    pub start_address: Option<u32>,
}

/// Where the firmware loads kernels of the given architecture.
pub fn kernel_load_address(aarch: u32) -> u32 {
    if aarch == 64 {
        0x8_0000
    } else {
        0x8000
    }
}

/// Write an Intel HEX image to device memory and, with `go`, start it after
/// the configured go delay.
pub fn flash_image<T, R, P>(layer: &mut PacketLayer<T>, reader: R, go: bool, mut progress: P) -> Result<FlashSummary>
where
    T: Transport,
    R: Read,
    P: FnMut(Progress),
{
    let started = Instant::now();
    let max_packet_size = layer.settings().max_packet_size;
    let mut chunker = Chunker::new(HexParser::new(reader), max_packet_size, DATA_HEADER_SIZE)?;
    let mut summary = FlashSummary {
        bytes: 0,
        packets: 0,
        start_address: None,
    };

    while let Some(item) = chunker.read()? {
        match item {
            ChunkItem::Chunk(mut chunk) => {
                layer.send_data_chunk(&mut chunk)?;
                summary.bytes += chunk.data().len() as u64;
                summary.packets += 1;
                progress(Progress {
                    done: summary.bytes,
                    total: None,
                });
            }
            ChunkItem::Record(record) => {
                if record.kind == RecordType::EndOfFile {
                    debug!("end of image");
                }
            }
        }
    }

    let entry = chunker.parser().entry_address();
    summary.start_address = Some(entry).filter(|a| *a != DEFAULT_START_ADDRESS);
    info!(
        "transferred {} bytes in {} packets, {:.1}s",
        summary.bytes,
        summary.packets,
        started.elapsed().as_secs_f32()
    );

    if go {
        let delay = layer.settings().go_delay;
        layer.send_go(summary.start_address, Some(delay))?;
    }
    Ok(summary)
}

/// Write a raw binary image to `load_address`, optionally starting it there.
pub fn flash_binary<T, R, P>(
    layer: &mut PacketLayer<T>,
    mut reader: R,
    load_address: u32,
    total: Option<u64>,
    go: bool,
    mut progress: P,
) -> Result<FlashSummary>
where
    T: Transport,
    R: Read,
    P: FnMut(Progress),
{
    let max_packet_size = layer.settings().max_packet_size;
    let mut buffer = vec![0u8; max_packet_size];
    let mut summary = FlashSummary {
        bytes: 0,
        packets: 0,
        start_address: Some(load_address),
    };

    loop {
        let n = read_full(&mut reader, &mut buffer[DATA_HEADER_SIZE..])?;
        if n == 0 {
            break;
        }
        let address = load_address.wrapping_add(summary.bytes as u32);
        layer.send_data(address, &buffer[DATA_HEADER_SIZE..DATA_HEADER_SIZE + n])?;
        summary.bytes += n as u64;
        summary.packets += 1;
        progress(Progress {
            done: summary.bytes,
            total,
        });
    }

    if go {
        let delay = layer.settings().go_delay;
        layer.send_go(Some(load_address), Some(delay))?;
    }
    Ok(summary)
}

/// Upload a local file to `remote` on the device.
pub fn push_file<T, P>(
    layer: &mut PacketLayer<T>,
    local: &Path,
    remote: &str,
    overwrite: bool,
    mut progress: P,
) -> Result<u32>
where
    T: Transport,
    P: FnMut(Progress),
{
    let metadata = fs::metadata(local)?;
    if metadata.len() > u32::MAX as u64 {
        return Err(Error::FileTooLarge {
            size: metadata.len(),
        });
    }
    let modified: DateTime<Local> = metadata.modified().unwrap_or_else(|_| SystemTime::now()).into();
    let token = (Utc::now().timestamp_millis() & 0x7FFF_FFFF) as u32;
    debug!("pushing {} => {} (token {:08x})", local.display(), remote, token);

    let mut reader = BufReader::new(File::open(local)?);
    let mut buffer = vec![0u8; layer.settings().max_packet_size - PUSH_HEADER_SIZE];
    let mut offset: u32 = 0;

    // An empty file still takes one packet, offset zero opens the upload.
    loop {
        let n = read_full(&mut reader, &mut buffer)?;
        layer.send_push_data(token, offset, &buffer[..n])?;
        offset = advance(offset, n)?;
        progress(Progress {
            done: offset as u64,
            total: Some(metadata.len()),
        });
        if n < buffer.len() {
            break;
        }
    }

    layer.send_push_commit(&PushCommit {
        token,
        size: offset,
        timestamp: FatTimestamp::from_datetime(&modified.naive_local()),
        attr: ATTR_ARCHIVE,
        overwrite,
        name: remote.to_owned(),
    })?;
    info!("pushed {} bytes to {}", offset, remote);
    Ok(offset)
}

/// Download `remote` from the device into `local`. Nothing is left behind
/// at `local` when the transfer fails.
pub fn pull_file<T, P>(layer: &mut PacketLayer<T>, remote: &str, local: &Path, progress: P) -> Result<PullHeader>
where
    T: Transport,
    P: FnMut(Progress),
{
    let mut sink = FileSink {
        writer: BufWriter::new(File::create(local)?),
        expected: 0,
        header: None,
        progress,
    };

    let result = layer.send_pull(remote, &mut sink).and_then(|_| sink.finish());
    match result {
        Ok(header) => {
            info!("pulled {} bytes from {}", header.size, remote);
            Ok(header)
        }
        Err(e) => {
            drop(sink);
            if let Err(rm) = fs::remove_file(local) {
                warn!("could not remove partial file {}: {}", local.display(), rm);
            }
            Err(e)
        }
    }
}

//==============================================================================
// Private stuff
//==============================================================================

/// Writes pulled data, insisting on contiguous offsets.
struct FileSink<P> {
    writer: BufWriter<File>,
    expected: u32,
    header: Option<PullHeader>,
    progress: P,
}

impl<P: FnMut(Progress)> ResponseHandler for FileSink<P> {
    fn on_pull_header(&mut self, header: &PullHeader) -> Result<()> {
        debug!("pulling {} ({} bytes)", header.filename, header.size);
        self.header = Some(header.clone());
        Ok(())
    }

    fn on_pull_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if offset != self.expected {
            return Err(Error::OffsetMismatch {
                expected: self.expected,
                actual: offset,
            });
        }
        self.writer.write_all(data)?;
        self.expected = advance(self.expected, data.len())?;
        (self.progress)(Progress {
            done: self.expected as u64,
            total: self.header.as_ref().map(|h| h.size as u64),
        });
        Ok(())
    }
}

impl<P> FileSink<P> {
    fn finish(&mut self) -> Result<PullHeader> {
        let header = self.header.take().ok_or_else(|| Error::InvalidResponse {
            what: "pull",
            reason: "no file header received".into(),
        })?;
        if header.size != self.expected {
            return Err(Error::OffsetMismatch {
                expected: header.size,
                actual: self.expected,
            });
        }

        self.writer.flush()?;
        let modified = header
            .timestamp
            .to_datetime()
            .and_then(|dt| Local.from_local_datetime(&dt).single());
        if let Some(modified) = modified {
            self.writer.get_ref().set_modified(modified.into())?;
        }
        Ok(header)
    }
}

/// Move a 32-bit file offset past `n` bytes.
fn advance(offset: u32, n: usize) -> Result<u32> {
    u32::try_from(n)
        .ok()
        .and_then(|n| offset.checked_add(n))
        .ok_or(Error::FileTooLarge {
            size: offset as u64 + n as u64,
        })
}

/// Fill `buf` as far as the reader allows, short only at the end of input.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// =============================================================================
// Unit Tests
// =============================================================================
