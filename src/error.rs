//! Error types shared by the codecs and the packet layer.

use thiserror::Error;

use crate::packet_layer::Version;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Device result code reported when a pushed file already exists.
pub const DEVICE_ERR_EXIST: i32 = 8;

/// Diagnostics emitted by the packet decoder. None of them are fatal to the
/// byte stream: the frame in progress is discarded and the decoder waits for
/// the next signal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A new signal sequence interrupted a frame in progress.
    #[error("new packet signal received mid-frame")]
    NewPacket,

    /// Two signal bytes followed by something other than a stuffing byte.
    #[error("invalid stuff byte 0x{0:02X}")]
    InvalidStuffByte(u8),

    #[error("invalid separator byte 0x{0:02X}")]
    InvalidSeparator(u8),

    /// Declared payload length exceeds the decoder's maximum.
    #[error("packet too large: {length} bytes (max {max})")]
    TooLarge { length: u32, max: usize },

    #[error("checksum mismatch: received 0x{received:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { received: u32, computed: u32 },

    #[error("invalid terminator byte 0x{0:02X}")]
    InvalidTerminator(u8),
}

/// Errors raised while reading an Intel HEX image.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("line {line}: invalid character {ch:?}")]
    InvalidCharacter { line: usize, ch: char },

    #[error("line {line}: checksum mismatch (expected 0x{expected:02X}, found 0x{found:02X})")]
    ChecksumMismatch { line: usize, expected: u8, found: u8 },

    #[error("line {line}: invalid length {length} for record type {kind:02}")]
    InvalidRecordLength { line: usize, kind: u8, length: usize },

    #[error("line {line}: unknown record type {kind:02}")]
    UnknownRecordType { line: usize, kind: u8 },

    #[error("line {line}: multiple start addresses")]
    DuplicateStartAddress { line: usize },

    #[error("line {line}: data after end-of-file record")]
    DataAfterEof { line: usize },

    #[error("line {line}: record cut short by end of input")]
    Truncated { line: usize },

    #[error("missing end-of-file record")]
    MissingEof,

    /// The requested chunk size leaves no room after the header.
    #[error("chunk size {max_chunk_size} leaves no room after a {header_size} byte header")]
    ChunkTooSmall { max_chunk_size: usize, header_size: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the struct codec library.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StructError {
    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("invalid field definition '{definition}': {reason}")]
    InvalidDefinition { definition: String, reason: String },

    #[error("missing value for field '{0}'")]
    MissingField(String),

    #[error("field '{field}' expects {expected}")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("value {value} out of range for field '{field}'")]
    OutOfRange { field: String, value: i64 },

    #[error("field '{field}' has {actual} elements, count says {expected}")]
    CountMismatch { field: String, expected: usize, actual: usize },

    #[error("field '{field}' needs {needed} bytes, only {available} left")]
    Truncated { field: String, needed: usize, available: usize },

    #[error("unterminated string in field '{0}'")]
    UnterminatedString(String),

    #[error("invalid UTF-8 in field '{0}'")]
    InvalidUtf8(String),
}

/// Errors surfaced by the packet layer and the operations built on it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport stopped delivering bytes.
    #[error("transport closed")]
    TransportClosed,

    #[error("timeout awaiting ack for packet #{seq} ({timeout_ms}ms)")]
    Timeout { seq: u32, timeout_ms: u64 },

    #[error("invalid sequence number in ack response: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("device error {code}")]
    Device { code: i32 },

    #[error("file already exists on device")]
    FileExists,

    #[error("bootloader version mismatch: device v{device}, tool v{tool}")]
    VersionMismatch { device: Version, tool: Version },

    #[error("packet size too large: requested {requested}, device supports {supported}")]
    PacketTooLarge { requested: usize, supported: usize },

    #[error("failed to ping device after {attempts} attempts")]
    DeviceUnresponsive { attempts: u32 },

    #[error("invalid {what} response: {reason}")]
    InvalidResponse { what: &'static str, reason: String },

    #[error("file packet offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: u32, actual: u32 },

    /// File offsets and sizes are 32-bit on the device.
    #[error("file too large: {size} bytes (max {})", u32::MAX)]
    FileTooLarge { size: u64 },

    #[error("hex image: {0}")]
    Hex(#[from] HexError),

    #[error("struct codec: {0}")]
    Struct(#[from] StructError),
}

impl Error {
    /// Map a device result code to `Ok` or the matching error.
    pub fn check_device_result(code: i32) -> Result<()> {
        match code {
            0 => Ok(()),
            DEVICE_ERR_EXIST => Err(Error::FileExists),
            code => Err(Error::Device { code }),
        }
    }

    /// Errors that must stop a ping loop instead of trying again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Serial(_)
                | Error::Io(_)
                | Error::TransportClosed
                | Error::VersionMismatch { .. }
                | Error::PacketTooLarge { .. }
        )
    }

    /// Short stable code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Serial(_) => "PB-001",
            Error::Io(_) => "PB-002",
            Error::TransportClosed => "PB-003",
            Error::Timeout { .. } => "PB-010",
            Error::SequenceMismatch { .. } => "PB-011",
            Error::Device { .. } => "PB-020",
            Error::FileExists => "PB-021",
            Error::VersionMismatch { .. } => "PB-030",
            Error::PacketTooLarge { .. } => "PB-031",
            Error::DeviceUnresponsive { .. } => "PB-032",
            Error::InvalidResponse { .. } => "PB-040",
            Error::OffsetMismatch { .. } => "PB-041",
            Error::FileTooLarge { .. } => "PB-042",
            Error::Hex(_) => "PB-050",
            Error::Struct(_) => "PB-060",
        }
    }
}
