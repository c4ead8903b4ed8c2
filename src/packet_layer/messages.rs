//! Payload layouts of the bootloader packets.
//!
//! All integers are little endian, strings are NUL terminated.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::{
    error::{Error, Result, StructError},
    structs::{Library, Record},
};

/// Build the library holding every payload layout of the protocol.
pub(crate) fn protocol_library() -> std::result::Result<Library, StructError> {
    let mut lib = Library::new();
    lib.define_type(
        "ping_ack",
        &[
            "uint8 ver_major",
            "uint8 ver_minor",
            "uint8 ver_build",
            "uint8 revision",
            "uint32le raspi",
            "uint32le aarch",
            "uint32le board_revision",
            "uint32le serial_lo",
            "uint32le serial_hi",
            "uint32le max_packet_size",
            "uint32le cpu_freq",
            "uint32le min_cpu_freq",
            "uint32le max_cpu_freq",
        ],
    )?;
    lib.define_type(
        "request_baud",
        &["uint32le baud", "uint32le reset_timeout", "uint32le cpu_freq"],
    )?;
    lib.define_type("go", &["uint32le address", "uint32le delay"])?;
    lib.define_type("command", &["string cwd", "string command"])?;
    lib.define_type("command_ack", &["int32le exit_code", "string cwd"])?;
    lib.define_type("pull", &["string path"])?;
    lib.define_type(
        "pull_header",
        &[
            "uint32le size",
            "uint16le time",
            "uint16le date",
            "uint8 attr",
            "string filename",
        ],
    )?;
    lib.define_type("pull_data", &["uint32le offset"])?;
    lib.define_type("push_data", &["uint32le token", "uint32le offset"])?;
    lib.define_type(
        "push_commit",
        &[
            "uint32le token",
            "uint32le size",
            "uint16le time",
            "uint16le date",
            "uint8 attr",
            "uint8 overwrite",
            "string name",
        ],
    )?;
    lib.define_type("result", &["int32le code"])?;
    Ok(lib)
}

/// Decode a response payload, blaming the device for anything malformed.
pub(crate) fn decode_response(lib: &Library, what: &'static str, payload: &[u8]) -> Result<Record> {
    lib.decode(what, payload)
        .map_err(|e| Error::InvalidResponse {
            what,
            reason: e.to_string(),
        })
}

/// Read an unsigned field of a decoded record.
pub(crate) fn field_u32(record: &Record, name: &str) -> u32 {
    record.get_int(name).unwrap_or_default() as u32
}

// =============================================================================
// Version
// =============================================================================

/// Bootloader / tool version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
}

impl Version {
    /// Version of this tool, which the bootloader is expected to match.
    pub fn tool() -> Self {
        let mut parts = env!("CARGO_PKG_VERSION")
            .split('.')
            .map(|p| p.parse::<u8>().unwrap_or(0));
        Version {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            build: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

// =============================================================================
// Ping
// =============================================================================

/// What the device reports about itself in reply to a ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingInfo {
    pub version: Version,
    pub revision: u8,
    /// Raspberry Pi generation the bootloader was built for.
    pub raspi: u32,
    /// 32 or 64.
    pub aarch: u32,
    pub board_revision: u32,
    pub board_serial: u64,
    pub max_packet_size: u32,
    pub cpu_freq: u32,
    pub min_cpu_freq: u32,
    pub max_cpu_freq: u32,
}

impl PingInfo {
    pub(crate) fn from_record(r: &Record) -> Self {
        let byte = |name| field_u32(r, name) as u8;
        PingInfo {
            version: Version {
                major: byte("ver_major"),
                minor: byte("ver_minor"),
                build: byte("ver_build"),
            },
            revision: byte("revision"),
            raspi: field_u32(r, "raspi"),
            aarch: field_u32(r, "aarch"),
            board_revision: field_u32(r, "board_revision"),
            board_serial: (field_u32(r, "serial_hi") as u64) << 32 | field_u32(r, "serial_lo") as u64,
            max_packet_size: field_u32(r, "max_packet_size"),
            cpu_freq: field_u32(r, "cpu_freq"),
            min_cpu_freq: field_u32(r, "min_cpu_freq"),
            max_cpu_freq: field_u32(r, "max_cpu_freq"),
        }
    }

    #[cfg(test)]
    pub(crate) fn to_record(&self) -> Record {
        Record::new()
            .with("ver_major", self.version.major)
            .with("ver_minor", self.version.minor)
            .with("ver_build", self.version.build)
            .with("revision", self.revision)
            .with("raspi", self.raspi)
            .with("aarch", self.aarch)
            .with("board_revision", self.board_revision)
            .with("serial_lo", self.board_serial as u32)
            .with("serial_hi", (self.board_serial >> 32) as u32)
            .with("max_packet_size", self.max_packet_size)
            .with("cpu_freq", self.cpu_freq)
            .with("min_cpu_freq", self.min_cpu_freq)
            .with("max_cpu_freq", self.max_cpu_freq)
    }
}

impl fmt::Display for PingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "board revision: {:06x}", self.board_revision)?;
        writeln!(
            f,
            "serial: {:08x}-{:08x}",
            self.board_serial >> 32,
            self.board_serial & 0xFFFF_FFFF
        )?;
        writeln!(
            f,
            "CPU clock: {}MHz (range: {}-{}MHz)",
            self.cpu_freq / 1_000_000,
            self.min_cpu_freq / 1_000_000,
            self.max_cpu_freq / 1_000_000
        )?;
        write!(
            f,
            "bootloader: rpi{}-aarch{} v{}, max packet size: {}",
            self.raspi, self.aarch, self.version, self.max_packet_size
        )
    }
}

// =============================================================================
// Commands and files
// =============================================================================

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    /// Working directory after the command ran.
    pub cwd: String,
}

/// Date and time packed the way FAT stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatTimestamp {
    pub date: u16,
    pub time: u16,
}

impl FatTimestamp {
    /// Pack a local time. FAT starts counting in 1980 and has a two second
    /// resolution.
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107) as u16;
        FatTimestamp {
            date: (year - 1980) << 9 | (dt.month() as u16) << 5 | dt.day() as u16,
            time: (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | (dt.second() / 2) as u16,
        }
    }

    /// `None` for values that are not a valid date.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            1980 + (self.date >> 9) as i32,
            ((self.date >> 5) & 0x0F) as u32,
            (self.date & 0x1F) as u32,
        )?
        .and_hms_opt(
            (self.time >> 11) as u32,
            ((self.time >> 5) & 0x3F) as u32,
            ((self.time & 0x1F) * 2) as u32,
        )
    }
}

/// First packet of a pulled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullHeader {
    pub size: u32,
    pub timestamp: FatTimestamp,
    pub attr: u8,
    pub filename: String,
}

impl PullHeader {
    pub(crate) fn from_record(r: &Record) -> Self {
        PullHeader {
            size: field_u32(r, "size"),
            timestamp: FatTimestamp {
                date: field_u32(r, "date") as u16,
                time: field_u32(r, "time") as u16,
            },
            attr: field_u32(r, "attr") as u8,
            filename: r.get_str("filename").unwrap_or_default().to_owned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn to_record(&self) -> Record {
        Record::new()
            .with("size", self.size)
            .with("time", self.timestamp.time)
            .with("date", self.timestamp.date)
            .with("attr", self.attr)
            .with("filename", self.filename.as_str())
    }
}

/// Final packet of a pushed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCommit {
    /// Same token as the data packets.
    pub token: u32,
    pub size: u32,
    pub timestamp: FatTimestamp,
    pub attr: u8,
    /// Replace an existing file instead of failing.
    pub overwrite: bool,
    /// Destination path on the device.
    pub name: String,
}

impl PushCommit {
    pub(crate) fn to_record(&self) -> Record {
        Record::new()
            .with("token", self.token)
            .with("size", self.size)
            .with("time", self.timestamp.time)
            .with("date", self.timestamp.date)
            .with("attr", self.attr)
            .with("overwrite", self.overwrite as u8)
            .with("name", self.name.as_str())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
