//! Piboot is the host side of a serial bootloader for the Raspberry Pi. It
//! talks to the bootloader over the serial line to load kernel images into
//! memory and start them, run shell commands on the device and copy files
//! to and from its SD card.
//!
//! The crate is built as a stack of small layers:
//!
//! * [`crc32`] and [`packet`] frame packets on the byte stream. Frames start
//!   with a signal sequence that can not appear anywhere else, so the
//!   decoder resynchronizes on its own after line noise.
//! * [`structs`] describes payload layouts as named field lists and turns
//!   records into bytes and back.
//! * [`hex`] reads Intel HEX images and regroups their records into chunks
//!   the size of a packet.
//! * [`packet_layer`] numbers requests, matches acknowledgments, handles
//!   timeouts and exposes the bootloader commands.
//! * [`transfer`] builds whole-file operations on top: flashing images,
//!   pushing and pulling files.
//!
//! The serial port itself sits behind the [`transport::Transport`] trait,
//! which only needs to write, drain, switch baud rates and report incoming
//! bytes.
//!
//! **Example**
//!
//! ```no_run
//! use piboot::{packet_layer::PacketLayer, transport::SerialTransport, SettingsBuilder};
//!
//! # fn main() -> piboot::error::Result<()> {
//! let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
//! let transport = SerialTransport::open(&settings)?;
//! let mut layer = PacketLayer::new(transport, settings)?;
//! let info = layer.ping()?;
//! println!("{}", info);
//! # Ok(())
//! # }
//! ```

pub mod crc32;
pub mod error;
pub mod hex;
pub mod packet;
pub mod packet_layer;
mod settings;
pub mod structs;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use error::{Error, Result};
pub use settings::{CpuBoost, Settings, SettingsBuilder, MIN_PACKET_SIZE};
