//! Byte level link to the device.
//!
//! The packet layer only needs four things from the link: write bytes, wait
//! for them to leave, change the baud rate and get told about incoming bytes.

mod serial;

use std::sync::mpsc;

#[cfg(test)]
use mockall::automock;

pub use serial::SerialTransport;

use crate::error::Result;

/// Where received bytes are pushed, in arrival order.
pub type ByteSink = mpsc::Sender<Vec<u8>>;

#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// Queue bytes for sending.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block until everything written has been sent on the line.
    fn drain(&mut self) -> Result<()>;

    /// Change the line speed. Anything still queued is drained first.
    fn switch_baud(&mut self, baud_rate: u32) -> Result<()>;

    /// Install the subscriber for received bytes, or remove it with `None`.
    fn read(&mut self, sink: Option<ByteSink>) -> Result<()>;
}
