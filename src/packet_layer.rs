//! Request / acknowledgment protocol on top of the packet framing.
//!
//! Every request gets a fresh sequence number and is answered by an `Ack`
//! packet carrying the same number. Only one request may be outstanding at
//! a time, which matches the half duplex nature of the link: callers issue
//! requests one after the other.
//!
//! While a request is outstanding the device may stream other packets for
//! it (command output, pulled file contents). Each valid packet received
//! restarts the inactivity timer, so long running requests only time out
//! once the device goes quiet.
//!
//! **Example**
//!
//! ```ignore
//! let transport = SerialTransport::open(&settings)?;
//! let mut layer = PacketLayer::new(transport, settings)?;
//! let info = layer.ping()?;
//! layer.boost(&info)?;
//! ```

mod handler;
mod layer;
mod messages;
mod operations;
mod packet_id;

pub use handler::{CapturedOutput, NoResponseHandler, ResponseHandler};
pub use layer::PacketLayer;
pub use messages::{CommandOutcome, FatTimestamp, PingInfo, PullHeader, PushCommit, Version};
pub use packet_id::PacketId;

pub(crate) use messages::protocol_library;

/// Size of the address header in front of data packets.
pub const DATA_HEADER_SIZE: usize = 4;
