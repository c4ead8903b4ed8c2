use std::{thread, time::Duration};

use crate::{
    error::Result,
    packet::{self, Frame, PacketDecoder},
    packet_layer::PacketId,
    transport::{ByteSink, Transport},
};

use super::{ping_ack_payload, result_payload, sample_ping_info};

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// In-memory [`Transport`] playing the device side of the protocol.
///
/// Every packet the host writes is decoded, recorded and handed to the
/// responder, whose reply packets are fed back to the host.
pub struct FakeDevice {
    decoder: PacketDecoder,
    sink: Option<ByteSink>,
    responder: Responder,
    pace: Option<Duration>,
    received: Vec<Frame>,
    bauds: Vec<u32>,
}

impl FakeDevice {
    pub fn new(responder: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
        FakeDevice {
            decoder: PacketDecoder::new(1 << 16),
            sink: None,
            responder: Box::new(responder),
            pace: None,
            received: Vec::new(),
            bauds: Vec::new(),
        }
    }

    /// A device answering the simple requests the way the bootloader does.
    pub fn bootloader() -> Self {
        let ping = ping_ack_payload(&sample_ping_info());
        Self::new(move |frame| match PacketId::from_id(frame.cmd) {
            Some(PacketId::Ping) => vec![ack(frame, ping.clone())],
            Some(PacketId::PushData) | Some(PacketId::PushCommit) => {
                vec![ack(frame, result_payload(0))]
            }
            _ => vec![ack(frame, Vec::new())],
        })
    }

    /// Send replies from a background thread, one every `pace`.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Packets the host sent, in order.
    pub fn received(&self) -> &[Frame] {
        &self.received
    }

    /// Baud rates the host switched to.
    pub fn bauds(&self) -> &[u32] {
        &self.bauds
    }
}

impl Transport for FakeDevice {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut replies = Vec::new();
        for result in self.decoder.feed_all(bytes) {
            let frame = result.unwrap_or_else(|e| panic!("host sent a bad packet: {}", e));
            for reply in (self.responder)(&frame) {
                replies.push(packet::encode(reply.seq, reply.cmd, &reply.payload));
            }
            self.received.push(frame);
        }

        if let Some(sink) = &self.sink {
            match self.pace {
                None => {
                    for reply in replies {
                        let _ = sink.send(reply);
                    }
                }
                Some(pace) => {
                    let sink = sink.clone();
                    thread::spawn(move || {
                        for reply in replies {
                            thread::sleep(pace);
                            let _ = sink.send(reply);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn switch_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.bauds.push(baud_rate);
        Ok(())
    }

    fn read(&mut self, sink: Option<ByteSink>) -> Result<()> {
        self.sink = sink;
        Ok(())
    }
}

/// Ack for `request`.
pub fn ack(request: &Frame, payload: impl Into<Vec<u8>>) -> Frame {
    Frame::new(request.seq, PacketId::Ack.id(), payload)
}

/// Packet of another kind belonging to `request`.
pub fn reply(request: &Frame, id: PacketId, payload: impl Into<Vec<u8>>) -> Frame {
    Frame::new(request.seq, id.id(), payload)
}
