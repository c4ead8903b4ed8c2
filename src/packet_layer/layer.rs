//! Sequence numbering, ack matching and inactivity timeouts.

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Instant,
};

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, warn, Level::Debug};

use super::{
    handler::{NoResponseHandler, ResponseHandler},
    messages::{decode_response, field_u32, protocol_library, PullHeader, Version},
    PacketId,
};
use crate::{
    error::{Error, Result},
    packet::{self, Frame, PacketDecoder},
    structs::Library,
    transport::Transport,
    Settings,
};

/// Sequence numbers run from 1 to this value and wrap back to 1. Zero is
/// what the device uses for packets it could not attribute to a request.
pub const SEQ_MAX: u32 = 0x3FFF;

/// Talks to the bootloader one request at a time.
pub struct PacketLayer<T: Transport> {
    pub(super) transport: T,
    pub(super) settings: Settings,
    pub(super) library: Library,
    pub(super) tool_version: Version,
    decoder: PacketDecoder,
    inbound: Receiver<Vec<u8>>,
    next_seq: u32,
    pending: Option<PendingRequest>,
}

/// The request awaiting its ack.
struct PendingRequest {
    seq: u32,
    deadline: Instant,
    outcome: Option<Result<Vec<u8>>>,
    /// First error raised by the response handler.
    handler_error: Option<Error>,
}

impl<T: Transport> PacketLayer<T> {
    /// Subscribe to the transport and get ready for the first request.
    pub fn new(mut transport: T, settings: Settings) -> Result<Self> {
        let (tx, inbound) = mpsc::channel();
        transport.read(Some(tx))?;
        Ok(PacketLayer {
            transport,
            decoder: PacketDecoder::new(settings.max_packet_size),
            settings,
            library: protocol_library()?,
            tool_version: Version::tool(),
            inbound,
            next_seq: 1,
            pending: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Unsubscribe and hand the transport back.
    pub fn into_transport(mut self) -> T {
        if let Err(e) = self.transport.read(None) {
            debug!("could not unsubscribe from transport: {}", e);
        }
        self.transport
    }

    /// Send a request and wait for its ack. Returns the ack payload.
    pub fn send(&mut self, id: PacketId, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_with(id, payload, &mut NoResponseHandler)
    }

    /// Like [`send`](Self::send), routing the packets the device streams
    /// back for this request to `handler`.
    pub fn send_with(
        &mut self,
        id: PacketId,
        payload: &[u8],
        handler: &mut dyn ResponseHandler,
    ) -> Result<Vec<u8>> {
        let seq = self.allocate_seq();
        let frame = packet::encode(seq, id.id(), payload);

        if log_enabled!(Debug) {
            debug!(
                "tx #{} {:?} ({} bytes payload)\n{}",
                seq,
                id,
                payload.len(),
                HexViewBuilder::new(&payload[..payload.len().min(64)])
                    .address_offset(0)
                    .row_width(16)
                    .finish()
            );
        }

        self.discard_idle_input();

        // Armed before writing so a fast ack can not be missed.
        self.pending = Some(PendingRequest {
            seq,
            deadline: Instant::now() + self.settings.packet_timeout,
            outcome: None,
            handler_error: None,
        });

        let result = self
            .transport
            .write(&frame)
            .and_then(|_| self.transport.drain())
            .and_then(|_| self.await_ack(handler));
        self.pending = None;
        result
    }

    /// Accept inbound payloads up to what the device may send, which can be
    /// more than we send ourselves.
    pub(super) fn set_inbound_limit(&mut self, max_payload: usize) {
        self.decoder = PacketDecoder::new(max_payload.max(self.settings.max_packet_size));
    }

    /// Drop any partial frame, used after the line speed changed.
    pub(super) fn reset_decoder(&mut self) {
        self.decoder.reset();
    }

    /// Decode whatever arrived while no request was outstanding. Late acks
    /// and output for finished requests are dropped here instead of being
    /// held against the next request.
    fn discard_idle_input(&mut self) {
        while let Ok(bytes) = self.inbound.try_recv() {
            for byte in bytes {
                self.receive(byte, &mut NoResponseHandler);
            }
        }
    }

    fn allocate_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = if seq >= SEQ_MAX { 1 } else { seq + 1 };
        seq
    }

    fn await_ack(&mut self, handler: &mut dyn ResponseHandler) -> Result<Vec<u8>> {
        loop {
            let (seq, deadline) = match &self.pending {
                Some(PendingRequest {
                    outcome: Some(_), ..
                }) => break,
                Some(p) => (p.seq, p.deadline),
                None => return Err(Error::TransportClosed),
            };

            let wait = deadline.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(wait) {
                Ok(bytes) => {
                    for byte in bytes {
                        self.receive(byte, handler);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let timeout_ms = self.settings.packet_timeout.as_millis() as u64;
                    debug!("no ack for #{} within {}ms", seq, timeout_ms);
                    return Err(Error::Timeout { seq, timeout_ms });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::TransportClosed),
            }
        }

        let noise = self.decoder.take_noise();
        if noise > 0 {
            trace!("skipped {} bytes outside of packets", noise);
        }

        match self.pending.as_mut().and_then(|p| p.outcome.take()) {
            Some(outcome) => outcome,
            None => Err(Error::TransportClosed),
        }
    }

    fn receive(&mut self, byte: u8, handler: &mut dyn ResponseHandler) {
        match self.decoder.feed(byte) {
            None => {}
            Some(Err(e)) => warn!("packet error: {}", e),
            Some(Ok(frame)) => self.dispatch(frame, handler),
        }
    }

    fn dispatch(&mut self, frame: Frame, handler: &mut dyn ResponseHandler) {
        let timeout = self.settings.packet_timeout;
        if let Some(p) = self.pending.as_mut() {
            p.deadline = Instant::now() + timeout;
        }

        if log_enabled!(Debug) {
            debug!(
                "rx #{} cmd {} ({} bytes payload)",
                frame.seq,
                frame.cmd,
                frame.payload.len()
            );
        }

        match PacketId::from_id(frame.cmd) {
            Some(PacketId::Ping) => info!("ping from device (alive)"),
            Some(PacketId::Ack) => self.on_ack(frame),
            Some(PacketId::Error) => {
                let code = match frame.payload.get(..4) {
                    Some(b) => i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    None => -1,
                };
                warn!("device reported packet error {} (#{})", code, frame.seq);
                self.resolve(Err(Error::Device { code }));
            }
            Some(
                id @ (PacketId::Stdout
                | PacketId::Stderr
                | PacketId::PullHeader
                | PacketId::PullData),
            ) => {
                if self.is_current(frame.seq) {
                    self.route(id, &frame.payload, handler);
                } else {
                    debug!("dropping {:?} for #{}, not the current request", id, frame.seq);
                }
            }
            _ => warn!(
                "unexpected packet #{} cmd {} ({} bytes)",
                frame.seq,
                frame.cmd,
                frame.payload.len()
            ),
        }
    }

    fn on_ack(&mut self, frame: Frame) {
        let pending = match self.pending.as_mut() {
            Some(p) if p.outcome.is_none() => p,
            _ => {
                debug!("stray ack #{}", frame.seq);
                return;
            }
        };
        pending.outcome = Some(if frame.seq != pending.seq {
            Err(Error::SequenceMismatch {
                expected: pending.seq,
                actual: frame.seq,
            })
        } else {
            match pending.handler_error.take() {
                Some(e) => Err(e),
                None => Ok(frame.payload),
            }
        });
    }

    fn resolve(&mut self, outcome: Result<Vec<u8>>) {
        if let Some(p) = self.pending.as_mut() {
            if p.outcome.is_none() {
                p.outcome = Some(outcome);
            }
        }
    }

    /// Whether `seq` belongs to the request still waiting for its ack.
    fn is_current(&self, seq: u32) -> bool {
        matches!(&self.pending, Some(p) if p.seq == seq && p.outcome.is_none())
    }

    fn route(&mut self, id: PacketId, payload: &[u8], handler: &mut dyn ResponseHandler) {
        if matches!(&self.pending, Some(p) if p.handler_error.is_some()) {
            return;
        }
        let result = match id {
            PacketId::Stdout => {
                handler.on_stdout(payload);
                Ok(())
            }
            PacketId::Stderr => {
                handler.on_stderr(payload);
                Ok(())
            }
            PacketId::PullHeader => decode_response(&self.library, "pull_header", payload)
                .and_then(|r| handler.on_pull_header(&PullHeader::from_record(&r))),
            PacketId::PullData => self
                .library
                .decode_prefix("pull_data", payload)
                .map_err(|e| Error::InvalidResponse {
                    what: "pull_data",
                    reason: e.to_string(),
                })
                .and_then(|(r, used)| handler.on_pull_data(field_u32(&r, "offset"), &payload[used..])),
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("failed handling {:?}: {}", id, e);
            if let Some(p) = self.pending.as_mut() {
                p.handler_error.get_or_insert(e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_seq(&mut self, seq: u32) {
        self.next_seq = seq;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        packet_layer::CapturedOutput,
        test_helpers::{ack, fast_settings, reply, FakeDevice},
        transport::{ByteSink, MockTransport},
        SettingsBuilder,
    };

    fn layer(device: FakeDevice) -> PacketLayer<FakeDevice> {
        PacketLayer::new(device, fast_settings()).unwrap()
    }

    #[test]
    fn ack_payload_is_returned() {
        let mut layer = layer(FakeDevice::new(|f| vec![ack(f, vec![1, 2, 3])]));
        let payload = layer.send(PacketId::Data, &[9, 9]).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);

        let sent = layer.transport().received();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], Frame::new(1, PacketId::Data.id(), vec![9, 9]));
    }

    #[test]
    fn timeout_then_success() {
        let mut count = 0;
        let mut layer = layer(FakeDevice::new(move |f| {
            count += 1;
            if count == 1 {
                vec![]
            } else {
                vec![ack(f, vec![])]
            }
        }));

        assert!(matches!(
            layer.send(PacketId::Ping, &[]),
            Err(Error::Timeout { seq: 1, .. })
        ));
        assert_eq!(layer.send(PacketId::Ping, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(layer.transport().received()[1].seq, 2);
    }

    #[test]
    fn late_ack_does_not_fail_the_next_request() {
        let sink: Arc<Mutex<Option<ByteSink>>> = Arc::default();
        let mut transport = MockTransport::new();
        let slot = sink.clone();
        transport.expect_read().returning(move |s| {
            *slot.lock().unwrap() = s;
            Ok(())
        });
        // silent on the first request, answers the second one
        let slot = sink.clone();
        let mut writes = 0;
        transport.expect_write().times(2).returning(move |_| {
            writes += 1;
            if writes == 2 {
                let frame = packet::encode(2, PacketId::Ack.id(), &[5]);
                slot.lock().unwrap().as_ref().unwrap().send(frame).unwrap();
            }
            Ok(())
        });
        transport.expect_drain().times(2).returning(|| Ok(()));

        let mut layer = PacketLayer::new(transport, fast_settings()).unwrap();
        assert!(matches!(
            layer.send(PacketId::Ping, &[]),
            Err(Error::Timeout { seq: 1, .. })
        ));

        // the device catches up while nothing is outstanding
        let late = packet::encode(1, PacketId::Ack.id(), &[]);
        sink.lock().unwrap().as_ref().unwrap().send(late).unwrap();
        let output = packet::encode(1, PacketId::Stdout.id(), b"late");
        sink.lock().unwrap().as_ref().unwrap().send(output).unwrap();

        assert_eq!(layer.send(PacketId::Ping, &[]).unwrap(), vec![5]);
    }

    #[test]
    fn wrong_ack_sequence_is_rejected() {
        let mut layer = layer(FakeDevice::new(|f| {
            vec![Frame::new(f.seq + 1, PacketId::Ack.id(), vec![])]
        }));
        assert!(matches!(
            layer.send(PacketId::Go, &[]),
            Err(Error::SequenceMismatch {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn sequence_numbers_wrap_to_one() {
        let mut layer = layer(FakeDevice::new(|f| vec![ack(f, vec![])]));
        layer.set_next_seq(SEQ_MAX);
        layer.send(PacketId::Ping, &[]).unwrap();
        layer.send(PacketId::Ping, &[]).unwrap();
        let seqs: Vec<u32> = layer.transport().received().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![SEQ_MAX, 1]);
    }

    #[test]
    fn output_is_routed_to_the_current_request() {
        let mut layer = layer(FakeDevice::new(|f| {
            vec![
                reply(f, PacketId::Stdout, b"hello ".to_vec()),
                Frame::new(f.seq + 7, PacketId::Stdout.id(), b"stray".to_vec()),
                reply(f, PacketId::Stderr, b"oops".to_vec()),
                reply(f, PacketId::Stdout, b"world".to_vec()),
                ack(f, vec![]),
                reply(f, PacketId::Stdout, b"late".to_vec()),
            ]
        }));

        let mut output = CapturedOutput::default();
        layer
            .send_with(PacketId::Command, &[], &mut output)
            .unwrap();
        assert_eq!(output.stdout, b"hello world");
        assert_eq!(output.stderr, b"oops");
    }

    #[test]
    fn device_error_fails_the_request() {
        let mut layer = layer(FakeDevice::new(|_| {
            vec![Frame::new(0, PacketId::Error.id(), (-3i32).to_le_bytes().to_vec())]
        }));
        assert!(matches!(
            layer.send(PacketId::Data, &[0; 8]),
            Err(Error::Device { code: -3 })
        ));
    }

    #[test]
    fn unsolicited_ping_is_ignored() {
        let mut layer = layer(FakeDevice::new(|f| {
            vec![Frame::new(0, PacketId::Ping.id(), vec![]), ack(f, vec![7])]
        }));
        assert_eq!(layer.send(PacketId::Go, &[]).unwrap(), vec![7]);
    }

    #[test]
    fn activity_restarts_the_timeout() {
        let settings = SettingsBuilder::new()
            .packet_timeout(Duration::from_millis(150))
            .finalize();
        let device = FakeDevice::new(|f| {
            let mut frames: Vec<Frame> = (0..5)
                .map(|_| reply(f, PacketId::Stdout, b".".to_vec()))
                .collect();
            frames.push(ack(f, vec![]));
            frames
        })
        .paced(Duration::from_millis(40));

        let mut layer = PacketLayer::new(device, settings).unwrap();
        let mut output = CapturedOutput::default();
        layer
            .send_with(PacketId::Command, &[], &mut output)
            .unwrap();
        assert_eq!(output.stdout, b".....");
    }

    #[test]
    fn closed_transport_is_reported() {
        let mut transport = MockTransport::new();
        // dropping the sink closes the channel
        transport.expect_read().returning(|_| Ok(()));
        transport.expect_write().times(1).returning(|_| Ok(()));
        transport.expect_drain().times(1).returning(|| Ok(()));

        let mut layer = PacketLayer::new(transport, fast_settings()).unwrap();
        assert!(matches!(
            layer.send(PacketId::Ping, &[]),
            Err(Error::TransportClosed)
        ));
    }

    #[test]
    fn write_failure_is_returned() {
        let mut transport = MockTransport::new();
        transport.expect_read().returning(|_| Ok(()));
        transport.expect_write().returning(|_| {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "unplugged",
            )))
        });
        transport.expect_drain().never();

        let mut layer = PacketLayer::new(transport, fast_settings()).unwrap();
        assert!(matches!(layer.send(PacketId::Ping, &[]), Err(Error::Io(_))));
    }
}
