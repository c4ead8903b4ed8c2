//! Packet command identifiers shared with the bootloader firmware.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketId {
    Ping,
    Ack,
    Error,
    Data,
    Go,
    RequestBaud,
    Command,
    Stdout,
    Stderr,
    Pull,
    PullHeader,
    PullData,
    PushData,
    PushCommit,
}

const ALL: [PacketId; 14] = [
    PacketId::Ping,
    PacketId::Ack,
    PacketId::Error,
    PacketId::Data,
    PacketId::Go,
    PacketId::RequestBaud,
    PacketId::Command,
    PacketId::Stdout,
    PacketId::Stderr,
    PacketId::Pull,
    PacketId::PullHeader,
    PacketId::PullData,
    PacketId::PushData,
    PacketId::PushCommit,
];

impl PacketId {
    /// Numeric value on the wire.
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        ALL.get(id as usize).copied()
    }
}

#[test]
fn ids_match_firmware() {
    assert_eq!(PacketId::Ping.id(), 0);
    assert_eq!(PacketId::RequestBaud.id(), 5);
    assert_eq!(PacketId::PushCommit.id(), 13);
    for (i, id) in ALL.iter().enumerate() {
        assert_eq!(PacketId::from_id(i as u32), Some(*id));
        assert_eq!(id.id(), i as u32);
    }
    assert_eq!(PacketId::from_id(14), None);
}
