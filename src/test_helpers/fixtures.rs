use std::time::Duration;

use crate::{
    packet_layer::{protocol_library, PingInfo, Version},
    Settings, SettingsBuilder,
};

/// What a healthy Pi 4 running a matching bootloader reports.
pub fn sample_ping_info() -> PingInfo {
    PingInfo {
        version: Version::tool(),
        revision: 1,
        raspi: 4,
        aarch: 64,
        board_revision: 0xC0_3111,
        board_serial: 0x1000_0000_3A5B_C0DE,
        max_packet_size: 4096,
        cpu_freq: 600_000_000,
        min_cpu_freq: 600_000_000,
        max_cpu_freq: 1_500_000_000,
    }
}

pub fn ping_ack_payload(info: &PingInfo) -> Vec<u8> {
    protocol_library()
        .and_then(|lib| lib.encode("ping_ack", &info.to_record()))
        .expect("ping_ack encodes")
}

/// Little endian result code, as acks of file requests carry.
pub fn result_payload(code: i32) -> Vec<u8> {
    code.to_le_bytes().to_vec()
}

/// Settings with a short timeout so failing cases finish quickly.
pub fn fast_settings() -> Settings {
    SettingsBuilder::new()
        .path("fake")
        .packet_timeout(Duration::from_millis(40))
        .ping_attempts(3)
        .finalize()
}

/// Intel HEX data record with a valid checksum.
pub fn hex_data_line(address: u16, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, 0];
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |s, b| s.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());
    let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!(":{}\n", hex)
}
