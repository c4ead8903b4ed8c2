//! The bootloader requests, built on [`PacketLayer::send`].

use std::time::Duration;

use log::{debug, info, warn};
use retry::{delay::NoDelay, retry_with_index, OperationResult};

use super::{
    messages::{decode_response, field_u32},
    CommandOutcome, PacketId, PacketLayer, PingInfo, PushCommit, ResponseHandler,
    DATA_HEADER_SIZE,
};
use crate::{
    error::{Error, Result},
    hex::Chunk,
    structs::Record,
    transport::Transport,
};

/// Tells the device to use its built in default for a field.
const USE_DEFAULT: u32 = 0xFFFF_FFFF;

impl<T: Transport> PacketLayer<T> {
    /// Ping until the device answers, up to `ping_attempts` times.
    ///
    /// Aborts right away on a device that can not take our packet size, and
    /// on a bootloader version other than ours unless version checking is
    /// disabled.
    pub fn ping(&mut self) -> Result<PingInfo> {
        let attempts = self.settings.ping_attempts.max(1);

        let result = retry_with_index(NoDelay.take(attempts as usize - 1), |index| {
            debug!("ping attempt {}", index);
            match self.ping_once() {
                Ok(info) => OperationResult::Ok(info),
                Err(e) if e.is_fatal() => OperationResult::Err(e),
                Err(e) => {
                    debug!("ping failed: {}", e);
                    OperationResult::Retry(e)
                }
            }
        });

        match result {
            Ok(info) => Ok(info),
            Err(retry::Error::Operation { error, .. }) if error.is_fatal() => Err(error),
            Err(retry::Error::Operation { tries, .. }) => {
                warn!("device did not answer {} pings", tries);
                Err(Error::DeviceUnresponsive { attempts })
            }
            Err(retry::Error::Internal(msg)) => {
                warn!("internal retry error while pinging: {}", msg);
                Err(Error::DeviceUnresponsive { attempts })
            }
        }
    }

    fn ping_once(&mut self) -> Result<PingInfo> {
        let payload = self.send(PacketId::Ping, &[])?;
        let info = PingInfo::from_record(&decode_response(&self.library, "ping_ack", &payload)?);
        info!(
            "device: rpi{}-aarch{} v{}, max packet size {}",
            info.raspi, info.aarch, info.version, info.max_packet_size
        );

        if self.settings.max_packet_size > info.max_packet_size as usize {
            return Err(Error::PacketTooLarge {
                requested: self.settings.max_packet_size,
                supported: info.max_packet_size as usize,
            });
        }

        if info.version != self.tool_version {
            if self.settings.check_version {
                return Err(Error::VersionMismatch {
                    device: info.version,
                    tool: self.tool_version,
                });
            }
            warn!(
                "bootloader v{} differs from tool v{}, continuing anyway",
                info.version, self.tool_version
            );
        }
        self.set_inbound_limit(info.max_packet_size as usize);
        Ok(info)
    }

    /// Ask the device to change its line speed and clock, then follow on our
    /// side. The device falls back to the old speed when it does not hear
    /// from us within `reset_timeout_ms`. A `cpu_freq` of zero leaves the
    /// clock alone.
    pub fn switch_baud(&mut self, baud: u32, reset_timeout_ms: u32, cpu_freq: u32) -> Result<()> {
        let payload = self.library.encode(
            "request_baud",
            &Record::new()
                .with("baud", baud)
                .with("reset_timeout", reset_timeout_ms)
                .with("cpu_freq", cpu_freq),
        )?;
        self.send(PacketId::RequestBaud, &payload)?;
        self.transport.switch_baud(baud)?;
        self.reset_decoder();
        info!("now at {} baud", baud);
        Ok(())
    }

    /// Switch to the configured transfer speed, raising the device clock to
    /// its maximum when the settings ask for it.
    pub fn boost(&mut self, ping: &PingInfo) -> Result<()> {
        let cpu_freq = if self.settings.boost_cpu() {
            ping.max_cpu_freq
        } else {
            0
        };
        let reset_timeout = self.settings.reset_timeout.as_millis() as u32;
        self.switch_baud(self.settings.flash_baud, reset_timeout, cpu_freq)
    }

    /// Store `data` at `address` in device memory.
    pub fn send_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(DATA_HEADER_SIZE + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(data);
        self.send_data_payload(&payload)
    }

    /// Like [`send_data`](Self::send_data) for a chunk with a reserved
    /// address header, which is filled in place instead of copying the data.
    pub fn send_data_chunk(&mut self, chunk: &mut Chunk) -> Result<()> {
        if chunk.header_size != DATA_HEADER_SIZE {
            return self.send_data(chunk.address, chunk.data());
        }
        let address = chunk.address;
        chunk.header_mut().copy_from_slice(&address.to_le_bytes());
        self.send_data_payload(&chunk.buffer)
    }

    fn send_data_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.settings.max_packet_size {
            return Err(Error::PacketTooLarge {
                requested: payload.len(),
                supported: self.settings.max_packet_size,
            });
        }
        self.send(PacketId::Data, payload)?;
        Ok(())
    }

    /// Jump to `address` after `delay`. `None` for either uses the device
    /// defaults.
    pub fn send_go(&mut self, address: Option<u32>, delay: Option<Duration>) -> Result<()> {
        let delay_ms = delay.map_or(USE_DEFAULT, |d| d.as_millis() as u32);
        let payload = self.library.encode(
            "go",
            &Record::new()
                .with("address", address.unwrap_or(USE_DEFAULT))
                .with("delay", delay_ms),
        )?;
        self.send(PacketId::Go, &payload)?;
        Ok(())
    }

    /// Run a shell command in `cwd`. Output arrives through `handler` while
    /// the command runs.
    pub fn send_command(
        &mut self,
        cwd: &str,
        command: &str,
        handler: &mut dyn ResponseHandler,
    ) -> Result<CommandOutcome> {
        let payload = self.library.encode(
            "command",
            &Record::new().with("cwd", cwd).with("command", command),
        )?;
        let ack = self.send_with(PacketId::Command, &payload, handler)?;
        let record = decode_response(&self.library, "command_ack", &ack)?;
        Ok(CommandOutcome {
            exit_code: record.get_int("exit_code").unwrap_or_default() as i32,
            cwd: record.get_str("cwd").unwrap_or_default().to_owned(),
        })
    }

    /// Fetch a file. Its header and contents arrive through `handler`.
    pub fn send_pull(&mut self, path: &str, handler: &mut dyn ResponseHandler) -> Result<()> {
        let payload = self.library.encode("pull", &Record::new().with("path", path))?;
        let ack = self.send_with(PacketId::Pull, &payload, handler)?;
        match self.result_code(&ack)? {
            0 => Ok(()),
            code => Err(Error::Device { code }),
        }
    }

    /// Upload part of a file. Offset zero starts a new upload for `token`.
    pub fn send_push_data(&mut self, token: u32, offset: u32, data: &[u8]) -> Result<()> {
        let mut payload = self.library.encode(
            "push_data",
            &Record::new().with("token", token).with("offset", offset),
        )?;
        payload.extend_from_slice(data);
        let ack = self.send(PacketId::PushData, &payload)?;
        Error::check_device_result(self.result_code(&ack)?)
    }

    /// Store the uploaded data under its final name.
    pub fn send_push_commit(&mut self, commit: &PushCommit) -> Result<()> {
        let payload = self.library.encode("push_commit", &commit.to_record())?;
        let ack = self.send(PacketId::PushCommit, &payload)?;
        Error::check_device_result(self.result_code(&ack)?)
    }

    fn result_code(&self, ack: &[u8]) -> Result<i32> {
        let record = decode_response(&self.library, "result", ack)?;
        Ok(field_u32(&record, "code") as i32)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
