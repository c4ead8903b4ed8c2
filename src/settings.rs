//! Settings for the serial line and the packet protocol.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

use log::warn;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

/// Smallest packet size the device protocol can work with.
pub const MIN_PACKET_SIZE: usize = 128;

// =============================================================================
// Public Interface
// =============================================================================

/// Whether to raise the device CPU clock along with the baud rate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CpuBoost {
    Yes,
    No,
    /// Boost only for baud rates above 1M.
    Auto,
}

/// Groups all settings used to talk to the bootloader and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second, as the bootloader starts with.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// Largest packet payload we send, and accept from the device.
    pub max_packet_size: usize,
    /// How long without any valid packet before a request times out.
    pub packet_timeout: Duration,
    /// Number of pings before giving up on the device.
    pub ping_attempts: u32,
    /// Abort on a bootloader version different from ours.
    pub check_version: bool,

    /// Baud rate to switch to for bulk transfers.
    pub flash_baud: u32,
    /// How long the device waits for traffic at the new baud rate before
    /// falling back.
    pub reset_timeout: Duration,
    pub cpu_boost: CpuBoost,
    /// Delay before the device jumps to a flashed image.
    pub go_delay: Duration,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Settings {
    /// Whether a baud switch should also raise the CPU clock.
    pub fn boost_cpu(&self) -> bool {
        match self.cpu_boost {
            CpuBoost::Yes => true,
            CpuBoost::No => false,
            CpuBoost::Auto => self.flash_baud > 1_000_000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        SettingsBuilder::new().finalize()
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use piboot::SettingsBuilder;
///
/// let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
/// assert_eq!(settings.baud_rate, 115_200);
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                max_packet_size: 4096,
                packet_timeout: Duration::from_millis(300),
                ping_attempts: 20,
                check_version: true,
                flash_baud: 1_000_000,
                reset_timeout: Duration::from_millis(500),
                cpu_boost: CpuBoost::Auto,
                go_delay: Duration::from_millis(300),
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().into_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Set the maximum packet size, at least [`MIN_PACKET_SIZE`]
    pub fn max_packet_size(mut self, size: usize) -> Self {
        if size < MIN_PACKET_SIZE {
            warn!("packet size {} too small, using {}", size, MIN_PACKET_SIZE);
        }
        self.settings.max_packet_size = size.max(MIN_PACKET_SIZE);
        self
    }

    /// Set the inactivity timeout for acknowledgments
    pub fn packet_timeout(mut self, timeout: Duration) -> Self {
        self.settings.packet_timeout = timeout;
        self
    }

    pub fn ping_attempts(mut self, attempts: u32) -> Self {
        self.settings.ping_attempts = attempts;
        self
    }

    pub fn check_version(mut self, check: bool) -> Self {
        self.settings.check_version = check;
        self
    }

    pub fn flash_baud(mut self, baud_rate: u32) -> Self {
        self.settings.flash_baud = baud_rate;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.settings.reset_timeout = timeout;
        self
    }

    pub fn cpu_boost(mut self, boost: CpuBoost) -> Self {
        self.settings.cpu_boost = boost;
        self
    }

    pub fn go_delay(mut self, delay: Duration) -> Self {
        self.settings.go_delay = delay;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            path: None,
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            max_packet_size: 4096,
            packet_timeout: Duration::from_millis(300),
            ping_attempts: 20,
            check_version: true,
            flash_baud: 1_000_000,
            reset_timeout: Duration::from_millis(500),
            cpu_boost: CpuBoost::Auto,
            go_delay: Duration::from_millis(300),
            _private_use_builder: (),
        }
    )
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rate() {
    let baud_rate = 921_600;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn line_parameters() {
    let settings = SettingsBuilder::new()
        .data_bits(DataBits::Seven)
        .flow_control(FlowControl::Hardware)
        .stop_bits(StopBits::Two)
        .parity(Parity::Even)
        .finalize();
    assert_eq!(settings.data_bits, DataBits::Seven);
    assert_eq!(settings.flow_control, FlowControl::Hardware);
    assert_eq!(settings.stop_bits, StopBits::Two);
    assert_eq!(settings.parity, Parity::Even);
}

#[test]
fn packet_size_has_a_floor() {
    let settings = SettingsBuilder::new().max_packet_size(16).finalize();
    assert_eq!(settings.max_packet_size, MIN_PACKET_SIZE);
    let settings = SettingsBuilder::new().max_packet_size(1024).finalize();
    assert_eq!(settings.max_packet_size, 1024);
}

#[test]
fn cpu_boost() {
    let settings = SettingsBuilder::new().finalize();
    assert!(!settings.boost_cpu());
    let settings = SettingsBuilder::new().flash_baud(2_000_000).finalize();
    assert!(settings.boost_cpu());
    let settings = SettingsBuilder::new()
        .flash_baud(2_000_000)
        .cpu_boost(CpuBoost::No)
        .finalize();
    assert!(!settings.boost_cpu());
    let settings = SettingsBuilder::new().cpu_boost(CpuBoost::Yes).finalize();
    assert!(settings.boost_cpu());
}

#[test]
fn protocol_options() {
    let settings = SettingsBuilder::new()
        .packet_timeout(Duration::from_millis(50))
        .ping_attempts(3)
        .check_version(false)
        .reset_timeout(Duration::from_secs(1))
        .go_delay(Duration::from_millis(0))
        .finalize();
    assert_eq!(settings.packet_timeout, Duration::from_millis(50));
    assert_eq!(settings.ping_attempts, 3);
    assert!(!settings.check_version);
    assert_eq!(settings.reset_timeout, Duration::from_secs(1));
    assert_eq!(settings.go_delay, Duration::ZERO);
}
