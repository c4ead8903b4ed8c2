//! Serial port transport.

use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use hexplay::HexViewBuilder;
use log::{debug, error, info, log_enabled, trace, Level::Trace};
use serialport::SerialPort;

use super::{ByteSink, Transport};
use crate::{
    error::{Error, Result},
    Settings,
};

/// Read timeout of the receiving thread, bounds how long a drop waits for it.
const READ_POLL: Duration = Duration::from_millis(50);

type SharedSink = Arc<Mutex<Option<ByteSink>>>;

/// [`Transport`] over a serial port. Received bytes are pumped to the
/// installed sink by a dedicated thread.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    sink: SharedSink,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open the port described by `settings`, retrying for a few seconds
    /// while the device shows up.
    pub fn open(settings: &Settings) -> Result<Self> {
        let mut port = open_and_setup_port(settings)?;
        port.set_timeout(READ_POLL)?;

        let sink: SharedSink = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let port = port.try_clone()?;
            let sink = Arc::clone(&sink);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("serial-rx".into())
                .spawn(move || pump(port, sink, running))?
        };

        Ok(SerialTransport {
            port,
            sink,
            running,
            reader: Some(reader),
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if log_enabled!(Trace) {
            trace!(
                "tx {} bytes\n{}",
                bytes.len(),
                HexViewBuilder::new(bytes).row_width(16).finish()
            );
        }
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn switch_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.drain()?;
        self.port.set_baud_rate(baud_rate)?;
        info!("switched to {} baud", baud_rate);
        Ok(())
    }

    fn read(&mut self, sink: Option<ByteSink>) -> Result<()> {
        let mut slot = self.sink.lock().map_err(|_| Error::TransportClosed)?;
        *slot = sink;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("serial receive thread panicked");
            }
        }
    }
}

//==============================================================================
// Private stuff
//==============================================================================

fn open_and_setup_port(settings: &Settings) -> Result<Box<dyn SerialPort>> {
    use retry::{delay, retry_with_index};

    let path = settings.path.clone().ok_or_else(|| {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::InvalidInput,
            "no serial port given",
        ))
    })?;

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to connect {}", index);
            serialport::new(&path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .open()
        },
    );

    match result {
        Ok(port) => {
            info!("Connected to {} at {} baud", path, settings.baud_rate);
            debug!("data_bits    : {:?}", settings.data_bits);
            debug!("stop_bits    : {:?}", settings.stop_bits);
            debug!("parity       : {:?}", settings.parity);
            debug!("flow control : {:?}", settings.flow_control);
            Ok(port)
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            info!(
                "Failed to open the port after {:?} and {} tries: {}",
                total_delay, tries, error,
            );
            Err(error.into())
        }
        Err(retry::Error::Internal(msg)) => {
            info!("Internal retry error while opening port: {}", msg);
            Err(Error::Serial(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "internal error while retrying to open the port",
            )))
        }
    }
}

/// Receive loop. A read failure closes the sink so the packet layer sees the
/// link go away instead of waiting for a timeout.
fn pump(mut port: Box<dyn SerialPort>, sink: SharedSink, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 1024];
    while running.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if log_enabled!(Trace) {
                    trace!(
                        "rx {} bytes\n{}",
                        n,
                        HexViewBuilder::new(&buf[..n]).row_width(16).finish()
                    );
                }
                if let Ok(slot) = sink.lock() {
                    if let Some(tx) = slot.as_ref() {
                        // A dropped receiver just means nobody is listening.
                        let _ = tx.send(buf[..n].to_vec());
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                error!("serial read failed: {}", e);
                if let Ok(mut slot) = sink.lock() {
                    slot.take();
                }
                break;
            }
        }
    }
    debug!("serial receive thread done");
}
