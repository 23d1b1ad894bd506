//! Native asynchronous serial port support for [`Session`](crate::Session).
//!
//! Uses the [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate.

use crate::{
    Result,
    transport::{Transport, open_error},
};
use async_trait::async_trait;
use log::{debug, info};
use serial2_tokio::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use std::io;
use tokio::{
    sync::watch,
    time::{self, Duration},
};

/// Baud rate of the odor display's USB serial bridge.
pub const BAUD_RATE: u32 = 115_200;

/// Time the device needs after the port has been opened before it accepts requests.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Serial port implementing [`Transport`].
pub struct SerialTransport {
    port: SerialPort,
    closed: watch::Sender<bool>,
}

impl SerialTransport {
    /// Opens the serial port at the given path with the odor display's line settings.
    pub async fn open(path: &str) -> Result<Self> {
        let port = SerialPort::open(path, |mut settings: Settings| {
            settings.set_raw();
            settings.set_baud_rate(BAUD_RATE)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_parity(Parity::None);
            settings.set_stop_bits(StopBits::One);
            settings.set_flow_control(FlowControl::None);

            Ok(settings)
        })
        .map_err(|err| open_error(&err))?;

        port.discard_buffers().map_err(|err| open_error(&err))?;
        time::sleep(SETTLE_DELAY).await;
        info!("Opened serial port {path}");

        Ok(Self {
            port,
            closed: watch::Sender::new(false),
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            res = self.port.read(buf) => res,
            _ = closed.wait_for(|&c| c) => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        if *self.closed.borrow() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.port.write_all(buf).await
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Closed serial port");
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// Returns the paths of all serial ports available on this system.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = SerialPort::available_ports().map_err(|err| open_error(&err))?;

    Ok(ports
        .into_iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect())
}
