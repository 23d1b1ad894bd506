//! Byte-level duplex channels.
//!
//! A [`Session`](crate::Session) talks to the odor display through a [`Transport`].
//! Two implementations are provided:
//!
//! - [`serial::SerialTransport`](crate::serial::SerialTransport) for real hardware
//!   (requires the `native-serial` feature).
//! - [`simulator::Simulator`], a deterministic software device for testing without hardware.

pub mod simulator;

use crate::{Error, Result};
use async_trait::async_trait;
use embedded_io_async::{ErrorType, Read};
use std::{io, sync::Arc};

/// Duplex byte channel to an odor display.
///
/// All methods take `&self`, so that one task can wait in [`Transport::read`]
/// while another one writes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reads available bytes into `buf`, waiting until at least one byte arrives.
    ///
    /// Returns `Ok(0)` once the channel has been closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all bytes of `buf`.
    async fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Closes the channel. Pending and future reads return `Ok(0)`.
    async fn close(&self);

    /// Returns whether the channel is still open.
    fn is_open(&self) -> bool;
}

/// Selects which [`Transport`] [`open`] creates.
#[derive(Clone, Debug)]
pub enum PortDescriptor {
    /// Serial port at the given path, e.g. `/dev/ttyUSB0` or `COM3`.
    #[cfg(feature = "native-serial")]
    #[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
    Serial(String),
    /// Simulated odor display.
    Simulated(simulator::SimulatorConfig),
}

/// Opens the transport described by `desc`.
pub async fn open(desc: &PortDescriptor) -> Result<Arc<dyn Transport>> {
    match desc {
        #[cfg(feature = "native-serial")]
        PortDescriptor::Serial(path) => Ok(Arc::new(crate::serial::SerialTransport::open(path).await?)),
        PortDescriptor::Simulated(config) => Ok(Arc::new(simulator::Simulator::new(config.clone()))),
    }
}

/// Read half of a shared transport.
///
/// Implements [`embedded_io_async::Read`] so it can feed a [`FrameReader`](crate::frame::FrameReader).
pub struct Link(pub Arc<dyn Transport>);

impl ErrorType for Link {
    type Error = io::Error;
}

impl Read for Link {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

pub(crate) fn open_error(err: &io::Error) -> Error {
    Error::OpenFailed(match err.kind() {
        io::ErrorKind::NotFound => format!("port not found ({err})"),
        io::ErrorKind::PermissionDenied => format!("port in use or access denied ({err})"),
        _ => err.to_string(),
    })
}
