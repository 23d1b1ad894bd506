//! Talk to multi-channel laboratory odor displays over their binary serial protocol.
//!
//! # Overview
//!
//! An odor display is assembled from up to eleven addressable modules:
//! one base module, nine odor channels and one dilution-air module.
//! All of them are reached through a single serial link that carries
//! framed binary packets in both directions.
//!
//! The `odorlink` crate implements the host side of that link:
//!
//! - [`packet`] encodes and decodes single wire frames.
//! - [`frame`] turns an unreliable byte stream into decoded [`Response`]s.
//! - [`session`] serializes requests, matches replies and fans out telemetry.
//! - [`value`] maps physical quantities to and from their wire representation.
//! - [`transport`] abstracts over the real serial port and a simulated device.
//!
//! # Getting started
//!
//! ```no_run
//! use odorlink::{MeasurementMode, PortDescriptor, Request, Session, SessionConfig};
//! use odorlink::session::Event;
//!
//! # async fn example() -> odorlink::Result<()> {
//! let desc = PortDescriptor::Simulated(Default::default());
//! let (session, mut events) = Session::open(&desc, SessionConfig::default()).await?;
//!
//! let reply = session.request(&Request::QueryDevices).await?;
//! println!("Devices: {:?}", reply.response);
//!
//! session
//!     .request(&Request::SetMeasurements(MeasurementMode::Start))
//!     .await?;
//!
//! while let Ok(evt) = events.recv().await {
//!     if let Event::Data(data) = evt {
//!         println!("{} ms: {:?}", data.timestamp, data.measurements);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol details
//!
//! Every frame starts with the preamble `CC CC CC`, followed by the packet type,
//! sender and receiver tags, a little-endian payload length, the payload itself
//! and a one-byte checksum. The protocol has no transaction identifiers:
//! the device answers requests strictly in the order it received them,
//! so at most one request is in flight at any time.
//!
//! Every request is acknowledged by exactly one [`Ack`].
//! Queries are answered with a typed response immediately followed by the `Ack`.
//! Measurement [`Data`] frames are pushed by the device on its own schedule
//! and may appear anywhere in the stream.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod device;
pub mod frame;
pub mod packet;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;
pub mod value;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use device::{Capabilities, Capability, Controller, DeviceId, Devices, Sensor};
pub use packet::{Packet, PacketType};
pub use request::{MeasurementMode, Request};
pub use response::{Ack, Data, DeviceCapabilities, Response, ResultCode, Version};
pub use session::{Reply, Session, SessionConfig};
pub use transport::{PortDescriptor, Transport};
pub use value::{Actuator, Measurement, SensorValue};

use core::{
    fmt::{Display, Formatter},
    num::Wrapping,
};

/// A specialized [`Result`](core::result::Result) type for odor display operations.
pub type Result<T> = core::result::Result<T, Error>;

/// What a [`Error::Timeout`] was waiting for.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Timeout {
    /// No reply of the given packet type arrived in time.
    Reply(PacketType),
    /// A frame was started but its remaining bytes never arrived.
    Frame,
}

impl Display for Timeout {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Reply(kind) => write!(f, "{kind} reply"),
            Self::Frame => write!(f, "the rest of a frame"),
        }
    }
}

/// Error type for odor display operations.
///
/// The [`Display`](core::fmt::Display) output of every variant is
/// a human-readable reason that can be shown to users directly.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    /// The transport could not be created or opened.
    #[error("failed to open port: {0}")]
    OpenFailed(String),
    /// Reading from or writing to the transport failed.
    #[error("port access failed: {0}")]
    AccessFailed(String),
    /// An expected reply or the rest of a frame did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(Timeout),
    /// A well-framed packet carries an incorrect checksum.
    #[error("incorrect checksum: expected {expected:#04x}, got {actual:#04x}")]
    Crc {
        /// Checksum computed from the received bytes.
        expected: u8,
        /// Checksum carried by the packet.
        actual: u8,
    },
    /// A frame could be read but its contents are malformed.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The device acknowledged the request with an error code.
    #[error("device error: {0}")]
    Device(ResultCode),
    /// The session has been closed.
    #[error("port is not open")]
    NotOpen,
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidData(reason.into())
    }
}

/// Computes the frame checksum over the given bytes.
///
/// `data` must contain type, sender, receiver, both length bytes and the payload.
/// The checksum is the one's complement of the 8-bit wrapping sum plus one.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().map(|&x| Wrapping(x)).sum::<Wrapping<u8>>();

    !(sum + Wrapping(1)).0
}
