//! Wire frame codec.
//!
//! ```text
//! [CC CC CC] [type] [from] [to] [len_lo] [len_hi] [payload: len] [checksum]
//! ```
//!
//! The checksum covers every byte between the preamble and the checksum itself,
//! including both length bytes. See [`compute_checksum`].

use crate::{Error, Result, compute_checksum};
use log::trace;
use strum::{Display, FromRepr};

/// Marker starting every frame.
pub const PREAMBLE: [u8; 3] = [0xcc; 3];

/// Number of bytes between the preamble and the payload.
pub const HEADER_LEN: usize = 5;

/// Length of a frame without payload, including preamble and checksum.
pub const MIN_FRAME_LEN: usize = PREAMBLE.len() + HEADER_LEN + 1;

/// Largest payload the device accepts or produces.
pub const MAX_PAYLOAD_LEN: usize = 985;

/// Sender/receiver tag of the host.
pub const HOST: u8 = 0xf0;

/// Sender/receiver tag of the odor display.
pub const DEVICE: u8 = 0xf1;

/// Packet type carried in the first header byte.
#[derive(FromRepr, Display, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[repr(u8)]
pub enum PacketType {
    /// Acknowledgement with a result code, sent for every request.
    Ack = 0xfa,
    /// Queries hardware, software and protocol versions.
    QueryVersion = 0x70,
    /// Version information.
    Version = 0x71,
    /// Queries which module slots are present.
    QueryDevices = 0x50,
    /// Present module slots.
    Devices = 0x51,
    /// Queries the capabilities of one module.
    QueryCapabilities = 0x40,
    /// Capabilities of one module.
    Capabilities = 0x41,
    /// Sets actuator values.
    SetActuators = 0x20,
    /// Sets system-wide switches.
    SetSystem = 0x60,
    /// Starts, stops or triggers measurements.
    SetMeasurements = 0x80,
    /// Measurement telemetry.
    Data = 0x31,
    /// Resets the device.
    Reset = 0x90,
}

/// A single protocol frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Sender tag.
    pub from: u8,
    /// Receiver tag.
    pub to: u8,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Checksum as carried on the wire.
    pub checksum: u8,
}

impl Packet {
    /// Constructs a host-to-device packet with a valid checksum.
    #[must_use]
    pub fn new(kind: PacketType, payload: Vec<u8>) -> Self {
        Self::with_route(kind, HOST, DEVICE, payload)
    }

    /// Constructs a device-to-host packet with a valid checksum.
    #[must_use]
    pub fn from_device(kind: PacketType, payload: Vec<u8>) -> Self {
        Self::with_route(kind, DEVICE, HOST, payload)
    }

    fn with_route(kind: PacketType, from: u8, to: u8, payload: Vec<u8>) -> Self {
        let mut pkt = Self {
            kind,
            from,
            to,
            payload,
            checksum: 0x00,
        };

        pkt.checksum = pkt.expected_checksum();
        trace!("New packet: {pkt:x?}");

        pkt
    }

    /// Serializes the packet into a complete frame, including preamble and checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());

        buf.extend_from_slice(&PREAMBLE);
        buf.extend_from_slice(&self.header());
        buf.extend_from_slice(&self.payload);
        buf.push(self.checksum);

        buf
    }

    /// Parses a frame with its preamble already stripped.
    ///
    /// The checksum is taken over as-is and not verified, see [`Packet::is_valid_crc`].
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN + 1 {
            return Err(Error::invalid(format!("frame too short ({} bytes)", raw.len())));
        }

        let kind = PacketType::from_repr(raw[0])
            .ok_or_else(|| Error::invalid(format!("unknown packet type {:#04x}", raw[0])))?;
        let len = usize::from(u16::from_le_bytes([raw[3], raw[4]]));

        if raw.len() != HEADER_LEN + len + 1 {
            return Err(Error::invalid(format!(
                "length field {len} does not match frame of {} bytes",
                raw.len()
            )));
        }

        Ok(Self {
            kind,
            from: raw[1],
            to: raw[2],
            payload: raw[HEADER_LEN..HEADER_LEN + len].to_vec(),
            checksum: raw[HEADER_LEN + len],
        })
    }

    /// Computes the checksum the packet should carry.
    #[must_use]
    pub fn expected_checksum(&self) -> u8 {
        let mut data = self.header().to_vec();

        data.extend_from_slice(&self.payload);

        compute_checksum(&data)
    }

    /// Returns whether the carried checksum matches the packet contents.
    #[must_use]
    pub fn is_valid_crc(&self) -> bool {
        self.checksum == self.expected_checksum()
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        // Request payloads are bounded by Request::to_packet, received ones by the frame reader
        let len = (self.payload.len() as u16).to_le_bytes();

        [self.kind as u8, self.from, self.to, len[0], len[1]]
    }
}
