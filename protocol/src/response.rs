//! Device-to-host responses.

use crate::{
    Error, Result,
    device::{Capabilities, DeviceId, Devices},
    packet::{Packet, PacketType},
    value::Measurement,
};
use strum::{Display, FromRepr};

/// Result code carried by every [`Ack`].
#[derive(FromRepr, Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ResultCode {
    /// The request was accepted.
    #[strum(to_string = "ok")]
    Ok = 0x00,
    /// A value in the request is out of range.
    #[strum(to_string = "invalid value")]
    InvalidValue = 0x01,
    /// The addressed module is not present.
    #[strum(to_string = "device not available")]
    DeviceNotAvailable = 0x02,
    /// The addressed module lacks the requested capability.
    #[strum(to_string = "capability not available")]
    CapabilityNotAvailable = 0x03,
    /// The device cannot process the request right now.
    #[strum(to_string = "device is busy")]
    Busy = 0x04,
    /// The device ran out of memory.
    #[strum(to_string = "device is out of memory")]
    OutOfMemory = 0x05,
    /// The packet type is not supported.
    #[strum(to_string = "unsupported packet")]
    UnsupportedPacket = 0x06,
    /// The payload length does not fit the packet type.
    #[strum(to_string = "invalid payload length")]
    InvalidLength = 0x07,
    /// The device received a packet with an incorrect checksum.
    #[strum(to_string = "request checksum rejected by device")]
    InvalidChecksum = 0x08,
    /// The device has not finished initializing.
    #[strum(to_string = "device is not ready")]
    NotReady = 0x09,
    /// Any other device failure.
    #[strum(to_string = "unknown device failure")]
    Unknown = 0x0a,
}

/// Acknowledgement sent by the device for every request.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Ack {
    /// Outcome of the acknowledged request.
    pub code: ResultCode,
}

impl Ack {
    /// Constructs an acknowledgement with the given code.
    #[must_use]
    pub const fn new(code: ResultCode) -> Self {
        Self { code }
    }

    /// Returns whether the request was accepted.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

/// Hardware, software and protocol versions as `(major, minor)` pairs.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Version {
    /// Hardware revision.
    pub hardware: (u8, u8),
    /// Firmware version.
    pub software: (u8, u8),
    /// Protocol revision.
    pub protocol: (u8, u8),
}

/// Capabilities of one module.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct DeviceCapabilities {
    /// Queried module.
    pub device: DeviceId,
    /// Capabilities the module exposes.
    pub capabilities: Capabilities,
}

/// Measurement telemetry frame.
#[derive(PartialEq, Clone, Debug)]
pub struct Data {
    /// Device timestamp in milliseconds.
    pub timestamp: u32,
    /// Per-module readings in payload order.
    pub measurements: Vec<Measurement>,
}

impl Data {
    /// Decodes a data payload.
    ///
    /// See [`Measurement::decode_all`] for how truncated payloads are handled.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (ts, rest) = payload
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::invalid("data payload without timestamp"))?;

        Ok(Self {
            timestamp: u32::from_le_bytes(*ts),
            measurements: Measurement::decode_all(rest)?,
        })
    }

    /// Encodes the data payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.timestamp.to_le_bytes().to_vec();

        for m in &self.measurements {
            m.encode_into(&mut buf);
        }

        buf
    }
}

/// A decoded device-to-host packet.
#[derive(PartialEq, Clone, Debug)]
pub enum Response {
    /// Request acknowledgement.
    Ack(Ack),
    /// Reply to [`Request::QueryVersion`](crate::Request::QueryVersion).
    Version(Version),
    /// Reply to [`Request::QueryDevices`](crate::Request::QueryDevices).
    Devices(Devices),
    /// Reply to [`Request::QueryCapabilities`](crate::Request::QueryCapabilities).
    Capabilities(DeviceCapabilities),
    /// Unsolicited measurement telemetry.
    Data(Data),
}

impl Response {
    /// Returns the packet type of this response.
    #[must_use]
    pub fn kind(&self) -> PacketType {
        match self {
            Self::Ack(_) => PacketType::Ack,
            Self::Version(_) => PacketType::Version,
            Self::Devices(_) => PacketType::Devices,
            Self::Capabilities(_) => PacketType::Capabilities,
            Self::Data(_) => PacketType::Data,
        }
    }

    /// Interprets a packet received from the device.
    pub fn decode(pkt: &Packet) -> Result<Self> {
        let payload = pkt.payload.as_slice();

        match pkt.kind {
            PacketType::Ack => {
                let [code] = fixed::<1>(pkt)?;

                ResultCode::from_repr(code)
                    .map(|code| Self::Ack(Ack::new(code)))
                    .ok_or_else(|| Error::invalid(format!("unknown result code {code:#04x}")))
            }
            PacketType::Version => {
                let v = fixed::<6>(pkt)?;

                Ok(Self::Version(Version {
                    hardware: (v[0], v[1]),
                    software: (v[2], v[3]),
                    protocol: (v[4], v[5]),
                }))
            }
            PacketType::Devices => {
                let bits = u16::from_le_bytes(fixed::<2>(pkt)?);

                Ok(Self::Devices(Devices::from_bits_truncate(bits)))
            }
            PacketType::Capabilities => {
                let [id, b0, b1, b2, b3] = fixed::<5>(pkt)?;
                let device = DeviceId::from_repr(id)
                    .ok_or_else(|| Error::invalid(format!("unknown device id {id:#04x}")))?;
                let bits = u32::from_le_bytes([b0, b1, b2, b3]);

                Ok(Self::Capabilities(DeviceCapabilities {
                    device,
                    capabilities: Capabilities::from_bits_truncate(bits),
                }))
            }
            PacketType::Data => Ok(Self::Data(Data::decode(payload)?)),
            kind => Err(Error::invalid(format!("{kind} packet is not a response"))),
        }
    }

    /// Encodes the response as a device-to-host packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let payload = match self {
            Self::Ack(ack) => vec![ack.code as u8],
            Self::Version(v) => vec![
                v.hardware.0,
                v.hardware.1,
                v.software.0,
                v.software.1,
                v.protocol.0,
                v.protocol.1,
            ],
            Self::Devices(devs) => devs.bits().to_le_bytes().to_vec(),
            Self::Capabilities(caps) => {
                let mut buf = vec![caps.device as u8];

                buf.extend_from_slice(&caps.capabilities.bits().to_le_bytes());
                buf
            }
            Self::Data(data) => data.encode(),
        };

        Packet::from_device(self.kind(), payload)
    }
}

fn fixed<const N: usize>(pkt: &Packet) -> Result<[u8; N]> {
    pkt.payload.as_slice().try_into().map_err(|_| {
        Error::invalid(format!(
            "{} payload must be {N} bytes, got {}",
            pkt.kind,
            pkt.payload.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SensorValue;

    #[test]
    fn decode_ack() -> Result<()> {
        let pkt = Packet::from_device(PacketType::Ack, vec![0x04]);

        assert_eq!(
            Response::decode(&pkt)?,
            Response::Ack(Ack::new(ResultCode::Busy)),
            "response should be correct"
        );

        Ok(())
    }

    #[test]
    fn decode_version() -> Result<()> {
        let pkt = Packet::from_device(PacketType::Version, vec![1, 2, 3, 4, 5, 6]);

        assert_eq!(
            Response::decode(&pkt)?,
            Response::Version(Version {
                hardware: (1, 2),
                software: (3, 4),
                protocol: (5, 6),
            }),
            "response should be correct"
        );

        Ok(())
    }

    #[test]
    fn decode_devices_and_capabilities() -> Result<()> {
        let devs = Response::decode(&Packet::from_device(PacketType::Devices, vec![0x03, 0x04]))?;

        assert_eq!(
            devs,
            Response::Devices(Devices::Base | Devices::Odor1 | Devices::DilutionAir),
            "devices should be correct"
        );

        let caps = Response::decode(&Packet::from_device(
            PacketType::Capabilities,
            vec![0x02, 0x00, 0x11, 0x00, 0x00],
        ))?;

        assert_eq!(
            caps,
            Response::Capabilities(DeviceCapabilities {
                device: DeviceId::Odor2,
                capabilities: Capabilities::OdorantFlowSensor
                    | Capabilities::OdorantFlowController,
            }),
            "capabilities should be correct"
        );

        Ok(())
    }

    #[test]
    fn decode_data_frame() -> Result<()> {
        let mut payload = 1000u32.to_le_bytes().to_vec();

        payload.push(0x81);
        payload.push(0x00);
        payload.extend_from_slice(&25.0f32.to_le_bytes());

        let resp = Response::decode(&Packet::from_device(PacketType::Data, payload))?;

        assert_eq!(
            resp,
            Response::Data(Data {
                timestamp: 1000,
                measurements: vec![Measurement {
                    device: DeviceId::Odor1,
                    values: vec![SensorValue::Pid { volts: 25.0 }],
                }],
            }),
            "data should be correct"
        );

        Ok(())
    }

    #[test]
    fn response_packet_round_trip() -> Result<()> {
        let resp = Response::Capabilities(DeviceCapabilities {
            device: DeviceId::DilutionAir,
            capabilities: Capabilities::DilutionAirFlowSensor
                | Capabilities::DilutionAirFlowController,
        });
        let pkt = resp.to_packet();

        assert_eq!(pkt.kind, PacketType::Capabilities);
        assert!(pkt.is_valid_crc(), "checksum should be valid");
        assert_eq!(Response::decode(&pkt)?, resp, "response should be preserved");

        Ok(())
    }

    #[test]
    fn error_wrong_shape() {
        for pkt in [
            Packet::from_device(PacketType::Ack, vec![]),
            Packet::from_device(PacketType::Ack, vec![0x42]),
            Packet::from_device(PacketType::Version, vec![1, 2, 3]),
            Packet::from_device(PacketType::Capabilities, vec![0x0b, 0, 0, 0, 0]),
            Packet::from_device(PacketType::Data, vec![0x00, 0x01]),
            Packet::from_device(PacketType::SetSystem, vec![0x00, 0x00]),
        ] {
            assert!(
                matches!(Response::decode(&pkt), Err(Error::InvalidData(_))),
                "{:?} packet should be rejected",
                pkt.kind
            );
        }
    }
}
