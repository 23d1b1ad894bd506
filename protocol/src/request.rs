//! Host-to-device requests.

use crate::{
    Error, Result,
    device::DeviceId,
    packet::{MAX_PAYLOAD_LEN, Packet, PacketType},
    value::Actuator,
};
use log::trace;
use strum::{Display, FromRepr};

/// Measurement mode set by [`Request::SetMeasurements`].
#[derive(FromRepr, Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum MeasurementMode {
    /// Stop periodic measurements.
    Stop = 0x00,
    /// Start periodic measurements.
    Start = 0x01,
    /// Send a single data frame after acknowledging.
    Once = 0x02,
}

/// A request to the odor display.
///
/// Every request is acknowledged with an [`Ack`](crate::Ack).
/// Queries are additionally answered with a typed response that precedes the `Ack`,
/// see [`Request::expected_response`].
#[derive(PartialEq, Clone, Debug)]
pub enum Request {
    /// Queries hardware, software and protocol versions.
    QueryVersion,
    /// Queries which module slots are present.
    QueryDevices,
    /// Queries the capabilities of a single module.
    QueryCapabilities(DeviceId),
    /// Applies controller values to one or more modules.
    SetActuators(Vec<Actuator>),
    /// Switches the chassis fans and the PID lamp.
    SetSystem {
        /// Chassis fans enabled.
        fans: bool,
        /// PID lamp enabled.
        pid_lamp: bool,
    },
    /// Starts, stops or triggers measurements.
    SetMeasurements(MeasurementMode),
    /// Resets the device to its power-on state.
    Reset,
}

impl Request {
    /// Returns the packet type of this request.
    #[must_use]
    pub fn kind(&self) -> PacketType {
        match self {
            Self::QueryVersion => PacketType::QueryVersion,
            Self::QueryDevices => PacketType::QueryDevices,
            Self::QueryCapabilities(_) => PacketType::QueryCapabilities,
            Self::SetActuators(_) => PacketType::SetActuators,
            Self::SetSystem { .. } => PacketType::SetSystem,
            Self::SetMeasurements(_) => PacketType::SetMeasurements,
            Self::Reset => PacketType::Reset,
        }
    }

    /// Returns the typed response preceding the [`Ack`](crate::Ack), if any.
    #[must_use]
    pub fn expected_response(&self) -> Option<PacketType> {
        match self {
            Self::QueryVersion => Some(PacketType::Version),
            Self::QueryDevices => Some(PacketType::Devices),
            Self::QueryCapabilities(_) => Some(PacketType::Capabilities),
            _ => None,
        }
    }

    /// Encodes the request as a host-to-device packet.
    ///
    /// Fails with [`Error::InvalidData`] if the payload does not fit into a frame.
    pub fn to_packet(&self) -> Result<Packet> {
        trace!("New request: {self:?}");

        let payload = match self {
            Self::QueryVersion | Self::QueryDevices | Self::Reset => Vec::new(),
            Self::QueryCapabilities(id) => vec![*id as u8],
            Self::SetActuators(actuators) => {
                let mut buf = Vec::new();

                for act in actuators {
                    act.encode_into(&mut buf);
                }

                buf
            }
            Self::SetSystem { fans, pid_lamp } => vec![u8::from(*fans), u8::from(*pid_lamp)],
            Self::SetMeasurements(mode) => vec![*mode as u8],
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::invalid(format!(
                "{} payload of {} bytes exceeds maximum of {MAX_PAYLOAD_LEN}",
                self.kind(),
                payload.len()
            )));
        }

        Ok(Packet::new(self.kind(), payload))
    }

    /// Interprets a packet sent by the host.
    pub fn decode(pkt: &Packet) -> Result<Self> {
        let payload = pkt.payload.as_slice();
        let unexpected_len = || {
            Error::invalid(format!(
                "unexpected {} payload of {} bytes",
                pkt.kind,
                payload.len()
            ))
        };

        match (pkt.kind, payload) {
            (PacketType::QueryVersion, []) => Ok(Self::QueryVersion),
            (PacketType::QueryDevices, []) => Ok(Self::QueryDevices),
            (PacketType::Reset, []) => Ok(Self::Reset),
            (PacketType::QueryCapabilities, &[id]) => DeviceId::from_repr(id)
                .map(Self::QueryCapabilities)
                .ok_or_else(|| Error::invalid(format!("unknown device id {id:#04x}"))),
            (PacketType::SetActuators, _) => Ok(Self::SetActuators(Actuator::decode_all(payload)?)),
            (PacketType::SetSystem, &[fans, pid_lamp]) => Ok(Self::SetSystem {
                fans: fans != 0,
                pid_lamp: pid_lamp != 0,
            }),
            (PacketType::SetMeasurements, &[mode]) => MeasurementMode::from_repr(mode)
                .map(Self::SetMeasurements)
                .ok_or_else(|| Error::invalid(format!("unknown measurement mode {mode:#04x}"))),
            (
                PacketType::QueryVersion
                | PacketType::QueryDevices
                | PacketType::Reset
                | PacketType::QueryCapabilities
                | PacketType::SetSystem
                | PacketType::SetMeasurements,
                _,
            ) => Err(unexpected_len()),
            (kind, _) => Err(Error::invalid(format!("{kind} packet is not a request"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Controller;

    #[test]
    fn expected_responses() {
        assert_eq!(Request::QueryVersion.expected_response(), Some(PacketType::Version));
        assert_eq!(Request::QueryDevices.expected_response(), Some(PacketType::Devices));
        assert_eq!(
            Request::QueryCapabilities(DeviceId::Base).expected_response(),
            Some(PacketType::Capabilities)
        );
        assert_eq!(Request::Reset.expected_response(), None);
        assert_eq!(
            Request::SetMeasurements(MeasurementMode::Start).expected_response(),
            None
        );
    }

    #[test]
    fn encode_set_measurements() -> Result<()> {
        let frame = Request::SetMeasurements(MeasurementMode::Start)
            .to_packet()?
            .encode();

        // 0x80 + 0xf0 + 0xf1 + 0x01 + 0x00 + 0x01 = 0x263 -> 0x63, plus one, inverted
        assert_eq!(
            frame,
            [0xcc, 0xcc, 0xcc, 0x80, 0xf0, 0xf1, 0x01, 0x00, 0x01, 0x9b],
            "frame contents should be correct"
        );

        Ok(())
    }

    #[test]
    fn encode_set_actuators_clamps_before_checksum() -> Result<()> {
        let req = Request::SetActuators(vec![
            Actuator::new(DeviceId::Odor1).with(Controller::OdorantFlow, 500.0),
        ]);
        let pkt = req.to_packet()?;
        let mut expected = vec![0x81, 0x00];

        expected.extend_from_slice(&50.0f32.to_le_bytes());

        assert_eq!(pkt.payload, expected, "payload should carry clamped value");
        assert!(pkt.is_valid_crc(), "checksum should cover clamped value");

        Ok(())
    }

    #[test]
    fn error_oversized_payload() {
        let act = Actuator::new(DeviceId::Odor1).with(Controller::OdorantFlow, 1.0);

        // 6 bytes per actuator, 1200 bytes in total
        let actuators = vec![act.clone(); 200];

        assert!(
            matches!(
                Request::SetActuators(actuators).to_packet(),
                Err(Error::InvalidData(_))
            ),
            "oversized payload should be rejected"
        );

        let actuators = vec![act; 164];

        assert!(
            Request::SetActuators(actuators).to_packet().is_ok(),
            "payload of 984 bytes should fit"
        );
    }

    #[test]
    fn decode_host_packets() -> Result<()> {
        let reqs = [
            Request::QueryVersion,
            Request::QueryCapabilities(DeviceId::Odor7),
            Request::SetSystem {
                fans: true,
                pid_lamp: false,
            },
            Request::SetMeasurements(MeasurementMode::Once),
            Request::SetActuators(vec![
                Actuator::new(DeviceId::Odor3)
                    .with(Controller::OdorantFlow, 5.0)
                    .with(Controller::OdorantValve, 100.0),
            ]),
            Request::Reset,
        ];

        for req in reqs {
            assert_eq!(Request::decode(&req.to_packet()?)?, req, "request should be preserved");
        }

        Ok(())
    }

    #[test]
    fn error_malformed_request() {
        for pkt in [
            Packet::new(PacketType::QueryVersion, vec![0x00]),
            Packet::new(PacketType::SetMeasurements, vec![0x07]),
            Packet::new(PacketType::QueryCapabilities, vec![0x0c]),
            Packet::new(PacketType::Ack, vec![0x00]),
        ] {
            assert!(
                matches!(Request::decode(&pkt), Err(Error::InvalidData(_))),
                "{:?} packet should be rejected",
                pkt.kind
            );
        }
    }
}
