//! Module identities and capabilities.
//!
//! An odor display consists of a base module, up to nine odor channels and
//! a dilution-air module. Each module is addressed by a [`DeviceId`] and
//! exposes a subset of all [`Capability`] values, queried at runtime with
//! [`Request::QueryCapabilities`](crate::Request::QueryCapabilities).

use crate::{Error, Result};
use bitflags_derive::{FlagsDebug, FlagsDisplay};
use strum::{Display, EnumIter, FromRepr};

/// Marks a byte as a device id inside actuator and data payloads.
pub const DEVICE_MARKER: u8 = 0x80;

/// Physically addressable module slot.
#[derive(FromRepr, Display, EnumIter, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
#[repr(u8)]
pub enum DeviceId {
    /// Base module with the mixing chamber, PID sensor and output valve.
    Base = 0x00,
    /// Odor channel 1.
    Odor1 = 0x01,
    /// Odor channel 2.
    Odor2 = 0x02,
    /// Odor channel 3.
    Odor3 = 0x03,
    /// Odor channel 4.
    Odor4 = 0x04,
    /// Odor channel 5.
    Odor5 = 0x05,
    /// Odor channel 6.
    Odor6 = 0x06,
    /// Odor channel 7.
    Odor7 = 0x07,
    /// Odor channel 8.
    Odor8 = 0x08,
    /// Odor channel 9.
    Odor9 = 0x09,
    /// Dilution air module.
    DilutionAir = 0x0a,
}

impl DeviceId {
    /// Returns the odor channel with the given one-based number.
    #[must_use]
    pub fn odor(channel: u8) -> Option<Self> {
        match channel {
            1..=9 => Self::from_repr(channel),
            _ => None,
        }
    }

    /// Returns whether this is one of the nine odor channels.
    #[must_use]
    pub fn is_odor(self) -> bool {
        (Self::Odor1..=Self::Odor9).contains(&self)
    }

    /// Decodes a device id from a high-bit tagged payload byte.
    pub fn from_marked(byte: u8) -> Result<Self> {
        if byte & DEVICE_MARKER == 0 {
            return Err(Error::invalid(format!("byte {byte:#04x} is not a device marker")));
        }

        Self::from_repr(byte & !DEVICE_MARKER)
            .ok_or_else(|| Error::invalid(format!("unknown device id {byte:#04x}")))
    }

    /// Returns the high-bit tagged payload byte for this device.
    #[must_use]
    pub const fn marked(self) -> u8 {
        self as u8 | DEVICE_MARKER
    }

    /// Returns the presence flag corresponding to this device.
    #[must_use]
    pub const fn flag(self) -> Devices {
        Devices::from_bits_retain(1 << self as u16)
    }
}

/// Named sensor or controller a module may expose.
#[derive(FromRepr, Display, EnumIter, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Capability {
    /// Photo-ionization detector.
    Pid = 0x00,
    /// Bead thermistor.
    BeadThermistor = 0x01,
    /// Chassis thermometer.
    ChassisThermometer = 0x02,
    /// Odor source thermometer.
    OdorSourceThermometer = 0x03,
    /// General purpose thermometer.
    GeneralPurposeThermometer = 0x04,
    /// Input air humidity sensor.
    InputAirHumiditySensor = 0x05,
    /// Output air humidity sensor.
    OutputAirHumiditySensor = 0x06,
    /// Pressure sensor.
    PressureSensor = 0x07,
    /// Odorant flow sensor.
    OdorantFlowSensor = 0x08,
    /// Dilution air flow sensor.
    DilutionAirFlowSensor = 0x09,
    /// Odorant valve state sensor.
    OdorantValveSensor = 0x0a,
    /// Output valve state sensor.
    OutputValveSensor = 0x0b,
    /// Odorant flow controller.
    OdorantFlowController = 0x0c,
    /// Dilution air flow controller.
    DilutionAirFlowController = 0x0d,
    /// Chassis temperature controller.
    ChassisTemperatureController = 0x0e,
    /// Odorant valve controller.
    OdorantValveController = 0x0f,
    /// Output valve controller.
    OutputValveController = 0x10,
}

impl Capability {
    /// Returns the flag corresponding to this capability.
    #[must_use]
    pub const fn flag(self) -> Capabilities {
        Capabilities::from_bits_retain(1 << self as u32)
    }
}

/// Sensor tag used inside data payloads.
///
/// Shares its numeric values with the sensor subset of [`Capability`].
/// The tag alone determines how many value bytes follow it.
#[derive(FromRepr, Display, EnumIter, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Sensor {
    /// Photo-ionization detector, volts.
    Pid = 0x00,
    /// Bead thermistor, ohms and volts.
    BeadThermistor = 0x01,
    /// Chassis thermometer, °C.
    ChassisThermometer = 0x02,
    /// Odor source thermometer, °C.
    OdorSourceThermometer = 0x03,
    /// General purpose thermometer, °C.
    GeneralPurposeThermometer = 0x04,
    /// Input air humidity, %RH and °C.
    InputAirHumiditySensor = 0x05,
    /// Output air humidity, %RH and °C.
    OutputAirHumiditySensor = 0x06,
    /// Air pressure, mbar and °C.
    PressureSensor = 0x07,
    /// Odorant flow, L/min, °C and mbar.
    OdorantFlowSensor = 0x08,
    /// Dilution air flow, L/min, °C and mbar.
    DilutionAirFlowSensor = 0x09,
    /// Odorant valve state.
    OdorantValveSensor = 0x0a,
    /// Output valve state.
    OutputValveSensor = 0x0b,
}

impl Sensor {
    /// Returns the number of value bytes following this tag in a data payload.
    #[must_use]
    pub const fn value_width(self) -> usize {
        match self {
            Self::OdorantValveSensor | Self::OutputValveSensor => 1,
            Self::Pid
            | Self::ChassisThermometer
            | Self::OdorSourceThermometer
            | Self::GeneralPurposeThermometer => 4,
            Self::BeadThermistor
            | Self::InputAirHumiditySensor
            | Self::OutputAirHumiditySensor
            | Self::PressureSensor => 8,
            Self::OdorantFlowSensor | Self::DilutionAirFlowSensor => 12,
        }
    }

    /// Returns the capability corresponding to this sensor.
    #[must_use]
    pub const fn capability(self) -> Capability {
        match self {
            Self::Pid => Capability::Pid,
            Self::BeadThermistor => Capability::BeadThermistor,
            Self::ChassisThermometer => Capability::ChassisThermometer,
            Self::OdorSourceThermometer => Capability::OdorSourceThermometer,
            Self::GeneralPurposeThermometer => Capability::GeneralPurposeThermometer,
            Self::InputAirHumiditySensor => Capability::InputAirHumiditySensor,
            Self::OutputAirHumiditySensor => Capability::OutputAirHumiditySensor,
            Self::PressureSensor => Capability::PressureSensor,
            Self::OdorantFlowSensor => Capability::OdorantFlowSensor,
            Self::DilutionAirFlowSensor => Capability::DilutionAirFlowSensor,
            Self::OdorantValveSensor => Capability::OdorantValveSensor,
            Self::OutputValveSensor => Capability::OutputValveSensor,
        }
    }
}

/// Actuator controller addressed inside a [`SetActuators`](crate::Request::SetActuators) payload.
#[derive(FromRepr, Display, EnumIter, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Controller {
    /// Odorant flow in sccm.
    OdorantFlow = 0x00,
    /// Dilution air flow in L/min.
    DilutionAirFlow = 0x01,
    /// Chassis temperature in °C.
    ChassisTemperature = 0x02,
    /// Odorant valve, signed duration in ms.
    OdorantValve = 0x03,
    /// Output valve, signed duration in ms.
    OutputValve = 0x04,
}

impl Controller {
    /// Returns the capability a device needs for this controller.
    #[must_use]
    pub const fn capability(self) -> Capability {
        match self {
            Self::OdorantFlow => Capability::OdorantFlowController,
            Self::DilutionAirFlow => Capability::DilutionAirFlowController,
            Self::ChassisTemperature => Capability::ChassisTemperatureController,
            Self::OdorantValve => Capability::OdorantValveController,
            Self::OutputValve => Capability::OutputValveController,
        }
    }

    /// Returns whether the controller takes a valve duration instead of a physical value.
    #[must_use]
    pub const fn is_valve(self) -> bool {
        matches!(self, Self::OdorantValve | Self::OutputValve)
    }
}

bitflags::bitflags! {
    /// Set of module slots that are physically present.
    ///
    /// Bit `n` corresponds to the [`DeviceId`] with value `n`.
    #[derive(FlagsDisplay, FlagsDebug, PartialEq, Eq, Copy, Clone)]
    pub struct Devices: u16 {
        /// Base module.
        const Base = 0x0001;
        /// Odor channel 1.
        const Odor1 = 0x0002;
        /// Odor channel 2.
        const Odor2 = 0x0004;
        /// Odor channel 3.
        const Odor3 = 0x0008;
        /// Odor channel 4.
        const Odor4 = 0x0010;
        /// Odor channel 5.
        const Odor5 = 0x0020;
        /// Odor channel 6.
        const Odor6 = 0x0040;
        /// Odor channel 7.
        const Odor7 = 0x0080;
        /// Odor channel 8.
        const Odor8 = 0x0100;
        /// Odor channel 9.
        const Odor9 = 0x0200;
        /// Dilution air module.
        const DilutionAir = 0x0400;
    }
}

impl Devices {
    /// Returns whether the given device is present.
    #[must_use]
    pub const fn has(self, id: DeviceId) -> bool {
        self.contains(id.flag())
    }

    /// Iterates over the present devices in id order.
    pub fn ids(self) -> impl Iterator<Item = DeviceId> {
        <DeviceId as strum::IntoEnumIterator>::iter().filter(move |&id| self.has(id))
    }
}

bitflags::bitflags! {
    /// Set of capabilities a single module exposes.
    ///
    /// Bit `n` corresponds to the [`Capability`] with value `n`.
    #[derive(FlagsDisplay, FlagsDebug, PartialEq, Eq, Copy, Clone)]
    pub struct Capabilities: u32 {
        /// Photo-ionization detector.
        const Pid = 1 << 0x00;
        /// Bead thermistor.
        const BeadThermistor = 1 << 0x01;
        /// Chassis thermometer.
        const ChassisThermometer = 1 << 0x02;
        /// Odor source thermometer.
        const OdorSourceThermometer = 1 << 0x03;
        /// General purpose thermometer.
        const GeneralPurposeThermometer = 1 << 0x04;
        /// Input air humidity sensor.
        const InputAirHumiditySensor = 1 << 0x05;
        /// Output air humidity sensor.
        const OutputAirHumiditySensor = 1 << 0x06;
        /// Pressure sensor.
        const PressureSensor = 1 << 0x07;
        /// Odorant flow sensor.
        const OdorantFlowSensor = 1 << 0x08;
        /// Dilution air flow sensor.
        const DilutionAirFlowSensor = 1 << 0x09;
        /// Odorant valve state sensor.
        const OdorantValveSensor = 1 << 0x0a;
        /// Output valve state sensor.
        const OutputValveSensor = 1 << 0x0b;
        /// Odorant flow controller.
        const OdorantFlowController = 1 << 0x0c;
        /// Dilution air flow controller.
        const DilutionAirFlowController = 1 << 0x0d;
        /// Chassis temperature controller.
        const ChassisTemperatureController = 1 << 0x0e;
        /// Odorant valve controller.
        const OdorantValveController = 1 << 0x0f;
        /// Output valve controller.
        const OutputValveController = 1 << 0x10;
    }
}

impl Capabilities {
    /// Returns whether the given capability is present.
    #[must_use]
    pub const fn has(self, cap: Capability) -> bool {
        self.contains(cap.flag())
    }

    /// Returns the sensors among these capabilities, in tag order.
    pub fn sensors(self) -> impl Iterator<Item = Sensor> {
        <Sensor as strum::IntoEnumIterator>::iter().filter(move |s| self.has(s.capability()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn device_markers() {
        assert_eq!(DeviceId::Odor1.marked(), 0x81, "marker should be correct");
        assert_eq!(DeviceId::DilutionAir.marked(), 0x8a, "marker should be correct");
        assert_eq!(
            DeviceId::from_marked(0x83),
            Ok(DeviceId::Odor3),
            "device should be correct"
        );
        assert!(
            matches!(DeviceId::from_marked(0x03), Err(Error::InvalidData(_))),
            "unmarked byte should be rejected"
        );
        assert!(
            matches!(DeviceId::from_marked(0x8b), Err(Error::InvalidData(_))),
            "unknown device should be rejected"
        );
    }

    #[test]
    fn odor_channels() {
        assert_eq!(DeviceId::odor(1), Some(DeviceId::Odor1));
        assert_eq!(DeviceId::odor(9), Some(DeviceId::Odor9));
        assert_eq!(DeviceId::odor(0), None);
        assert_eq!(DeviceId::odor(10), None);
        assert_eq!(DeviceId::iter().filter(|id| id.is_odor()).count(), 9);
    }

    #[test]
    fn flags_match_ids() {
        for id in DeviceId::iter() {
            assert_eq!(id.flag().bits(), 1 << id as u16, "flag for {id} should be correct");
        }

        for cap in Capability::iter() {
            assert_eq!(cap.flag().bits(), 1 << cap as u32, "flag for {cap} should be correct");
        }

        assert_eq!(Capability::iter().count(), 17);
        assert_eq!(DeviceId::iter().count(), 11);
    }

    #[test]
    fn present_devices() {
        let devs = Devices::Base | Devices::Odor2 | Devices::DilutionAir;

        assert_eq!(
            devs.ids().collect::<Vec<_>>(),
            [DeviceId::Base, DeviceId::Odor2, DeviceId::DilutionAir],
            "present devices should be correct"
        );
    }

    #[test]
    fn sensor_capabilities() {
        for sensor in Sensor::iter() {
            assert_eq!(
                sensor.capability() as u8,
                sensor as u8,
                "capability for {sensor} should be correct"
            );
        }

        let caps = Capabilities::Pid | Capabilities::PressureSensor | Capabilities::OutputValveController;

        assert_eq!(
            caps.sensors().collect::<Vec<_>>(),
            [Sensor::Pid, Sensor::PressureSensor],
            "sensors should be correct"
        );
    }
}
