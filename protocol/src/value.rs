//! Physical values and their wire representation.
//!
//! Sensor readings arrive inside [`Data`](crate::Data) payloads as a flat sequence of
//! tagged values. The payload carries no per-value length: the [`Sensor`] tag alone
//! determines how many bytes follow (see [`Sensor::value_width`]).
//!
//! Actuator values travel the other way, inside
//! [`SetActuators`](crate::Request::SetActuators) requests. Every controller value
//! occupies four bytes and is clamped to the controller's range before encoding.

use crate::{
    Error, Result,
    device::{Controller, DEVICE_MARKER, DeviceId, Sensor},
};
use log::warn;

/// Upper limit of the odorant flow controller in sccm.
pub const ODORANT_FLOW_MAX: f32 = 50.0;

/// Upper limit of the dilution air flow controller in L/min.
pub const DILUTION_AIR_FLOW_MAX: f32 = 10.0;

/// Upper limit of the chassis temperature controller in °C.
pub const CHASSIS_TEMPERATURE_MAX: f32 = 50.0;

/// A single decoded sensor reading.
#[derive(PartialEq, Copy, Clone, Debug)]
pub enum SensorValue {
    /// Photo-ionization detector output.
    Pid {
        /// Detector voltage.
        volts: f32,
    },
    /// Bead thermistor reading.
    BeadThermistor {
        /// Thermistor resistance.
        ohms: f32,
        /// Voltage across the thermistor.
        volts: f32,
    },
    /// Plain temperature reading.
    Thermometer {
        /// Source thermometer.
        sensor: Sensor,
        /// Temperature in °C.
        celsius: f32,
    },
    /// Relative humidity reading.
    Humidity {
        /// Source humidity sensor.
        sensor: Sensor,
        /// Relative humidity in percent.
        percent: f32,
        /// Air temperature in °C.
        celsius: f32,
    },
    /// Air pressure reading.
    Pressure {
        /// Pressure in mbar.
        millibar: f32,
        /// Sensor temperature in °C.
        celsius: f32,
    },
    /// Gas flow reading.
    GasFlow {
        /// Source flow sensor.
        sensor: Sensor,
        /// Flow in L/min.
        liters_per_minute: f32,
        /// Gas temperature in °C.
        celsius: f32,
        /// Gas pressure in mbar.
        millibar: f32,
    },
    /// Valve state.
    Valve {
        /// Source valve sensor.
        sensor: Sensor,
        /// Whether the valve is currently open.
        opened: bool,
    },
}

impl SensorValue {
    /// Decodes a value of the given sensor.
    ///
    /// `data` must hold exactly [`Sensor::value_width`] bytes.
    pub fn decode(sensor: Sensor, data: &[u8]) -> Result<Self> {
        if data.len() != sensor.value_width() {
            return Err(Error::invalid(format!(
                "{sensor} value needs {} bytes, got {}",
                sensor.value_width(),
                data.len()
            )));
        }

        let f = |idx: usize| {
            let start = idx * 4;

            f32::from_le_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]])
        };

        Ok(match sensor {
            Sensor::Pid => Self::Pid { volts: f(0) },
            Sensor::BeadThermistor => Self::BeadThermistor {
                ohms: f(0),
                volts: f(1),
            },
            Sensor::ChassisThermometer
            | Sensor::OdorSourceThermometer
            | Sensor::GeneralPurposeThermometer => Self::Thermometer {
                sensor,
                celsius: f(0),
            },
            Sensor::InputAirHumiditySensor | Sensor::OutputAirHumiditySensor => Self::Humidity {
                sensor,
                percent: f(0),
                celsius: f(1),
            },
            Sensor::PressureSensor => Self::Pressure {
                millibar: f(0),
                celsius: f(1),
            },
            Sensor::OdorantFlowSensor | Sensor::DilutionAirFlowSensor => Self::GasFlow {
                sensor,
                liters_per_minute: f(0),
                celsius: f(1),
                millibar: f(2),
            },
            Sensor::OdorantValveSensor | Sensor::OutputValveSensor => Self::Valve {
                sensor,
                opened: data[0] != 0,
            },
        })
    }

    /// Returns the sensor this value was read from.
    #[must_use]
    pub fn sensor(&self) -> Sensor {
        match *self {
            Self::Pid { .. } => Sensor::Pid,
            Self::BeadThermistor { .. } => Sensor::BeadThermistor,
            Self::Pressure { .. } => Sensor::PressureSensor,
            Self::Thermometer { sensor, .. }
            | Self::Humidity { sensor, .. }
            | Self::GasFlow { sensor, .. }
            | Self::Valve { sensor, .. } => sensor,
        }
    }

    /// Appends the sensor tag and value bytes to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.sensor() as u8);

        match *self {
            Self::Pid { volts } => buf.extend_from_slice(&volts.to_le_bytes()),
            Self::Thermometer { celsius, .. } => buf.extend_from_slice(&celsius.to_le_bytes()),
            Self::BeadThermistor { ohms, volts } => {
                buf.extend_from_slice(&ohms.to_le_bytes());
                buf.extend_from_slice(&volts.to_le_bytes());
            }
            Self::Humidity {
                percent, celsius, ..
            } => {
                buf.extend_from_slice(&percent.to_le_bytes());
                buf.extend_from_slice(&celsius.to_le_bytes());
            }
            Self::Pressure { millibar, celsius } => {
                buf.extend_from_slice(&millibar.to_le_bytes());
                buf.extend_from_slice(&celsius.to_le_bytes());
            }
            Self::GasFlow {
                liters_per_minute,
                celsius,
                millibar,
                ..
            } => {
                buf.extend_from_slice(&liters_per_minute.to_le_bytes());
                buf.extend_from_slice(&celsius.to_le_bytes());
                buf.extend_from_slice(&millibar.to_le_bytes());
            }
            Self::Valve { opened, .. } => buf.push(u8::from(opened)),
        }
    }
}

/// Readings of a single module within one data frame.
#[derive(PartialEq, Clone, Debug)]
pub struct Measurement {
    /// Module the readings belong to.
    pub device: DeviceId,
    /// Readings in payload order.
    pub values: Vec<SensorValue>,
}

impl Measurement {
    /// Constructs an empty measurement for the given device.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            values: Vec::new(),
        }
    }

    /// Decodes the measurement section of a data payload.
    ///
    /// A device byte (high bit set) opens a new measurement, every following
    /// sensor tag belongs to it. A value cut short by the end of `data` ends
    /// decoding, returning everything decoded up to that point. Unknown tags
    /// or values preceding any device byte are rejected, since the position
    /// of all following values is lost.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut measurements: Vec<Self> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let tag = data[pos];

            pos += 1;

            if tag & DEVICE_MARKER != 0 {
                measurements.push(Self::new(DeviceId::from_marked(tag)?));

                continue;
            }

            let sensor = Sensor::from_repr(tag)
                .ok_or_else(|| Error::invalid(format!("unknown sensor tag {tag:#04x}")))?;
            let cur = measurements
                .last_mut()
                .ok_or_else(|| Error::invalid(format!("{sensor} value without device")))?;
            let end = pos + sensor.value_width();

            if end > data.len() {
                warn!(
                    "Truncated {sensor} value for {}, {} bytes missing",
                    cur.device,
                    end - data.len()
                );

                break;
            }

            cur.values.push(SensorValue::decode(sensor, &data[pos..end])?);
            pos = end;
        }

        Ok(measurements)
    }

    /// Appends the device byte and all values to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.device.marked());

        for val in &self.values {
            val.encode_into(buf);
        }
    }
}

/// Requested state of a valve controller.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ValveState {
    /// Force the valve closed.
    Off,
    /// Force the valve open until further notice.
    On,
    /// Open the valve for the given number of milliseconds.
    Pulse(u32),
}

impl ValveState {
    /// Interprets a signed controller value in milliseconds.
    #[must_use]
    pub fn from_millis(ms: f32) -> Self {
        if ms.is_nan() || ms == 0.0 {
            Self::Off
        } else if ms < 0.0 {
            Self::On
        } else {
            // Saturating float-to-int cast, sub-millisecond pulses round up
            Self::Pulse((ms.round() as u32).max(1))
        }
    }

    /// Decodes the wire representation.
    #[must_use]
    pub fn from_wire(val: i32) -> Self {
        match val {
            0 => Self::Off,
            v if v < 0 => Self::On,
            v => Self::Pulse(v.unsigned_abs()),
        }
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::On => -1,
            Self::Pulse(ms) => i32::try_from(ms).unwrap_or(i32::MAX),
        }
    }
}

/// Encodes a single controller value, applying the controller's range.
///
/// - Flow and temperature values are clamped and sent as `f32`; NaN becomes zero.
/// - Valve values are durations in milliseconds sent as `i32`:
///   positive values pulse the valve, zero closes it and negative values open it
///   indefinitely.
#[must_use]
pub fn encode_actuator(controller: Controller, value: f32) -> [u8; 4] {
    let clamp = |max: f32| {
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, max)
        }
    };

    match controller {
        Controller::OdorantFlow => clamp(ODORANT_FLOW_MAX).to_le_bytes(),
        Controller::DilutionAirFlow => clamp(DILUTION_AIR_FLOW_MAX).to_le_bytes(),
        Controller::ChassisTemperature => clamp(CHASSIS_TEMPERATURE_MAX).to_le_bytes(),
        Controller::OdorantValve | Controller::OutputValve => {
            ValveState::from_millis(value).to_wire().to_le_bytes()
        }
    }
}

/// Decodes a single controller value, the inverse of [`encode_actuator`].
///
/// Valve durations are returned as milliseconds, with `-1.0` meaning "on indefinitely".
#[must_use]
pub fn decode_actuator(controller: Controller, data: [u8; 4]) -> f32 {
    if controller.is_valve() {
        match ValveState::from_wire(i32::from_le_bytes(data)) {
            ValveState::Off => 0.0,
            ValveState::On => -1.0,
            #[allow(clippy::cast_precision_loss)]
            ValveState::Pulse(ms) => ms as f32,
        }
    } else {
        f32::from_le_bytes(data)
    }
}

/// Controller values to apply to one module.
#[derive(PartialEq, Clone, Debug)]
pub struct Actuator {
    /// Target module.
    pub device: DeviceId,
    /// Controller values in the order they are sent.
    pub controllers: Vec<(Controller, f32)>,
}

impl Actuator {
    /// Constructs an actuator without controller values.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            controllers: Vec::new(),
        }
    }

    /// Sets a controller value, replacing any previous value for the same controller.
    #[must_use]
    pub fn with(mut self, controller: Controller, value: f32) -> Self {
        self.set(controller, value);
        self
    }

    /// Sets a controller value, replacing any previous value for the same controller.
    pub fn set(&mut self, controller: Controller, value: f32) {
        match self.controllers.iter_mut().find(|(c, _)| *c == controller) {
            Some(entry) => entry.1 = value,
            None => self.controllers.push((controller, value)),
        }
    }

    /// Appends the device byte and all encoded controller values to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.device.marked());

        for &(controller, value) in &self.controllers {
            buf.push(controller as u8);
            buf.extend_from_slice(&encode_actuator(controller, value));
        }
    }

    /// Decodes all actuators of a [`SetActuators`](crate::Request::SetActuators) payload.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut actuators: Vec<Self> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let tag = data[pos];

            pos += 1;

            if tag & DEVICE_MARKER != 0 {
                actuators.push(Self::new(DeviceId::from_marked(tag)?));

                continue;
            }

            let controller = Controller::from_repr(tag)
                .ok_or_else(|| Error::invalid(format!("unknown controller {tag:#04x}")))?;
            let cur = actuators
                .last_mut()
                .ok_or_else(|| Error::invalid(format!("{controller} value without device")))?;
            let raw: [u8; 4] = data
                .get(pos..pos + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| Error::invalid(format!("truncated {controller} value")))?;

            cur.controllers
                .push((controller, decode_actuator(controller, raw)));
            pos += 4;
        }

        Ok(actuators)
    }
}
