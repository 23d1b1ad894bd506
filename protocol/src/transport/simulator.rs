//! Simulated odor display.
//!
//! The simulator decodes every frame written to it, answers with the replies
//! a real device would send after [`SimulatorConfig::reply_delay`], and emits
//! periodic [`Data`] frames while measurements are running. Sensor readings are
//! derived from the actuator values set by the host, without any randomness,
//! so tests can assert on them.

use crate::{
    device::{Capabilities, Controller, DeviceId, Devices, Sensor},
    packet::{PREAMBLE, Packet},
    request::{MeasurementMode, Request},
    response::{Ack, Data, DeviceCapabilities, Response, ResultCode, Version},
    transport::Transport,
    value::{Actuator, Measurement, SensorValue, ValveState},
};
use async_trait::async_trait;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Weak},
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Duration, Instant},
};

/// Ambient temperature reported by all thermometers, in °C.
const AMBIENT_CELSIUS: f32 = 24.0;

/// Ambient air pressure reported by all pressure sensors, in mbar.
const AMBIENT_MILLIBAR: f32 = 1013.0;

/// PID output with clean air, in volts.
const PID_BASELINE_VOLTS: f32 = 0.05;

/// PID response per sccm of total odorant flow, in volts.
const PID_VOLTS_PER_SCCM: f32 = 0.01;

/// Behavior of a [`Simulator`].
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Module slots reported as present.
    pub devices: Devices,
    /// Versions reported by [`Request::QueryVersion`].
    pub version: Version,
    /// Delay between receiving a request and sending its replies.
    pub reply_delay: Duration,
    /// Interval between data frames while measurements are running.
    pub data_interval: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            devices: Devices::Base
                | Devices::Odor1
                | Devices::Odor2
                | Devices::Odor3
                | Devices::DilutionAir,
            version: Version {
                hardware: (1, 0),
                software: (1, 2),
                protocol: (1, 0),
            },
            reply_delay: Duration::from_millis(10),
            data_interval: Duration::from_millis(100),
        }
    }
}

/// Returns the capabilities a module of the given slot exposes.
#[must_use]
pub fn capabilities_of(id: DeviceId) -> Capabilities {
    match id {
        DeviceId::Base => {
            Capabilities::Pid
                | Capabilities::BeadThermistor
                | Capabilities::ChassisThermometer
                | Capabilities::GeneralPurposeThermometer
                | Capabilities::InputAirHumiditySensor
                | Capabilities::OutputAirHumiditySensor
                | Capabilities::PressureSensor
                | Capabilities::OutputValveSensor
                | Capabilities::ChassisTemperatureController
                | Capabilities::OutputValveController
        }
        DeviceId::DilutionAir => {
            Capabilities::DilutionAirFlowSensor | Capabilities::DilutionAirFlowController
        }
        _ => {
            Capabilities::OdorSourceThermometer
                | Capabilities::OdorantFlowSensor
                | Capabilities::OdorantValveSensor
                | Capabilities::OdorantFlowController
                | Capabilities::OdorantValveController
        }
    }
}

#[derive(Default, Debug)]
struct State {
    // Bytes on their way to the host
    outbound: VecDeque<u8>,
    closed: bool,
    muted: bool,
    written: Vec<Packet>,
    values: HashMap<(DeviceId, Controller), f32>,
    // `None` means open indefinitely
    valves: HashMap<(DeviceId, Controller), Option<Instant>>,
    fans: bool,
    pid_lamp: bool,
    measurements: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    config: SimulatorConfig,
    reply_delay: Mutex<Duration>,
    // Requests are processed one after another
    busy_until: Mutex<Instant>,
    state: Mutex<State>,
    readable: Notify,
    started: Instant,
}

/// Simulated odor display implementing [`Transport`].
///
/// Must be used from within a Tokio runtime, since replies are scheduled as tasks.
#[derive(Debug)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl Simulator {
    /// Constructs a simulator in its power-on state.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                reply_delay: Mutex::new(config.reply_delay),
                busy_until: Mutex::new(Instant::now()),
                config,
                state: Mutex::new(State::default()),
                readable: Notify::new(),
                started: Instant::now(),
            }),
        }
    }

    /// Changes the delay applied to replies of subsequently written requests.
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.inner.reply_delay.lock() = delay;
    }

    /// Stops answering requests while `muted` is set.
    pub fn set_muted(&self, muted: bool) {
        self.inner.state.lock().muted = muted;
    }

    /// Queues raw bytes for the host, bypassing the protocol logic.
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.push_bytes(bytes);
    }

    /// Returns all packets the host has written so far.
    #[must_use]
    pub fn written(&self) -> Vec<Packet> {
        self.inner.state.lock().written.clone()
    }

    /// Returns whether periodic measurements are running.
    #[must_use]
    pub fn is_measuring(&self) -> bool {
        self.inner.state.lock().measurements.is_some()
    }

    /// Returns the current system switches as `(fans, pid_lamp)`.
    #[must_use]
    pub fn system(&self) -> (bool, bool) {
        let state = self.inner.state.lock();

        (state.fans, state.pid_lamp)
    }

    /// Returns the last value set for a controller of a module.
    #[must_use]
    pub fn controller_value(&self, device: DeviceId, controller: Controller) -> Option<f32> {
        self.inner
            .state
            .lock()
            .values
            .get(&(device, controller))
            .copied()
    }
}

#[async_trait]
impl Transport for Simulator {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut state = self.inner.state.lock();
                let count = buf.len().min(state.outbound.len());

                if count > 0 {
                    for (dst, src) in buf.iter_mut().zip(state.outbound.drain(..count)) {
                        *dst = src;
                    }

                    return Ok(count);
                }

                if state.closed {
                    return Ok(0);
                }
            }

            self.inner.readable.notified().await;
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.inner.state.lock().closed {
            return Err(io::ErrorKind::NotConnected.into());
        }

        let replies = match buf.strip_prefix(&PREAMBLE).map(Packet::decode) {
            Some(Ok(pkt)) => self.inner.handle_packet(pkt),
            Some(Err(err)) => {
                warn!("Simulator received malformed frame: {err}");

                vec![Response::Ack(Ack::new(ResultCode::UnsupportedPacket))]
            }
            None => {
                warn!("Simulator received frame without preamble: {buf:02x?}");

                Vec::new()
            }
        };

        if replies.is_empty() || self.inner.state.lock().muted {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let delay = *self.inner.reply_delay.lock();
        let deadline = {
            let mut busy_until = self.inner.busy_until.lock();

            *busy_until = (*busy_until).max(Instant::now()) + delay;
            *busy_until
        };

        tokio::spawn(async move {
            time::sleep_until(deadline).await;

            for resp in replies {
                inner.push_response(&resp);
            }
        });

        Ok(())
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock();

        state.closed = true;

        if let Some(task) = state.measurements.take() {
            task.abort();
        }

        drop(state);
        self.inner.readable.notify_one();
    }

    fn is_open(&self) -> bool {
        !self.inner.state.lock().closed
    }
}

impl Inner {
    fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().outbound.extend(bytes);
        self.readable.notify_one();
    }

    fn push_response(&self, resp: &Response) {
        trace!("Simulator sends {resp:?}");
        self.push_bytes(&resp.to_packet().encode());
    }

    fn handle_packet(self: &Arc<Self>, pkt: Packet) -> Vec<Response> {
        let valid = pkt.is_valid_crc();
        let req = Request::decode(&pkt);

        self.state.lock().written.push(pkt);

        if !valid {
            return vec![Response::Ack(Ack::new(ResultCode::InvalidChecksum))];
        }

        match req {
            Ok(req) => {
                debug!("Simulator handles {req:?}");
                self.handle_request(req)
            }
            Err(err) => {
                warn!("Simulator rejects request: {err}");
                vec![Response::Ack(Ack::new(ResultCode::UnsupportedPacket))]
            }
        }
    }

    fn handle_request(self: &Arc<Self>, req: Request) -> Vec<Response> {
        let devices = self.config.devices;
        let ack = |code| Response::Ack(Ack::new(code));

        match req {
            Request::QueryVersion => vec![Response::Version(self.config.version), ack(ResultCode::Ok)],
            Request::QueryDevices => vec![Response::Devices(devices), ack(ResultCode::Ok)],
            Request::QueryCapabilities(id) if devices.has(id) => vec![
                Response::Capabilities(DeviceCapabilities {
                    device: id,
                    capabilities: capabilities_of(id),
                }),
                ack(ResultCode::Ok),
            ],
            Request::QueryCapabilities(_) => vec![ack(ResultCode::DeviceNotAvailable)],
            Request::SetActuators(actuators) => vec![ack(self.apply_actuators(&actuators))],
            Request::SetSystem { fans, pid_lamp } => {
                let mut state = self.state.lock();

                state.fans = fans;
                state.pid_lamp = pid_lamp;

                vec![ack(ResultCode::Ok)]
            }
            Request::SetMeasurements(MeasurementMode::Start) => {
                self.start_measurements();
                vec![ack(ResultCode::Ok)]
            }
            Request::SetMeasurements(MeasurementMode::Stop) => {
                self.stop_measurements();
                vec![ack(ResultCode::Ok)]
            }
            Request::SetMeasurements(MeasurementMode::Once) => {
                vec![ack(ResultCode::Ok), Response::Data(self.sample())]
            }
            Request::Reset => {
                self.stop_measurements();

                let mut state = self.state.lock();

                state.values.clear();
                state.valves.clear();
                state.fans = false;
                state.pid_lamp = false;

                vec![ack(ResultCode::Ok)]
            }
        }
    }

    fn apply_actuators(&self, actuators: &[Actuator]) -> ResultCode {
        // Validate everything first, the device applies all or nothing
        for act in actuators {
            if !self.config.devices.has(act.device) {
                return ResultCode::DeviceNotAvailable;
            }

            let caps = capabilities_of(act.device);

            if act
                .controllers
                .iter()
                .any(|(c, _)| !caps.has(c.capability()))
            {
                return ResultCode::CapabilityNotAvailable;
            }
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        for act in actuators {
            for &(controller, value) in &act.controllers {
                let key = (act.device, controller);

                state.values.insert(key, value);

                if controller.is_valve() {
                    match ValveState::from_millis(value) {
                        ValveState::Off => {
                            state.valves.remove(&key);
                        }
                        ValveState::On => {
                            state.valves.insert(key, None);
                        }
                        ValveState::Pulse(ms) => {
                            let until = now + Duration::from_millis(u64::from(ms));

                            state.valves.insert(key, Some(until));
                        }
                    }
                }
            }
        }

        ResultCode::Ok
    }

    fn start_measurements(self: &Arc<Self>) {
        let mut state = self.state.lock();

        if state.measurements.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.data_interval;

        state.measurements = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;

                let Some(inner) = Weak::upgrade(&weak) else {
                    break;
                };

                inner.push_response(&Response::Data(inner.sample()));
            }
        }));
    }

    fn stop_measurements(&self) {
        if let Some(task) = self.state.lock().measurements.take() {
            task.abort();
        }
    }

    fn sample(&self) -> Data {
        let now = Instant::now();
        let state = self.state.lock();
        let value = |id: DeviceId, c: Controller| state.values.get(&(id, c)).copied().unwrap_or(0.0);
        let opened = |id: DeviceId, c: Controller| match state.valves.get(&(id, c)) {
            Some(None) => true,
            Some(Some(until)) => now < *until,
            None => false,
        };
        let total_odor_flow: f32 = self
            .config
            .devices
            .ids()
            .filter(|id| id.is_odor() && opened(*id, Controller::OdorantValve))
            .map(|id| value(id, Controller::OdorantFlow))
            .sum();

        let measurements = self
            .config
            .devices
            .ids()
            .map(|id| {
                let values = capabilities_of(id)
                    .sensors()
                    .map(|sensor| match sensor {
                        Sensor::Pid => SensorValue::Pid {
                            volts: PID_BASELINE_VOLTS + PID_VOLTS_PER_SCCM * total_odor_flow,
                        },
                        Sensor::BeadThermistor => SensorValue::BeadThermistor {
                            ohms: 1500.0,
                            volts: 1.2,
                        },
                        Sensor::ChassisThermometer => SensorValue::Thermometer {
                            sensor,
                            celsius: match value(id, Controller::ChassisTemperature) {
                                t if t > 0.0 => t,
                                _ => AMBIENT_CELSIUS,
                            },
                        },
                        Sensor::OdorSourceThermometer | Sensor::GeneralPurposeThermometer => {
                            SensorValue::Thermometer {
                                sensor,
                                celsius: AMBIENT_CELSIUS,
                            }
                        }
                        Sensor::InputAirHumiditySensor | Sensor::OutputAirHumiditySensor => {
                            SensorValue::Humidity {
                                sensor,
                                percent: 35.0,
                                celsius: AMBIENT_CELSIUS,
                            }
                        }
                        Sensor::PressureSensor => SensorValue::Pressure {
                            millibar: AMBIENT_MILLIBAR,
                            celsius: AMBIENT_CELSIUS,
                        },
                        Sensor::OdorantFlowSensor => SensorValue::GasFlow {
                            sensor,
                            // Controller is set in sccm, sensor reports L/min
                            liters_per_minute: value(id, Controller::OdorantFlow) / 1000.0,
                            celsius: AMBIENT_CELSIUS,
                            millibar: AMBIENT_MILLIBAR,
                        },
                        Sensor::DilutionAirFlowSensor => SensorValue::GasFlow {
                            sensor,
                            liters_per_minute: value(id, Controller::DilutionAirFlow),
                            celsius: AMBIENT_CELSIUS,
                            millibar: AMBIENT_MILLIBAR,
                        },
                        Sensor::OdorantValveSensor => SensorValue::Valve {
                            sensor,
                            opened: opened(id, Controller::OdorantValve),
                        },
                        Sensor::OutputValveSensor => SensorValue::Valve {
                            sensor,
                            opened: opened(id, Controller::OutputValve),
                        },
                    })
                    .collect();

                Measurement { device: id, values }
            })
            .collect();

        Data {
            // Device clock wraps after ~49 days
            timestamp: now.duration_since(self.started).as_millis() as u32,
            measurements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Result, device::Capability, frame::FrameReader, tests::init_logger, transport::Link};

    struct Host {
        sim: Arc<Simulator>,
        reader: FrameReader<Link>,
    }

    impl Host {
        fn new() -> Self {
            let sim = Arc::new(Simulator::new(SimulatorConfig::default()));
            let reader = FrameReader::new(Link(sim.clone()), Duration::from_millis(100));

            Self { sim, reader }
        }

        async fn send(&mut self, req: &Request) -> Result<()> {
            self.sim
                .write(&req.to_packet()?.encode())
                .await
                .map_err(|err| Error::AccessFailed(err.to_string()))
        }

        async fn exchange(&mut self, req: &Request) -> Result<Vec<Response>> {
            let count = 1 + usize::from(req.expected_response().is_some());
            let mut replies = Vec::new();

            self.send(req).await?;

            for _ in 0..count {
                replies.push(self.reader.next_response().await?);
            }

            Ok(replies)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answers_queries() -> Result<()> {
        init_logger();

        let mut host = Host::new();
        let replies = host
            .exchange(&Request::QueryCapabilities(DeviceId::DilutionAir))
            .await?;

        assert_eq!(
            replies,
            [
                Response::Capabilities(DeviceCapabilities {
                    device: DeviceId::DilutionAir,
                    capabilities: capabilities_of(DeviceId::DilutionAir),
                }),
                Response::Ack(Ack::new(ResultCode::Ok)),
            ],
            "replies should be correct"
        );
        assert_eq!(host.sim.written().len(), 1, "one packet should be recorded");

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_absent_device() -> Result<()> {
        init_logger();

        let mut host = Host::new();
        let replies = host
            .exchange(&Request::SetActuators(vec![
                Actuator::new(DeviceId::Odor8).with(Controller::OdorantFlow, 10.0),
            ]))
            .await?;

        assert_eq!(
            replies,
            [Response::Ack(Ack::new(ResultCode::DeviceNotAvailable))],
            "ack should be correct"
        );
        assert_eq!(
            host.sim.controller_value(DeviceId::Odor8, Controller::OdorantFlow),
            None
        );

        // Typed reply is withheld for absent modules
        host.send(&Request::QueryCapabilities(DeviceId::Odor9)).await?;

        assert_eq!(
            host.reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::DeviceNotAvailable)),
            "ack should be correct"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_missing_capability() -> Result<()> {
        init_logger();

        let mut host = Host::new();
        let replies = host
            .exchange(&Request::SetActuators(vec![
                Actuator::new(DeviceId::Odor1).with(Controller::ChassisTemperature, 30.0),
            ]))
            .await?;

        assert_eq!(
            replies,
            [Response::Ack(Ack::new(ResultCode::CapabilityNotAvailable))],
            "ack should be correct"
        );
        assert!(
            !capabilities_of(DeviceId::Odor1).has(Capability::ChassisTemperatureController),
            "odor channels should lack temperature control"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_bad_checksum() -> Result<()> {
        init_logger();

        let mut host = Host::new();
        let mut frame = Request::Reset.to_packet()?.encode();

        if let Some(crc) = frame.last_mut() {
            *crc ^= 0xff;
        }

        host.sim
            .write(&frame)
            .await
            .map_err(|err| Error::AccessFailed(err.to_string()))?;

        assert_eq!(
            host.reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::InvalidChecksum)),
            "ack should be correct"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn data_follows_actuators() -> Result<()> {
        init_logger();

        let mut host = Host::new();

        host.exchange(&Request::SetActuators(vec![
            Actuator::new(DeviceId::Odor2)
                .with(Controller::OdorantFlow, 20.0)
                .with(Controller::OdorantValve, -1.0),
        ]))
        .await?;

        let replies = host
            .exchange(&Request::SetMeasurements(MeasurementMode::Once))
            .await?;

        assert_eq!(replies, [Response::Ack(Ack::new(ResultCode::Ok))]);

        let Response::Data(data) = host.reader.next_response().await? else {
            panic!("response should be data");
        };
        let base = &data.measurements[0];
        let odor2 = data
            .measurements
            .iter()
            .find(|m| m.device == DeviceId::Odor2)
            .expect("odor channel 2 should be measured");

        assert_eq!(base.device, DeviceId::Base);
        assert_eq!(
            base.values[0],
            SensorValue::Pid {
                volts: PID_BASELINE_VOLTS + PID_VOLTS_PER_SCCM * 20.0
            },
            "PID should follow odorant flow"
        );
        assert!(
            odor2.values.contains(&SensorValue::Valve {
                sensor: Sensor::OdorantValveSensor,
                opened: true
            }),
            "odorant valve should be open"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_measurements() -> Result<()> {
        init_logger();

        let mut host = Host::new();

        host.exchange(&Request::SetMeasurements(MeasurementMode::Start))
            .await?;
        assert!(host.sim.is_measuring(), "measurements should be running");

        for _ in 0..3 {
            assert!(
                matches!(host.reader.next_response().await?, Response::Data(_)),
                "response should be data"
            );
        }

        host.send(&Request::Reset).await?;
        assert!(!host.sim.is_measuring(), "measurements should be stopped");

        Ok(())
    }

    #[tokio::test]
    async fn closed_simulator() {
        let sim = Simulator::new(SimulatorConfig::default());

        sim.close().await;

        let mut buf = [0x00; 4];

        assert!(!sim.is_open(), "simulator should be closed");
        assert_eq!(
            sim.read(&mut buf).await.ok(),
            Some(0),
            "read should return end-of-file"
        );
        assert!(sim.write(&[0xcc]).await.is_err(), "write should fail");
    }
}
