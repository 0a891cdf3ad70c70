use crate::channel::{ChannelError, ChannelFactory, ChannelKind, DeviceChannel};
use crate::setpoint::decode_step_delay_us;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const SIM_SENSOR_PORT: &str = "sim-sensor";
pub const SIM_MOTOR_PORT: &str = "sim-motor";

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// How long each load-cell read blocks, i.e. the device's output cadence.
    pub sample_period: Duration,
    /// First-order lag of the spindle speed behind the commanded speed.
    pub time_constant_s: f64,
    /// Load reported per RPM of spindle speed (a Newtonian fluid).
    pub load_per_rpm_g: f64,
    pub baseline_load_g: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(50),
            time_constant_s: 0.5,
            load_per_rpm_g: 0.8,
            baseline_load_g: 2.0,
        }
    }
}

/// A scripted outcome for one load-cell read, consumed before the model is consulted.
#[derive(Debug, Clone, PartialEq)]
pub enum SimRead {
    Line(String),
    Timeout,
    IoError,
}

#[derive(Debug)]
struct RigState {
    commanded_rpm: f64,
    speed_rpm: f64,
    last_update: Instant,
    setpoints: Vec<u64>,
    script: VecDeque<SimRead>,
    write_budget: Option<usize>,
    sensor_open: bool,
    motor_open: bool,
}

impl RigState {
    fn advance(&mut self, config: &SimConfig) {
        let now = Instant::now();
        let dt_s = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let error = self.commanded_rpm - self.speed_rpm;
        self.speed_rpm += error * (1.0 - (-dt_s / config.time_constant_s).exp());
    }

    fn load_g(&self, config: &SimConfig) -> f64 {
        config.baseline_load_g + config.load_per_rpm_g * self.speed_rpm
    }
}

/// A load cell and a stepper on one bench, behind the same factory as real ports.
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
    config: SimConfig,
}

impl SimulatedRig {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RigState {
                commanded_rpm: 0.0,
                speed_rpm: 0.0,
                last_update: Instant::now(),
                setpoints: Vec::new(),
                script: VecDeque::new(),
                write_budget: None,
                sensor_open: false,
                motor_open: false,
            })),
            config,
        }
    }

    /// Every encoded setpoint the motor has accepted, in order.
    pub fn setpoint_log(&self) -> Vec<u64> {
        self.lock().setpoints.clone()
    }

    pub fn script<I: IntoIterator<Item = SimRead>>(&self, reads: I) {
        self.lock().script.extend(reads);
    }

    /// After `writes` more accepted setpoints, every further write fails.
    pub fn fail_writes_after(&self, writes: usize) {
        self.lock().write_budget = Some(writes);
    }

    pub fn speed_rpm(&self) -> f64 {
        let mut state = self.lock();
        state.advance(&self.config);
        state.speed_rpm
    }

    pub fn is_open(&self, kind: ChannelKind) -> bool {
        let state = self.lock();
        match kind {
            ChannelKind::Sensor => state.sensor_open,
            ChannelKind::Motor => state.motor_open,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_open(&self, kind: ChannelKind, open: bool) {
        let mut state = self.lock();
        match kind {
            ChannelKind::Sensor => state.sensor_open = open,
            ChannelKind::Motor => state.motor_open = open,
        }
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for SimulatedRig {
    fn list_ports(&self) -> Result<Vec<String>, ChannelError> {
        Ok(vec![SIM_SENSOR_PORT.to_string(), SIM_MOTOR_PORT.to_string()])
    }

    fn open(
        &self,
        kind: ChannelKind,
        port: &str,
        _baud_rate: u32,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        let expected = match kind {
            ChannelKind::Sensor => SIM_SENSOR_PORT,
            ChannelKind::Motor => SIM_MOTOR_PORT,
        };
        if port != expected {
            return Err(ChannelError::Connection {
                port: port.to_string(),
                reason: format!("no simulated {kind} on this port"),
            });
        }
        if self.is_open(kind) {
            return Err(ChannelError::Connection {
                port: port.to_string(),
                reason: "device busy".to_string(),
            });
        }
        self.set_open(kind, true);

        let rig = self.clone();
        Ok(match kind {
            ChannelKind::Sensor => Box::new(SimulatedLoadCell { rig, open: true }),
            ChannelKind::Motor => Box::new(SimulatedMotor { rig, open: true }),
        })
    }
}

struct SimulatedLoadCell {
    rig: SimulatedRig,
    open: bool,
}

impl DeviceChannel for SimulatedLoadCell {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sensor
    }

    fn port(&self) -> &str {
        SIM_SENSOR_PORT
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        thread::sleep(self.rig.config.sample_period);

        let mut state = self.rig.lock();
        state.advance(&self.rig.config);
        match state.script.pop_front() {
            Some(SimRead::Line(line)) => Ok(line),
            Some(SimRead::Timeout) => Err(ChannelError::Timeout),
            Some(SimRead::IoError) => Err(ChannelError::Read("simulated glitch".to_string())),
            None => Ok(format!("{:.2}\r\n", state.load_g(&self.rig.config))),
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.rig.set_open(ChannelKind::Sensor, false);
        }
    }
}

struct SimulatedMotor {
    rig: SimulatedRig,
    open: bool,
}

impl DeviceChannel for SimulatedMotor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Motor
    }

    fn port(&self) -> &str {
        SIM_MOTOR_PORT
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write_setpoint(&mut self, encoded: u64) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let mut state = self.rig.lock();
        if let Some(budget) = state.write_budget.as_mut() {
            if *budget == 0 {
                return Err(ChannelError::Write("simulated write failure".to_string()));
            }
            *budget -= 1;
        }
        state.advance(&self.rig.config);
        state.setpoints.push(encoded);
        state.commanded_rpm = decode_step_delay_us(encoded);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.rig.set_open(ChannelKind::Motor, false);
        }
    }
}
