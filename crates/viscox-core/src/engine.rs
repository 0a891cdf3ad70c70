use crate::acquisition::{AcquisitionConfig, AcquisitionHandle, AcquisitionStats, SensorAcquisitionLoop};
use crate::buffer::{Sample, TelemetryBuffer};
use crate::channel::{
    is_none_selected, ChannelError, ChannelFactory, ChannelKind, SharedChannel, NONE_SELECTED,
};
use crate::export::{ExportError, Exporter};
use crate::ramp::{
    ProgramViolation, RampConfig, RampController, RampError, RampProgram, RampReport, RampStats,
};
use crate::run_state::MotorRunState;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub baud_rate: u32,
    pub acquisition: AcquisitionConfig,
    pub ramp: RampConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            acquisition: AcquisitionConfig::default(),
            ramp: RampConfig::default(),
        }
    }
}

/// Successful result of a connect command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { port: String },
    /// The "none selected" sentinel was chosen; nothing was opened.
    NotSelected,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Precondition {
    #[error("{0} is already connected")]
    AlreadyConnected(ChannelKind),

    #[error("{0} is not connected")]
    NotConnected(ChannelKind),

    #[error("a ramp is already running")]
    RampRunning,

    #[error("invalid ramp program: {0}")]
    InvalidProgram(ProgramViolation),

    #[error("session is active; disconnect the sensor and stop the ramp first")]
    SessionActive,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    Connection(ChannelError),

    #[error(transparent)]
    Precondition(#[from] Precondition),

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

impl From<RampError> for EngineError {
    fn from(err: RampError) -> Self {
        match err {
            RampError::AlreadyRunning => Precondition::RampRunning.into(),
            RampError::MotorUnavailable => Precondition::NotConnected(ChannelKind::Motor).into(),
            RampError::InvalidProgram(v) => Precondition::InvalidProgram(v).into(),
            RampError::Spawn(e) => EngineError::Spawn("ramp", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub sensor_port: Option<String>,
    pub motor_port: Option<String>,
    pub run_state: MotorRunState,
    pub commanded_rpm: f64,
    pub last_sensor_value: Option<f64>,
    pub sensor_samples: usize,
    pub motor_samples: usize,
}

struct MotorSlot {
    port: String,
    channel: SharedChannel,
}

/// The acquisition and ramp-control engine behind the operator's commands.
///
/// Owns both channels, both series, the acquisition thread and the ramp controller.
/// Every command returns promptly; the only waits are the bounded joins performed
/// by disconnect and shutdown.
pub struct RigEngine {
    factory: Arc<dyn ChannelFactory>,
    exporter: Arc<dyn Exporter>,
    config: EngineConfig,
    sensor_buffer: Arc<TelemetryBuffer>,
    motor_buffer: Arc<TelemetryBuffer>,
    controller: Arc<RampController>,
    sensor: Mutex<Option<AcquisitionHandle>>,
    motor: Mutex<Option<MotorSlot>>,
    motor_open: AtomicBool,
}

impl RigEngine {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        exporter: Arc<dyn Exporter>,
        config: EngineConfig,
    ) -> Self {
        let sensor_buffer = Arc::new(TelemetryBuffer::new());
        let motor_buffer = Arc::new(TelemetryBuffer::new());
        let controller = Arc::new(RampController::new(
            Arc::clone(&motor_buffer),
            Arc::clone(&sensor_buffer),
            Arc::clone(&exporter),
            config.ramp.clone(),
        ));
        Self {
            factory,
            exporter,
            config,
            sensor_buffer,
            motor_buffer,
            controller,
            sensor: Mutex::new(None),
            motor: Mutex::new(None),
            motor_open: AtomicBool::new(false),
        }
    }

    pub fn list_ports(&self) -> Result<Vec<String>, EngineError> {
        self.factory.list_ports().map_err(EngineError::Connection)
    }

    /// Port choices for a selector: the "none selected" sentinel, then every port.
    pub fn port_choices(&self) -> Result<Vec<String>, EngineError> {
        let mut choices = vec![NONE_SELECTED.to_string()];
        choices.extend(self.list_ports()?);
        Ok(choices)
    }

    pub fn connect_sensor(&self, port: &str) -> Result<ConnectOutcome, EngineError> {
        if is_none_selected(port) {
            info!("No sensor port selected");
            return Ok(ConnectOutcome::NotSelected);
        }
        let mut slot = lock(&self.sensor);
        if let Some(handle) = slot.as_ref() {
            if handle.is_alive() {
                return Err(Precondition::AlreadyConnected(ChannelKind::Sensor).into());
            }
            // The previous loop died with its channel; clear it out.
            if let Some(dead) = slot.take() {
                dead.stop();
            }
        }

        let channel = self
            .factory
            .open(ChannelKind::Sensor, port, self.config.baud_rate)
            .map_err(EngineError::Connection)?;
        let handle = SensorAcquisitionLoop::new(
            channel,
            Arc::clone(&self.sensor_buffer),
            self.config.acquisition.clone(),
        )
        .spawn()
        .map_err(|e| EngineError::Spawn("sensor acquisition", e))?;
        *slot = Some(handle);

        info!("Sensor connected on {port}");
        Ok(ConnectOutcome::Connected {
            port: port.to_string(),
        })
    }

    pub fn disconnect_sensor(&self) -> Result<AcquisitionStats, EngineError> {
        let handle = lock(&self.sensor)
            .take()
            .ok_or(Precondition::NotConnected(ChannelKind::Sensor))?;
        let port = handle.port().to_string();
        let stats = handle.stop();
        info!(
            "Sensor disconnected from {port} ({} samples, {} dropped)",
            stats.samples_appended,
            stats.decode_drops + stats.io_drops
        );
        Ok(stats)
    }

    pub fn connect_motor(&self, port: &str) -> Result<ConnectOutcome, EngineError> {
        if is_none_selected(port) {
            info!("No motor port selected");
            return Ok(ConnectOutcome::NotSelected);
        }
        let mut slot = lock(&self.motor);
        if slot.is_some() {
            return Err(Precondition::AlreadyConnected(ChannelKind::Motor).into());
        }

        let channel = self
            .factory
            .open(ChannelKind::Motor, port, self.config.baud_rate)
            .map_err(EngineError::Connection)?;
        *slot = Some(MotorSlot {
            port: port.to_string(),
            channel: SharedChannel::new(channel),
        });
        self.motor_open.store(true, Ordering::Release);

        info!("Motor connected on {port}");
        Ok(ConnectOutcome::Connected {
            port: port.to_string(),
        })
    }

    /// Stops any running ramp (which leaves the motor commanded to zero), then
    /// closes the channel.
    pub fn disconnect_motor(&self) -> Result<(), EngineError> {
        let slot = lock(&self.motor)
            .take()
            .ok_or(Precondition::NotConnected(ChannelKind::Motor))?;
        self.motor_open.store(false, Ordering::Release);

        self.controller.stop();
        self.controller.join();
        slot.channel.close();

        info!("Motor disconnected from {}", slot.port);
        Ok(())
    }

    pub fn start_ramp(&self, program: RampProgram) -> Result<(), EngineError> {
        let channel = lock(&self.motor)
            .as_ref()
            .map(|slot| slot.channel.clone())
            .ok_or(Precondition::NotConnected(ChannelKind::Motor))?;
        self.controller.start(program, channel)?;
        Ok(())
    }

    /// Returns whether a running ramp was asked to stop; a no-op when idle.
    pub fn stop_ramp(&self) -> bool {
        self.controller.stop()
    }

    pub fn export_now(&self, label: &str) -> Result<String, EngineError> {
        let sensor = self.sensor_buffer.snapshot();
        let motor = self.motor_buffer.snapshot();
        let id = self.exporter.export(label, &sensor, &motor)?;
        info!(
            "Exported {} sensor and {} motor samples to {id}",
            sensor.len(),
            motor.len()
        );
        Ok(id)
    }

    /// Clears both series. Refused while a producer could still be appending.
    pub fn reset_session(&self) -> Result<(), EngineError> {
        let sensor_active = lock(&self.sensor).as_ref().is_some_and(|h| h.is_alive());
        if sensor_active || self.controller.is_running() {
            return Err(Precondition::SessionActive.into());
        }
        self.sensor_buffer.reset();
        self.motor_buffer.reset();
        info!("Session buffers reset");
        Ok(())
    }

    pub fn sensor_connected(&self) -> bool {
        lock(&self.sensor).as_ref().is_some_and(|h| h.is_alive())
    }

    /// Lock-free; safe to call while a ramp is writing to the motor.
    pub fn motor_connected(&self) -> bool {
        self.motor_open.load(Ordering::Acquire)
    }

    pub fn run_state(&self) -> MotorRunState {
        self.controller.run_state()
    }

    pub fn commanded_rpm(&self) -> f64 {
        self.controller.commanded_rpm()
    }

    pub fn record_motor_snapshot(&self) {
        self.controller.record_snapshot();
    }

    pub fn sensor_snapshot(&self) -> Vec<Sample> {
        self.sensor_buffer.snapshot()
    }

    pub fn motor_snapshot(&self) -> Vec<Sample> {
        self.motor_buffer.snapshot()
    }

    /// Blocks until the current ramp (if any) has finished and autosaved.
    pub fn wait_for_ramp(&self) -> Option<RampReport> {
        self.controller.join()
    }

    pub fn last_ramp_report(&self) -> Option<RampReport> {
        self.controller.last_report()
    }

    pub fn ramp_stats(&self) -> RampStats {
        self.controller.stats()
    }

    pub fn acquisition_stats(&self) -> Option<AcquisitionStats> {
        lock(&self.sensor).as_ref().map(AcquisitionHandle::stats)
    }

    pub fn status(&self) -> EngineStatus {
        let sensor_port = lock(&self.sensor)
            .as_ref()
            .filter(|h| h.is_alive())
            .map(|h| h.port().to_string());
        let motor_port = lock(&self.motor).as_ref().map(|slot| slot.port.clone());
        EngineStatus {
            sensor_port,
            motor_port,
            run_state: self.run_state(),
            commanded_rpm: self.commanded_rpm(),
            last_sensor_value: self.sensor_buffer.latest().map(|s| s.value),
            sensor_samples: self.sensor_buffer.len(),
            motor_samples: self.motor_buffer.len(),
        }
    }

    /// Stops the ramp, then the acquisition loop, then closes both channels.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.controller.stop() {
            info!("Stopping ramp for shutdown");
        }
        self.controller.join();

        if let Some(handle) = lock(&self.sensor).take() {
            handle.stop();
        }
        if let Some(slot) = lock(&self.motor).take() {
            self.motor_open.store(false, Ordering::Release);
            slot.channel.close();
            info!("Motor channel on {} closed", slot.port);
        }
    }
}

impl Drop for RigEngine {
    fn drop(&mut self) {
        if self.controller.is_running() || self.motor_connected() {
            warn!("Engine dropped without shutdown; shutting down now");
        }
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
