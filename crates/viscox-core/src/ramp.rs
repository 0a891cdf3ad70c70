use crate::buffer::TelemetryBuffer;
use crate::channel::{ChannelError, SharedChannel};
use crate::export::Exporter;
use crate::run_state::{MotorRunState, RunStateCell};
use crate::setpoint::{RampLimits, Setpoint, SetpointViolation, Validated};
use crate::tags::AUTOSAVE_LABEL;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest accepted step or interval, one day.
pub const MAX_DURATION_S: f64 = 86_400.0;

#[derive(Clone, Debug)]
pub struct RampConfig {
    /// Granularity at which step and interval waits re-check for a stop request.
    pub poll_interval: Duration,
    pub limits: RampLimits,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            limits: RampLimits::default(),
        }
    }
}

/// Parameters of one commanded ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampProgram {
    pub start_rpm: f64,
    pub end_rpm: f64,
    pub steps: u32,
    pub step_duration_s: f64,
    #[serde(default)]
    pub interval_duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ProgramViolation {
    #[error("a ramp needs at least one step")]
    ZeroSteps,

    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("{field} must not exceed {max} seconds (got {value})")]
    DurationTooLong {
        field: &'static str,
        value: f64,
        max: f64,
    },

    #[error("{field}: {violation}")]
    Setpoint {
        field: &'static str,
        violation: SetpointViolation,
    },
}

impl RampProgram {
    pub fn validate(&self, limits: &RampLimits) -> Result<(), ProgramViolation> {
        if self.steps == 0 {
            return Err(ProgramViolation::ZeroSteps);
        }
        for (field, rpm) in [("start_rpm", self.start_rpm), ("end_rpm", self.end_rpm)] {
            Setpoint::new(rpm)
                .validate(limits)
                .map_err(|violation| ProgramViolation::Setpoint { field, violation })?;
        }
        for (field, value) in [
            ("step_duration_s", self.step_duration_s),
            ("interval_duration_s", self.interval_duration_s),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ProgramViolation::InvalidDuration { field, value });
            }
            if value > MAX_DURATION_S {
                return Err(ProgramViolation::DurationTooLong {
                    field,
                    value,
                    max: MAX_DURATION_S,
                });
            }
        }
        Ok(())
    }

    pub fn delta(&self) -> f64 {
        (self.end_rpm - self.start_rpm) / f64::from(self.steps)
    }

    /// Target speed of `step` in `0..=steps`.
    ///
    /// Clamped to the program's own range so rounding in `delta` can never push the
    /// last step past `end_rpm` (and over the speed limit).
    pub fn target_rpm(&self, step: u32) -> f64 {
        let low = self.start_rpm.min(self.end_rpm);
        let high = self.start_rpm.max(self.end_rpm);
        (self.start_rpm + f64::from(step) * self.delta())
            .max(low)
            .min(high)
    }

    /// Saturates at `Duration::MAX`; negative or NaN values become zero.
    pub fn step_duration(&self) -> Duration {
        seconds(self.step_duration_s)
    }

    pub fn interval_duration(&self) -> Duration {
        seconds(self.interval_duration_s)
    }

    pub fn has_intervals(&self) -> bool {
        self.interval_duration_s > 0.0
    }
}

fn seconds(value: f64) -> Duration {
    if value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Error)]
pub enum RampError {
    #[error("a ramp is already running")]
    AlreadyRunning,

    #[error("motor channel is not open")]
    MotorUnavailable,

    #[error("invalid ramp program: {0}")]
    InvalidProgram(#[from] ProgramViolation),

    #[error("failed to spawn ramp thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RampOutcome {
    Completed,
    Cancelled { during_step: u32 },
    Faulted { during_step: u32, reason: String },
}

impl RampOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Faulted { .. } => "faulted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampReport {
    pub program: RampProgram,
    pub outcome: RampOutcome,
    /// Setpoints issued for ramp steps (excludes interval and final stops).
    pub step_setpoints: u32,
    pub interval_pauses: u32,
    /// Whether the closing zero-RPM setpoint reached the device.
    pub stopped_cleanly: bool,
    pub export: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    ramps_started: AtomicU64,
    ramps_completed: AtomicU64,
    ramps_cancelled: AtomicU64,
    ramps_faulted: AtomicU64,
    setpoints_written: AtomicU64,
    setpoint_failures: AtomicU64,
    exports_written: AtomicU64,
    export_failures: AtomicU64,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct RampStats {
    pub ramps_started: u64,
    pub ramps_completed: u64,
    pub ramps_cancelled: u64,
    pub ramps_faulted: u64,
    pub setpoints_written: u64,
    pub setpoint_failures: u64,
    pub exports_written: u64,
    pub export_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Elapsed,
    Cancelled,
}

#[derive(Debug)]
enum Fault {
    Setpoint(SetpointViolation),
    Channel(ChannelError),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setpoint(v) => write!(f, "{v}"),
            Self::Channel(e) => write!(f, "{e}"),
        }
    }
}

/// Owns the commanded-RPM state machine and the motor series.
///
/// `start` runs the step sequence on a dedicated thread whose handle is retained,
/// so `join` (and the engine's shutdown) always waits for it deterministically.
pub struct RampController {
    state: RunStateCell,
    commanded_rpm: AtomicU64,
    /// Serializes read-then-append on the motor series so appends follow the
    /// order in which the commanded RPM was observed.
    record_lock: Mutex<()>,
    motor_buffer: Arc<TelemetryBuffer>,
    sensor_buffer: Arc<TelemetryBuffer>,
    exporter: Arc<dyn Exporter>,
    config: RampConfig,
    counters: Counters,
    task: Mutex<Option<JoinHandle<RampReport>>>,
    last_report: Mutex<Option<RampReport>>,
}

impl RampController {
    pub fn new(
        motor_buffer: Arc<TelemetryBuffer>,
        sensor_buffer: Arc<TelemetryBuffer>,
        exporter: Arc<dyn Exporter>,
        config: RampConfig,
    ) -> Self {
        Self {
            state: RunStateCell::new(),
            commanded_rpm: AtomicU64::new(0f64.to_bits()),
            record_lock: Mutex::new(()),
            motor_buffer,
            sensor_buffer,
            exporter,
            config,
            counters: Counters::default(),
            task: Mutex::new(None),
            last_report: Mutex::new(None),
        }
    }

    pub fn start(
        self: &Arc<Self>,
        program: RampProgram,
        motor: SharedChannel,
    ) -> Result<(), RampError> {
        program.validate(&self.config.limits)?;
        if !motor.is_open() {
            return Err(RampError::MotorUnavailable);
        }
        if !self.state.try_start() {
            return Err(RampError::AlreadyRunning);
        }

        // The previous run may still be writing its autosave after going Idle.
        self.reap();

        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("ramp".to_string())
            .spawn(move || this.execute(program, motor));
        match spawned {
            Ok(handle) => {
                *lock(&self.task) = Some(handle);
                self.counters.ramps_started.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.state.finish();
                Err(RampError::Spawn(e))
            }
        }
    }

    /// Requests cancellation; returns false when no ramp was running.
    pub fn stop(&self) -> bool {
        let requested = self.state.request_stop();
        if requested {
            info!("Ramp stop requested");
        }
        requested
    }

    /// Waits for the current (or most recent) run to finish, including its autosave.
    pub fn join(&self) -> Option<RampReport> {
        if self.reap() {
            // a panicked run never reached its own Idle transition
            self.state.finish();
        }
        self.last_report()
    }

    pub fn run_state(&self) -> MotorRunState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn commanded_rpm(&self) -> f64 {
        f64::from_bits(self.commanded_rpm.load(Ordering::Acquire))
    }

    /// Appends the current commanded RPM to the motor series.
    pub fn record_snapshot(&self) {
        let _guard = lock(&self.record_lock);
        self.motor_buffer.record(self.commanded_rpm());
    }

    pub fn last_report(&self) -> Option<RampReport> {
        lock(&self.last_report).clone()
    }

    pub fn stats(&self) -> RampStats {
        let c = &self.counters;
        RampStats {
            ramps_started: c.ramps_started.load(Ordering::Relaxed),
            ramps_completed: c.ramps_completed.load(Ordering::Relaxed),
            ramps_cancelled: c.ramps_cancelled.load(Ordering::Relaxed),
            ramps_faulted: c.ramps_faulted.load(Ordering::Relaxed),
            setpoints_written: c.setpoints_written.load(Ordering::Relaxed),
            setpoint_failures: c.setpoint_failures.load(Ordering::Relaxed),
            exports_written: c.exports_written.load(Ordering::Relaxed),
            export_failures: c.export_failures.load(Ordering::Relaxed),
        }
    }

    /// Joins the retained ramp thread, if any. Returns true when it panicked.
    fn reap(&self) -> bool {
        let handle = lock(&self.task).take();
        let Some(handle) = handle else {
            return false;
        };
        match handle.join() {
            Ok(report) => {
                *lock(&self.last_report) = Some(report);
                false
            }
            Err(_) => {
                error!("Ramp thread panicked");
                true
            }
        }
    }

    fn execute(&self, program: RampProgram, motor: SharedChannel) -> RampReport {
        let started = Instant::now();
        info!(
            "Ramp started: {} -> {} rpm in {} steps ({}s/step, {}s interval)",
            program.start_rpm,
            program.end_rpm,
            program.steps,
            program.step_duration_s,
            program.interval_duration_s
        );

        let mut outcome = RampOutcome::Completed;
        let mut step_setpoints = 0;
        let mut interval_pauses = 0;

        self.record_snapshot();
        for step in 0..=program.steps {
            if self.state.stop_requested() {
                outcome = RampOutcome::Cancelled { during_step: step };
                break;
            }

            let target = program.target_rpm(step);
            if let Err(fault) = self.issue(target, &motor) {
                outcome = faulted(step, fault);
                break;
            }
            step_setpoints += 1;
            self.record_snapshot();

            if self.wait(program.step_duration()) == Wait::Cancelled {
                outcome = RampOutcome::Cancelled { during_step: step };
                break;
            }
            self.record_snapshot();

            if step == program.steps {
                break;
            }

            if program.has_intervals() {
                if let Err(fault) = self.issue(0.0, &motor) {
                    outcome = faulted(step, fault);
                    break;
                }
                interval_pauses += 1;
                self.record_snapshot();

                if self.wait(program.interval_duration()) == Wait::Cancelled {
                    outcome = RampOutcome::Cancelled { during_step: step };
                    break;
                }
                self.record_snapshot();
            }
        }

        let stopped_cleanly = match self.issue(0.0, &motor) {
            Ok(()) => true,
            Err(fault) => {
                warn!("Final motor stop failed: {fault}");
                false
            }
        };
        self.record_snapshot();

        let tally = match &outcome {
            RampOutcome::Completed => &self.counters.ramps_completed,
            RampOutcome::Cancelled { .. } => &self.counters.ramps_cancelled,
            RampOutcome::Faulted { .. } => &self.counters.ramps_faulted,
        };
        tally.fetch_add(1, Ordering::Relaxed);

        self.state.finish();
        info!(
            "Ramp {} after {} step setpoints",
            outcome.as_str(),
            step_setpoints
        );

        let export = self.autosave();

        RampReport {
            program,
            outcome,
            step_setpoints,
            interval_pauses,
            stopped_cleanly,
            export,
            elapsed: started.elapsed(),
        }
    }

    fn issue(&self, rpm: f64, motor: &SharedChannel) -> Result<(), Fault> {
        let setpoint: Setpoint<Validated> = Setpoint::new(rpm)
            .validate(&self.config.limits)
            .map_err(Fault::Setpoint)?;
        let encoded = setpoint.encode();
        match motor.write_setpoint(encoded) {
            Ok(()) => {
                self.commanded_rpm
                    .store(setpoint.rpm().to_bits(), Ordering::Release);
                self.counters.setpoints_written.fetch_add(1, Ordering::Relaxed);
                debug!("Setpoint {} rpm written as {}", setpoint.rpm(), encoded);
                Ok(())
            }
            Err(e) => {
                self.counters.setpoint_failures.fetch_add(1, Ordering::Relaxed);
                Err(Fault::Channel(e))
            }
        }
    }

    /// A deadline past what `Instant` can represent waits for a stop request.
    fn wait(&self, duration: Duration) -> Wait {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.state.stop_requested() {
                return Wait::Cancelled;
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wait::Elapsed;
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };
            thread::sleep(nap);
        }
    }

    fn autosave(&self) -> Option<String> {
        let sensor = self.sensor_buffer.snapshot();
        let motor = self.motor_buffer.snapshot();
        match self.exporter.export(AUTOSAVE_LABEL, &sensor, &motor) {
            Ok(id) => {
                self.counters.exports_written.fetch_add(1, Ordering::Relaxed);
                info!("Ramp data saved to {id}");
                Some(id)
            }
            Err(e) => {
                self.counters.export_failures.fetch_add(1, Ordering::Relaxed);
                error!("Automatic ramp export failed: {e}");
                None
            }
        }
    }
}

fn faulted(step: u32, fault: Fault) -> RampOutcome {
    warn!("Ramp aborted at step {step}: {fault}");
    RampOutcome::Faulted {
        during_step: step,
        reason: fault.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(start: f64, end: f64, steps: u32) -> RampProgram {
        RampProgram {
            start_rpm: start,
            end_rpm: end,
            steps,
            step_duration_s: 2.0,
            interval_duration_s: 0.0,
        }
    }

    #[test]
    fn targets_walk_from_start_to_end() {
        let p = program(10.0, 100.0, 10);
        assert_eq!(p.delta(), 9.0);
        assert_eq!(p.target_rpm(0), 10.0);
        assert_eq!(p.target_rpm(5), 55.0);
        assert_eq!(p.target_rpm(10), 100.0);
    }

    #[test]
    fn descending_and_flat_ramps() {
        let down = program(100.0, 0.0, 4);
        assert_eq!(down.target_rpm(4), 0.0);
        let flat = program(50.0, 50.0, 3);
        assert!((0..=3).all(|s| flat.target_rpm(s) == 50.0));
    }

    #[test]
    fn rejects_zero_steps() {
        let res = program(10.0, 20.0, 0).validate(&RampLimits::default());
        assert_eq!(res, Err(ProgramViolation::ZeroSteps));
    }

    #[test]
    fn rejects_negative_duration() {
        let mut p = program(10.0, 20.0, 2);
        p.interval_duration_s = -1.0;
        assert!(matches!(
            p.validate(&RampLimits::default()),
            Err(ProgramViolation::InvalidDuration {
                field: "interval_duration_s",
                ..
            })
        ));
    }

    #[test]
    fn rejects_overspeed_end() {
        let res = program(10.0, 5000.0, 2).validate(&RampLimits::default());
        assert!(matches!(
            res,
            Err(ProgramViolation::Setpoint {
                field: "end_rpm",
                violation: SetpointViolation::ExceedsMaxRpm { .. }
            })
        ));
    }

    #[test]
    fn durations_convert_to_std() {
        let mut p = program(0.0, 1.0, 1);
        p.step_duration_s = 0.25;
        assert_eq!(p.step_duration(), Duration::from_millis(250));
        assert_eq!(p.interval_duration(), Duration::ZERO);
        assert!(!p.has_intervals());
    }

    #[test]
    fn rejects_durations_longer_than_a_day() {
        let limits = RampLimits::default();
        let mut p = program(10.0, 20.0, 1);
        p.step_duration_s = 1e19;
        assert!(matches!(
            p.validate(&limits),
            Err(ProgramViolation::DurationTooLong {
                field: "step_duration_s",
                ..
            })
        ));

        p.step_duration_s = MAX_DURATION_S;
        p.interval_duration_s = 1e20;
        assert!(matches!(
            p.validate(&limits),
            Err(ProgramViolation::DurationTooLong {
                field: "interval_duration_s",
                ..
            })
        ));

        p.interval_duration_s = MAX_DURATION_S;
        assert_eq!(p.validate(&limits), Ok(()));
    }

    #[test]
    fn unrepresentable_durations_saturate_instead_of_vanishing() {
        let mut p = program(10.0, 20.0, 1);
        p.step_duration_s = 1e20;
        p.interval_duration_s = f64::NAN;
        assert_eq!(p.step_duration(), Duration::MAX);
        assert_eq!(p.interval_duration(), Duration::ZERO);
    }

    #[cfg(feature = "simulation")]
    #[test]
    fn endless_wait_still_honors_stop() {
        let controller = RampController::new(
            Arc::new(TelemetryBuffer::new()),
            Arc::new(TelemetryBuffer::new()),
            Arc::new(crate::export::MemoryExporter::new()),
            RampConfig {
                poll_interval: Duration::from_millis(5),
                ..RampConfig::default()
            },
        );
        assert!(controller.state.try_start());
        assert!(controller.state.request_stop());
        assert!(controller.wait(Duration::MAX) == Wait::Cancelled);
    }
}
