use crate::infra::audit::{AuditEventType, AuditLogger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use viscox_core::buffer::Sample;
use viscox_core::engine::RigEngine;
use viscox_core::ramp::{RampOutcome, RampStats};
use viscox_core::render::RenderSink;
use viscox_core::timebase::TimeBase;
use viscox_io::metrics::{
    init_metrics, serve_metrics, COMMANDED_RPM, EXPORTS, MOTOR_CONNECTED, RAMPS_FINISHED,
    RAMPS_STARTED, RUN_STATE, SENSOR_CONNECTED, SENSOR_DROPS, SENSOR_LAST_VALUE, SENSOR_SAMPLES,
    SENSOR_TIMEOUTS, SETPOINTS_WRITTEN, SETPOINT_FAILURES,
};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Turns a monotonically growing engine counter into Prometheus increments.
///
/// Acquisition counters restart with every sensor connection, so a value below
/// the last one seen starts a new baseline.
#[derive(Debug, Default)]
struct CounterSync {
    last: u64,
}

impl CounterSync {
    fn delta(&mut self, current: u64) -> u64 {
        let delta = if current >= self.last {
            current - self.last
        } else {
            current
        };
        self.last = current;
        delta
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    samples: CounterSync,
    decode_drops: CounterSync,
    io_drops: CounterSync,
    timeouts: CounterSync,
    ramps_started: CounterSync,
    ramps_completed: CounterSync,
    ramps_cancelled: CounterSync,
    ramps_faulted: CounterSync,
    setpoints: CounterSync,
    setpoint_failures: CounterSync,
    exports: CounterSync,
    export_failures: CounterSync,
}

/// Ramps that ended between two observations, by outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FinishedRamps {
    completed: u64,
    cancelled: u64,
    faulted: u64,
}

impl FinishedRamps {
    fn total(&self) -> u64 {
        self.completed + self.cancelled + self.faulted
    }

    fn publish(&self) {
        for (outcome, count) in [
            ("completed", self.completed),
            ("cancelled", self.cancelled),
            ("faulted", self.faulted),
        ] {
            RAMPS_FINISHED.with_label_values(&[outcome]).inc_by(count);
        }
    }
}

impl EngineCounters {
    fn finished(&mut self, ramp: &RampStats) -> FinishedRamps {
        FinishedRamps {
            completed: self.ramps_completed.delta(ramp.ramps_completed),
            cancelled: self.ramps_cancelled.delta(ramp.ramps_cancelled),
            faulted: self.ramps_faulted.delta(ramp.ramps_faulted),
        }
    }

    /// Copies one engine observation into the registry. Returns the ramps that
    /// finished since the previous call.
    fn apply(&mut self, engine: &RigEngine) -> FinishedRamps {
        let status = engine.status();
        SENSOR_CONNECTED.set(if status.sensor_port.is_some() { 1.0 } else { 0.0 });
        MOTOR_CONNECTED.set(if status.motor_port.is_some() { 1.0 } else { 0.0 });
        RUN_STATE.set(status.run_state as u8 as f64);
        COMMANDED_RPM.set(status.commanded_rpm);

        if let Some(acq) = engine.acquisition_stats() {
            SENSOR_SAMPLES.inc_by(self.samples.delta(acq.samples_appended));
            SENSOR_DROPS
                .with_label_values(&["decode"])
                .inc_by(self.decode_drops.delta(acq.decode_drops));
            SENSOR_DROPS
                .with_label_values(&["io"])
                .inc_by(self.io_drops.delta(acq.io_drops));
            SENSOR_TIMEOUTS.inc_by(self.timeouts.delta(acq.timeouts));
        }

        let ramp = engine.ramp_stats();
        RAMPS_STARTED.inc_by(self.ramps_started.delta(ramp.ramps_started));
        SETPOINTS_WRITTEN.inc_by(self.setpoints.delta(ramp.setpoints_written));
        SETPOINT_FAILURES.inc_by(self.setpoint_failures.delta(ramp.setpoint_failures));
        EXPORTS
            .with_label_values(&["ok"])
            .inc_by(self.exports.delta(ramp.exports_written));
        EXPORTS
            .with_label_values(&["failed"])
            .inc_by(self.export_failures.delta(ramp.export_failures));

        let finished = self.finished(&ramp);
        finished.publish();
        finished
    }
}

/// Audits the most recent report. Earlier ramps ending within the same tick
/// have no report left; the entry counts them instead.
fn record_finished_ramp(
    engine: &RigEngine,
    finished: FinishedRamps,
    audit: Option<&AuditLogger>,
    timebase: TimeBase,
) {
    if finished.total() > 1 {
        debug!(finished = finished.total(), "Several ramps ended within one tick");
    }
    let Some(report) = engine.last_ramp_report() else {
        return;
    };
    let Some(logger) = audit else {
        return;
    };
    let reason = match &report.outcome {
        RampOutcome::Faulted { reason, .. } => Some(reason.clone()),
        _ => None,
    };
    if let Err(e) = logger.log_event(
        timebase.now_us(),
        timebase.unix_us(),
        AuditEventType::RampFinished,
        serde_json::json!({
            "outcome": report.outcome.as_str(),
            "reason": reason,
            "step_setpoints": report.step_setpoints,
            "stopped_cleanly": report.stopped_cleanly,
            "export": report.export,
            "elapsed_s": report.elapsed.as_secs_f64(),
            "finished_since_last": finished.total(),
        }),
    ) {
        warn!(error = %e, "Failed to write audit entry");
    }
}

/// Periodically mirrors engine statistics into the metrics registry and writes a
/// `ramp_finished` audit entry whenever a ramp ends.
pub fn start_telemetry_updater(
    engine: Arc<RigEngine>,
    audit: Option<Arc<AuditLogger>>,
    timebase: TimeBase,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("telemetry".to_string())
        .spawn(move || {
            let mut counters = EngineCounters::default();
            loop {
                // One last pass after stop so short runs still publish their totals.
                let stopping = stop.load(Ordering::Relaxed);
                let finished = counters.apply(&engine);
                if finished.total() > 0 {
                    record_finished_ramp(&engine, finished, audit.as_deref(), timebase);
                }
                if stopping {
                    break;
                }
                thread::sleep(Duration::from_millis(200));
            }
        })
}

/// Render sink that keeps the live-value gauges current and traces each frame.
#[derive(Debug, Default)]
pub struct MetricsSink {
    frames: u64,
}

impl RenderSink for MetricsSink {
    fn render(&mut self, sensor: &[Sample], motor: &[Sample]) {
        self.frames += 1;
        if let Some(latest) = sensor.last() {
            SENSOR_LAST_VALUE.set(latest.value);
        }
        debug!(
            frame = self.frames,
            sensor_samples = sensor.len(),
            motor_samples = motor.len(),
            sensor_value = sensor.last().map(|s| s.value),
            motor_rpm = motor.last().map(|s| s.value),
            "Render frame"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_sync_rebases_after_reset() {
        let mut sync = CounterSync::default();
        assert_eq!(sync.delta(5), 5);
        assert_eq!(sync.delta(8), 3);
        assert_eq!(sync.delta(8), 0);
        // a fresh sensor connection starts counting from zero again
        assert_eq!(sync.delta(2), 2);
        assert_eq!(sync.delta(6), 4);
    }

    #[test]
    fn finished_ramps_count_every_outcome_within_a_tick() {
        init();
        let mut counters = EngineCounters::default();
        let mut stats = RampStats {
            ramps_completed: 1,
            ..RampStats::default()
        };
        assert_eq!(counters.finished(&stats).total(), 1);

        stats.ramps_completed = 3;
        stats.ramps_cancelled = 1;
        stats.ramps_faulted = 1;
        let finished = counters.finished(&stats);
        assert_eq!(
            finished,
            FinishedRamps {
                completed: 2,
                cancelled: 1,
                faulted: 1,
            }
        );
        assert_eq!(finished.total(), 4);

        let completed = RAMPS_FINISHED.with_label_values(&["completed"]);
        let before = completed.get();
        finished.publish();
        assert_eq!(completed.get(), before + 2);

        assert_eq!(counters.finished(&stats), FinishedRamps::default());
    }

    #[test]
    fn metrics_sink_tracks_latest_sensor_value() {
        init();
        let mut sink = MetricsSink::default();
        sink.render(&[Sample::new(1.0, 3.5), Sample::new(2.0, 4.25)], &[]);
        assert_eq!(SENSOR_LAST_VALUE.get(), 4.25);
        sink.render(&[], &[Sample::new(2.0, 10.0)]);
        assert_eq!(SENSOR_LAST_VALUE.get(), 4.25);
        assert_eq!(sink.frames, 2);
    }
}
