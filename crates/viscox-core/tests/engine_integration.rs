#![cfg(feature = "simulation")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use viscox_core::acquisition::AcquisitionConfig;
use viscox_core::channel::ChannelKind;
use viscox_core::channel_sim::{SimConfig, SimRead, SimulatedRig, SIM_MOTOR_PORT, SIM_SENSOR_PORT};
use viscox_core::engine::{ConnectOutcome, EngineConfig, EngineError, Precondition, RigEngine};
use viscox_core::export::MemoryExporter;
use viscox_core::ramp::{RampConfig, RampOutcome, RampProgram};
use viscox_core::run_state::MotorRunState;
use viscox_core::setpoint::encode_step_delay_us;
use viscox_core::tags::AUTOSAVE_LABEL;

struct Bench {
    rig: SimulatedRig,
    exporter: MemoryExporter,
    engine: RigEngine,
}

fn bench() -> Bench {
    let rig = SimulatedRig::with_config(SimConfig {
        sample_period: Duration::from_millis(5),
        ..SimConfig::default()
    });
    let exporter = MemoryExporter::new();
    let engine = RigEngine::new(
        Arc::new(rig.clone()),
        Arc::new(exporter.clone()),
        EngineConfig {
            acquisition: AcquisitionConfig {
                poll_delay: Duration::from_millis(5),
            },
            ramp: RampConfig {
                poll_interval: Duration::from_millis(5),
                ..RampConfig::default()
            },
            ..EngineConfig::default()
        },
    );
    Bench {
        rig,
        exporter,
        engine,
    }
}

fn program(steps: u32, step_duration_s: f64, interval_duration_s: f64) -> RampProgram {
    RampProgram {
        start_rpm: 10.0,
        end_rpm: 100.0,
        steps,
        step_duration_s,
        interval_duration_s,
    }
}

#[test]
fn completed_ramp_ends_stopped_and_autosaves() {
    let bench = bench();
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.start_ramp(program(10, 0.02, 0.0)).unwrap();

    let report = bench.engine.wait_for_ramp().expect("ramp report");
    assert_eq!(report.outcome, RampOutcome::Completed);
    assert_eq!(report.step_setpoints, 11);
    assert_eq!(report.interval_pauses, 0);
    assert!(report.stopped_cleanly);
    assert_eq!(bench.engine.run_state(), MotorRunState::Idle);
    assert_eq!(bench.engine.commanded_rpm(), 0.0);

    let expected: Vec<u64> = (0..=10)
        .map(|step| encode_step_delay_us(10.0 + 9.0 * f64::from(step)))
        .chain([0])
        .collect();
    assert_eq!(bench.rig.setpoint_log(), expected);

    // baseline + (after-issue, after-wait) per step + final stop
    let motor = bench.engine.motor_snapshot();
    assert!(motor.len() >= 1 + 2 * 11 + 1, "motor series too short: {}", motor.len());
    assert_eq!(motor.last().map(|s| s.value), Some(0.0));
    assert!(motor.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let records = bench.exporter.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].label, AUTOSAVE_LABEL);
    assert_eq!(records[0].motor.last().map(|s| s.value), Some(0.0));
    assert_eq!(report.export.as_deref(), Some("memory:1:autosave"));
}

#[test]
fn intervals_rest_between_steps_only() {
    let bench = bench();
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.start_ramp(program(2, 0.0, 0.01)).unwrap();

    let report = bench.engine.wait_for_ramp().unwrap();
    assert_eq!(report.interval_pauses, 2);
    assert_eq!(
        bench.rig.setpoint_log(),
        vec![
            encode_step_delay_us(10.0),
            0,
            encode_step_delay_us(55.0),
            0,
            encode_step_delay_us(100.0),
            0
        ]
    );
}

#[test]
fn stop_mid_ramp_skips_remaining_steps() {
    let bench = bench();
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.start_ramp(program(10, 0.2, 0.0)).unwrap();

    thread::sleep(Duration::from_millis(300));
    let requested_at = Instant::now();
    assert!(bench.engine.stop_ramp());
    let report = bench.engine.wait_for_ramp().unwrap();
    assert!(requested_at.elapsed() < Duration::from_millis(150));

    let RampOutcome::Cancelled { during_step } = report.outcome else {
        panic!("expected a cancelled ramp, got {:?}", report.outcome);
    };
    assert!(during_step < 10);

    let log = bench.rig.setpoint_log();
    assert_eq!(log.len() as u32, during_step + 2);
    assert_eq!(log.last(), Some(&0));
    for (step, encoded) in log[..log.len() - 1].iter().enumerate() {
        assert_eq!(*encoded, encode_step_delay_us(10.0 + 9.0 * step as f64));
    }
    assert_eq!(bench.exporter.records().len(), 1);
    assert!(!bench.engine.stop_ramp(), "stop while idle is a no-op");
}

#[test]
fn write_failure_ends_ramp_but_still_exports() {
    let bench = bench();
    bench.rig.fail_writes_after(3);
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.start_ramp(program(10, 0.0, 0.0)).unwrap();

    let report = bench.engine.wait_for_ramp().unwrap();
    assert!(matches!(
        report.outcome,
        RampOutcome::Faulted { during_step: 3, .. }
    ));
    assert_eq!(report.step_setpoints, 3);
    assert!(!report.stopped_cleanly);
    assert_eq!(bench.engine.run_state(), MotorRunState::Idle);
    assert_eq!(bench.exporter.records().len(), 1);

    let stats = bench.engine.ramp_stats();
    assert_eq!(stats.ramps_faulted, 1);
    assert_eq!(stats.setpoints_written, 3);
    assert_eq!(stats.setpoint_failures, 2);
}

#[test]
fn sensor_samples_flow_and_disconnect_is_prompt() {
    let bench = bench();
    bench
        .rig
        .script([SimRead::Line("garbage".into()), SimRead::IoError]);
    let outcome = bench.engine.connect_sensor(SIM_SENSOR_PORT).unwrap();
    assert_eq!(
        outcome,
        ConnectOutcome::Connected {
            port: SIM_SENSOR_PORT.to_string()
        }
    );
    assert!(bench.engine.sensor_connected());

    thread::sleep(Duration::from_millis(150));
    let started = Instant::now();
    let stats = bench.engine.disconnect_sensor().unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(stats.samples_appended > 0);
    assert_eq!(stats.decode_drops, 1);
    assert_eq!(stats.io_drops, 1);
    assert!(!bench.rig.is_open(ChannelKind::Sensor));
    assert!(!bench.engine.sensor_connected());

    let sensor = bench.engine.sensor_snapshot();
    assert_eq!(sensor.len() as u64, stats.samples_appended);
    assert!(sensor.iter().all(|s| s.value.is_finite()));
}

#[test]
fn none_selected_performs_no_io() {
    let bench = bench();
    assert_eq!(
        bench.engine.connect_sensor("none").unwrap(),
        ConnectOutcome::NotSelected
    );
    assert_eq!(
        bench.engine.connect_motor("").unwrap(),
        ConnectOutcome::NotSelected
    );
    assert!(!bench.rig.is_open(ChannelKind::Sensor));
    assert!(!bench.rig.is_open(ChannelKind::Motor));
    assert_eq!(
        bench.engine.port_choices().unwrap(),
        vec!["none", SIM_SENSOR_PORT, SIM_MOTOR_PORT]
    );
}

#[test]
fn preconditions_are_reported_without_state_change() {
    let bench = bench();

    let err = bench.engine.start_ramp(program(2, 0.0, 0.0)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(Precondition::NotConnected(ChannelKind::Motor))
    ));
    assert!(matches!(
        bench.engine.disconnect_sensor(),
        Err(EngineError::Precondition(Precondition::NotConnected(ChannelKind::Sensor)))
    ));
    assert!(matches!(
        bench.engine.connect_motor("COM42"),
        Err(EngineError::Connection(_))
    ));

    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    assert!(matches!(
        bench.engine.connect_motor(SIM_MOTOR_PORT),
        Err(EngineError::Precondition(Precondition::AlreadyConnected(ChannelKind::Motor)))
    ));

    let mut invalid = program(2, 0.0, 0.0);
    invalid.steps = 0;
    assert!(matches!(
        bench.engine.start_ramp(invalid),
        Err(EngineError::Precondition(Precondition::InvalidProgram(_)))
    ));
    assert_eq!(bench.engine.run_state(), MotorRunState::Idle);

    bench.engine.start_ramp(program(4, 0.5, 0.0)).unwrap();
    assert!(matches!(
        bench.engine.start_ramp(program(4, 0.5, 0.0)),
        Err(EngineError::Precondition(Precondition::RampRunning))
    ));
    assert!(matches!(
        bench.engine.reset_session(),
        Err(EngineError::Precondition(Precondition::SessionActive))
    ));

    bench.engine.disconnect_motor().unwrap();
    assert_eq!(bench.engine.run_state(), MotorRunState::Idle);
    assert_eq!(bench.rig.setpoint_log().last(), Some(&0));
    assert!(!bench.rig.is_open(ChannelKind::Motor));
}

#[test]
fn manual_export_and_reset() {
    let bench = bench();
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.record_motor_snapshot();

    let id = bench.engine.export_now("run-1").unwrap();
    assert_eq!(id, "memory:1:run-1");
    assert!(matches!(
        bench.engine.export_now(" "),
        Err(EngineError::Export(_))
    ));

    bench.engine.reset_session().unwrap();
    assert!(bench.engine.motor_snapshot().is_empty());
    assert!(bench.engine.sensor_snapshot().is_empty());
}

#[test]
fn shutdown_stops_everything_and_is_idempotent() {
    let bench = bench();
    bench.engine.connect_sensor(SIM_SENSOR_PORT).unwrap();
    bench.engine.connect_motor(SIM_MOTOR_PORT).unwrap();
    bench.engine.start_ramp(program(5, 1.0, 0.0)).unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    bench.engine.shutdown();
    assert!(started.elapsed() < Duration::from_millis(500));
    bench.engine.shutdown();

    assert_eq!(bench.engine.run_state(), MotorRunState::Idle);
    assert!(!bench.rig.is_open(ChannelKind::Sensor));
    assert!(!bench.rig.is_open(ChannelKind::Motor));
    assert_eq!(bench.rig.setpoint_log().last(), Some(&0));

    let status = bench.engine.status();
    assert_eq!(status.sensor_port, None);
    assert_eq!(status.motor_port, None);
}
