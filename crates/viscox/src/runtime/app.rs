use crate::infra::audit::{AuditEventType, AuditLogger};
#[cfg(feature = "rerun")]
use crate::integrations::rerun_viz::{RerunConfig, RerunSink};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::signals::{install_signal_handlers, ShutdownSignal};
use crate::runtime::telemetry::{self, MetricsSink};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use viscox_core::channel::ChannelFactory;
use viscox_core::channel_sim::SimulatedRig;
use viscox_core::engine::{ConnectOutcome, EngineError, RigEngine};
use viscox_core::ramp::{RampOutcome, RampProgram};
use viscox_core::render::{spawn_render_loop, RenderSink};
use viscox_core::timebase::TimeBase;
use viscox_io::bridge::Bridge;
use viscox_io::export::CsvExporter;
use viscox_io::metrics::EXPORTS;
use viscox_io::protocol::Command;
use viscox_io::serial::SerialChannelFactory;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to open audit log {}: {source}", path.display())]
    Audit { path: PathBuf, source: io::Error },

    #[error("failed to bind bridge on {addr}: {source}")]
    Bridge { addr: String, source: io::Error },

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, io::Error),

    #[error("ramp ended with a fault during step {during_step}: {reason}")]
    RampFaulted { during_step: u32, reason: String },
}

pub fn run_from_args() -> Result<(), AppError> {
    let config = RuntimeConfig::from_env()?;
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let factory: Arc<dyn ChannelFactory> = if config.simulate {
        info!("Using simulated rig");
        Arc::new(SimulatedRig::new())
    } else {
        Arc::new(SerialChannelFactory::new(config.serial_config()))
    };
    let engine = Arc::new(RigEngine::new(
        factory,
        Arc::new(CsvExporter::new(&config.export_dir)),
        config.engine_config(),
    ));

    if config.list_ports {
        for port in engine.port_choices()? {
            println!("{port}");
        }
        return Ok(());
    }

    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let shutdown = ShutdownSignal::new();
    install_signal_handlers(Arc::clone(&engine), shutdown.clone())
        .map_err(|e| AppError::Spawn("signals", e))?;

    let timebase = TimeBase::new();
    let audit_logger = init_audit_logger(config.audit_path.as_ref())?;

    audit(
        audit_logger.as_deref(),
        timebase,
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "simulate": config.simulate,
            "bridge_enabled": config.bridge_enabled,
            "metrics_enabled": metrics_enabled,
            "export_dir": config.export_dir.display().to_string(),
        }),
    );

    // Bind before any worker starts so a busy port fails cleanly.
    let bridge = if config.bridge_enabled {
        let bridge_config = config.bridge_config();
        Some(
            Bridge::bind(bridge_config.clone()).map_err(|source| AppError::Bridge {
                addr: bridge_config.bind_addr,
                source,
            })?,
        )
    } else {
        None
    };

    let stop = Arc::new(AtomicBool::new(false));

    let telemetry_handle = telemetry::start_telemetry_updater(
        Arc::clone(&engine),
        audit_logger.clone(),
        timebase,
        Arc::clone(&stop),
    )
    .map_err(|e| AppError::Spawn("telemetry", e))?;

    let render_handle = spawn_render_loop(
        Arc::clone(&engine),
        render_sinks(&config),
        config.render_config(),
        Arc::clone(&stop),
    )
    .map_err(|e| AppError::Spawn("render", e))?;

    let bridge_handle = if let Some(bridge) = bridge {
        let engine_bridge = Arc::clone(&engine);
        let stop_bridge = Arc::clone(&stop);
        let audit_bridge = audit_logger.clone();
        Some(
            thread::Builder::new()
                .name("bridge".to_string())
                .spawn(move || {
                    bridge.run_with(engine_bridge, stop_bridge, move |command, reply| {
                        if let Command::Export { .. } = command {
                            let result = if reply.ok { "ok" } else { "failed" };
                            EXPORTS.with_label_values(&[result]).inc();
                        }
                        if let Some(logger) = audit_bridge.as_ref() {
                            if let Err(e) = logger.log_command(
                                timebase.now_us(),
                                timebase.unix_us(),
                                command,
                                reply,
                            ) {
                                warn!(error = %e, "Failed to write audit entry");
                            }
                        }
                    })
                })
                .map_err(|e| AppError::Spawn("bridge", e))?,
        )
    } else {
        info!("Bridge disabled");
        None
    };

    let result = drive(&config, &engine, &shutdown, audit_logger.as_deref(), timebase);

    engine.shutdown();
    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = bridge_handle {
        let _ = handle.join();
    }
    let frames = render_handle.join().unwrap_or_default();
    let _ = telemetry_handle.join();

    let stats = engine.ramp_stats();
    info!(
        render_frames = frames,
        ramps_started = stats.ramps_started,
        setpoints_written = stats.setpoints_written,
        setpoint_failures = stats.setpoint_failures,
        "Run complete"
    );
    audit(
        audit_logger.as_deref(),
        timebase,
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "ramps_started": stats.ramps_started,
            "ramps_completed": stats.ramps_completed,
            "ramps_cancelled": stats.ramps_cancelled,
            "ramps_faulted": stats.ramps_faulted,
            "exports_written": stats.exports_written,
            "signalled": shutdown.is_requested(),
            "error": result.as_ref().err().map(ToString::to_string),
        }),
    );

    result
}

/// Connects the startup ports, then runs the headless ramp or waits out the
/// configured duration. An interactive session lasts until SIGINT or SIGTERM.
fn drive(
    config: &RuntimeConfig,
    engine: &RigEngine,
    shutdown: &ShutdownSignal,
    audit_logger: Option<&AuditLogger>,
    timebase: TimeBase,
) -> Result<(), AppError> {
    let (sensor_port, motor_port) = config.startup_ports();
    if let Some(port) = sensor_port {
        if let ConnectOutcome::Connected { port } = engine.connect_sensor(&port)? {
            audit(
                audit_logger,
                timebase,
                AuditEventType::SensorConnected,
                serde_json::json!({ "port": port }),
            );
        }
    }
    if let Some(port) = motor_port {
        if let ConnectOutcome::Connected { port } = engine.connect_motor(&port)? {
            audit(
                audit_logger,
                timebase,
                AuditEventType::MotorConnected,
                serde_json::json!({ "port": port }),
            );
        }
    }

    if let Some(program) = config.ramp {
        return run_ramp(engine, program, audit_logger, timebase);
    }

    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
        shutdown.wait(Some(Duration::from_secs(seconds)));
        return Ok(());
    }

    info!("viscox running; connect to the bridge to send commands");
    shutdown.wait(None);
    info!("Shutting down");
    Ok(())
}

fn run_ramp(
    engine: &RigEngine,
    program: RampProgram,
    audit_logger: Option<&AuditLogger>,
    timebase: TimeBase,
) -> Result<(), AppError> {
    engine.start_ramp(program)?;
    audit(
        audit_logger,
        timebase,
        AuditEventType::RampStarted,
        serde_json::json!({ "program": program }),
    );
    info!(
        start_rpm = program.start_rpm,
        end_rpm = program.end_rpm,
        steps = program.steps,
        "Headless ramp started"
    );

    let Some(report) = engine.wait_for_ramp() else {
        return Ok(());
    };
    info!(
        outcome = report.outcome.as_str(),
        step_setpoints = report.step_setpoints,
        export = report.export.as_deref().unwrap_or("-"),
        elapsed_s = report.elapsed.as_secs_f64(),
        "Headless ramp finished"
    );
    match report.outcome {
        RampOutcome::Faulted {
            during_step,
            reason,
        } => Err(AppError::RampFaulted {
            during_step,
            reason,
        }),
        _ => Ok(()),
    }
}

#[cfg_attr(not(feature = "rerun"), allow(unused_mut, unused_variables))]
fn render_sinks(config: &RuntimeConfig) -> Vec<Box<dyn RenderSink>> {
    let mut sinks: Vec<Box<dyn RenderSink>> = vec![Box::new(MetricsSink::default())];
    #[cfg(feature = "rerun")]
    if config.rerun_enabled {
        let rerun_config = RerunConfig {
            save_path: config.rerun_save_path.clone(),
        };
        if let Some(sink) = RerunSink::start(rerun_config) {
            sinks.push(Box::new(sink));
        }
    }
    sinks
}

fn audit(
    logger: Option<&AuditLogger>,
    timebase: TimeBase,
    event_type: AuditEventType,
    details: serde_json::Value,
) {
    if let Some(logger) = logger {
        if let Err(e) = logger.log_event(timebase.now_us(), timebase.unix_us(), event_type, details)
        {
            warn!(error = %e, "Failed to write audit entry");
        }
    }
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(AppError::Audit {
                path: path.clone(),
                source,
            }),
        })
        .transpose()
}
