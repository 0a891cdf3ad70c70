//! Prometheus metrics for the rig.
//!
//! Counters mirror the engine's own statistics and are advanced by the telemetry
//! updater; gauges carry the latest live values.

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};
use viscox_core::tags;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn register<C: Collector + Clone + 'static>(metric: prometheus::Result<C>) -> C {
    // Names and help texts are static; a failure here is a programming error.
    let metric = metric.expect("metric definition");
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric registered once");
    metric
}

// ============================================================================
// Acquisition Metrics
// ============================================================================

pub static SENSOR_SAMPLES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(
        "viscox_sensor_samples_total",
        "Sensor samples decoded and appended",
    ))
});

/// Sensor lines dropped, by reason (decode, io)
pub static SENSOR_DROPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(IntCounterVec::new(
        Opts::new("viscox_sensor_drops_total", "Sensor reads discarded"),
        &["reason"],
    ))
});

pub static SENSOR_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(
        "viscox_sensor_timeouts_total",
        "Sensor reads that timed out without a line",
    ))
});

pub static SENSOR_LAST_VALUE: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        tags::SENSOR_LOAD.metric,
        "Most recent decoded sensor value",
    ))
});

// ============================================================================
// Ramp Metrics
// ============================================================================

pub static SETPOINTS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(
        "viscox_setpoints_written_total",
        "Motor setpoints written successfully",
    ))
});

pub static SETPOINT_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(
        "viscox_setpoint_failures_total",
        "Motor setpoint writes that failed",
    ))
});

pub static RAMPS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(
        "viscox_ramps_started_total",
        "Ramp programs started",
    ))
});

/// Finished ramps, by outcome (completed, cancelled, faulted)
pub static RAMPS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(IntCounterVec::new(
        Opts::new("viscox_ramps_finished_total", "Ramp programs finished"),
        &["outcome"],
    ))
});

/// Exports written, by result (ok, failed)
pub static EXPORTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(IntCounterVec::new(
        Opts::new("viscox_exports_total", "Records exported"),
        &["result"],
    ))
});

pub static COMMANDED_RPM: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        tags::MOTOR_RPM.metric,
        "Most recently commanded motor speed in RPM",
    ))
});

/// Run state (0=idle,1=running,2=stop requested)
pub static RUN_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        tags::RUN_STATE.metric,
        "Ramp run state (0=idle,1=running,2=stop requested)",
    ))
});

// ============================================================================
// Connection Metrics
// ============================================================================

pub static SENSOR_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        "viscox_sensor_connected",
        "Sensor channel status (1=connected, 0=disconnected)",
    ))
});

pub static MOTOR_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        "viscox_motor_connected",
        "Motor channel status (1=connected, 0=disconnected)",
    ))
});

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(
        "viscox_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    ))
});

/// Bridge commands handled, by result (ok, failed, rejected)
pub static BRIDGE_COMMANDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(IntCounterVec::new(
        Opts::new("viscox_bridge_commands_total", "Bridge commands handled"),
        &["result"],
    ))
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Encode every registered metric in the Prometheus text format.
pub fn render_text() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match render_text() {
                    Ok(body) => {
                        let mut response = Response::from_data(body);
                        if let Ok(header) = Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        ) {
                            response = response.with_header(header);
                        }
                        response.boxed()
                    }
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error")
                            .with_status_code(500)
                            .boxed()
                    }
                },
                "/health" => Response::from_string("OK").boxed(),
                "/ready" => {
                    // Ready once at least one device is attached
                    if SENSOR_CONNECTED.get() > 0.0 || MOTOR_CONNECTED.get() > 0.0 {
                        Response::from_string("Ready").boxed()
                    } else {
                        Response::from_string("Not Ready")
                            .with_status_code(503)
                            .boxed()
                    }
                }
                _ => Response::from_string("Not Found")
                    .with_status_code(404)
                    .boxed(),
            };
            let _ = request.respond(response);
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = SENSOR_SAMPLES.get();
    let _ = SENSOR_TIMEOUTS.get();
    let _ = SENSOR_LAST_VALUE.get();
    let _ = SETPOINTS_WRITTEN.get();
    let _ = SETPOINT_FAILURES.get();
    let _ = RAMPS_STARTED.get();
    let _ = COMMANDED_RPM.get();
    let _ = RUN_STATE.get();
    let _ = SENSOR_CONNECTED.get();
    let _ = MOTOR_CONNECTED.get();
    let _ = BRIDGE_CONNECTED.get();
    for reason in ["decode", "io"] {
        let _ = SENSOR_DROPS.with_label_values(&[reason]);
    }
    for outcome in ["completed", "cancelled", "faulted"] {
        let _ = RAMPS_FINISHED.with_label_values(&[outcome]);
    }
    for result in ["ok", "failed"] {
        let _ = EXPORTS.with_label_values(&[result]);
    }
    for result in ["ok", "failed", "rejected"] {
        let _ = BRIDGE_COMMANDS.with_label_values(&[result]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_series_names() {
        init_metrics();
        COMMANDED_RPM.set(42.0);
        let text = String::from_utf8(render_text().unwrap()).unwrap();
        assert!(text.contains("viscox_motor_commanded_rpm 42"));
        assert!(text.contains("viscox_ramps_finished_total{outcome=\"cancelled\"} 0"));
        assert!(text.contains(tags::SENSOR_LOAD.metric));
    }
}
