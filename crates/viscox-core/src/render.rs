use crate::buffer::Sample;
use crate::engine::RigEngine;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consumer of periodic buffer snapshots (a chart, a metrics exporter, a recording).
///
/// Called from the render thread; implementations must return promptly.
pub trait RenderSink: Send {
    fn render(&mut self, sensor: &[Sample], motor: &[Sample]);
}

#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub period: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
        }
    }
}

/// One render pass: top up the motor series while a motor is connected, then hand
/// consistent snapshots of both series to every sink.
pub fn render_tick(engine: &RigEngine, sinks: &mut [Box<dyn RenderSink>]) {
    if engine.motor_connected() {
        engine.record_motor_snapshot();
    }
    let sensor = engine.sensor_snapshot();
    let motor = engine.motor_snapshot();
    for sink in sinks.iter_mut() {
        sink.render(&sensor, &motor);
    }
}

pub fn spawn_render_loop(
    engine: Arc<RigEngine>,
    mut sinks: Vec<Box<dyn RenderSink>>,
    config: RenderConfig,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("render".to_string())
        .spawn(move || {
            info!("Render loop started ({} sinks)", sinks.len());
            let mut ticks = 0u64;
            while !stop.load(Ordering::Relaxed) {
                render_tick(&engine, &mut sinks);
                ticks += 1;
                thread::sleep(config.period);
            }
            debug!("Render loop stopped after {ticks} ticks");
            ticks
        })
}
