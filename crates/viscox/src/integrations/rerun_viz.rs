#![cfg(feature = "rerun")]

use rerun::{RecordingStream, RecordingStreamBuilder, Scalar};
use std::path::PathBuf;
use tracing::{info, warn};
use viscox_core::buffer::Sample;
use viscox_core::render::RenderSink;
use viscox_core::tags::{self, Tag};

#[derive(Clone, Debug, Default)]
pub struct RerunConfig {
    pub save_path: Option<PathBuf>,
}

/// Streams both series to a Rerun viewer or recording file, one scalar per new
/// sample, stamped with the sample's own wall-clock time.
pub struct RerunSink {
    rec: RecordingStream,
    sensor_sent: usize,
    motor_sent: usize,
}

impl RerunSink {
    pub fn start(config: RerunConfig) -> Option<Self> {
        let rec = match config.save_path {
            Some(path) => RecordingStreamBuilder::new("viscox").save(path),
            None => RecordingStreamBuilder::new("viscox").spawn(),
        };

        match rec {
            Ok(rec) => {
                info!("Rerun recording started");
                Some(Self {
                    rec,
                    sensor_sent: 0,
                    motor_sent: 0,
                })
            }
            Err(err) => {
                warn!("Rerun init failed: {err}");
                None
            }
        }
    }

    fn log_new(&self, tag: &Tag, samples: &[Sample], sent: usize) -> usize {
        // A shorter series means the session was reset.
        let from = if samples.len() < sent { 0 } else { sent };
        for sample in &samples[from..] {
            self.rec.set_time_seconds("wall_time", sample.timestamp);
            if let Err(err) = self.rec.log(tag.rerun_path, &Scalar::new(sample.value)) {
                warn!("Rerun log failed: {err}");
            }
        }
        samples.len()
    }
}

impl RenderSink for RerunSink {
    fn render(&mut self, sensor: &[Sample], motor: &[Sample]) {
        self.sensor_sent = self.log_new(&tags::SENSOR_LOAD, sensor, self.sensor_sent);
        self.motor_sent = self.log_new(&tags::MOTOR_RPM, motor, self.motor_sent);
    }
}
