use crate::buffer::TelemetryBuffer;
use crate::channel::{ChannelError, DeviceChannel};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AcquisitionConfig {
    /// Pause between reads; bounds the poll rate, not required for correctness.
    pub poll_delay: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("sensor payload {0:?} is not a number")]
    NotANumber(String),

    #[error("sensor payload {0:?} is not finite")]
    NonFinite(String),
}

/// Parses one sensor line (surrounding whitespace ignored) into a finite value.
pub fn decode_sample(line: &str) -> Result<f64, DecodeError> {
    let text = line.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| DecodeError::NotANumber(text.to_string()))?;
    if !value.is_finite() {
        return Err(DecodeError::NonFinite(text.to_string()));
    }
    Ok(value)
}

#[derive(Debug, Default)]
struct Counters {
    lines_read: AtomicU64,
    samples_appended: AtomicU64,
    decode_drops: AtomicU64,
    io_drops: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub lines_read: u64,
    pub samples_appended: u64,
    pub decode_drops: u64,
    pub io_drops: u64,
    pub timeouts: u64,
}

/// Reads sensor lines into a buffer until stopped or the channel dies.
pub struct SensorAcquisitionLoop {
    channel: Box<dyn DeviceChannel>,
    buffer: Arc<TelemetryBuffer>,
    config: AcquisitionConfig,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl SensorAcquisitionLoop {
    pub fn new(
        channel: Box<dyn DeviceChannel>,
        buffer: Arc<TelemetryBuffer>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            channel,
            buffer,
            config,
            running: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Moves the loop onto its own thread; the returned handle stops and joins it.
    pub fn spawn(self) -> std::io::Result<AcquisitionHandle> {
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let port = self.channel.port().to_string();
        let thread = thread::Builder::new()
            .name("sensor-acquisition".to_string())
            .spawn(move || self.run())?;
        Ok(AcquisitionHandle {
            port,
            running,
            counters,
            thread: Some(thread),
        })
    }

    pub fn run(mut self) {
        info!("Sensor acquisition started on {}", self.channel.port());
        while self.running.load(Ordering::Acquire) {
            match self.channel.read_line() {
                Ok(line) => {
                    self.counters.lines_read.fetch_add(1, Ordering::Relaxed);
                    match decode_sample(&line) {
                        Ok(value) => {
                            self.buffer.record(value);
                            self.counters
                                .samples_appended
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.counters.decode_drops.fetch_add(1, Ordering::Relaxed);
                            trace!("Dropped sensor line: {e}");
                        }
                    }
                }
                Err(ChannelError::Timeout) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(ChannelError::Decode(reason)) => {
                    self.counters.decode_drops.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropped undecodable sensor bytes: {reason}");
                }
                Err(e) if e.is_persistent() => {
                    warn!("Sensor channel unusable, stopping acquisition: {e}");
                    break;
                }
                Err(e) => {
                    self.counters.io_drops.fetch_add(1, Ordering::Relaxed);
                    debug!("Transient sensor read failure: {e}");
                }
            }
            thread::sleep(self.config.poll_delay);
        }
        self.running.store(false, Ordering::Release);
        self.channel.close();
        info!("Sensor acquisition stopped on {}", self.channel.port());
    }
}

/// Retained handle to a running acquisition loop.
#[derive(Debug)]
pub struct AcquisitionHandle {
    port: String,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl AcquisitionHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// False once the loop has exited, whether asked to or because the channel died.
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stats(&self) -> AcquisitionStats {
        let c = &self.counters;
        AcquisitionStats {
            lines_read: c.lines_read.load(Ordering::Relaxed),
            samples_appended: c.samples_appended.load(Ordering::Relaxed),
            decode_drops: c.decode_drops.load(Ordering::Relaxed),
            io_drops: c.io_drops.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Clears the liveness flag and waits for the loop to close its channel.
    ///
    /// Returns within one read timeout plus one poll delay.
    pub fn stop(mut self) -> AcquisitionStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Sensor acquisition thread panicked on {}", self.port);
            }
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trimmed_numbers() {
        assert_eq!(decode_sample("12.5\r\n"), Ok(12.5));
        assert_eq!(decode_sample("  -3 "), Ok(-3.0));
        assert_eq!(decode_sample("1e3"), Ok(1000.0));
    }

    #[test]
    fn rejects_garbage_and_non_finite() {
        assert!(matches!(
            decode_sample("12.5g"),
            Err(DecodeError::NotANumber(_))
        ));
        assert!(matches!(decode_sample(""), Err(DecodeError::NotANumber(_))));
        assert!(matches!(decode_sample("NaN"), Err(DecodeError::NonFinite(_))));
        assert!(matches!(decode_sample("inf"), Err(DecodeError::NonFinite(_))));
    }
}
