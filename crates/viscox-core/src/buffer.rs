use crate::timebase::unix_seconds;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One timestamped reading from the load cell or the commanded-RPM track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Append-only series shared between one producer and any number of readers.
///
/// Readers never see the vector itself: `snapshot` copies it out while holding the
/// lock, so a reader observes either all or none of a concurrent append.
#[derive(Debug, Default)]
pub struct TelemetryBuffer {
    samples: Mutex<Vec<Sample>>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, sample: Sample) {
        self.lock().push(sample);
    }

    /// Stamp `value` with the current wall clock and append it.
    ///
    /// The timestamp is taken inside the critical section and never precedes the
    /// latest sample, so timestamps stay non-decreasing across concurrent
    /// recorders and backward wall-clock steps.
    pub fn record(&self, value: f64) -> Sample {
        let mut samples = self.lock();
        let now = unix_seconds();
        let timestamp = samples.last().map_or(now, |last| now.max(last.timestamp));
        let sample = Sample::new(timestamp, value);
        samples.push(sample);
        sample
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.lock().clone()
    }

    /// Only called at session start, never while a producer is running.
    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.lock().last().copied()
    }

    // A panicking producer cannot leave a torn Sample behind (push is the only
    // mutation), so a poisoned lock still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
