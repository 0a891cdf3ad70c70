use crate::buffer::Sample;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export label is empty")]
    EmptyLabel,

    #[error("export label {0:?} may not contain path separators or control characters")]
    InvalidLabel(String),

    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(String),
}

/// Writes both series to a durable record and returns its identifier.
///
/// The two series are independent sections; implementations must not pair rows
/// across them or truncate either one to the other's length.
pub trait Exporter: Send + Sync {
    fn export(&self, label: &str, sensor: &[Sample], motor: &[Sample])
        -> Result<String, ExportError>;
}

/// Trims the label and rejects anything that would escape the export directory.
pub fn validate_label(label: &str) -> Result<&str, ExportError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(ExportError::EmptyLabel);
    }
    let bad_char = |c: char| c == '/' || c == '\\' || c.is_control();
    if label.chars().any(bad_char) || label == "." || label == ".." {
        return Err(ExportError::InvalidLabel(label.to_string()));
    }
    Ok(label)
}

#[cfg(feature = "simulation")]
pub use memory::{ExportedRecord, MemoryExporter};

#[cfg(feature = "simulation")]
mod memory {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Debug, Clone, PartialEq)]
    pub struct ExportedRecord {
        pub label: String,
        pub sensor: Vec<Sample>,
        pub motor: Vec<Sample>,
    }

    /// Keeps exported records in memory; the simulated rig's exporter.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryExporter {
        records: Arc<Mutex<Vec<ExportedRecord>>>,
    }

    impl MemoryExporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<ExportedRecord> {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl Exporter for MemoryExporter {
        fn export(
            &self,
            label: &str,
            sensor: &[Sample],
            motor: &[Sample],
        ) -> Result<String, ExportError> {
            let label = validate_label(label)?;
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.push(ExportedRecord {
                label: label.to_string(),
                sensor: sensor.to_vec(),
                motor: motor.to_vec(),
            });
            Ok(format!("memory:{}:{}", records.len(), label))
        }
    }
}
