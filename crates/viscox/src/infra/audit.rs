//! Audit trail of operator commands and rig state changes.
//!
//! One JSON object per line, appended; survives restarts of the bench.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use viscox_io::bridge::NO_RAMP_RUNNING;
use viscox_io::protocol::{Command, ResultMsg};

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    SensorConnected,
    SensorDisconnected,
    MotorConnected,
    MotorDisconnected,
    RampStarted,
    RampStopRequested,
    /// A ramp ended (completed, cancelled or faulted) and autosaved
    RampFinished,
    ExportWritten,
    /// A command the engine refused (precondition, connection or export failure)
    CommandFailed,
}

impl AuditEventType {
    /// The event a successful bridge command produces, if it changed rig state.
    pub fn for_command(command: &Command, reply: &ResultMsg) -> Option<Self> {
        match command {
            Command::ListPorts => None,
            Command::ConnectSensor { .. } => Some(Self::SensorConnected),
            Command::DisconnectSensor => Some(Self::SensorDisconnected),
            Command::ConnectMotor { .. } => Some(Self::MotorConnected),
            Command::DisconnectMotor => Some(Self::MotorDisconnected),
            Command::StartRamp(_) => Some(Self::RampStarted),
            Command::StopRamp if reply.detail == NO_RAMP_RUNNING => None,
            Command::StopRamp => Some(Self::RampStopRequested),
            Command::Export { .. } => Some(Self::ExportWritten),
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }

    /// Records a bridge command; commands that changed nothing are skipped.
    pub fn log_command(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        command: &Command,
        reply: &ResultMsg,
    ) -> std::io::Result<()> {
        let event_type = if reply.ok {
            match AuditEventType::for_command(command, reply) {
                Some(event) => event,
                None => return Ok(()),
            }
        } else {
            AuditEventType::CommandFailed
        };
        let mut details = serde_json::json!({
            "command": command.name(),
            "detail": reply.detail,
        });
        if let Command::StartRamp(program) = command {
            details["program"] = serde_json::to_value(program)?;
        }
        self.log_event(timestamp_us, unix_us, event_type, details)
    }
}
