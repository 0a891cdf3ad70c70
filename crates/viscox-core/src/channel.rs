use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Port identifier meaning "no port selected"; connect attempts with it perform no I/O.
pub const NONE_SELECTED: &str = "none";

pub fn is_none_selected(port: &str) -> bool {
    let port = port.trim();
    port.is_empty() || port.eq_ignore_ascii_case(NONE_SELECTED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Sensor,
    Motor,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Motor => "motor",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot open {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("read timed out")]
    Timeout,

    #[error("read failed: {0}")]
    Read(String),

    #[error("payload is not valid text: {0}")]
    Decode(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("channel is closed")]
    Closed,

    #[error("{kind} channel does not support {operation}")]
    Unsupported {
        kind: ChannelKind,
        operation: &'static str,
    },
}

impl ChannelError {
    /// Errors after which the owning loop should stop using the channel.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Closed | Self::Unsupported { .. })
    }
}

/// An open half-duplex connection to one physical device.
///
/// Sensor channels implement `read_line`, motor channels implement `write_setpoint`;
/// the other operation keeps its default and reports `Unsupported`.
pub trait DeviceChannel: Send {
    fn kind(&self) -> ChannelKind;

    fn port(&self) -> &str;

    fn is_open(&self) -> bool;

    fn read_line(&mut self) -> Result<String, ChannelError> {
        Err(ChannelError::Unsupported {
            kind: self.kind(),
            operation: "read_line",
        })
    }

    fn write_setpoint(&mut self, _encoded: u64) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported {
            kind: self.kind(),
            operation: "write_setpoint",
        })
    }

    /// Idempotent; safe on a channel that is already closed.
    fn close(&mut self);
}

/// Opens channels of either kind; chosen once per session (serial hardware or simulation).
pub trait ChannelFactory: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>, ChannelError>;

    fn open(
        &self,
        kind: ChannelKind,
        port: &str,
        baud_rate: u32,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError>;
}

/// Motor channel shared between the engine (connect/close) and the ramp thread (writes).
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<Mutex<Box<dyn DeviceChannel>>>,
}

impl SharedChannel {
    pub fn new(channel: Box<dyn DeviceChannel>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn DeviceChannel>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    pub fn write_setpoint(&self, encoded: u64) -> Result<(), ChannelError> {
        let mut channel = self.lock();
        if !channel.is_open() {
            return Err(ChannelError::Closed);
        }
        channel.write_setpoint(encoded)
    }

    pub fn close(&self) {
        self.lock().close();
    }
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self.lock();
        f.debug_struct("SharedChannel")
            .field("kind", &channel.kind())
            .field("port", &channel.port())
            .field("open", &channel.is_open())
            .finish()
    }
}
