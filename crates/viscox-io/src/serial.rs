//! Serial-port channels for the load cell and the stepper controller.

use serialport::SerialPort;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info, trace};
use viscox_core::channel::{ChannelError, ChannelFactory, ChannelKind, DeviceChannel};

/// Longest sensor line accepted before the pending bytes are discarded.
pub const MAX_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Upper bound on a single blocking read; also bounds how long a sensor
    /// disconnect waits for the acquisition loop.
    pub read_timeout: Duration,
    /// Appended to every setpoint written to the motor. The stock firmware
    /// parses bare digits, so this is empty by default.
    pub motor_terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            motor_terminator: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerialChannelFactory {
    config: SerialConfig,
}

impl SerialChannelFactory {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for SerialChannelFactory {
    fn list_ports(&self) -> Result<Vec<String>, ChannelError> {
        let ports = serialport::available_ports().map_err(|e| ChannelError::Connection {
            port: "*".to_string(),
            reason: format!("port enumeration failed: {e}"),
        })?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open(
        &self,
        kind: ChannelKind,
        port: &str,
        baud_rate: u32,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| ChannelError::Connection {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        info!(%port, baud_rate, kind = kind.as_str(), "Serial port opened");

        Ok(match kind {
            ChannelKind::Sensor => Box::new(SerialSensor {
                port_name: port.to_string(),
                port: Some(serial),
                framer: LineFramer::new(),
            }),
            ChannelKind::Motor => Box::new(SerialMotor {
                port_name: port.to_string(),
                port: Some(serial),
                terminator: self.config.motor_terminator.clone(),
            }),
        })
    }
}

/// Splits a byte stream into newline-terminated text lines.
///
/// Bytes of an unfinished line are kept across reads, so a line split by a read
/// timeout is decoded whole rather than as two wrong numbers.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Next complete line with its terminator stripped, if one is buffered.
    pub fn next_line(&mut self) -> Option<Result<String, ChannelError>> {
        match self.pending.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let text = String::from_utf8(raw)
                    .map(|line| line.trim_end_matches(['\r', '\n']).to_string())
                    .map_err(|e| ChannelError::Decode(e.to_string()));
                Some(text)
            }
            None if self.pending.len() > MAX_LINE_BYTES => {
                let dropped = self.pending.len();
                self.pending.clear();
                Some(Err(ChannelError::Decode(format!(
                    "{dropped} bytes without a line terminator"
                ))))
            }
            None => None,
        }
    }
}

struct SerialSensor {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    framer: LineFramer,
}

impl DeviceChannel for SerialSensor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sensor
    }

    fn port(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = self.framer.next_line() {
                return line;
            }
            let port = self.port.as_mut().ok_or(ChannelError::Closed)?;
            match port.read(&mut buf) {
                Ok(0) => return Err(ChannelError::Timeout),
                Ok(n) => {
                    trace!(port = %self.port_name, bytes = n, "Sensor bytes received");
                    self.framer.push(&buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(read_error(e)),
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Sensor port closed");
        }
    }
}

struct SerialMotor {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    terminator: String,
}

impl DeviceChannel for SerialMotor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Motor
    }

    fn port(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_setpoint(&mut self, encoded: u64) -> Result<(), ChannelError> {
        let port = self.port.as_mut().ok_or(ChannelError::Closed)?;
        let payload = encode_setpoint_payload(encoded, &self.terminator);
        port.write_all(payload.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|e| ChannelError::Write(e.to_string()))?;
        trace!(port = %self.port_name, payload = %payload.escape_default(), "Setpoint written");
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Motor port closed");
        }
    }
}

/// Maps a failed sensor read to a channel error. A vanished device is `Closed`
/// so acquisition stops instead of counting drops forever.
fn read_error(e: io::Error) -> ChannelError {
    #[cfg(unix)]
    const EIO: i32 = 5;

    match e.kind() {
        ErrorKind::TimedOut => ChannelError::Timeout,
        ErrorKind::BrokenPipe | ErrorKind::NotConnected => ChannelError::Closed,
        #[cfg(unix)]
        _ if e.raw_os_error() == Some(EIO) => ChannelError::Closed,
        _ => ChannelError::Read(e.to_string()),
    }
}

/// Setpoints travel as bare decimal digits plus the configured terminator.
pub fn encode_setpoint_payload(encoded: u64, terminator: &str) -> String {
    format!("{encoded}{terminator}")
}
