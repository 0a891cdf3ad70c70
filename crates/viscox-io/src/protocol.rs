use serde::{Deserialize, Serialize};
use thiserror::Error;
use viscox_core::engine::EngineStatus;
use viscox_core::ramp::RampProgram;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::v1()
    }
}

/// An operator command received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ListPorts,
    ConnectSensor { port: String },
    DisconnectSensor,
    ConnectMotor { port: String },
    DisconnectMotor,
    StartRamp(RampProgram),
    StopRamp,
    Export { label: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListPorts => "list_ports",
            Self::ConnectSensor { .. } => "connect_sensor",
            Self::DisconnectSensor => "disconnect_sensor",
            Self::ConnectMotor { .. } => "connect_motor",
            Self::DisconnectMotor => "disconnect_motor",
            Self::StartRamp(_) => "start_ramp",
            Self::StopRamp => "stop_ramp",
            Self::Export { .. } => "export",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no \"type\" field")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("unsupported protocol version {}.{}", .0.major, .0.minor)]
    UnsupportedVersion(ProtocolVersion),

    #[error("invalid {command} message: {source}")]
    InvalidFields {
        command: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    protocol_version: ProtocolVersion,
}

#[derive(Deserialize)]
struct PortArgs {
    port: String,
}

#[derive(Deserialize)]
struct ExportArgs {
    label: String,
}

#[derive(Debug)]
pub struct IncomingMessage {
    pub protocol_version: ProtocolVersion,
    pub command: Command,
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ParseError::MissingType)?
            .to_string();

        let envelope: Envelope = serde_json::from_value(value.clone())?;
        if !envelope.protocol_version.is_supported() {
            return Err(ParseError::UnsupportedVersion(envelope.protocol_version));
        }

        let command = match msg_type.as_str() {
            "list_ports" => Command::ListPorts,
            "disconnect_sensor" => Command::DisconnectSensor,
            "disconnect_motor" => Command::DisconnectMotor,
            "stop_ramp" => Command::StopRamp,
            "connect_sensor" => {
                let args: PortArgs = fields("connect_sensor", value)?;
                Command::ConnectSensor { port: args.port }
            }
            "connect_motor" => {
                let args: PortArgs = fields("connect_motor", value)?;
                Command::ConnectMotor { port: args.port }
            }
            "start_ramp" => Command::StartRamp(fields("start_ramp", value)?),
            "export" => {
                let args: ExportArgs = fields("export", value)?;
                Command::Export { label: args.label }
            }
            _ => return Err(ParseError::UnknownType(msg_type)),
        };

        Ok(Self {
            protocol_version: envelope.protocol_version,
            command,
        })
    }
}

fn fields<T: for<'de> Deserialize<'de>>(
    command: &'static str,
    value: serde_json::Value,
) -> Result<T, ParseError> {
    serde_json::from_value(value).map_err(|source| ParseError::InvalidFields { command, source })
}

/// Reply to exactly one incoming line.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub command: String,
    pub ok: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<String>>,
}

impl ResultMsg {
    pub fn ok(command: &str, detail: impl Into<String>) -> Self {
        Self {
            msg_type: "result",
            protocol_version: ProtocolVersion::v1(),
            command: command.to_string(),
            ok: true,
            detail: detail.into(),
            ports: None,
        }
    }

    pub fn failed(command: &str, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            ..Self::ok(command, detail)
        }
    }

    pub fn with_ports(mut self, ports: Vec<String>) -> Self {
        self.ports = Some(ports);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct StateMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub unix_us: u64,
    pub sensor_port: Option<String>,
    pub motor_port: Option<String>,
    pub sensor_load: Option<f64>,
    pub motor_rpm: f64,
    pub run_state: &'static str,
    pub sensor_samples: usize,
    pub motor_samples: usize,
}

impl StateMsg {
    pub fn from_status(sequence: u64, unix_us: u64, status: &EngineStatus) -> Self {
        Self {
            msg_type: "state",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            unix_us,
            sensor_port: status.sensor_port.clone(),
            motor_port: status.motor_port.clone(),
            sensor_load: status.last_sensor_value,
            motor_rpm: status.commanded_rpm,
            run_state: status.run_state.as_str(),
            sensor_samples: status.sensor_samples,
            motor_samples: status.motor_samples,
        }
    }
}
