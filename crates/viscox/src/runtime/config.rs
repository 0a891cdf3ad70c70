use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use viscox_core::acquisition::AcquisitionConfig;
use viscox_core::engine::EngineConfig;
use viscox_core::ramp::{RampConfig, RampProgram};
use viscox_core::render::RenderConfig;
use viscox_io::bridge::BridgeConfig;
use viscox_io::serial::SerialConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(&'static str),

    #[error("invalid value for {flag}: {value:?}")]
    InvalidValue { flag: &'static str, value: String },

    #[error("unknown option {0:?} (try --help)")]
    UnknownFlag(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub list_ports: bool,
    pub simulate: bool,
    pub sensor_port: Option<String>,
    pub motor_port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub sensor_poll_ms: u64,
    pub ramp_poll_ms: u64,
    pub render_ms: u64,
    pub motor_newline: bool,
    pub ramp: Option<RampProgram>,
    pub export_dir: PathBuf,
    pub run_seconds: Option<u64>,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    #[cfg(feature = "rerun")]
    pub rerun_enabled: bool,
    #[cfg(feature = "rerun")]
    pub rerun_save_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            list_ports: false,
            simulate: false,
            sensor_port: None,
            motor_port: None,
            baud_rate: 9600,
            read_timeout_ms: 1000,
            sensor_poll_ms: 100,
            ramp_poll_ms: 100,
            render_ms: 500,
            motor_newline: false,
            ramp: None,
            export_dir: PathBuf::from("exports"),
            run_seconds: None,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            #[cfg(feature = "rerun")]
            rerun_enabled: false,
            #[cfg(feature = "rerun")]
            rerun_save_path: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &'static str) -> Result<&'a str, ConfigError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or(ConfigError::MissingValue(flag))
}

fn parsed<T: FromStr>(args: &[String], i: &mut usize, flag: &'static str) -> Result<T, ConfigError> {
    let raw = value(args, i, flag)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag,
        value: raw.to_string(),
    })
}

/// Parses `START:END:STEPS:STEP_S[:INTERVAL_S]`.
pub fn parse_ramp(raw: &str) -> Option<RampProgram> {
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    if !(4..=5).contains(&parts.len()) {
        return None;
    }
    Some(RampProgram {
        start_rpm: parts[0].parse().ok()?,
        end_rpm: parts[1].parse().ok()?,
        steps: parts[2].parse().ok()?,
        step_duration_s: parts[3].parse().ok()?,
        interval_duration_s: match parts.get(4) {
            Some(interval) => interval.parse().ok()?,
            None => 0.0,
        },
    })
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--list-ports" => {
                    cfg.list_ports = true;
                }
                "--sensor" => {
                    cfg.sensor_port = Some(value(args, &mut i, "--sensor")?.to_string());
                }
                "--motor" => {
                    cfg.motor_port = Some(value(args, &mut i, "--motor")?.to_string());
                }
                "--baud" => {
                    cfg.baud_rate = parsed(args, &mut i, "--baud")?;
                }
                "--read-timeout-ms" => {
                    cfg.read_timeout_ms = parsed(args, &mut i, "--read-timeout-ms")?;
                }
                "--sensor-poll-ms" => {
                    cfg.sensor_poll_ms = parsed(args, &mut i, "--sensor-poll-ms")?;
                }
                "--ramp-poll-ms" => {
                    cfg.ramp_poll_ms = parsed(args, &mut i, "--ramp-poll-ms")?;
                }
                "--render-ms" => {
                    cfg.render_ms = parsed(args, &mut i, "--render-ms")?;
                }
                "--motor-newline" => {
                    cfg.motor_newline = true;
                }
                "--ramp" => {
                    let raw = value(args, &mut i, "--ramp")?;
                    cfg.ramp = Some(parse_ramp(raw).ok_or_else(|| ConfigError::InvalidValue {
                        flag: "--ramp",
                        value: raw.to_string(),
                    })?);
                }
                "--export-dir" => {
                    cfg.export_dir = PathBuf::from(value(args, &mut i, "--export-dir")?);
                }
                "--run-seconds" => {
                    cfg.run_seconds = Some(parsed(args, &mut i, "--run-seconds")?);
                }
                "--bind" => {
                    cfg.bind_addr = value(args, &mut i, "--bind")?.to_string();
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, &mut i, "--log-dir")?));
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, &mut i, "--metrics-addr")?.to_string());
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, &mut i, "--audit-log")?));
                }
                #[cfg(feature = "rerun")]
                "--rerun" => {
                    cfg.rerun_enabled = true;
                }
                #[cfg(feature = "rerun")]
                "--rerun-save" => {
                    cfg.rerun_enabled = true;
                    cfg.rerun_save_path = Some(PathBuf::from(value(args, &mut i, "--rerun-save")?));
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
            i += 1;
        }
        Ok(cfg)
    }

    /// Ports to connect at startup; `--simulate` fills in the bench ports.
    pub fn startup_ports(&self) -> (Option<String>, Option<String>) {
        if self.simulate {
            use viscox_core::channel_sim::{SIM_MOTOR_PORT, SIM_SENSOR_PORT};
            (
                Some(self.sensor_port.clone().unwrap_or_else(|| SIM_SENSOR_PORT.to_string())),
                Some(self.motor_port.clone().unwrap_or_else(|| SIM_MOTOR_PORT.to_string())),
            )
        } else {
            (self.sensor_port.clone(), self.motor_port.clone())
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            baud_rate: self.baud_rate,
            acquisition: AcquisitionConfig {
                poll_delay: Duration::from_millis(self.sensor_poll_ms),
            },
            ramp: RampConfig {
                poll_interval: Duration::from_millis(self.ramp_poll_ms.max(1)),
                ..RampConfig::default()
            },
        }
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
            motor_terminator: if self.motor_newline {
                "\n".to_string()
            } else {
                String::new()
            },
        }
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            period: Duration::from_millis(self.render_ms.max(1)),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            bind_addr: self.bind_addr.clone(),
            ..BridgeConfig::default()
        }
    }

    pub fn print_help() {
        println!(
            r#"viscox - viscometer rig: load-cell acquisition and stepper ramp control

USAGE:
    viscox [OPTIONS]

OPTIONS:
    --simulate              Use the simulated bench (ports sim-sensor, sim-motor)
    --list-ports            Print the selectable ports and exit
    --sensor <PORT>         Connect the load cell on startup ("none" skips)
    --motor <PORT>          Connect the stepper controller on startup ("none" skips)
    --baud <N>              Serial baud rate [default: 9600]
    --read-timeout-ms <MS>  Upper bound on one blocking serial read [default: 1000]
    --sensor-poll-ms <MS>   Delay between sensor reads [default: 100]
    --ramp-poll-ms <MS>     Stop-request polling granularity during a ramp [default: 100]
    --render-ms <MS>        Render/snapshot period [default: 500]
    --motor-newline         Terminate motor setpoints with a newline
    --ramp <S:E:N:T[:I]>    Run one ramp headless (start rpm, end rpm, steps, step s, interval s)
                            and exit once it finishes and autosaves
    --export-dir <PATH>     Directory for exported records [default: exports]
    --run-seconds <SECS>    Run for a fixed duration then exit
    --bind <ADDR>           Bridge TCP bind address [default: 127.0.0.1:7000]
    --no-bridge             Disable the TCP command bridge
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write logs to a daily rolling file in PATH
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    --rerun                 Enable Rerun visualization (requires 'rerun' feature)
    --rerun-save <PATH>     Save Rerun recording to file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,viscox_io=trace)

EXAMPLES:
    # Bench session driven over the bridge
    viscox --sensor /dev/ttyUSB0 --motor /dev/ttyUSB1 --metrics-addr 0.0.0.0:9090

    # Headless ramp 10 -> 100 rpm in 10 steps of 2 s
    viscox --sensor /dev/ttyUSB0 --motor /dev/ttyUSB1 --no-bridge --ramp 10:100:10:2

    # Demo without hardware
    viscox --simulate --ramp 0:200:4:1:0.5 --export-dir /tmp/viscox
"#
        );
    }
}
