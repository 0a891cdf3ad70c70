use crate::metrics::{BRIDGE_COMMANDS, BRIDGE_CONNECTED};
use crate::protocol::{Command, IncomingMessage, ResultMsg, StateMsg};
use crate::serial::LineFramer;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use viscox_core::engine::{ConnectOutcome, RigEngine};
use viscox_core::timebase::TimeBase;

/// Reply detail for `stop_ramp` when there was nothing to stop.
pub const NO_RAMP_RUNNING: &str = "no ramp running";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(250),
        }
    }
}

/// Line-delimited JSON command bridge; serves one client at a time.
pub struct Bridge {
    listener: TcpListener,
    config: BridgeConfig,
}

impl Bridge {
    pub fn bind(config: BridgeConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %config.bind_addr, "Bridge listening");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, engine: Arc<RigEngine>, stop: Arc<AtomicBool>) {
        self.run_with(engine, stop, |_, _| {});
    }

    /// Serves clients until `stop` is set. `on_command` sees every parsed command
    /// together with the reply sent for it.
    pub fn run_with<F>(self, engine: Arc<RigEngine>, stop: Arc<AtomicBool>, mut on_command: F)
    where
        F: FnMut(&Command, &ResultMsg),
    {
        let timebase = TimeBase::new();
        let mut client: Option<TcpStream> = None;
        let mut framer = LineFramer::new();
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;
        let mut last_publish = Instant::now();
        let mut state_sequence: u64 = 0;

        while !stop.load(Ordering::Relaxed) {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            client = Some(stream);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(err) => warn!(error = %err, "Failed to set client nonblocking"),
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!("Bridge accept error: {}", err);
                    }
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                // Receive commands
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        framer.push(&temp[..n]);
                        for reply in take_replies(&mut framer, &engine, &mut on_command) {
                            queue_line(&mut send_buf, &reply);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                // Publish state
                if send_buf.is_empty() && last_publish.elapsed() >= self.config.publish_interval {
                    state_sequence = state_sequence.wrapping_add(1);
                    let msg = StateMsg::from_status(
                        state_sequence,
                        timebase.unix_us(),
                        &engine.status(),
                    );
                    queue_line(&mut send_buf, &msg);
                    last_publish = Instant::now();
                }

                if !drop_client && !send_buf.is_empty() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                framer = LineFramer::new();
                send_buf.clear();
                send_offset = 0;
                BRIDGE_CONNECTED.set(0.0);
            }

            std::thread::sleep(Duration::from_millis(5));
        }
        BRIDGE_CONNECTED.set(0.0);
        info!("Bridge stopped");
    }
}

/// Binds and serves until `stop` is set.
pub fn run_bridge(
    engine: Arc<RigEngine>,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    Bridge::bind(config)?.run(engine, stop);
    Ok(())
}

fn queue_line<T: serde::Serialize>(send_buf: &mut Vec<u8>, msg: &T) {
    match serde_json::to_vec(msg) {
        Ok(line) => {
            send_buf.extend_from_slice(&line);
            send_buf.push(b'\n');
        }
        Err(e) => warn!(error = %e, "Failed to encode bridge message"),
    }
}

/// Handles every complete line buffered in `framer`. A line that is not UTF-8,
/// or that outgrows the framer's cap before its newline, is rejected.
fn take_replies<F>(framer: &mut LineFramer, engine: &RigEngine, on_command: &mut F) -> Vec<ResultMsg>
where
    F: FnMut(&Command, &ResultMsg),
{
    let mut replies = Vec::new();
    while let Some(line) = framer.next_line() {
        match line {
            Ok(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    replies.push(handle_line(engine, trimmed, on_command));
                }
            }
            Err(e) => replies.push(rejected(e)),
        }
    }
    replies
}

fn handle_line<F>(engine: &RigEngine, line: &str, on_command: &mut F) -> ResultMsg
where
    F: FnMut(&Command, &ResultMsg),
{
    match IncomingMessage::parse(line) {
        Ok(msg) => {
            let reply = dispatch(engine, &msg.command);
            let result = if reply.ok { "ok" } else { "failed" };
            BRIDGE_COMMANDS.with_label_values(&[result]).inc();
            on_command(&msg.command, &reply);
            reply
        }
        Err(e) => rejected(e),
    }
}

fn rejected(reason: impl std::fmt::Display) -> ResultMsg {
    warn!(error = %reason, "Rejected bridge message");
    BRIDGE_COMMANDS.with_label_values(&["rejected"]).inc();
    ResultMsg::failed("invalid", reason.to_string())
}

/// Applies one command to the engine and describes the outcome for the client.
#[instrument(skip_all, fields(command = command.name()))]
pub fn dispatch(engine: &RigEngine, command: &Command) -> ResultMsg {
    let name = command.name();
    let reply = match command {
        Command::ListPorts => engine
            .port_choices()
            .map(|ports| ResultMsg::ok(name, format!("{} choices", ports.len())).with_ports(ports)),
        Command::ConnectSensor { port } => engine.connect_sensor(port).map(|o| connected(name, o)),
        Command::ConnectMotor { port } => engine.connect_motor(port).map(|o| connected(name, o)),
        Command::DisconnectSensor => engine.disconnect_sensor().map(|stats| {
            ResultMsg::ok(
                name,
                format!(
                    "{} samples, {} dropped",
                    stats.samples_appended,
                    stats.decode_drops + stats.io_drops
                ),
            )
        }),
        Command::DisconnectMotor => engine
            .disconnect_motor()
            .map(|()| ResultMsg::ok(name, "motor disconnected")),
        Command::StartRamp(program) => engine
            .start_ramp(*program)
            .map(|()| ResultMsg::ok(name, "ramp started")),
        Command::StopRamp => Ok(if engine.stop_ramp() {
            ResultMsg::ok(name, "stop requested")
        } else {
            ResultMsg::ok(name, NO_RAMP_RUNNING)
        }),
        Command::Export { label } => engine.export_now(label).map(|id| ResultMsg::ok(name, id)),
    };
    reply.unwrap_or_else(|e| {
        debug!(error = %e, "Command failed");
        ResultMsg::failed(name, e.to_string())
    })
}

fn connected(name: &str, outcome: ConnectOutcome) -> ResultMsg {
    match outcome {
        ConnectOutcome::Connected { port } => ResultMsg::ok(name, format!("connected on {port}")),
        ConnectOutcome::NotSelected => ResultMsg::ok(name, "no port selected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viscox_core::channel_sim::{SimulatedRig, SIM_MOTOR_PORT};
    use viscox_core::engine::EngineConfig;
    use viscox_core::export::MemoryExporter;
    use viscox_core::ramp::RampProgram;

    fn engine() -> RigEngine {
        RigEngine::new(
            Arc::new(SimulatedRig::new()),
            Arc::new(MemoryExporter::new()),
            EngineConfig::default(),
        )
    }

    #[test]
    fn failures_become_failed_results() {
        let engine = engine();
        let reply = dispatch(
            &engine,
            &Command::StartRamp(RampProgram {
                start_rpm: 10.0,
                end_rpm: 20.0,
                steps: 1,
                step_duration_s: 0.0,
                interval_duration_s: 0.0,
            }),
        );
        assert!(!reply.ok);
        assert_eq!(reply.command, "start_ramp");
        assert_eq!(reply.detail, "motor is not connected");
    }

    #[test]
    fn list_ports_carries_choices() {
        let reply = dispatch(&engine(), &Command::ListPorts);
        assert!(reply.ok);
        let ports = reply.ports.unwrap();
        assert_eq!(ports[0], "none");
        assert!(ports.iter().any(|p| p == SIM_MOTOR_PORT));
    }

    #[test]
    fn sentinel_connect_is_not_an_error() {
        let reply = dispatch(
            &engine(),
            &Command::ConnectSensor {
                port: "none".into(),
            },
        );
        assert!(reply.ok);
        assert_eq!(reply.detail, "no port selected");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let engine = engine();
        let mut seen = 0;
        let reply = handle_line(&engine, "{not json", &mut |_: &Command, _: &ResultMsg| seen += 1);
        assert!(!reply.ok);
        assert_eq!(reply.command, "invalid");
        assert_eq!(seen, 0);
    }

    #[test]
    fn unterminated_flood_is_dropped_and_the_session_recovers() {
        use crate::serial::MAX_LINE_BYTES;

        let engine = engine();
        let mut framer = LineFramer::new();
        let mut seen = Vec::new();
        let mut on_command = |command: &Command, _: &ResultMsg| seen.push(command.name());

        framer.push(&vec![b'{'; MAX_LINE_BYTES + 1]);
        let replies = take_replies(&mut framer, &engine, &mut on_command);
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].ok);
        assert_eq!(replies[0].command, "invalid");
        assert_eq!(framer.pending_len(), 0);

        framer.push(b"{\"type\":\"stop_ramp\"}\r\n\n");
        let replies = take_replies(&mut framer, &engine, &mut on_command);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].ok);
        assert_eq!(replies[0].detail, NO_RAMP_RUNNING);
        assert_eq!(seen, vec!["stop_ramp"]);
    }
}
