use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use viscox_core::channel_sim::{SimulatedRig, SIM_MOTOR_PORT, SIM_SENSOR_PORT};
use viscox_core::engine::{EngineConfig, RigEngine};
use viscox_core::export::MemoryExporter;
use viscox_io::bridge::{Bridge, BridgeConfig};

struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to bridge");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    fn next_message(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("bridge line");
        serde_json::from_str(&line).expect("bridge emits JSON lines")
    }

    /// Sends one command and returns its result, skipping interleaved state messages.
    fn call(&mut self, msg: Value) -> Value {
        let mut line = msg.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).unwrap();
        loop {
            let reply = self.next_message();
            if reply["type"] == "result" {
                return reply;
            }
        }
    }

    fn wait_for_state(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let msg = self.next_message();
            if msg["type"] == "state" && pred(&msg) {
                return msg;
            }
        }
        panic!("state condition not reached");
    }
}

#[test]
fn operator_session_over_the_bridge() {
    let rig = SimulatedRig::new();
    let exporter = MemoryExporter::new();
    let engine = Arc::new(RigEngine::new(
        Arc::new(rig.clone()),
        Arc::new(exporter.clone()),
        EngineConfig::default(),
    ));

    let bridge = Bridge::bind(BridgeConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        publish_interval: Duration::from_millis(20),
    })
    .expect("bind ephemeral port");
    let addr = bridge.local_addr().unwrap().to_string();

    let stop = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        let seen = Arc::clone(&seen);
        thread::spawn(move || {
            bridge.run_with(engine, stop, move |command, reply| {
                seen.lock()
                    .unwrap()
                    .push((command.name().to_string(), reply.ok));
            })
        })
    };

    let mut client = Client::connect(&addr);

    let ports = client.call(json!({"type": "list_ports"}));
    assert_eq!(ports["ok"], true);
    assert_eq!(ports["ports"], json!(["none", SIM_SENSOR_PORT, SIM_MOTOR_PORT]));

    let early = client.call(json!({"type": "start_ramp", "start_rpm": 10, "end_rpm": 20,
        "steps": 1, "step_duration_s": 0}));
    assert_eq!(early["ok"], false);
    assert_eq!(early["detail"], "motor is not connected");

    assert_eq!(
        client.call(json!({"type": "connect_sensor", "port": SIM_SENSOR_PORT}))["ok"],
        true
    );
    assert_eq!(
        client.call(json!({"type": "connect_motor", "port": SIM_MOTOR_PORT}))["ok"],
        true
    );
    client.wait_for_state(|s| s["sensor_port"] == SIM_SENSOR_PORT && s["sensor_samples"].as_u64() > Some(0));

    let started = client.call(json!({"type": "start_ramp", "start_rpm": 10, "end_rpm": 100,
        "steps": 10, "step_duration_s": 2, "interval_duration_s": 0}));
    assert_eq!(started["ok"], true, "{started}");
    client.wait_for_state(|s| s["run_state"] == "running");

    assert_eq!(client.call(json!({"type": "stop_ramp"}))["detail"], "stop requested");
    let idle = client.wait_for_state(|s| s["run_state"] == "idle");
    assert_eq!(idle["motor_rpm"], 0.0);

    let export = client.call(json!({"type": "export", "label": "session"}));
    assert_eq!(export["ok"], true);

    let garbage = client.call(json!({"type": "reboot"}));
    assert_eq!(garbage["command"], "invalid");

    assert_eq!(client.call(json!({"type": "disconnect_sensor"}))["ok"], true);
    assert_eq!(client.call(json!({"type": "disconnect_motor"}))["ok"], true);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    // the autosave may land before or after the manual export
    let mut labels: Vec<String> = exporter.records().into_iter().map(|r| r.label).collect();
    labels.sort();
    assert_eq!(labels, vec!["autosave", "session"]);
    assert_eq!(rig.setpoint_log().last(), Some(&0));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&("list_ports".to_string(), true)));
    assert!(!seen.iter().any(|(name, _)| name == "invalid"));
}
