pub mod bridge;
pub mod export;
pub mod metrics;
pub mod protocol;
pub mod serial;

pub use bridge::{dispatch, run_bridge, Bridge, BridgeConfig};
pub use export::{read_record, CsvExporter, RecordSections};
pub use metrics::{init_metrics, serve_metrics};
pub use protocol::{Command, IncomingMessage, ParseError, ProtocolVersion, ResultMsg, StateMsg};
pub use serial::{LineFramer, SerialChannelFactory, SerialConfig};
