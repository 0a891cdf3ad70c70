pub mod acquisition;
pub mod buffer;
pub mod channel;
#[cfg(feature = "simulation")]
pub mod channel_sim;
pub mod engine;
pub mod export;
pub mod ramp;
mod ramp_proptest;
pub mod render;
pub mod run_state;
pub mod setpoint;
pub mod tags;
pub mod timebase;

pub use acquisition::{AcquisitionConfig, AcquisitionHandle, AcquisitionStats, SensorAcquisitionLoop};
pub use buffer::{Sample, TelemetryBuffer};
pub use channel::{ChannelError, ChannelFactory, ChannelKind, DeviceChannel, SharedChannel};
#[cfg(feature = "simulation")]
pub use channel_sim::{SimConfig, SimRead, SimulatedRig};
pub use engine::{ConnectOutcome, EngineConfig, EngineError, EngineStatus, Precondition, RigEngine};
#[cfg(feature = "simulation")]
pub use export::MemoryExporter;
pub use export::{ExportError, Exporter};
pub use ramp::{RampConfig, RampOutcome, RampProgram, RampReport, RampStats};
pub use render::{RenderConfig, RenderSink};
pub use run_state::MotorRunState;
pub use setpoint::{RampLimits, Setpoint, SetpointViolation, Unvalidated, Validated};
pub use timebase::TimeBase;
