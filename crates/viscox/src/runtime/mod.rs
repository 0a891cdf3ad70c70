mod app;
mod config;
mod logging;
mod signals;
mod telemetry;

pub use app::run_from_args;
