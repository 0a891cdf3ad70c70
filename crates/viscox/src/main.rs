mod infra {
    pub mod audit;
}
mod integrations {
    #[cfg(feature = "rerun")]
    pub mod rerun_viz;
}
mod runtime;

use std::process::ExitCode;

fn main() -> ExitCode {
    match runtime::run_from_args() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("viscox: {e}");
            ExitCode::FAILURE
        }
    }
}
