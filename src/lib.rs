mod archive;
mod cli;
pub mod config;
pub mod download;
mod error;
mod logging;
pub mod orchestrator;
pub mod paths;
mod platform;
pub mod ports;
pub mod process;
pub mod runtime;
pub mod service;
pub mod settings;

use std::process::ExitCode;

use clap::Parser as _;

pub use error::{AppError, ErrorKind, Result};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use platform::get_arch_target;
pub use service::{ServiceKind, ServiceState, ServiceStatus};

/// Entry point of the `campp` binary.
pub fn run() -> ExitCode {
    let cli = cli::Cli::parse();

    let options = match cli.options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = paths::DataLayout::new(&options.data_dir).logs_dir();
    let _logging = match logging::init_logging(&log_dir, cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {}", e);
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async move {
        let orch = Orchestrator::new(options)?;
        cli::execute(&orch, cli.command).await
    });

    match outcome {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
