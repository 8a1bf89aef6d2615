//! `outflux`: loads a YAML configuration file, builds the output
//! registry from it, and runs the engine's event loop until `Ctrl-C` or
//! a configuration/startup error. Tasks are only ever injected
//! programmatically today (see `engine::TaskHandle`); this binary is a
//! runnable shell around the library crates, not a full agent.

mod plugins;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use context::Context;
use engine::{Command, Engine};
use plugins::DemoFactory;
use registry::Registry;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "outflux", about = "Runs the output registry's event loop against a YAML configuration file")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Identifier used for per-process log fields and metrics.
    #[arg(long, default_value = "outflux")]
    process_id: String,

    /// `tracing_subscriber::EnvFilter` directive, falling back to `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut registry = Registry::new();
    let factory = DemoFactory;
    if let Err(err) = config::load_into(&args.config, &mut registry, &factory) {
        tracing::error!(error = %err, "failed to load configuration");
        return ExitCode::from(1);
    }

    let engine = Engine::new(registry, args.process_id, Context::new());
    let (command_handler, command_rx, _task_handle, task_rx) = engine::channels();

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_handler.send(Command::StopAll);
        }
    });

    let result = engine.run(command_rx, task_rx, None).await;
    ctrl_c.abort();

    if let Err(err) = result {
        tracing::error!(error = %err, "engine exited with an error");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
