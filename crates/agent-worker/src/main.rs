// Entry point for the Pipelines Agent worker process.
//
// The worker is spawned by the listener with exactly three positional
// arguments: the literal mode tag `spawnclient`, the inbound pipe name, and
// the outbound pipe name. It receives one job over IPC, executes it, and
// exits.

use agent_common::constants::return_code;
use agent_common::HostContext;
use clap::Parser;
use std::sync::Arc;

use agent_worker::worker::{validate_args, Worker};

/// Command-line arguments for the worker process.
#[derive(Parser, Debug)]
#[command(name = "agent-worker", about = "Pipelines Agent Worker")]
struct Args {
    /// Mode tag; must be the literal `spawnclient`.
    mode: String,

    /// Pipe the worker receives messages on.
    pipe_in: String,

    /// Pipe the worker sends messages on.
    pipe_out: String,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(args).await });
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = validate_args(&args.mode, &args.pipe_in, &args.pipe_out) {
        tracing::error!("Invalid worker invocation: {e:#}");
        return return_code::TERMINATED_ERROR;
    }

    tracing::info!("Worker process starting.");
    tracing::info!("  pipeIn  = {}", args.pipe_in);
    tracing::info!("  pipeOut = {}", args.pipe_out);

    let host_context = HostContext::new("Worker");
    let worker = Worker::new(Arc::clone(&host_context));

    match worker.run(&args.pipe_in, &args.pipe_out).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            tracing::error!("Worker failed: {e:#}");
            return_code::TERMINATED_ERROR
        }
    }
}
