// Entry point for the Pipelines Agent listener process.
//
// The listener is the persistent supervisor: it holds the control-plane
// session, pumps messages, and supervises at most one worker at a time.

use agent_common::constants::{self, return_code};
use agent_common::HostContext;
use std::sync::Arc;

use agent_listener::agent::Agent;
use agent_listener::command_settings::CommandSettings;

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Agent listener process starting.");
    tracing::info!("  Version  = {}", agent_sdk::AgentPackage::VERSION);
    tracing::info!("  Commit   = {}", agent_sdk::Source::COMMIT_HASH);
    tracing::info!(
        "  Platform = {} / {}",
        constants::CURRENT_PLATFORM,
        constants::CURRENT_ARCHITECTURE
    );

    let settings = CommandSettings::parse();
    let host_context = HostContext::new("Agent");
    let agent = Agent::new(Arc::clone(&host_context));

    match agent.execute_command(&settings).await {
        Ok(exit_code) => {
            tracing::info!("Agent exiting with code {exit_code}");
            exit_code
        }
        Err(e) => {
            // Unhandled pump failures exit retryable so the service host
            // restarts the process.
            tracing::error!("Agent failed: {e:#}");
            return_code::RETRYABLE_ERROR
        }
    }
}
