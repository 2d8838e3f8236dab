// agent-listener: Main entry point and message loop for the Pipelines Agent.
//
// Architecture:
//   main → Agent::execute_command → configure / remove / reauth / run /
//   warmup / diagnostics / help / version
//   Agent::run → MessageListener (session + long-poll) → JobDispatcher →
//   worker process

pub mod agent;
pub mod command_settings;
pub mod control_plane;
pub mod error_throttler;
pub mod job_dispatcher;
pub mod message_listener;
pub mod self_updater;
