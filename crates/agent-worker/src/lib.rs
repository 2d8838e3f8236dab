// agent-worker: Job and step execution engine for the Pipelines Agent.
//
// Architecture:
//   Worker::run → JobRunner::run → JobExtension::initialize_job
//     → StepsRunner::run → per-step handler child processes
// Progress flows back through ExecutionContext → JobServerQueue → JobServer.

pub mod conditions;
pub mod execution_context;
pub mod handlers;
pub mod job_extension;
pub mod job_runner;
pub mod job_server;
pub mod messages;
pub mod server_queue;
pub mod steps_runner;
pub mod timeline;
pub mod variables;
pub mod worker;
