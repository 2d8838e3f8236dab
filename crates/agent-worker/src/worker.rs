// The worker process's top-level service: connects the IPC channel,
// receives the job request, runs it, listens for cancellation and metadata
// messages concurrently, and reports completion back to the listener.

use agent_common::constants::return_code;
use agent_common::process_channel::{
    ChannelReceiver, JobCompletedBody, JobMetadataBody, MessageType, ProcessChannel,
};
use agent_common::{HostContext, ShutdownReason, Tracing};
use agent_sdk::TraceWriter;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::job_runner::JobRunner;
use crate::job_server::{HttpJobServer, JobServer};
use crate::messages::JobRequestMessage;

/// The worker service. One instance runs one job, then the process exits.
pub struct Worker {
    host_context: Arc<HostContext>,
}

impl Worker {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self { host_context }
    }

    /// Main entry point. Returns the process exit code.
    pub async fn run(&self, pipe_in: &str, pipe_out: &str) -> Result<i32> {
        let trace = self.host_context.get_trace("Worker");
        trace.info("Connecting to the listener IPC channel...");

        // The worker writes on the listener's inbound socket and reads from
        // the listener's outbound socket.
        let channel = ProcessChannel::connect(Path::new(pipe_out), Path::new(pipe_in))
            .await
            .context("Failed to connect the IPC channel")?;
        let (mut sender, mut receiver) = channel.split();

        // The first frame must carry the job.
        let first = receiver
            .receive(CancellationToken::new())
            .await
            .context("Failed to receive the job message")?;
        if first.message_type != MessageType::NewJobRequest {
            anyhow::bail!(
                "Expected NewJobRequest as the first message, got {}",
                first.message_type
            );
        }

        let job_message: JobRequestMessage = serde_json::from_str(&first.body)
            .context("Failed to deserialize the job request message")?;
        trace.info(&format!(
            "Received job: {} ({})",
            job_message.job_display_name, job_message.job_id
        ));

        let system_connection = match job_message.system_connection() {
            Some(endpoint) => endpoint.clone(),
            None => {
                trace.error("The job request carries no system connection endpoint.");
                return Ok(return_code::TERMINATED_ERROR);
            }
        };
        let server: Arc<dyn JobServer> = Arc::new(HttpJobServer::new(
            system_connection.url.clone(),
            system_connection.access_token().cloned(),
        )?);

        // Cancellation and metadata flow from the listener while the job runs.
        let job_cancel = CancellationToken::new();
        let (metadata_tx, metadata_rx) = watch::channel(Duration::from_millis(500));
        let loop_stop = CancellationToken::new();

        let message_loop = tokio::spawn(Self::message_loop(
            receiver,
            Arc::clone(&self.host_context),
            job_cancel.clone(),
            metadata_tx,
            loop_stop.clone(),
            self.host_context.get_trace("Worker.MessageLoop"),
        ));

        let runner = JobRunner::new(Arc::clone(&self.host_context));
        let result = runner
            .run(job_message.clone(), job_cancel.clone(), server, Some(metadata_rx))
            .await;

        loop_stop.cancel();
        let _ = message_loop.await;

        // Tell the listener the job is done. Failure here is not a job
        // failure; the listener treats a silent exit as a crash.
        let completed = JobCompletedBody {
            job_id: job_message.job_id,
            request_id: job_message.request_id,
            result,
        };
        let body = serde_json::to_string(&completed)?;
        if let Err(e) = sender.send(MessageType::JobCompleted, &body).await {
            trace.warning(&format!("Failed to send JobCompleted to the listener: {e}"));
        }

        trace.info(&format!("Worker finished with job result: {result}"));
        Ok(return_code::SUCCESS)
    }

    /// Pump listener → worker messages until the channel closes or the job
    /// finishes.
    async fn message_loop(
        mut receiver: ChannelReceiver,
        host_context: Arc<HostContext>,
        job_cancel: CancellationToken,
        metadata_tx: watch::Sender<Duration>,
        stop: CancellationToken,
        trace: Tracing,
    ) {
        loop {
            let message = match receiver.receive(stop.clone()).await {
                Ok(message) => message,
                Err(agent_common::ChannelError::Cancelled) => break,
                Err(e) => {
                    trace.info(&format!("IPC channel closed: {e}"));
                    break;
                }
            };

            match message.message_type {
                MessageType::CancelRequest => {
                    trace.info("Received CancelRequest from the listener.");
                    job_cancel.cancel();
                }
                MessageType::AgentShutdown => {
                    trace.info("Received AgentShutdown from the listener.");
                    host_context.shutdown_agent(ShutdownReason::UserCancelled);
                    job_cancel.cancel();
                }
                MessageType::OperatingSystemShutdown => {
                    trace.info("Received OperatingSystemShutdown from the listener.");
                    host_context.shutdown_agent(ShutdownReason::OperatingSystemShutdown);
                    job_cancel.cancel();
                }
                MessageType::JobMetadataUpdate => {
                    match serde_json::from_str::<JobMetadataBody>(&message.body) {
                        Ok(body) => {
                            if let Some(millis) = body.post_lines_frequency_millis {
                                trace.info(&format!(
                                    "Updating console post frequency to {millis}ms."
                                ));
                                let _ = metadata_tx.send(Duration::from_millis(millis));
                            }
                        }
                        Err(e) => {
                            trace.warning(&format!("Ignoring malformed metadata update: {e}"));
                        }
                    }
                }
                other => {
                    trace.info(&format!("Ignoring unexpected message type: {other}"));
                }
            }
        }
    }
}

/// Validate the worker's positional arguments: the fixed `spawnclient` tag
/// and the two pipe names. Any deviation is a fatal startup error.
pub fn validate_args(mode: &str, pipe_in: &str, pipe_out: &str) -> Result<()> {
    if mode != agent_common::constants::WORKER_SPAWN_CLIENT_TAG {
        anyhow::bail!(
            "Unknown mode '{mode}'; the worker must be launched with '{}'",
            agent_common::constants::WORKER_SPAWN_CLIENT_TAG
        );
    }
    if pipe_in.trim().is_empty() || pipe_out.trim().is_empty() {
        anyhow::bail!("Both pipe names are required");
    }
    Ok(())
}
