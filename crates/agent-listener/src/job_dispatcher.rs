// Worker process supervision: spawns the per-job worker, owns the IPC
// channel, routes cancel/metadata messages, and watches for exit. At most
// one worker exists per listener at any instant.

use agent_common::constants::{WellKnownDirectory, WORKER_SPAWN_CLIENT_TAG};
use agent_common::process_channel::{
    unique_pipe_names, ChannelReceiver, ChannelSender, JobCancelBody, JobCompletedBody,
    JobMetadataBody, MessageType, ProcessChannelServer,
};
use agent_common::{HostContext, ShutdownReason, TaskResult, Tracing};
use agent_sdk::TraceWriter;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long the dispatcher waits for the spawned worker to connect.
const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between a shutdown message and force-termination.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Minimal view of a job request message; the full body is forwarded to
/// the worker verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestRef {
    #[serde(default)]
    pub job_id: Uuid,
    #[serde(default)]
    pub request_id: u64,
    #[serde(default)]
    pub job_display_name: String,
}

/// What became of a dispatched worker.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub job_id: Uuid,
    pub request_id: u64,
    pub exit_code: i32,
    /// The result carried by the worker's `JobCompleted` message, if one
    /// arrived before exit.
    pub result: Option<TaskResult>,
    /// The worker exited without reporting completion.
    pub crashed: bool,
}

/// The record of the one active worker.
struct ActiveWorker {
    job_id: Uuid,
    sender: Arc<Mutex<ChannelSender>>,
    kill_token: CancellationToken,
    monitor: Option<JoinHandle<WorkerOutcome>>,
}

/// Controls the single-worker invariant and translates listener messages
/// into process signals.
pub struct JobDispatcher {
    host_context: Arc<HostContext>,
    trace: Tracing,
    active: Arc<Mutex<Option<ActiveWorker>>>,
    run_once_tx: Option<mpsc::Sender<WorkerOutcome>>,
}

impl JobDispatcher {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        let trace = host_context.get_trace("JobDispatcher");
        Self {
            host_context,
            trace,
            active: Arc::new(Mutex::new(None)),
            run_once_tx: None,
        }
    }

    /// Set the channel notified when a dispatched worker finishes. Used by
    /// the run-once mode to break out of the poll loop.
    pub fn set_run_once_channel(&mut self, tx: mpsc::Sender<WorkerOutcome>) {
        self.run_once_tx = Some(tx);
    }

    /// Whether a worker is currently active.
    pub async fn is_busy(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Spawn a worker for the job and hand it the request over IPC.
    pub async fn run(&self, job_ref: &JobRequestRef, raw_body: &str) -> Result<()> {
        {
            let active = self.active.lock().await;
            if let Some(ref worker) = *active {
                anyhow::bail!(
                    "A worker is already active for job {}; refusing to dispatch job {}",
                    worker.job_id,
                    job_ref.job_id
                );
            }
        }

        self.trace.info(&format!(
            "Dispatching job {} (request {}): {}",
            job_ref.job_id, job_ref.request_id, job_ref.job_display_name
        ));

        // One socket per direction, named uniquely per process and job.
        let (out_path, in_path) = unique_pipe_names(std::process::id(), Uuid::new_v4())
            .context("Failed to allocate IPC pipe names")?;
        let server = ProcessChannelServer::bind(&out_path, &in_path)
            .context("Failed to create the IPC channel for the worker")?;

        let worker_binary = self.find_worker_binary()?;
        self.trace.info(&format!(
            "Starting worker process: {} {} {} {}",
            worker_binary.display(),
            WORKER_SPAWN_CLIENT_TAG,
            out_path.display(),
            in_path.display()
        ));

        let mut child = tokio::process::Command::new(&worker_binary)
            .arg(WORKER_SPAWN_CLIENT_TAG)
            .arg(&out_path)
            .arg(&in_path)
            .stdin(std::process::Stdio::null())
            .spawn()
            .context("Failed to spawn the worker process")?;

        // The worker must connect before the job can be delivered.
        let channel = match tokio::time::timeout(WORKER_CONNECT_TIMEOUT, server.accept()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e).context("Worker IPC accept failed");
            }
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!(
                    "Worker did not connect within {}s",
                    WORKER_CONNECT_TIMEOUT.as_secs()
                );
            }
        };
        let (mut sender, receiver) = channel.split();

        sender
            .send(MessageType::NewJobRequest, raw_body)
            .await
            .context("Failed to send the job request to the worker")?;

        let kill_token = CancellationToken::new();
        let monitor = {
            let active = Arc::clone(&self.active);
            let run_once_tx = self.run_once_tx.clone();
            let trace = self.trace.clone();
            let kill_token = kill_token.clone();
            let job_id = job_ref.job_id;
            let request_id = job_ref.request_id;
            tokio::spawn(async move {
                let outcome =
                    monitor_worker(child, receiver, kill_token, job_id, request_id, trace).await;
                {
                    let mut guard = active.lock().await;
                    if guard.as_ref().map(|w| w.job_id == job_id).unwrap_or(false) {
                        *guard = None;
                    }
                }
                if let Some(tx) = run_once_tx {
                    let _ = tx.send(outcome.clone()).await;
                }
                outcome
            })
        };

        *self.active.lock().await = Some(ActiveWorker {
            job_id: job_ref.job_id,
            sender: Arc::new(Mutex::new(sender)),
            kill_token,
            monitor: Some(monitor),
        });

        Ok(())
    }

    /// Forward a cancel message to the active worker. Returns whether a
    /// cancellation was actually dispatched; the listener leaves the
    /// message undeleted otherwise so it is re-delivered.
    pub async fn cancel(&self, cancel: &JobCancelBody) -> bool {
        let sender = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(worker) if worker.job_id == cancel.job_id => Arc::clone(&worker.sender),
                Some(worker) => {
                    self.trace.info(&format!(
                        "Cancel for job {} does not match the active job {}.",
                        cancel.job_id, worker.job_id
                    ));
                    return false;
                }
                None => {
                    self.trace.info(&format!(
                        "Cancel for job {} arrived with no active worker.",
                        cancel.job_id
                    ));
                    return false;
                }
            }
        };

        let body = match serde_json::to_string(cancel) {
            Ok(body) => body,
            Err(_) => return false,
        };
        let send_result = sender.lock().await.send(MessageType::CancelRequest, &body).await;
        match send_result {
            Ok(()) => {
                self.trace
                    .info(&format!("Cancel dispatched to the worker for job {}.", cancel.job_id));
                true
            }
            Err(e) => {
                self.trace
                    .warning(&format!("Failed to send the cancel request: {e}"));
                false
            }
        }
    }

    /// Best-effort forward of a job metadata update to the active worker.
    pub async fn metadata_update(&self, metadata: &JobMetadataBody) {
        let sender = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(worker) => Arc::clone(&worker.sender),
                None => return,
            }
        };

        if let Ok(body) = serde_json::to_string(metadata) {
            if let Err(e) = sender
                .lock()
                .await
                .send(MessageType::JobMetadataUpdate, &body)
                .await
            {
                self.trace
                    .verbose(&format!("Failed to send the metadata update: {e}"));
            }
        }
    }

    /// Shut down the active worker, if any: send the shutdown message,
    /// wait out the grace period, then terminate. The channel is disposed
    /// before the process is reaped.
    pub async fn shutdown(&self) -> Option<WorkerOutcome> {
        let (sender, kill_token, monitor) = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(worker) => (
                    Arc::clone(&worker.sender),
                    worker.kill_token.clone(),
                    worker.monitor.take()?,
                ),
                None => return None,
            }
        };

        let message_type = match self.host_context.agent_shutdown_reason() {
            Some(ShutdownReason::OperatingSystemShutdown) => MessageType::OperatingSystemShutdown,
            _ => MessageType::AgentShutdown,
        };
        if let Err(e) = sender.lock().await.send(message_type, "{}").await {
            self.trace
                .verbose(&format!("Failed to send the shutdown message: {e}"));
        }

        // Dispose the channel before reaping the worker.
        {
            let mut active = self.active.lock().await;
            *active = None;
        }
        drop(sender);

        let outcome = match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, monitor).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                self.trace.error(&format!("Worker monitor task failed: {e}"));
                None
            }
            Err(_) => {
                self.trace.warning(&format!(
                    "Worker did not exit within the {}s grace period; terminating it.",
                    SHUTDOWN_GRACE_PERIOD.as_secs()
                ));
                kill_token.cancel();
                None
            }
        };

        if let Some(ref outcome) = outcome {
            self.trace.info(&format!(
                "Worker for job {} exited with code {}.",
                outcome.job_id, outcome.exit_code
            ));
        }
        outcome
    }

    fn find_worker_binary(&self) -> Result<PathBuf> {
        let bin_dir = self.host_context.get_directory(WellKnownDirectory::Bin);
        let name = format!("agent-worker{}", agent_sdk::io_util::EXE_EXTENSION);

        let candidate = bin_dir.join(&name);
        if candidate.exists() {
            return Ok(candidate);
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(dir) = exe_path.parent() {
                let candidate = dir.join(&name);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        Err(anyhow::anyhow!(
            "Worker binary '{}' not found in {}",
            name,
            bin_dir.display()
        ))
    }
}

/// Await the worker's exit, consuming `JobCompleted` from the channel along
/// the way. Exit before `JobCompleted` is a crash: the job is recorded as
/// failed with the exit code and the listener resumes polling.
async fn monitor_worker(
    mut child: tokio::process::Child,
    mut receiver: ChannelReceiver,
    kill_token: CancellationToken,
    job_id: Uuid,
    request_id: u64,
    trace: Tracing,
) -> WorkerOutcome {
    let pid = child.id();
    let mut job_result: Option<TaskResult> = None;
    let mut channel_open = true;
    let mut kill_sent = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                let exit_code = match status {
                    Ok(status) => {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1)
                        }
                        #[cfg(not(unix))]
                        {
                            status.code().unwrap_or(-1)
                        }
                    }
                    Err(_) => -1,
                };

                let crashed = job_result.is_none();
                if crashed {
                    trace.error(&format!(
                        "Worker for job {job_id} exited with code {exit_code} before reporting completion; recording the job as failed."
                    ));
                } else {
                    trace.info(&format!(
                        "Worker for job {job_id} exited with code {exit_code}."
                    ));
                }

                return WorkerOutcome {
                    job_id,
                    request_id,
                    exit_code,
                    result: job_result,
                    crashed,
                };
            }

            message = receiver.receive(CancellationToken::new()), if channel_open => {
                match message {
                    Ok(message) if message.message_type == MessageType::JobCompleted => {
                        match serde_json::from_str::<JobCompletedBody>(&message.body) {
                            Ok(body) => {
                                trace.info(&format!(
                                    "Job {} completed with result {}.",
                                    body.job_id, body.result
                                ));
                                job_result = Some(body.result);
                            }
                            Err(e) => {
                                trace.warning(&format!(
                                    "Malformed JobCompleted body from the worker: {e}"
                                ));
                            }
                        }
                    }
                    Ok(message) => {
                        trace.verbose(&format!(
                            "Ignoring unexpected {} from the worker.",
                            message.message_type
                        ));
                    }
                    Err(_) => {
                        // The worker closed its end; keep waiting for exit.
                        channel_open = false;
                    }
                }
            }

            _ = kill_token.cancelled(), if !kill_sent => {
                kill_sent = true;
                trace.warning(&format!("Force-terminating the worker for job {job_id}."));
                #[cfg(unix)]
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_common::process_channel::ProcessChannel;
    use agent_common::{SecretMasker, TraceManager};

    fn test_trace() -> Tracing {
        TraceManager::new(SecretMasker::new()).get("JobDispatcherTests")
    }

    /// Bind a channel pair and return the listener-side receiver plus the
    /// worker-side sender the test drives.
    async fn channel_pair(dir: &std::path::Path) -> (ChannelReceiver, ChannelSender) {
        let out = dir.join("out");
        let inp = dir.join("in");
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();
        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });
        let server_channel = server.accept().await.unwrap();
        let client_channel = client.await.unwrap();

        let (_listener_tx, listener_rx) = server_channel.split();
        let (worker_tx, _worker_rx) = client_channel.split();
        (listener_rx, worker_tx)
    }

    #[tokio::test]
    async fn exit_without_job_completed_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, _worker_tx) = channel_pair(dir.path()).await;

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("exit 7")
            .spawn()
            .unwrap();

        let outcome = monitor_worker(
            child,
            receiver,
            CancellationToken::new(),
            Uuid::new_v4(),
            5,
            test_trace(),
        )
        .await;

        assert!(outcome.crashed);
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.result, None);
    }

    #[tokio::test]
    async fn job_completed_before_exit_is_a_clean_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut worker_tx) = channel_pair(dir.path()).await;

        let job_id = Uuid::new_v4();
        let child = tokio::process::Command::new("sleep")
            .arg("0.4")
            .spawn()
            .unwrap();

        let body = serde_json::to_string(&JobCompletedBody {
            job_id,
            request_id: 5,
            result: TaskResult::Succeeded,
        })
        .unwrap();
        worker_tx
            .send(MessageType::JobCompleted, &body)
            .await
            .unwrap();

        let outcome = monitor_worker(
            child,
            receiver,
            CancellationToken::new(),
            job_id,
            5,
            test_trace(),
        )
        .await;

        assert!(!outcome.crashed);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.result, Some(TaskResult::Succeeded));
    }

    #[tokio::test]
    async fn kill_token_terminates_a_stuck_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, _worker_tx) = channel_pair(dir.path()).await;

        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let kill_token = CancellationToken::new();
        let killer = kill_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            killer.cancel();
        });

        let outcome = monitor_worker(
            child,
            receiver,
            kill_token,
            Uuid::new_v4(),
            5,
            test_trace(),
        )
        .await;

        assert!(outcome.crashed);
        assert_ne!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn second_dispatch_is_refused_while_a_worker_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let (_receiver, worker_tx) = channel_pair(dir.path()).await;

        let host = HostContext::new("Agent");
        let dispatcher = JobDispatcher::new(host);
        let active_job = Uuid::new_v4();
        *dispatcher.active.lock().await = Some(ActiveWorker {
            job_id: active_job,
            sender: Arc::new(Mutex::new(worker_tx)),
            kill_token: CancellationToken::new(),
            monitor: None,
        });

        let job_ref = JobRequestRef {
            job_id: Uuid::new_v4(),
            request_id: 2,
            job_display_name: "Second".into(),
        };
        let result = dispatcher.run(&job_ref, "{}").await;
        assert!(result.is_err());
        assert!(dispatcher.is_busy().await);
    }

    #[tokio::test]
    async fn cancel_with_a_matching_active_worker_is_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let inp = dir.path().join("in");
        let server = ProcessChannelServer::bind(&out, &inp).unwrap();
        let client = tokio::spawn({
            let (out, inp) = (out.clone(), inp.clone());
            async move { ProcessChannel::connect(&inp, &out).await.unwrap() }
        });
        let server_channel = server.accept().await.unwrap();
        let client_channel = client.await.unwrap();
        let (listener_tx, _listener_rx) = server_channel.split();
        let (_worker_tx, mut worker_rx) = client_channel.split();

        let host = HostContext::new("Agent");
        let dispatcher = JobDispatcher::new(host);
        let job_id = Uuid::new_v4();
        *dispatcher.active.lock().await = Some(ActiveWorker {
            job_id,
            sender: Arc::new(Mutex::new(listener_tx)),
            kill_token: CancellationToken::new(),
            monitor: None,
        });

        let dispatched = dispatcher
            .cancel(&JobCancelBody {
                job_id,
                timeout_seconds: None,
            })
            .await;
        assert!(dispatched);

        let frame = worker_rx.receive(CancellationToken::new()).await.unwrap();
        assert_eq!(frame.message_type, MessageType::CancelRequest);
        let body: JobCancelBody = serde_json::from_str(&frame.body).unwrap();
        assert_eq!(body.job_id, job_id);
    }

    #[tokio::test]
    async fn cancel_without_an_active_worker_reports_not_dispatched() {
        let host = HostContext::new("Agent");
        let dispatcher = JobDispatcher::new(host);

        let dispatched = dispatcher
            .cancel(&JobCancelBody {
                job_id: Uuid::new_v4(),
                timeout_seconds: None,
            })
            .await;
        assert!(!dispatched);
        assert!(!dispatcher.is_busy().await);
    }

    #[test]
    fn job_request_ref_parses_a_minimal_body() {
        let body = r#"{"jobId":"0d4ab9e9-6dc9-4f4a-8c6b-6c6f24b1b356","requestId":9,"jobDisplayName":"Build"}"#;
        let parsed: JobRequestRef = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.request_id, 9);
        assert_eq!(parsed.job_display_name, "Build");
    }
}
