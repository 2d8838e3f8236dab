// Orchestrates a single job end to end: request validation, server queue
// setup, context initialization, metadata variables, step resolution and
// execution, and terminal completion reporting.

use agent_common::constants::{self, WellKnownDirectory};
use agent_common::{HostContext, NonRetryableError, ShutdownReason, TaskResult};
use agent_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::execution_context::{ExecutionContext, ExecutionGlobals};
use crate::job_extension::JobExtension;
use crate::job_server::JobServer;
use crate::messages::JobRequestMessage;
use crate::server_queue::JobServerQueue;
use crate::steps_runner::StepsRunner;
use crate::variables::Variables;

/// Attempts for the terminal job-completed event.
const COMPLETE_JOB_RETRY_LIMIT: u32 = 5;
/// Delay between completion attempts.
const COMPLETE_JOB_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Runs one job to completion and reports the result.
pub struct JobRunner {
    host_context: Arc<HostContext>,
}

impl JobRunner {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self { host_context }
    }

    /// Run the job. Never returns an error; every failure mode folds into
    /// the returned result.
    ///
    /// `metadata_rx` carries console-cadence updates from job metadata
    /// messages the listener forwards while the job runs.
    pub async fn run(
        &self,
        mut message: JobRequestMessage,
        job_cancel_token: CancellationToken,
        server: Arc<dyn JobServer>,
        metadata_rx: Option<tokio::sync::watch::Receiver<Duration>>,
    ) -> TaskResult {
        let trace = self.host_context.get_trace("JobRunner");

        if let Err(e) = message.validate() {
            trace.error(&format!("Invalid job request: {e:#}"));
            return TaskResult::Failed;
        }

        trace.info(&format!(
            "Starting job: {} ({})",
            message.job_display_name, message.job_id
        ));

        // On-premises control planes may advertise a host the agent cannot
        // reach; rewrite matching resource URLs onto the locally configured
        // server URL.
        self.rewrite_on_prem_urls(&mut message, &trace);

        let queue = JobServerQueue::new(
            Arc::clone(&server),
            message.plan_id,
            message.timeline_id,
            self.host_context.get_trace("JobServerQueue"),
        );
        queue.start();

        if let Some(mut rx) = metadata_rx {
            let queue_for_updates = Arc::clone(&queue);
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let delay = *rx.borrow();
                    queue_for_updates.set_post_lines_frequency(delay);
                }
            });
        }

        let variables =
            Variables::from_request(&message.variables, &self.host_context.secret_masker);
        self.register_mask_hints(&message);

        let work_directory = self.host_context.get_directory(WellKnownDirectory::Work);
        let temp_directory = self.host_context.get_directory(WellKnownDirectory::Temp);
        let tools_directory = self.host_context.get_directory(WellKnownDirectory::Tools);
        let diag_directory = self.host_context.get_directory(WellKnownDirectory::Diag);

        let write_debug = variables
            .get_boolean(constants::variables::system::DEBUG)
            .unwrap_or(false);

        let globals = Arc::new(ExecutionGlobals {
            variables,
            endpoints: message.resources.endpoints.clone(),
            repositories: message.resources.repositories.clone(),
            secure_files: message.resources.secure_files.clone(),
            containers: message.resources.containers.clone(),
            plan_id: message.plan_id,
            timeline_id: message.timeline_id,
            job_id: message.job_id,
            request_id: message.request_id,
            job_display_name: message.job_display_name.clone(),
            job_cancel_token: job_cancel_token.clone(),
            server_queue: Arc::clone(&queue),
            diag_directory,
            work_directory: work_directory.clone(),
            temp_directory,
            tools_directory,
            write_debug,
        });

        let mut job_context =
            ExecutionContext::new_job(Arc::clone(&self.host_context), globals, message.job_id);
        job_context.start(Some(&message.job_display_name));

        // The work root must be usable before anything touches it.
        if let Err(e) = self.validate_work_directory(&work_directory) {
            job_context.error(&format!(
                "The work directory '{}' is not usable: {e:#}",
                work_directory.display()
            ));
            let result = job_context.complete(Some(TaskResult::Failed));
            return self.finalize(job_context, &message, queue, server, result).await;
        }

        self.populate_agent_variables(&job_context);
        self.start_detection_commands(&mut job_context);

        // Resolve concrete executable steps.
        let extension = JobExtension::new();
        let prepared = match extension.initialize_job(&mut job_context, &message) {
            Ok(prepared) => prepared,
            Err(e) => {
                let result = if job_cancel_token.is_cancelled() {
                    job_context.output("Job initialization was canceled.");
                    TaskResult::Canceled
                } else {
                    job_context.error(&format!("Job initialization failed: {e:#}"));
                    TaskResult::Failed
                };
                let result = job_context.complete(Some(result));
                extension.finalize_job(&mut job_context);
                return self.finalize(job_context, &message, queue, server, result).await;
            }
        };

        let fail_on_shutdown = job_context
            .global()
            .variables
            .get_boolean("agent.failonagentshutdown")
            .unwrap_or(false);

        StepsRunner::new(fail_on_shutdown)
            .run(&mut job_context, prepared)
            .await;

        // A shutdown that interrupted the job surfaces as a job issue with
        // the reason.
        if let Some(reason) = self.host_context.agent_shutdown_reason() {
            let message = match reason {
                ShutdownReason::UserCancelled => {
                    "The agent was asked to shut down; the job has been stopped."
                }
                ShutdownReason::OperatingSystemShutdown => {
                    "The operating system is shutting down; the job has been stopped."
                }
            };
            job_context.error(message);
        }

        // One last throttling check so short jobs still get the warning.
        if let Some(delay) = queue.check_throttling() {
            job_context.warning(&format!(
                "The server throttled uploads from this job by a total of {}s.",
                delay.as_secs()
            ));
        }

        extension.finalize_job(&mut job_context);

        let result = job_context.complete(None);
        self.finalize(job_context, &message, queue, server, result).await
    }

    /// Finalization shared by all exit paths: diagnostic upload, queue
    /// drain, and the terminal completion event with retries.
    async fn finalize(
        &self,
        job_context: ExecutionContext,
        message: &JobRequestMessage,
        queue: Arc<JobServerQueue>,
        server: Arc<dyn JobServer>,
        result: TaskResult,
    ) -> TaskResult {
        let trace = self.host_context.get_trace("JobRunner");

        let diagnostic = job_context
            .global()
            .variables
            .get_boolean(constants::variables::agent::DIAGNOSTIC)
            .or_else(|| {
                std::env::var(constants::env_vars::DIAGNOSTIC)
                    .ok()
                    .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
            })
            .unwrap_or(false);
        if diagnostic {
            self.upload_diagnostic_logs(&job_context, &queue);
        }

        queue.shutdown().await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match server
                .raise_job_completed(message.plan_id, message.job_id, result)
                .await
            {
                Ok(()) => {
                    trace.info(&format!("Job completed with result: {result}"));
                    return result;
                }
                Err(e) => {
                    if e.downcast_ref::<NonRetryableError>().is_some() {
                        trace.error(&format!(
                            "Job completion rejected by the control plane: {e:#}"
                        ));
                        return TaskResult::Failed;
                    }
                    if attempt >= COMPLETE_JOB_RETRY_LIMIT {
                        trace.error(&format!(
                            "Failed to report job completion after {attempt} attempts: {e:#}"
                        ));
                        return TaskResult::Failed;
                    }
                    trace.warning(&format!(
                        "Failed to report job completion (attempt {attempt}/{COMPLETE_JOB_RETRY_LIMIT}): {e:#}"
                    ));
                    tokio::time::sleep(COMPLETE_JOB_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Register literal and regex mask hints from the request.
    fn register_mask_hints(&self, message: &JobRequestMessage) {
        let masker = &self.host_context.secret_masker;
        let trace = self.host_context.get_trace("JobRunner");

        for hint in &message.mask_hints {
            match hint.hint_type {
                crate::messages::MaskHintType::Literal => {
                    masker.add_value(&hint.value, "MaskHint");
                }
                crate::messages::MaskHintType::Regex => {
                    if let Err(e) = masker.add_regex(&hint.value, "MaskHint") {
                        trace.warning(&format!("Dropping unparseable mask hint: {e}"));
                    }
                }
            }
        }

        // Endpoint authorization parameters are always secrets.
        for endpoint in &message.resources.endpoints {
            if let Some(ref auth) = endpoint.authorization {
                for (key, value) in &auth.parameters {
                    if !value.is_empty() {
                        masker.add_value(value, &format!("Endpoint:{}:{key}", endpoint.name));
                    }
                }
            }
        }

        // Container registry passwords and secure-file tickets too.
        for container in &message.resources.containers {
            if let Some(ref creds) = container.credentials {
                if !creds.password.is_empty() {
                    masker.add_value(&creds.password, &format!("Container:{}", container.alias));
                }
            }
        }
        for file in &message.resources.secure_files {
            if !file.ticket.is_empty() {
                masker.add_value(&file.ticket, &format!("SecureFile:{}", file.name));
            }
        }
    }

    /// Rewrite scheme/host of resource URLs that point at the control
    /// plane's advertised host onto the locally configured server URL.
    fn rewrite_on_prem_urls(&self, message: &mut JobRequestMessage, trace: &agent_common::Tracing) {
        let on_prem = message
            .variables
            .get(constants::variables::system::SERVER_TYPE)
            .map(|v| v.value.eq_ignore_ascii_case("OnPremises"))
            .unwrap_or(false);
        if !on_prem {
            return;
        }

        let store = agent_common::ConfigurationStore::new(&self.host_context);
        let local_url = match store.get_settings().ok().and_then(|s| Url::parse(&s.server_url).ok())
        {
            Some(url) => url,
            None => return,
        };

        let advertised_host = match message
            .system_connection()
            .and_then(|e| Url::parse(&e.url).ok())
            .and_then(|u| u.host_str().map(str::to_lowercase))
        {
            Some(host) => host,
            None => return,
        };

        let mut rewritten = 0usize;
        for url in message
            .resources
            .endpoints
            .iter_mut()
            .map(|e| &mut e.url)
            .chain(message.resources.repositories.iter_mut().map(|r| &mut r.url))
        {
            if let Some(updated) = rewrite_matching_url(url, &advertised_host, &local_url) {
                *url = updated;
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            trace.info(&format!(
                "Rewrote {rewritten} resource URL(s) onto the configured server URL."
            ));
        }
    }

    /// The work root must exist and be writable.
    fn validate_work_directory(&self, work_directory: &std::path::Path) -> anyhow::Result<()> {
        agent_sdk::IOUtil::create_directory(work_directory)?;
        let probe = work_directory.join(format!(".permissions_check_{}", Uuid::new_v4().simple()));
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }

    /// Agent metadata the job can read back as variables.
    fn populate_agent_variables(&self, job_context: &ExecutionContext) {
        let global = job_context.global();
        let vars = &global.variables;
        let set = |name: &str, value: String| {
            vars.set(name, value, false, true, false);
        };

        let store = agent_common::ConfigurationStore::new(&self.host_context);
        if let Ok(settings) = store.get_settings() {
            set(constants::variables::agent::ID, settings.agent_id.to_string());
            set(constants::variables::agent::NAME, settings.agent_name);
        }

        let machine = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        set(constants::variables::agent::MACHINE_NAME, machine);
        set(
            constants::variables::agent::OS,
            constants::CURRENT_PLATFORM.to_string(),
        );
        set(
            constants::variables::agent::OS_ARCHITECTURE,
            constants::CURRENT_ARCHITECTURE.to_string(),
        );
        set(constants::variables::agent::SELF_HOSTED, "true".to_string());
        set(
            constants::variables::agent::VERSION,
            agent_sdk::AgentPackage::VERSION.to_string(),
        );
        set(
            constants::variables::agent::TOOLS_DIRECTORY,
            global.tools_directory.to_string_lossy().to_string(),
        );
        set(
            constants::variables::agent::WORK_FOLDER,
            global.work_directory.to_string_lossy().to_string(),
        );
        set(
            constants::variables::agent::TEMP_DIRECTORY,
            global.temp_directory.to_string_lossy().to_string(),
        );

        let proxy = &self.host_context.web_proxy;
        if let Some(ref address) = proxy.https_proxy_address.clone().or(proxy.http_proxy_address.clone()) {
            set(constants::variables::agent::PROXY_URL, address.clone());
            if let Some(ref username) = proxy.https_proxy_username.clone().or(proxy.http_proxy_username.clone()) {
                set(constants::variables::agent::PROXY_USERNAME, username.clone());
            }
            if let Some(password) = proxy.https_proxy_password.clone().or(proxy.http_proxy_password.clone()) {
                vars.set(
                    constants::variables::agent::PROXY_PASSWORD,
                    password,
                    true,
                    true,
                    false,
                );
            }
        }
    }

    /// Opportunistic environment detection, queued as background work.
    /// Failures are non-fatal and drained before the first step.
    fn start_detection_commands(&self, job_context: &mut ExecutionContext) {
        let trace = self.host_context.get_trace("EnvironmentDetection");
        let vars = job_context.global().variables.clone();

        let handle = tokio::spawn(async move {
            let in_container = std::path::Path::new("/.dockerenv").exists()
                || std::path::Path::new("/run/.containerenv").exists();
            if in_container {
                trace.info("Detected a container environment.");
                vars.set("agent.iscontainer", "true", false, true, false);
            }
            Ok(())
        });
        job_context.add_async_command("DetectContainerEnvironment", handle);
    }

    /// Queue the worker's diag pages for upload against the job record.
    fn upload_diagnostic_logs(&self, job_context: &ExecutionContext, queue: &Arc<JobServerQueue>) {
        let diag = job_context.global().diag_directory.clone();
        let pages = diag.join(agent_common::paging_logger::PAGING_FOLDER);
        if let Ok(entries) = std::fs::read_dir(&pages) {
            for entry in entries.flatten() {
                queue.queue_log_upload(job_context.record_id(), entry.path());
            }
        }
    }
}

/// Replace scheme/host/port of `raw` with those of `local` when its host
/// equals `advertised_host`, preserving path and query.
fn rewrite_matching_url(raw: &str, advertised_host: &str, local: &Url) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if host != advertised_host {
        return None;
    }

    let mut updated = parsed;
    updated.set_scheme(local.scheme()).ok()?;
    updated.set_host(local.host_str()).ok()?;
    updated.set_port(local.port()).ok()?;
    Some(updated.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        JobResources, ServiceEndpoint, StepDescriptor, StepKind, VariableValueMessage,
    };
    use crate::server_queue::test_support::FakeJobServer;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn script_step(name: &str, script: &str) -> StepDescriptor {
        StepDescriptor {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
            ref_name: String::new(),
            condition: String::new(),
            timeout_in_minutes: 0,
            continue_on_error: false,
            target: None,
            kind: StepKind::Script,
            reference: None,
            script: Some(script.to_string()),
            inputs: HashMap::new(),
            environment: HashMap::new(),
        }
    }

    fn message_with(steps: Vec<StepDescriptor>) -> JobRequestMessage {
        JobRequestMessage {
            request_id: 1,
            plan_id: Uuid::new_v4(),
            timeline_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_display_name: "Build".into(),
            job_ref_name: "__build".into(),
            steps,
            variables: HashMap::<String, VariableValueMessage>::new(),
            resources: JobResources {
                endpoints: vec![ServiceEndpoint {
                    name: "SystemVssConnection".into(),
                    url: "https://pipelines.example.com".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            mask_hints: Vec::new(),
        }
    }

    fn runner_in(dir: &std::path::Path) -> JobRunner {
        let host = HostContext::new("Worker");
        host.set_root_override(dir.to_path_buf());
        JobRunner::new(host)
    }

    #[tokio::test]
    async fn runs_a_job_and_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let runner = runner_in(dir.path());

        let message = message_with(vec![script_step("Say hi", "echo hello")]);
        let job_id = message.job_id;
        let result = runner
            .run(message, CancellationToken::new(), server.clone(), None)
            .await;

        assert_eq!(result, TaskResult::Succeeded);
        let completions = server.completions.lock().clone();
        assert_eq!(completions, vec![(job_id, TaskResult::Succeeded)]);
        assert!(server
            .console_text()
            .iter()
            .any(|l| l.contains("hello")));
    }

    #[tokio::test]
    async fn invalid_request_fails_without_reaching_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let runner = runner_in(dir.path());

        let mut message = message_with(vec![script_step("Step", "true")]);
        message.steps.clear();
        let result = runner
            .run(message, CancellationToken::new(), server.clone(), None)
            .await;

        assert_eq!(result, TaskResult::Failed);
        assert!(server.completions.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_event_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        *server.fail_completions.lock() = 2;
        let runner = runner_in(dir.path());

        let message = message_with(vec![script_step("Quick", "true")]);
        let result = runner
            .run(message, CancellationToken::new(), server.clone(), None)
            .await;

        assert_eq!(result, TaskResult::Succeeded);
        assert_eq!(server.completions.lock().len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_completion_error_returns_failed() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        server.non_retryable_completion.store(true, Ordering::SeqCst);
        let runner = runner_in(dir.path());

        let message = message_with(vec![script_step("Quick", "true")]);
        let result = runner
            .run(message, CancellationToken::new(), server.clone(), None)
            .await;

        assert_eq!(result, TaskResult::Failed);
        assert!(server.completions.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_step_fails_the_job_and_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let runner = runner_in(dir.path());

        let message = message_with(vec![script_step("Breaks", "exit 3")]);
        let job_id = message.job_id;
        let result = runner
            .run(message, CancellationToken::new(), server.clone(), None)
            .await;

        assert_eq!(result, TaskResult::Failed);
        assert_eq!(
            server.completions.lock().clone(),
            vec![(job_id, TaskResult::Failed)]
        );
    }

    #[test]
    fn url_rewrite_preserves_path_and_query() {
        let local = Url::parse("https://tfs.internal.corp:8443/tfs").unwrap();
        let rewritten = rewrite_matching_url(
            "https://advertised.example.com/collection/_apis/build?id=7",
            "advertised.example.com",
            &local,
        )
        .unwrap();
        assert_eq!(
            rewritten,
            "https://tfs.internal.corp:8443/collection/_apis/build?id=7"
        );
    }

    #[test]
    fn url_rewrite_ignores_other_hosts() {
        let local = Url::parse("https://tfs.internal.corp/tfs").unwrap();
        assert!(rewrite_matching_url(
            "https://github.com/org/repo",
            "advertised.example.com",
            &local,
        )
        .is_none());
    }
}
