// The execution context: one logging + state scope per job or step. Each
// context owns its timeline record and paging log; contexts form a tree with
// linked cancellation. Shared job-wide state (variables, resources, the
// server queue) lives in `ExecutionGlobals` and is inherited by children.

use agent_common::{HostContext, PagingLogger, TaskResult};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::messages::{ContainerResource, RepositoryResource, SecureFileResource, ServiceEndpoint};
use crate::server_queue::JobServerQueue;
use crate::timeline::{Issue, IssueType, RecordType, TimelineRecord, TimelineRecordState};
use crate::variables::Variables;

/// Grace period between `force_task_complete` and the latch firing.
pub const FORCE_COMPLETE_GRACE: Duration = Duration::from_secs(5);

/// Issue data key carrying the log line the issue was written at.
pub const LOG_LINE_NUMBER_KEY: &str = "logFileLineNumber";

/// A fire-and-forget command attached to a context, drained at step or job
/// boundaries.
pub struct AsyncCommand {
    pub name: String,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

/// Shared mutable state for the entire job, inherited by all step contexts.
pub struct ExecutionGlobals {
    pub variables: Variables,
    pub endpoints: Vec<ServiceEndpoint>,
    pub repositories: Vec<RepositoryResource>,
    pub secure_files: Vec<SecureFileResource>,
    pub containers: Vec<ContainerResource>,

    pub plan_id: Uuid,
    pub timeline_id: Uuid,
    pub job_id: Uuid,
    pub request_id: u64,
    pub job_display_name: String,

    /// Fires when the job is canceled from the listener or the agent is
    /// shutting down.
    pub job_cancel_token: CancellationToken,

    pub server_queue: Arc<JobServerQueue>,

    pub diag_directory: PathBuf,
    pub work_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub tools_directory: PathBuf,

    pub write_debug: bool,
}

/// Options for `ExecutionContext::set_variable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetVariableOptions {
    pub is_secret: bool,
    pub is_output: bool,
    pub is_read_only: bool,
    pub preserve_case: bool,
}

/// A logging + state scope bound to one timeline record.
pub struct ExecutionContext {
    host_context: Arc<HostContext>,
    global: Arc<ExecutionGlobals>,

    record: TimelineRecord,

    /// Union of parent cancellation, an armed timeout, and explicit cancel.
    cancellation_token: CancellationToken,
    timeout_task: Option<JoinHandle<()>>,

    /// One-shot "give up waiting for this step" latch.
    force_completed: CancellationToken,
    force_complete_abort: CancellationToken,

    paging_logger: Option<PagingLogger>,
    line_count: u64,
    next_child_order: u32,

    /// Mirror console lines into the parent record's feed.
    forward_to_parent: bool,

    pub async_commands: Vec<AsyncCommand>,
}

impl ExecutionContext {
    /// Create the root (job-level) context.
    pub fn new_job(
        host_context: Arc<HostContext>,
        global: Arc<ExecutionGlobals>,
        record_id: Uuid,
    ) -> Self {
        let record = TimelineRecord::new(
            record_id,
            None,
            0,
            global.job_display_name.clone(),
            "__job".to_string(),
            RecordType::Job,
        );
        let cancellation_token = global.job_cancel_token.child_token();
        Self {
            host_context,
            global,
            record,
            cancellation_token,
            timeout_task: None,
            force_completed: CancellationToken::new(),
            force_complete_abort: CancellationToken::new(),
            paging_logger: None,
            line_count: 0,
            next_child_order: 1,
            forward_to_parent: false,
            async_commands: Vec::new(),
        }
    }

    /// Allocate a child context with a linked cancellation source, a fresh
    /// timeline record at the next child order, and its own paging log.
    pub fn create_child(
        &mut self,
        record_id: Uuid,
        display_name: &str,
        ref_name: &str,
        forward_output: bool,
    ) -> Self {
        let order = self.next_child_order;
        self.next_child_order += 1;

        let record = TimelineRecord::new(
            record_id,
            Some(self.record.id),
            order,
            display_name,
            ref_name,
            RecordType::Task,
        );

        Self {
            host_context: Arc::clone(&self.host_context),
            global: Arc::clone(&self.global),
            record,
            cancellation_token: self.cancellation_token.child_token(),
            timeout_task: None,
            force_completed: CancellationToken::new(),
            force_complete_abort: CancellationToken::new(),
            paging_logger: None,
            line_count: 0,
            next_child_order: 1,
            forward_to_parent: forward_output,
            async_commands: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn host_context(&self) -> &Arc<HostContext> {
        &self.host_context
    }

    pub fn global(&self) -> &Arc<ExecutionGlobals> {
        &self.global
    }

    pub fn record_id(&self) -> Uuid {
        self.record.id
    }

    pub fn record(&self) -> &TimelineRecord {
        &self.record
    }

    pub fn display_name(&self) -> &str {
        &self.record.name
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.record.result
    }

    /// Pre-set the result without completing the record.
    pub fn set_result(&mut self, result: TaskResult) {
        self.record.result = Some(result);
    }

    pub fn state(&self) -> TimelineRecordState {
        self.record.state
    }

    pub fn is_completed(&self) -> bool {
        self.record.state == TimelineRecordState::Completed
    }

    /// This context's cancellation token (parent ∪ timeout ∪ explicit).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// The job-level cancellation token.
    pub fn job_cancel_token(&self) -> CancellationToken {
        self.global.job_cancel_token.clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Mark the record in progress and push an immediate timeline update.
    /// Opens the paging log for this record.
    pub fn start(&mut self, operation: Option<&str>) {
        if !self.record.transition_to(TimelineRecordState::InProgress) {
            return;
        }
        self.record.start_time = Some(Utc::now());

        match PagingLogger::new(&self.global.diag_directory, self.global.timeline_id, self.record.id)
        {
            Ok(mut logger) => {
                let queue = Arc::clone(&self.global.server_queue);
                logger.set_on_page_complete(move |_, record_id, path| {
                    queue.queue_log_upload(record_id, PathBuf::from(path));
                });
                self.paging_logger = Some(logger);
            }
            Err(e) => {
                tracing::warn!("Failed to open paging log for {}: {e:#}", self.record.name);
            }
        }

        if let Some(operation) = operation {
            self.output(&format!("Starting: {operation}"));
        }

        self.global.server_queue.queue_timeline_update(self.record.clone());
    }

    /// Complete the record. If no result was supplied or pre-set, the record
    /// completes as `Succeeded`. Returns the final result.
    pub fn complete(&mut self, result: Option<TaskResult>) -> TaskResult {
        if self.is_completed() {
            return self.record.result.unwrap_or(TaskResult::Succeeded);
        }

        let final_result = result
            .or(self.record.result)
            .unwrap_or(TaskResult::Succeeded);
        self.record.result = Some(final_result);
        self.record.finish_time = Some(Utc::now());
        self.record.percent_complete = 100;
        self.record.transition_to(TimelineRecordState::Completed);

        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(mut logger) = self.paging_logger.take() {
            logger.end();
        }

        self.global.server_queue.queue_timeline_update(self.record.clone());
        final_result
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Write a line: count, mask, enqueue for the web console, append to the
    /// paging log, and optionally mirror to the parent feed. Returns the
    /// assigned line number. Line numbers within one context are strictly
    /// monotonic.
    pub fn write(&mut self, tag: Option<&str>, message: &str, mask: bool) -> u64 {
        self.line_count += 1;
        let line_number = self.line_count;

        let text = if mask {
            self.host_context.secret_masker.mask(message)
        } else {
            message.to_string()
        };
        let line = match tag {
            Some(tag) => format!("{tag}{text}"),
            None => text,
        };

        self.global
            .server_queue
            .queue_console_line(self.record.id, line_number, &line);

        if let Some(ref mut logger) = self.paging_logger {
            logger.write(&line);
        }

        if self.forward_to_parent {
            if let Some(parent_id) = self.record.parent_id {
                self.global
                    .server_queue
                    .queue_console_line(parent_id, line_number, &line);
            }
        }

        line_number
    }

    /// Write a plain output line.
    pub fn output(&mut self, message: &str) -> u64 {
        self.write(None, message, true)
    }

    /// Write a debug line; dropped unless the job runs with system.debug.
    pub fn debug(&mut self, message: &str) {
        if self.global.write_debug {
            self.write(Some("##[debug]"), message, true);
        }
    }

    /// Write a command echo line.
    pub fn command(&mut self, message: &str) -> u64 {
        self.write(Some("##[command]"), message, true)
    }

    /// Record an issue: mask, log under the severity tag, count, and append
    /// to the record's issue list if under the cap.
    pub fn add_issue(&mut self, issue_type: IssueType, message: &str) {
        let masked = self.host_context.secret_masker.mask(message);
        let tag = match issue_type {
            IssueType::Error => "##[error]",
            IssueType::Warning => "##[warning]",
        };
        // Already masked; don't pay for a second pass.
        let line_number = self.write(Some(tag), &masked, false);

        let mut issue = Issue::new(issue_type, masked);
        issue
            .data
            .insert(LOG_LINE_NUMBER_KEY.to_string(), line_number.to_string());
        self.record.add_issue(issue);

        self.global.server_queue.queue_timeline_update(self.record.clone());
    }

    pub fn error(&mut self, message: &str) {
        self.add_issue(IssueType::Error, message);
    }

    pub fn warning(&mut self, message: &str) {
        self.add_issue(IssueType::Warning, message);
    }

    /// Report progress (0–100) on the record.
    pub fn set_progress(&mut self, percent: u8) {
        self.record.percent_complete = percent.min(100);
        self.global.server_queue.queue_timeline_update(self.record.clone());
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Set a variable in the job-wide store. Outputs are additionally
    /// published under `{recordRefName}.{name}` and on this record.
    pub fn set_variable(&mut self, name: &str, value: &str, options: SetVariableOptions) {
        self.global.variables.set(
            name,
            value,
            options.is_secret,
            options.is_read_only,
            options.preserve_case,
        );

        if options.is_output {
            let qualified = format!("{}.{}", self.record.ref_name, name);
            self.global.variables.set(
                &qualified,
                value,
                options.is_secret,
                options.is_read_only,
                options.preserve_case,
            );
            let record_value = if options.is_secret {
                "***".to_string()
            } else {
                value.to_string()
            };
            self.record.variables.insert(name.to_string(), record_value);
            self.global.server_queue.queue_timeline_update(self.record.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Arm this context's cancellation to fire after `duration`.
    pub fn set_timeout(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        let token = self.cancellation_token.clone();
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            token.cancel();
        }));
    }

    /// Trigger cancellation of this context (not the parent).
    pub fn cancel_token(&self) {
        self.cancellation_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Force-complete latch
    // -----------------------------------------------------------------------

    /// Observable latch that fires a grace period after `force_task_complete`.
    pub fn force_completed_token(&self) -> CancellationToken {
        self.force_completed.clone()
    }

    /// Signal the one-shot completion latch. A waiter observing the latch
    /// unblocks after the grace period unless `cancel_force_task_completion`
    /// is called first.
    pub fn force_task_complete(&self) {
        let latch = self.force_completed.clone();
        let abort = self.force_complete_abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(FORCE_COMPLETE_GRACE) => latch.cancel(),
                _ = abort.cancelled() => {}
            }
        });
    }

    /// Withdraw a pending `force_task_complete`.
    pub fn cancel_force_task_completion(&self) {
        self.force_complete_abort.cancel();
    }

    // -----------------------------------------------------------------------
    // Async commands
    // -----------------------------------------------------------------------

    /// Attach a fire-and-forget command; drained at the step or job boundary.
    pub fn add_async_command(&mut self, name: impl Into<String>, handle: JoinHandle<anyhow::Result<()>>) {
        self.async_commands.push(AsyncCommand {
            name: name.into(),
            handle,
        });
    }

    /// Take the queued async commands for draining.
    pub fn take_async_commands(&mut self) -> Vec<AsyncCommand> {
        std::mem::take(&mut self.async_commands)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::server_queue::test_support::FakeJobServer;
    use agent_common::TraceManager;

    /// Build a root context over a fake server for tests.
    pub fn test_job_context(
        server: Arc<FakeJobServer>,
        tempdir: &std::path::Path,
    ) -> (ExecutionContext, Arc<JobServerQueue>, Arc<HostContext>) {
        let host_context = HostContext::new("Worker");
        let trace = TraceManager::new(host_context.secret_masker.clone()).get("Test");
        let queue = JobServerQueue::new(server, Uuid::new_v4(), Uuid::new_v4(), trace);

        let global = Arc::new(ExecutionGlobals {
            variables: Variables::with_masker(host_context.secret_masker.clone()),
            endpoints: Vec::new(),
            repositories: Vec::new(),
            secure_files: Vec::new(),
            containers: Vec::new(),
            plan_id: Uuid::new_v4(),
            timeline_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            request_id: 1,
            job_display_name: "Test job".to_string(),
            job_cancel_token: CancellationToken::new(),
            server_queue: Arc::clone(&queue),
            diag_directory: tempdir.join("_diag"),
            work_directory: tempdir.join("_work"),
            temp_directory: tempdir.join("_temp"),
            tools_directory: tempdir.join("_tool"),
            write_debug: false,
        });

        let context = ExecutionContext::new_job(Arc::clone(&host_context), global, Uuid::new_v4());
        (context, queue, host_context)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_job_context;
    use super::*;
    use crate::server_queue::test_support::FakeJobServer;

    #[tokio::test]
    async fn start_then_complete_walks_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());

        assert_eq!(ctx.state(), TimelineRecordState::Pending);
        ctx.start(None);
        assert_eq!(ctx.state(), TimelineRecordState::InProgress);
        assert!(ctx.record().start_time.is_some());

        let result = ctx.complete(None);
        assert_eq!(result, TaskResult::Succeeded);
        assert_eq!(ctx.state(), TimelineRecordState::Completed);
        assert_eq!(ctx.record().percent_complete, 100);

        queue.shutdown().await;
        let last = server.last_record(ctx.record_id()).unwrap();
        assert_eq!(last.state, TimelineRecordState::Completed);
        assert_eq!(last.result, Some(TaskResult::Succeeded));
    }

    #[tokio::test]
    async fn completing_twice_keeps_the_first_result() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        ctx.start(None);
        assert_eq!(ctx.complete(Some(TaskResult::Failed)), TaskResult::Failed);
        assert_eq!(ctx.complete(Some(TaskResult::Succeeded)), TaskResult::Failed);
    }

    #[tokio::test]
    async fn writes_are_masked_and_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, queue, host) = test_job_context(Arc::clone(&server), dir.path());

        host.secret_masker.add_value("s3cr3t-token", "test");
        ctx.start(None);
        let first = ctx.output("token is s3cr3t-token");
        let second = ctx.output("plain line");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        ctx.complete(None);

        queue.shutdown().await;
        let lines = server.console_text();
        assert!(lines.contains(&"token is ***".to_string()));
        assert!(lines.contains(&"plain line".to_string()));
        assert!(!lines.iter().any(|l| l.contains("s3cr3t-token")));
    }

    #[tokio::test]
    async fn issues_carry_log_line_numbers_and_respect_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        ctx.start(None);
        for i in 0..12 {
            ctx.error(&format!("boom {i}"));
        }
        assert_eq!(ctx.record().error_count, 12);
        assert_eq!(ctx.record().issues.len(), 10);
        let line = ctx.record().issues[0]
            .data
            .get(LOG_LINE_NUMBER_KEY)
            .unwrap();
        assert_eq!(line, "1");
    }

    #[tokio::test]
    async fn issue_messages_are_masked() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, host) = test_job_context(server, dir.path());

        host.secret_masker.add_value("deploy-key-value", "test");
        ctx.start(None);
        ctx.error("failed with deploy-key-value");
        assert_eq!(
            ctx.record().issues[0].message,
            "failed with ***"
        );
    }

    #[tokio::test]
    async fn children_get_sequential_orders_and_linked_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        let child_a = ctx.create_child(Uuid::new_v4(), "Step A", "__a", false);
        let child_b = ctx.create_child(Uuid::new_v4(), "Step B", "__b", false);
        assert_eq!(child_a.record().order, 1);
        assert_eq!(child_b.record().order, 2);
        assert_eq!(child_a.record().parent_id, Some(ctx.record_id()));

        // Canceling a child does not touch the parent.
        child_a.cancel_token();
        assert!(child_a.cancellation_token().is_cancelled());
        assert!(!ctx.cancellation_token().is_cancelled());

        // Canceling the parent reaches remaining children.
        ctx.cancel_token();
        assert!(child_b.cancellation_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_this_context_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        let mut child = ctx.create_child(Uuid::new_v4(), "Slow step", "__slow", false);
        child.set_timeout(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(child.cancellation_token().is_cancelled());
        assert!(!ctx.cancellation_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn force_complete_latch_fires_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (ctx, _queue, _host) = {
            let (ctx, q, h) = test_job_context(server, dir.path());
            (ctx, q, h)
        };

        let latch = ctx.force_completed_token();
        ctx.force_task_complete();
        assert!(!latch.is_cancelled());
        tokio::time::sleep(FORCE_COMPLETE_GRACE + Duration::from_millis(100)).await;
        assert!(latch.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn force_complete_can_be_withdrawn() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (ctx, _queue, _host) = test_job_context(server, dir.path());

        let latch = ctx.force_completed_token();
        ctx.force_task_complete();
        ctx.cancel_force_task_completion();
        tokio::time::sleep(FORCE_COMPLETE_GRACE * 2).await;
        assert!(!latch.is_cancelled());
    }

    #[tokio::test]
    async fn progress_updates_cap_at_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());

        ctx.start(None);
        ctx.set_progress(40);
        assert_eq!(ctx.record().percent_complete, 40);
        ctx.set_progress(250);
        assert_eq!(ctx.record().percent_complete, 100);

        queue.shutdown().await;
        let last = server.last_record(ctx.record_id()).unwrap();
        assert_eq!(last.percent_complete, 100);
    }

    #[tokio::test]
    async fn output_variables_publish_qualified_names() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        let mut child = ctx.create_child(Uuid::new_v4(), "Producer", "__producer", false);
        child.set_variable(
            "artifactPath",
            "/tmp/out",
            SetVariableOptions {
                is_output: true,
                ..Default::default()
            },
        );

        let vars = &child.global().variables;
        assert_eq!(vars.get("artifactPath"), Some("/tmp/out".to_string()));
        assert_eq!(
            vars.get("__producer.artifactPath"),
            Some("/tmp/out".to_string())
        );
        assert_eq!(
            child.record().variables.get("artifactPath"),
            Some(&"/tmp/out".to_string())
        );
    }

    #[tokio::test]
    async fn secret_output_variables_are_masked_on_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();
        let (mut ctx, _queue, _host) = test_job_context(server, dir.path());

        ctx.set_variable(
            "sessionToken",
            "super-secret-value",
            SetVariableOptions {
                is_secret: true,
                is_output: true,
                ..Default::default()
            },
        );
        assert_eq!(
            ctx.record().variables.get("sessionToken"),
            Some(&"***".to_string())
        );
    }
}
