// Drives sequential execution of a job's steps: condition evaluation,
// timeout enforcement, cancellation routing, async-command draining, and
// result merging. Failures are recorded on the owning contexts; this
// runner never propagates an error to its caller.

use agent_common::TaskResult;
use agent_sdk::TraceWriter;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::conditions::{self, ConditionContext};
use crate::execution_context::{AsyncCommand, ExecutionContext};
use crate::handlers::{self, HandlerInvocation};
use crate::job_extension::{PreparedStep, StepExecutionPlan};
use crate::messages::StepDescriptor;
use crate::variables::Variables;

/// Reference shown with the one-shot throttling warning.
const THROTTLING_HELP_LINK: &str = "https://aka.ms/pipelines-agent-throttling";

/// Executes all steps of a job, in order.
pub struct StepsRunner {
    /// Upgrade agent-shutdown cancellation of a running step to a failure.
    fail_on_agent_shutdown: bool,
}

impl StepsRunner {
    pub fn new(fail_on_agent_shutdown: bool) -> Self {
        Self {
            fail_on_agent_shutdown,
        }
    }

    /// Run all prepared steps. Side effects land on the step contexts and
    /// the job context; the job result is the merge of the step results.
    pub async fn run(&self, job_context: &mut ExecutionContext, steps: Vec<PreparedStep>) {
        for prepared in steps {
            // Job-level async commands queued before this step must settle
            // first; their failures are logged but do not fail the job.
            let pending = job_context.take_async_commands();
            Self::drain_commands_logged(job_context, pending).await;

            // Surface accumulated server throttling exactly once per job.
            if let Some(delay) = job_context.global().server_queue.check_throttling() {
                job_context.warning(&format!(
                    "The server is throttling requests from this agent; uploads have been delayed by {}s so far. See {} for details.",
                    delay.as_secs(),
                    THROTTLING_HELP_LINK
                ));
            }

            // A cancellation noticed between steps marks the job before the
            // next condition is evaluated.
            if prepared.context.job_cancel_token().is_cancelled() {
                job_context
                    .set_result(TaskResult::merge(job_context.result(), TaskResult::Canceled));
            }

            let step_result = self.run_step(job_context, prepared).await;

            // Skipped steps leave the job result alone; everything else
            // merges in.
            if let Some(result) = step_result {
                job_context.set_result(TaskResult::merge(job_context.result(), result));
            }
        }
    }

    /// Run one step end to end. Returns the step result to merge into the
    /// job, or `None` when the step was skipped.
    async fn run_step(
        &self,
        job_context: &mut ExecutionContext,
        prepared: PreparedStep,
    ) -> Option<TaskResult> {
        let PreparedStep {
            descriptor,
            mut context,
            plan,
        } = prepared;

        context.start(Some(&descriptor.display_name));

        // Re-expand inputs so values produced by earlier steps are visible.
        let (expanded_inputs, expanded_script, warnings) =
            expand_step(&descriptor, &job_context.global().variables);
        for warning in warnings {
            context.warning(&warning);
        }

        // Condition evaluation.
        let agent_shutdown = context.host_context().agent_shutdown_reason().is_some();
        let job_canceled = context.job_cancel_token().is_cancelled();
        let condition_state = ConditionContext {
            job_result: job_context.result(),
            job_canceled,
        };
        let condition_trace = context.host_context().get_trace("StepCondition");

        let proceed = if agent_shutdown {
            context.output("The agent is shutting down; the step condition is treated as false.");
            false
        } else {
            match conditions::evaluate(&descriptor.condition, &condition_state, &condition_trace) {
                Ok(value) => value,
                Err(e) => {
                    context.error(&e.to_string());
                    return Some(context.complete(Some(TaskResult::Failed)));
                }
            }
        };

        if !proceed {
            context.output(&format!(
                "Skipping step '{}': the condition evaluated to false.",
                descriptor.display_name
            ));
            context.complete(Some(TaskResult::Skipped));
            return None;
        }

        // Arm the step timeout and take token handles for the watcher.
        if descriptor.timeout_in_minutes > 0 {
            context.set_timeout(Duration::from_secs(u64::from(descriptor.timeout_in_minutes) * 60));
        }
        ensure_utf8_console(&mut context).await;

        let step_token = context.cancellation_token();
        let job_token = context.job_cancel_token();
        let force_latch = context.force_completed_token();
        let condition = descriptor.condition.clone();

        // The block scopes the pinned execution future so the mutable borrow
        // of the context ends before the result is classified.
        let execution_result: Result<()> = {
            let execution = execute_step(
                &mut context,
                &descriptor,
                &plan,
                &expanded_inputs,
                expanded_script.as_deref(),
            );
            tokio::pin!(execution);

            let mut cancel_observed = false;
            loop {
                tokio::select! {
                    result = &mut execution => break result,

                    // Job cancellation: re-evaluate the condition with
                    // host-only tracing. An always-run condition lets the
                    // step finish; any other outcome cancels the step's
                    // token.
                    _ = job_token.cancelled(), if !cancel_observed => {
                        cancel_observed = true;
                        let state = ConditionContext {
                            job_result: Some(TaskResult::Canceled),
                            job_canceled: true,
                        };
                        let keep_running = conditions::evaluate(
                            &condition,
                            &state,
                            &condition_trace,
                        )
                        .unwrap_or(false);
                        if keep_running {
                            condition_trace.info(&format!(
                                "Step '{}' continues after job cancellation (always-run condition).",
                                descriptor.display_name
                            ));
                        } else {
                            step_token.cancel();
                        }
                    }

                    // The force-complete latch gives up waiting: cancel the
                    // step and let the handler kill path unwind the
                    // execution.
                    _ = force_latch.cancelled() => {
                        condition_trace.info(&format!(
                            "Force-completing step '{}'.",
                            descriptor.display_name
                        ));
                        step_token.cancel();
                    }
                }
            }
        };

        let shutdown_requested = context.host_context().agent_shutdown_reason().is_some();
        let mut step_result = match execution_result {
            Ok(()) => context.result().unwrap_or(TaskResult::Succeeded),
            Err(e) => {
                if step_token.is_cancelled() {
                    if !job_token.is_cancelled() {
                        context.error(&format!(
                            "The step '{}' has timed out after {} minutes.",
                            descriptor.display_name, descriptor.timeout_in_minutes
                        ));
                        TaskResult::Failed
                    } else if shutdown_requested && self.fail_on_agent_shutdown {
                        context.error(
                            "The agent is shutting down; the running step has been failed.",
                        );
                        TaskResult::Failed
                    } else {
                        context.output("The step was canceled.");
                        TaskResult::Canceled
                    }
                } else {
                    context.error(&format!("{e:#}"));
                    TaskResult::Failed
                }
            }
        };

        // Drain step-level async commands and fold their outcome in.
        let pending = context.take_async_commands();
        if let Some(command_result) =
            Self::drain_commands_classified(&mut context, pending, job_token.is_cancelled()).await
        {
            step_result = TaskResult::merge(Some(step_result), command_result);
        }

        if step_result == TaskResult::Failed && descriptor.continue_on_error {
            context.output("Step failed; continuing because continue-on-error is set.");
            step_result = TaskResult::SucceededWithIssues;
        }

        Some(context.complete(Some(step_result)))
    }

    /// Drain commands where failures are logged but never affect a result.
    async fn drain_commands_logged(context: &mut ExecutionContext, commands: Vec<AsyncCommand>) {
        for command in commands {
            match command.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    context.output(&format!(
                        "Background command '{}' failed: {e:#}",
                        command.name
                    ));
                }
                Err(e) => {
                    context.output(&format!(
                        "Background command '{}' did not complete: {e}",
                        command.name
                    ));
                }
            }
        }
    }

    /// Drain commands and classify failures: canceled while the job is
    /// canceled, failed otherwise. Returns the worst command result.
    async fn drain_commands_classified(
        context: &mut ExecutionContext,
        commands: Vec<AsyncCommand>,
        job_canceled: bool,
    ) -> Option<TaskResult> {
        let mut worst: Option<TaskResult> = None;
        for command in commands {
            let failure = match command.handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Command '{}' failed: {e:#}", command.name)),
                Err(e) => Some(format!("Command '{}' did not complete: {e}", command.name)),
            };
            if let Some(message) = failure {
                let result = if job_canceled {
                    context.output(&message);
                    TaskResult::Canceled
                } else {
                    context.error(&message);
                    TaskResult::Failed
                };
                worst = Some(TaskResult::merge(worst, result));
            }
        }
        worst
    }
}

/// Expand a step's script, inputs, and environment against the current
/// variable store, collecting cycle warnings.
fn expand_step(
    descriptor: &StepDescriptor,
    variables: &Variables,
) -> (HashMap<String, String>, Option<String>, Vec<String>) {
    let mut warnings = Vec::new();

    let mut inputs = HashMap::with_capacity(descriptor.inputs.len());
    for (name, value) in &descriptor.inputs {
        let (expanded, mut w) = variables.expand(value);
        warnings.append(&mut w);
        inputs.insert(name.clone(), expanded);
    }

    let script = descriptor.script.as_ref().map(|script| {
        let (expanded, mut w) = variables.expand(script);
        warnings.append(&mut w);
        expanded
    });

    (inputs, script, warnings)
}

/// Build the handler invocation for a step and run it. A non-zero exit
/// records an error and pre-sets the step result to `Failed`.
async fn execute_step(
    context: &mut ExecutionContext,
    descriptor: &StepDescriptor,
    plan: &StepExecutionPlan,
    expanded_inputs: &HashMap<String, String>,
    expanded_script: Option<&str>,
) -> Result<()> {
    let global = Arc::clone(context.global());

    let mut environment = global.variables.copy_into_env_block();
    for (name, value) in &descriptor.environment {
        let (expanded, _) = global.variables.expand(value);
        environment.insert(name.clone(), expanded);
    }
    environment.insert(
        "AGENT_TEMPDIRECTORY".to_string(),
        global.temp_directory.to_string_lossy().to_string(),
    );

    let invocation: HandlerInvocation = match plan {
        StepExecutionPlan::Script { script } => {
            let body = expanded_script.unwrap_or(script.as_str());
            let (invocation, _script_file) = handlers::resolve_script_invocation(
                &global.temp_directory,
                &global.work_directory,
                body,
                environment,
            )?;
            invocation
        }

        StepExecutionPlan::Handler { handler } => handlers::resolve_task_invocation(
            handler,
            &global.tools_directory,
            &global.work_directory,
            expanded_inputs,
            environment,
            descriptor.target.as_deref(),
        )?,

        StepExecutionPlan::Checkout {
            handler,
            repository,
        } => {
            environment.insert("REPOSITORY_ALIAS".to_string(), repository.alias.clone());
            environment.insert("REPOSITORY_URL".to_string(), repository.url.clone());
            if let Some(ref version) = repository.version {
                environment.insert("REPOSITORY_VERSION".to_string(), version.clone());
            }
            handlers::resolve_task_invocation(
                handler,
                &global.tools_directory,
                &global.work_directory,
                expanded_inputs,
                environment,
                descriptor.target.as_deref(),
            )?
        }
    };

    let exit_code = handlers::run_handler(context, &invocation).await?;
    if exit_code != 0 {
        context.error(&format!("Process completed with exit code {exit_code}."));
        context.set_result(TaskResult::Failed);
    }

    Ok(())
}

/// Best-effort switch of the console code page to UTF-8 on platforms that
/// are not natively UTF-8. Failure is a warning, bounded by an internal
/// timeout.
#[cfg(windows)]
async fn ensure_utf8_console(context: &mut ExecutionContext) {
    let attempt = tokio::time::timeout(
        Duration::from_secs(60),
        tokio::process::Command::new("chcp").arg("65001").output(),
    )
    .await;
    match attempt {
        Ok(Ok(output)) if output.status.success() => {}
        _ => context.warning("Failed to switch the console code page to UTF-8."),
    }
}

#[cfg(not(windows))]
async fn ensure_utf8_console(_context: &mut ExecutionContext) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::test_support::test_job_context;
    use crate::job_extension::JobExtension;
    use crate::messages::{
        JobRequestMessage, JobResources, ServiceEndpoint, StepKind, VariableValueMessage,
    };
    use crate::server_queue::test_support::FakeJobServer;
    use crate::timeline::IssueType;
    use std::sync::Arc;
    use uuid::Uuid;

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

    fn request_with(steps: Vec<StepDescriptor>) -> JobRequestMessage {
        JobRequestMessage {
            request_id: 1,
            plan_id: Uuid::new_v4(),
            timeline_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_display_name: "Job".into(),
            job_ref_name: "__job".into(),
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

    async fn run_steps(
        server: Arc<FakeJobServer>,
        dir: &std::path::Path,
        message: &JobRequestMessage,
    ) -> TaskResult {
        let (mut job_ctx, queue, _host) = test_job_context(server, dir);

        // Seed variables the way the worker bootstrap does; the store
        // registers secrets with the masker on set.
        for (name, var) in &message.variables {
            job_ctx.global().variables.set(
                name,
                var.value.clone(),
                var.is_secret,
                var.is_read_only,
                false,
            );
        }

        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, message)
            .unwrap();

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;
        job_result
    }

    fn step_result(server: &FakeJobServer, record_id: Uuid) -> Option<TaskResult> {
        server.last_record(record_id).and_then(|r| r.result)
    }

    #[tokio::test]
    async fn happy_path_masks_secrets_in_console_output() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut message = request_with(vec![script_step(
            "Greet",
            r#"echo "$(GREETING) $(USERNAME): $(TOKEN)""#,
        )]);
        message.variables.insert(
            "GREETING".into(),
            VariableValueMessage {
                value: "hi".into(),
                is_secret: false,
                is_read_only: false,
            },
        );
        message.variables.insert(
            "USERNAME".into(),
            VariableValueMessage {
                value: "admin".into(),
                is_secret: false,
                is_read_only: false,
            },
        );
        message.variables.insert(
            "TOKEN".into(),
            VariableValueMessage {
                value: "s3cr3t".into(),
                is_secret: true,
                is_read_only: false,
            },
        );

        let job_result = run_steps(Arc::clone(&server), dir.path(), &message).await;

        assert_eq!(job_result, TaskResult::Succeeded);
        let lines = server.console_text();
        assert!(
            lines.iter().any(|l| l.contains("hi admin: ***")),
            "expected masked output, got: {lines:?}"
        );
        assert!(!lines.iter().any(|l| l.contains("s3cr3t")));
    }

    #[tokio::test]
    async fn step_timeout_fails_the_step_with_an_issue() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut slow = script_step("Sleepy", "sleep 30");
        // The wire unit is minutes; shrink through the context API instead
        // of waiting a minute: use a 0-minute descriptor and arm directly.
        slow.timeout_in_minutes = 1;

        let message = request_with(vec![slow.clone()]);
        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();

        // Fire the step's own token shortly after start to model the armed
        // timeout elapsing while the job token stays quiet.
        let step_record = prepared[0].context.record_id();
        let step_token = prepared[0].context.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            step_token.cancel();
        });

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(job_result, TaskResult::Failed);
        let record = server.last_record(step_record).unwrap();
        assert_eq!(record.result, Some(TaskResult::Failed));
        assert!(record
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::Error && i.message.contains("timed out")));
    }

    #[tokio::test]
    async fn continue_on_error_downgrades_failure() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut failing = script_step("Flaky", "exit 1");
        failing.continue_on_error = true;
        let ok = script_step("Solid", "true");
        let message = request_with(vec![failing, ok]);

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let flaky_record = prepared[0].context.record_id();
        let solid_record = prepared[1].context.record_id();

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(
            step_result(&server, flaky_record),
            Some(TaskResult::SucceededWithIssues)
        );
        assert_eq!(step_result(&server, solid_record), Some(TaskResult::Succeeded));
        assert_eq!(job_result, TaskResult::SucceededWithIssues);
    }

    #[tokio::test]
    async fn cancel_during_step_two_cancels_it_and_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let message = request_with(vec![
            script_step("One", "true"),
            script_step("Two", "sleep 30"),
            script_step("Three", "true"),
        ]);

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let ids: Vec<Uuid> = prepared.iter().map(|p| p.context.record_id()).collect();

        let job_cancel = job_ctx.job_cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            job_cancel.cancel();
        });

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(step_result(&server, ids[0]), Some(TaskResult::Succeeded));
        assert_eq!(step_result(&server, ids[1]), Some(TaskResult::Canceled));
        assert_eq!(step_result(&server, ids[2]), Some(TaskResult::Skipped));
        assert_eq!(job_result, TaskResult::Canceled);
    }

    #[tokio::test]
    async fn always_run_step_survives_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut cleanup = script_step("Cleanup", "true");
        cleanup.condition = "always()".into();
        let message = request_with(vec![script_step("Slow", "sleep 30"), cleanup]);

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let ids: Vec<Uuid> = prepared.iter().map(|p| p.context.record_id()).collect();

        let job_cancel = job_ctx.job_cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            job_cancel.cancel();
        });

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(step_result(&server, ids[0]), Some(TaskResult::Canceled));
        assert_eq!(step_result(&server, ids[1]), Some(TaskResult::Succeeded));
        assert_eq!(job_result, TaskResult::Canceled);
    }

    #[tokio::test]
    async fn condition_evaluation_error_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut broken = script_step("Broken", "true");
        broken.condition = "definitely-not-a-function".into();
        let message = request_with(vec![broken]);

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let record_id = prepared[0].context.record_id();

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(step_result(&server, record_id), Some(TaskResult::Failed));
        assert_eq!(job_result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn failed_step_skips_later_default_condition_steps() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let message = request_with(vec![
            script_step("Breaks", "exit 2"),
            script_step("Never runs", "true"),
        ]);

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let ids: Vec<Uuid> = prepared.iter().map(|p| p.context.record_id()).collect();

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        let job_result = job_ctx.complete(None);
        queue.shutdown().await;

        assert_eq!(step_result(&server, ids[0]), Some(TaskResult::Failed));
        assert_eq!(step_result(&server, ids[1]), Some(TaskResult::Skipped));
        assert_eq!(job_result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn variable_expansion_warnings_surface_on_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeJobServer::new();

        let mut message = request_with(vec![script_step("Echo", "echo $(a)")]);
        message.variables.insert(
            "a".into(),
            VariableValueMessage {
                value: "$(b)".into(),
                is_secret: false,
                is_read_only: false,
            },
        );
        message.variables.insert(
            "b".into(),
            VariableValueMessage {
                value: "$(a)".into(),
                is_secret: false,
                is_read_only: false,
            },
        );

        let (mut job_ctx, queue, _host) = test_job_context(Arc::clone(&server), dir.path());
        for (name, var) in &message.variables {
            job_ctx
                .global()
                .variables
                .set(name, var.value.clone(), false, false, false);
        }
        job_ctx.start(None);
        let prepared = JobExtension::new()
            .initialize_job(&mut job_ctx, &message)
            .unwrap();
        let record_id = prepared[0].context.record_id();

        StepsRunner::new(false).run(&mut job_ctx, prepared).await;
        job_ctx.complete(None);
        queue.shutdown().await;

        let record = server.last_record(record_id).unwrap();
        assert!(record.warning_count >= 1);
    }
}
