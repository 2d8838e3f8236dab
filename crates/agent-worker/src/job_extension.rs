// Turns the job request's step descriptors into executable steps: resolves
// handler references, binds checkout steps to their repository, allocates
// the per-step execution contexts, and prepares the working directories.

use anyhow::Result;

use crate::execution_context::ExecutionContext;
use crate::messages::{JobRequestMessage, RepositoryResource, StepDescriptor, StepKind};

/// How a resolved step executes.
#[derive(Debug, Clone)]
pub enum StepExecutionPlan {
    /// Inline script run through the platform shell.
    Script { script: String },
    /// Task or plugin handler executable.
    Handler { handler: String },
    /// Handler executable with the repository resource bound in.
    Checkout {
        handler: String,
        repository: RepositoryResource,
    },
}

/// A step descriptor paired with its initialized context and execution plan.
pub struct PreparedStep {
    pub descriptor: StepDescriptor,
    pub context: ExecutionContext,
    pub plan: StepExecutionPlan,
}

/// Resolves concrete executable steps for the job.
pub struct JobExtension;

impl JobExtension {
    pub fn new() -> Self {
        Self
    }

    /// Prepare the work, temp, and diag directories for this job.
    pub fn prepare_directories(&self, job_context: &ExecutionContext) -> Result<()> {
        let global = job_context.global();
        for dir in [
            &global.work_directory,
            &global.temp_directory,
            &global.diag_directory,
            &global.tools_directory,
        ] {
            agent_sdk::IOUtil::create_directory(dir)?;
        }
        Ok(())
    }

    /// Resolve every step descriptor into an executable step with an
    /// initialized child context. Unresolvable steps are an initialization
    /// failure for the whole job.
    pub fn initialize_job(
        &self,
        job_context: &mut ExecutionContext,
        message: &JobRequestMessage,
    ) -> Result<Vec<PreparedStep>> {
        self.prepare_directories(job_context)?;

        let mut prepared = Vec::with_capacity(message.steps.len());
        for descriptor in &message.steps {
            let plan = self.resolve_step(descriptor, message)?;
            let ref_name = if descriptor.ref_name.is_empty() {
                format!("__step_{}", prepared.len() + 1)
            } else {
                descriptor.ref_name.clone()
            };
            let context = job_context.create_child(
                descriptor.id,
                &descriptor.display_name,
                &ref_name,
                false,
            );
            prepared.push(PreparedStep {
                descriptor: descriptor.clone(),
                context,
                plan,
            });
        }

        Ok(prepared)
    }

    /// Finalize hook, called regardless of the job outcome. Clears the job
    /// temp directory so the next job starts clean.
    pub fn finalize_job(&self, job_context: &mut ExecutionContext) {
        let temp = job_context.global().temp_directory.clone();
        if let Err(e) = agent_sdk::IOUtil::delete_directory(&temp) {
            job_context.debug(&format!("Failed to clear temp directory: {e:#}"));
        }
        let _ = agent_sdk::IOUtil::create_directory(&temp);
    }

    fn resolve_step(
        &self,
        descriptor: &StepDescriptor,
        message: &JobRequestMessage,
    ) -> Result<StepExecutionPlan> {
        // A container target must name a known container resource.
        if let Some(ref alias) = descriptor.target {
            if !message
                .resources
                .containers
                .iter()
                .any(|c| c.alias.eq_ignore_ascii_case(alias))
            {
                anyhow::bail!(
                    "Step '{}' targets unknown container '{}'",
                    descriptor.display_name,
                    alias
                );
            }
        }

        match descriptor.kind {
            StepKind::Script => {
                let script = descriptor
                    .script
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "Script step '{}' has no script body",
                            descriptor.display_name
                        )
                    })?;
                Ok(StepExecutionPlan::Script { script })
            }

            StepKind::Task | StepKind::Plugin => {
                let handler = self.resolve_handler(descriptor)?;
                Ok(StepExecutionPlan::Handler { handler })
            }

            StepKind::Checkout => {
                let handler = self.resolve_handler(descriptor)?;
                let alias = descriptor
                    .inputs
                    .get("repository")
                    .cloned()
                    .unwrap_or_else(|| "self".to_string());
                let repository = message
                    .resources
                    .repositories
                    .iter()
                    .find(|r| r.alias.eq_ignore_ascii_case(&alias))
                    .cloned()
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "Checkout step '{}' references unknown repository '{}'",
                            descriptor.display_name,
                            alias
                        )
                    })?;
                Ok(StepExecutionPlan::Checkout { handler, repository })
            }
        }
    }

    fn resolve_handler(&self, descriptor: &StepDescriptor) -> Result<String> {
        descriptor
            .reference
            .as_ref()
            .map(|r| r.handler.clone())
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Step '{}' does not resolve to a handler executable",
                    descriptor.display_name
                )
            })
    }
}

impl Default for JobExtension {
    fn default() -> Self {
        Self::new()
    }
}
