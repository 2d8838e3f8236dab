// Step handlers: the bridge from a resolved step to an opaque child
// executable. The command-line contract is fixed here; what the handler
// does internally is its own business.
//
// Output streams into the owning execution context line by line while the
// child runs, so masking and line numbering happen on the live path.

use agent_sdk::{ProcessInvoker, TraceWriter};
use anyhow::{Context as AnyhowContext, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::execution_context::ExecutionContext;

/// A fully resolved handler command line.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub file_name: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub working_directory: String,
}

/// Run a handler child process, streaming stdout and stderr into the
/// context. Returns the exit code; cancellation kills the child and
/// surfaces as an error.
pub async fn run_handler(
    context: &mut ExecutionContext,
    invocation: &HandlerInvocation,
) -> Result<i32> {
    let trace: Arc<dyn TraceWriter> = Arc::new(context.host_context().get_trace("ProcessInvoker"));
    let mut invoker = ProcessInvoker::new(trace);

    let mut stdout = invoker
        .take_stdout_receiver()
        .expect("fresh invoker always has a stdout receiver");
    let mut stderr = invoker
        .take_stderr_receiver()
        .expect("fresh invoker always has a stderr receiver");

    context.command(&format!(
        "{} {}",
        invocation.file_name,
        invocation.arguments.join(" ")
    ));

    let cancellation = context.cancellation_token();
    let execute = invoker.execute(
        &invocation.working_directory,
        &invocation.file_name,
        &invocation.arguments,
        Some(&invocation.environment),
        false,
        false,
        cancellation,
    );
    tokio::pin!(execute);

    let exit_code = loop {
        tokio::select! {
            result = &mut execute => break result?,
            Some(line) = stdout.recv() => {
                context.output(&line.data);
            }
            Some(line) = stderr.recv() => {
                context.output(&line.data);
            }
        }
    };

    // The readers may still hold buffered tail lines.
    while let Ok(line) = stdout.try_recv() {
        context.output(&line.data);
    }
    while let Ok(line) = stderr.try_recv() {
        context.output(&line.data);
    }

    Ok(exit_code)
}

// ---------------------------------------------------------------------------
// Script steps
// ---------------------------------------------------------------------------

/// Write an inline script body to a temp file and return the invocation
/// that runs it through the platform shell.
pub fn resolve_script_invocation(
    temp_directory: &Path,
    working_directory: &Path,
    script: &str,
    environment: HashMap<String, String>,
) -> Result<(HandlerInvocation, PathBuf)> {
    std::fs::create_dir_all(temp_directory)
        .with_context(|| format!("Failed to create '{}'", temp_directory.display()))?;

    let script_file = temp_directory.join(format!("script_{}.sh", Uuid::new_v4().simple()));
    std::fs::write(&script_file, script)
        .with_context(|| format!("Failed to write script file '{}'", script_file.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&script_file, std::fs::Permissions::from_mode(0o755));
    }

    let (shell, mut arguments) = default_shell();
    arguments.push(script_file.to_string_lossy().to_string());

    Ok((
        HandlerInvocation {
            file_name: shell,
            arguments,
            environment,
            working_directory: working_directory.to_string_lossy().to_string(),
        },
        script_file,
    ))
}

/// The platform shell and its standard argument prefix.
fn default_shell() -> (String, Vec<String>) {
    if cfg!(windows) {
        ("pwsh".to_string(), vec!["-File".to_string()])
    } else {
        (
            "bash".to_string(),
            vec![
                "--noprofile".to_string(),
                "--norc".to_string(),
                "-e".to_string(),
                "-o".to_string(),
                "pipefail".to_string(),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Task / plugin steps
// ---------------------------------------------------------------------------

/// Build the invocation for a task or plugin handler executable.
///
/// Inputs are passed as `INPUT_*` environment variables; the step target
/// rides along as `AGENT_STEP_TARGET` so container-aware handlers can route
/// themselves.
pub fn resolve_task_invocation(
    handler: &str,
    tools_directory: &Path,
    working_directory: &Path,
    inputs: &HashMap<String, String>,
    mut environment: HashMap<String, String>,
    target: Option<&str>,
) -> Result<HandlerInvocation> {
    if handler.trim().is_empty() {
        anyhow::bail!("Task step does not name a handler executable");
    }

    let handler_path = if Path::new(handler).is_absolute() {
        PathBuf::from(handler)
    } else {
        tools_directory.join(handler)
    };

    for (name, value) in inputs {
        environment.insert(format!("INPUT_{}", env_safe_name(name)), value.clone());
    }
    if let Some(alias) = target {
        environment.insert("AGENT_STEP_TARGET".to_string(), alias.to_string());
    }

    Ok(HandlerInvocation {
        file_name: handler_path.to_string_lossy().to_string(),
        arguments: Vec::new(),
        environment,
        working_directory: working_directory.to_string_lossy().to_string(),
    })
}

fn env_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
