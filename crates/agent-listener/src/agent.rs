// The listener orchestrator: CLI dispatch and the main message pump
// (create session → poll → dispatch → repeat), including self-update
// coordination and graceful shutdown.

use agent_common::constants::{self, return_code};
use agent_common::process_channel::{JobCancelBody, JobMetadataBody};
use agent_common::{AgentSettings, ConfigurationStore, CredentialData, HostContext, ShutdownReason, Tracing};
use agent_sdk::TraceWriter;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command_settings::CommandSettings;
use crate::control_plane::{AgentMessage, AgentMessageKind, HttpControlPlane};
use crate::error_throttler::ErrorThrottler;
use crate::job_dispatcher::{JobDispatcher, JobRequestRef, WorkerOutcome};
use crate::message_listener::MessageListener;
use crate::self_updater::{AgentRefreshMessage, SelfUpdater, Updater};

/// Delay between poll iterations on an empty response.
const MESSAGE_POLL_DELAY: Duration = Duration::from_secs(1);

/// The main listener orchestrator.
pub struct Agent {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl Agent {
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("Agent");
        Self { context, trace }
    }

    /// Parse the CLI verb and dispatch. Returns the process exit code.
    pub async fn execute_command(&self, settings: &CommandSettings) -> Result<i32> {
        self.trace.info(&format!(
            "Command: {:?}, Args: {:?}",
            settings.command(),
            settings.sanitized_args()
        ));

        for unknown in settings.unknown() {
            self.trace
                .warning(&format!("Ignoring unrecognized argument '{unknown}'"));
        }

        if settings.is_version() {
            println!("{}", agent_sdk::AgentPackage::VERSION);
            return Ok(return_code::SUCCESS);
        }
        if settings.is_commit() {
            println!("{}", agent_sdk::Source::COMMIT_HASH);
            return Ok(return_code::SUCCESS);
        }
        if settings.is_help() {
            self.print_help();
            return Ok(return_code::SUCCESS);
        }

        match settings.command() {
            Some("configure") => self.configure(settings),
            Some("remove") => self.remove(),
            Some("reauth") => self.reauth(settings),
            Some("warmup") => self.warmup(),
            Some("diagnostics") => self.diagnostics(),
            Some("run") | None => self.run(settings).await,
            Some(other) => {
                self.trace.error(&format!("Unknown command '{other}'"));
                self.print_help();
                Ok(return_code::TERMINATED_ERROR)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Command handlers
    // -----------------------------------------------------------------------

    fn configure(&self, settings: &CommandSettings) -> Result<i32> {
        let store = ConfigurationStore::new(&self.context);
        if store.is_configured() {
            println!("The agent is already configured; run 'remove' first.");
            return Ok(return_code::TERMINATED_ERROR);
        }

        let url = settings
            .get_url()
            .context("--url is required for configure")?;
        let token = settings
            .get_token()
            .context("--token is required for configure")?;
        let pool = settings
            .get_pool()
            .unwrap_or("1")
            .parse::<u64>()
            .context("--pool must be a number")?;
        let name = settings
            .get_name()
            .map(str::to_string)
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
            })
            .context("--name is required when the hostname cannot be determined")?;

        self.context.secret_masker.add_value(token, "RegistrationToken");

        let agent_settings = AgentSettings {
            agent_id: 0,
            agent_name: name.clone(),
            pool_id: pool,
            server_url: url.to_string(),
            work_folder: settings.get_work().unwrap_or("_work").to_string(),
            disable_update: settings.is_disable_update(),
            run_once: settings.is_once(),
        };
        store.save_settings(&agent_settings)?;

        let mut credentials = CredentialData {
            scheme: "OAuth".into(),
            ..Default::default()
        };
        credentials.data.insert("token".into(), token.to_string());
        store.save_credentials(&credentials)?;

        println!("√ Agent '{name}' configured against {url}");
        Ok(return_code::SUCCESS)
    }

    fn remove(&self) -> Result<i32> {
        let store = ConfigurationStore::new(&self.context);
        store.delete_settings()?;
        store.delete_credentials()?;
        store.delete_session()?;
        println!("√ Agent configuration removed");
        Ok(return_code::SUCCESS)
    }

    fn reauth(&self, settings: &CommandSettings) -> Result<i32> {
        let store = ConfigurationStore::new(&self.context);
        if !store.is_configured() {
            println!("The agent is not configured.");
            return Ok(return_code::TERMINATED_ERROR);
        }

        let token = settings
            .get_token()
            .context("--token is required for reauth")?;
        self.context.secret_masker.add_value(token, "RegistrationToken");

        let mut credentials = store.get_credentials().unwrap_or_default();
        credentials.data.insert("token".into(), token.to_string());
        store.save_credentials(&credentials)?;

        println!("√ Credentials updated");
        Ok(return_code::SUCCESS)
    }

    fn warmup(&self) -> Result<i32> {
        let store = ConfigurationStore::new(&self.context);
        if store.is_configured() {
            let _ = store.get_settings();
            self.trace.info("Warmup: settings loaded");
        }
        Ok(return_code::SUCCESS)
    }

    fn diagnostics(&self) -> Result<i32> {
        println!("Agent diagnostics");
        println!("  Version:      {}", agent_sdk::AgentPackage::VERSION);
        println!("  Commit:       {}", agent_sdk::Source::COMMIT_HASH);
        println!(
            "  Platform:     {} / {}",
            constants::CURRENT_PLATFORM,
            constants::CURRENT_ARCHITECTURE
        );
        println!(
            "  Proxy:        {}",
            if self.context.web_proxy.is_configured() {
                "configured"
            } else {
                "none"
            }
        );

        let store = ConfigurationStore::new(&self.context);
        if store.is_configured() {
            match store.get_settings() {
                Ok(settings) => {
                    println!("  Agent name:   {}", settings.agent_name);
                    println!("  Server URL:   {}", settings.server_url);
                    println!("  Pool:         {}", settings.pool_id);
                    println!("  Work folder:  {}", settings.work_folder);
                }
                Err(e) => println!("  Settings:     unreadable ({e})"),
            }
        } else {
            println!("  Configured:   no");
        }
        Ok(return_code::SUCCESS)
    }

    fn print_help(&self) {
        println!("Pipelines Agent v{}", agent_sdk::AgentPackage::VERSION);
        println!();
        println!("Commands:");
        println!("  configure     Configure the agent against the control plane");
        println!("  remove        Remove the agent configuration");
        println!("  reauth        Replace the stored credentials");
        println!("  run           Poll for jobs (default)");
        println!("  warmup        Preload configuration");
        println!("  diagnostics   Print environment diagnostics");
        println!();
        println!("Options:");
        println!("  --url <url>       Control-plane URL");
        println!("  --token <token>   Registration token");
        println!("  --pool <id>       Pool id");
        println!("  --name <name>     Agent name (default: hostname)");
        println!("  --work <dir>      Work directory (default: _work)");
        println!("  --once            Exit after the first job completes");
        println!("  --unattended      No interactive prompts");
        println!("  --disableupdate   Skip agent self-updates");
        println!("  --version         Print the agent version");
        println!("  --commit          Print the build commit");
        println!("  --help            Show this help");
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// The core `run` verb: create the session, pump messages, dispatch
    /// jobs, and shut down in order (channel → worker → session).
    async fn run(&self, command_settings: &CommandSettings) -> Result<i32> {
        let store = ConfigurationStore::new(&self.context);
        if !store.is_configured() {
            println!("The agent is not configured. Run 'configure' first.");
            return Ok(return_code::TERMINATED_ERROR);
        }

        let settings = store.get_settings().context("Failed to load agent settings")?;
        let credentials = store
            .get_credentials()
            .context("Failed to load credentials")?;
        if let Some(token) = credentials.token() {
            self.context.secret_masker.add_value(token, "AgentCredentials");
        }

        if !settings.work_folder.is_empty() {
            self.context.set_work_folder(&settings.work_folder);
        }

        let is_run_once = command_settings.is_once() || settings.run_once;

        // SIGINT is a user cancel; SIGTERM is an OS shutdown.
        let shutdown_token = self.context.agent_shutdown_token();
        let context_for_signal = Arc::clone(&self.context);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received; initiating graceful shutdown");
                context_for_signal.shutdown_agent(ShutdownReason::UserCancelled);
            }
        });

        #[cfg(unix)]
        {
            let context_for_sigterm = Arc::clone(&self.context);
            tokio::spawn(async move {
                let mut sigterm =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(signal) => signal,
                        Err(_) => return,
                    };
                sigterm.recv().await;
                tracing::info!("SIGTERM received; initiating graceful shutdown");
                context_for_sigterm.shutdown_agent(ShutdownReason::OperatingSystemShutdown);
            });
        }

        let control_plane = Arc::new(
            HttpControlPlane::new(
                settings.server_url.clone(),
                settings.pool_id,
                credentials,
                Some(
                    self.context
                        .get_config_file(constants::WellKnownConfigFile::Credentials),
                ),
            )
            .context("Failed to build the control-plane client")?,
        );

        let mut listener = MessageListener::new(&self.context, control_plane);
        listener
            .create_session(settings.agent_id, &settings.agent_name, shutdown_token.clone())
            .await
            .context("Failed to create a session with the control plane")?;

        println!(
            "√ Connected to the control plane\n\n{} Listening for jobs",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let mut dispatcher = JobDispatcher::new(Arc::clone(&self.context));
        let (run_once_tx, mut run_once_rx) = mpsc::channel::<WorkerOutcome>(1);
        if is_run_once {
            dispatcher.set_run_once_channel(run_once_tx);
        }

        let disable_update = settings.disable_update
            || std::env::var(constants::env_vars::ACKNOWLEDGE_NO_UPDATES)
                .ok()
                .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
                .unwrap_or(false);

        let updater: Arc<dyn Updater> = Arc::new(SelfUpdater::new(Arc::clone(&self.context)));

        let result = self
            .run_message_loop(
                &mut listener,
                &dispatcher,
                updater,
                disable_update,
                is_run_once,
                &mut run_once_rx,
                shutdown_token,
            )
            .await;

        // Disposal order on every non-abrupt path: channel → worker →
        // session.
        dispatcher.shutdown().await;
        listener.delete_session().await;

        result
    }

    /// The message pump. Separated from `run` so tests drive it with
    /// in-memory fakes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_message_loop(
        &self,
        listener: &mut MessageListener,
        dispatcher: &JobDispatcher,
        updater: Arc<dyn Updater>,
        disable_update: bool,
        is_run_once: bool,
        run_once_rx: &mut mpsc::Receiver<WorkerOutcome>,
        shutdown: CancellationToken,
    ) -> Result<i32> {
        let mut throttler = ErrorThrottler::new();
        let mut update_task: Option<JoinHandle<Result<bool>>> = None;
        let mut held_job: Option<AgentMessage> = None;

        loop {
            if shutdown.is_cancelled() {
                self.trace.info("Shutdown requested; leaving the message loop.");
                return Ok(return_code::SUCCESS);
            }

            // Resolve a finished self-update before anything else.
            let update_finished = update_task
                .as_ref()
                .map(|t| t.is_finished())
                .unwrap_or(false);
            if update_finished {
                let task = match update_task.take() {
                    Some(task) => task,
                    None => continue,
                };
                match task.await {
                    Ok(Ok(true)) => {
                        self.trace
                            .info("Self-update staged; restarting into the new agent.");
                        // A held job request stays undeleted so the updated
                        // agent picks it up after restart.
                        return Ok(return_code::AGENT_UPDATING);
                    }
                    Ok(Ok(false)) => {
                        self.trace.info("Self-update resolved with no restart needed.");
                    }
                    Ok(Err(e)) => {
                        self.trace.error(&format!("Self-update failed: {e:#}"));
                    }
                    Err(e) => {
                        self.trace.error(&format!("Self-update task panicked: {e}"));
                    }
                }

                if let Some(message) = held_job.take() {
                    self.trace.info("Processing the job request held during the update.");
                    self.dispatch_job(listener, dispatcher, &message).await;
                }
            }

            // Run-once: leave as soon as the first job's worker finishes.
            if is_run_once {
                if let Ok(outcome) = run_once_rx.try_recv() {
                    self.trace.info(&format!(
                        "Run-once job finished (exit code {}); leaving the message loop.",
                        outcome.exit_code
                    ));
                    return Ok(return_code::SUCCESS);
                }
            }

            match listener.get_next_message(shutdown.clone()).await {
                Ok(Some(message)) => {
                    throttler.reset();
                    match message.kind() {
                        AgentMessageKind::JobRequest => {
                            if update_task.is_some() {
                                // Held without delete so the updated agent
                                // receives it after restart.
                                self.trace.info(
                                    "Holding the job request until the self-update resolves.",
                                );
                                held_job = Some(message);
                            } else {
                                self.dispatch_job(listener, dispatcher, &message).await;
                            }
                        }

                        AgentMessageKind::JobCancel => {
                            match serde_json::from_str::<JobCancelBody>(&message.body) {
                                Ok(body) => {
                                    if dispatcher.cancel(&body).await {
                                        let _ = listener.delete_message(&message).await;
                                    } else {
                                        // Leave it queued for re-delivery on
                                        // the next poll.
                                        self.trace.info(
                                            "Cancel was not dispatched; leaving the message for re-delivery.",
                                        );
                                    }
                                }
                                Err(e) => {
                                    self.trace
                                        .error(&format!("Malformed cancel message: {e}"));
                                    let _ = listener.delete_message(&message).await;
                                }
                            }
                        }

                        AgentMessageKind::JobMetadataUpdate => {
                            match serde_json::from_str::<JobMetadataBody>(&message.body) {
                                Ok(body) => dispatcher.metadata_update(&body).await,
                                Err(e) => {
                                    self.trace
                                        .warning(&format!("Malformed metadata message: {e}"));
                                }
                            }
                            let _ = listener.delete_message(&message).await;
                        }

                        AgentMessageKind::AgentRefresh => {
                            if disable_update {
                                self.trace
                                    .info("Self-update is disabled; ignoring the refresh message.");
                            } else if update_task.is_some() {
                                self.trace
                                    .info("A self-update is already in progress; ignoring the refresh message.");
                            } else {
                                match serde_json::from_str::<AgentRefreshMessage>(&message.body) {
                                    Ok(refresh) => {
                                        self.trace.info(&format!(
                                            "Agent refresh received (target version {}).",
                                            refresh.target_version
                                        ));
                                        let updater = Arc::clone(&updater);
                                        let cancel = shutdown.clone();
                                        update_task = Some(tokio::spawn(async move {
                                            updater.apply(&refresh, cancel).await
                                        }));
                                    }
                                    Err(e) => {
                                        self.trace
                                            .error(&format!("Malformed refresh message: {e}"));
                                    }
                                }
                            }
                            let _ = listener.delete_message(&message).await;
                        }

                        AgentMessageKind::Unknown => {
                            self.trace.info(&format!(
                                "Ignoring unknown message type '{}'.",
                                message.message_type
                            ));
                            let _ = listener.delete_message(&message).await;
                        }
                    }
                }

                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(MESSAGE_POLL_DELAY) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }

                Err(e) => {
                    self.trace
                        .error(&format!("Error polling for messages: {e:#}"));
                    if !throttler.increment_and_wait(shutdown.clone()).await {
                        return Ok(return_code::SUCCESS);
                    }
                }
            }
        }
    }

    /// Deserialize, dispatch, and acknowledge one job request message.
    async fn dispatch_job(
        &self,
        listener: &MessageListener,
        dispatcher: &JobDispatcher,
        message: &AgentMessage,
    ) {
        match serde_json::from_str::<JobRequestRef>(&message.body) {
            Ok(job_ref) => {
                if let Err(e) = dispatcher.run(&job_ref, &message.body).await {
                    self.trace.error(&format!("Failed to dispatch the job: {e:#}"));
                }
            }
            Err(e) => {
                self.trace
                    .error(&format!("Failed to deserialize the job request: {e}"));
            }
        }
        let _ = listener.delete_message(message).await;
    }
}
