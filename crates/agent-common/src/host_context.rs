// The per-process application context: secret masker, trace sources,
// directory layout, and shutdown coordination.
//
// Collaborators are passed explicitly at construction sites; there is no
// runtime service registry. Anything a component needs it takes as a
// parameter, which is also what lets tests substitute in-memory fakes.

use crate::constants::{self, WellKnownConfigFile, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use agent_sdk::AgentWebProxy;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The reason the agent is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

/// The central application context for one agent process.
///
/// One `HostContext` exists per process ("Agent" for the listener, "Worker"
/// for the worker). It owns the process-wide secret masker, creates
/// per-component trace sources over it, resolves well-known directories and
/// files, and coordinates graceful shutdown.
pub struct HostContext {
    /// The host type string ("Agent" or "Worker").
    host_type: String,

    /// Secret masker shared across the entire process.
    pub secret_masker: SecretMasker,

    /// Web proxy configuration read from environment variables.
    pub web_proxy: AgentWebProxy,

    /// Trace manager for creating per-component trace sources.
    trace_manager: TraceManager,

    /// Cancellation token for coordinated agent shutdown.
    shutdown_token: CancellationToken,

    /// The reason for shutdown, set once `shutdown_agent` is called.
    shutdown_reason: Mutex<Option<ShutdownReason>>,

    /// Override for the agent root directory (used in tests).
    root_override: Mutex<Option<PathBuf>>,

    /// Work folder override, set after settings are loaded.
    work_folder_override: Mutex<Option<PathBuf>>,
}

impl HostContext {
    /// Create a new `HostContext`.
    ///
    /// `host_type` should be `"Agent"` for the listener or `"Worker"` for
    /// the worker process.
    pub fn new(host_type: impl Into<String>) -> Arc<Self> {
        let host_type = host_type.into();
        assert!(!host_type.is_empty(), "host_type must not be empty");

        let secret_masker = SecretMasker::new();
        let web_proxy = AgentWebProxy::new();

        // Proxy passwords are secrets from the first trace line onward.
        if let Some(ref password) = web_proxy.http_proxy_password {
            secret_masker.add_value(password, "HttpProxyPassword");
        }
        if let Some(ref password) = web_proxy.https_proxy_password {
            secret_masker.add_value(password, "HttpsProxyPassword");
        }

        let print_to_stdout = env::var("AGENT_PRINT_LOG_TO_STDOUT")
            .ok()
            .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        let trace_setting = TraceSetting {
            print_to_stdout,
            ..TraceSetting::default()
        };
        let trace_manager = TraceManager::with_setting(secret_masker.clone(), trace_setting);

        Arc::new(Self {
            host_type,
            secret_masker,
            web_proxy,
            trace_manager,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            root_override: Mutex::new(None),
            work_folder_override: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Directory resolution
    // -----------------------------------------------------------------------

    /// Override the root directory (used primarily for testing).
    pub fn set_root_override(&self, path: PathBuf) {
        *self.root_override.lock().unwrap() = Some(path);
    }

    /// Set the work folder path explicitly (used after loading settings).
    pub fn set_work_folder(&self, work_folder: &str) {
        let root = self.get_directory(WellKnownDirectory::Root);
        let full_path = if Path::new(work_folder).is_absolute() {
            PathBuf::from(work_folder)
        } else {
            root.join(work_folder)
        };
        *self.work_folder_override.lock().unwrap() = Some(full_path);
    }

    /// Resolve the path for a well-known directory.
    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Bin => env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from(".")),

            WellKnownDirectory::Root => {
                if let Some(ref root) = *self.root_override.lock().unwrap() {
                    return root.clone();
                }
                let bin = self.get_directory(WellKnownDirectory::Bin);
                bin.parent().map(|p| p.to_path_buf()).unwrap_or(bin)
            }

            WellKnownDirectory::Diag => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::DIAG_DIRECTORY),

            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),

            WellKnownDirectory::Tools => env::var("AGENT_TOOLSDIRECTORY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    self.get_directory(WellKnownDirectory::Work)
                        .join(constants::path::TOOL_DIRECTORY)
                }),

            WellKnownDirectory::Update => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::UPDATE_DIRECTORY),

            WellKnownDirectory::Work => {
                if let Some(ref work) = *self.work_folder_override.lock().unwrap() {
                    return work.clone();
                }
                self.get_directory(WellKnownDirectory::Root)
                    .join(constants::path::WORK_DIRECTORY)
            }
        }
    }

    /// Resolve the path for a well-known configuration file.
    pub fn get_config_file(&self, config_file: WellKnownConfigFile) -> PathBuf {
        let root = self.get_directory(WellKnownDirectory::Root);
        match config_file {
            WellKnownConfigFile::Agent => root.join(".agent"),
            WellKnownConfigFile::Credentials => root.join(".credentials"),
            WellKnownConfigFile::Session => root.join(".session"),
        }
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Get the cancellation token that fires on agent shutdown.
    pub fn agent_shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Get the reason for shutdown, if shutdown has been initiated.
    pub fn agent_shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock().unwrap()
    }

    /// Initiate agent shutdown with the given reason.
    pub fn shutdown_agent(&self, reason: ShutdownReason) {
        let trace = self.get_trace("HostContext");
        agent_sdk::TraceWriter::info(&trace, &format!("Agent will be shut down for {}", reason));
        *self.shutdown_reason.lock().unwrap() = Some(reason);
        self.shutdown_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    /// Get the host type string.
    pub fn host_type(&self) -> &str {
        &self.host_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_override_changes_resolution() {
        let context = HostContext::new("Agent");
        let dir = tempfile::tempdir().unwrap();
        context.set_root_override(dir.path().to_path_buf());

        assert_eq!(context.get_directory(WellKnownDirectory::Root), dir.path());
        assert_eq!(
            context.get_directory(WellKnownDirectory::Work),
            dir.path().join("_work")
        );
        assert_eq!(
            context.get_config_file(WellKnownConfigFile::Agent),
            dir.path().join(".agent")
        );
    }

    #[test]
    fn work_folder_override_wins() {
        let context = HostContext::new("Agent");
        let dir = tempfile::tempdir().unwrap();
        context.set_root_override(dir.path().to_path_buf());
        context.set_work_folder("custom_work");
        assert_eq!(
            context.get_directory(WellKnownDirectory::Work),
            dir.path().join("custom_work")
        );
    }

    #[test]
    fn shutdown_fires_token_and_records_reason() {
        let context = HostContext::new("Agent");
        let token = context.agent_shutdown_token();
        assert!(!token.is_cancelled());
        assert_eq!(context.agent_shutdown_reason(), None);

        context.shutdown_agent(ShutdownReason::UserCancelled);
        assert!(token.is_cancelled());
        assert_eq!(
            context.agent_shutdown_reason(),
            Some(ShutdownReason::UserCancelled)
        );
    }
}
