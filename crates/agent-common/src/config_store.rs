// Loading and saving agent settings, credentials, and the session file
// from the agent root directory.

use crate::constants::WellKnownConfigFile;
use crate::host_context::HostContext;

use agent_sdk::IOUtil;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AgentSettings
// ---------------------------------------------------------------------------

/// Persisted agent configuration (`.agent` file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    /// The agent's unique id on the control plane.
    #[serde(default, rename = "AgentId")]
    pub agent_id: u64,

    /// The agent's display name.
    #[serde(default, rename = "AgentName")]
    pub agent_name: String,

    /// The pool the agent is registered to.
    #[serde(default, rename = "PoolId")]
    pub pool_id: u64,

    /// The control-plane URL.
    #[serde(default, rename = "ServerUrl")]
    pub server_url: String,

    /// The work directory name / path (relative to root unless absolute).
    #[serde(default, rename = "WorkFolder")]
    pub work_folder: String,

    /// Whether auto-update is disabled.
    #[serde(default, rename = "DisableUpdate")]
    pub disable_update: bool,

    /// Whether the agent exits after its first job (run-once mode).
    #[serde(default, rename = "RunOnce")]
    pub run_once: bool,
}

// ---------------------------------------------------------------------------
// CredentialData
// ---------------------------------------------------------------------------

/// Persisted credential payload (`.credentials` file). Opaque to the core
/// apart from the token accessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialData {
    #[serde(default, rename = "Scheme")]
    pub scheme: String,

    #[serde(default, rename = "Data")]
    pub data: std::collections::HashMap<String, String>,
}

impl CredentialData {
    /// Look up a data entry by key.
    pub fn get_data(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// The access token, if present.
    pub fn token(&self) -> Option<&String> {
        self.get_data("token").or_else(|| self.get_data("accessToken"))
    }
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// The session file written at the agent root while a session is open.
/// A leftover file after a crash lets the next start resume the stale
/// session instead of conflicting with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "SessionId")]
    pub session_id: Uuid,

    #[serde(default, rename = "OwnerName")]
    pub owner_name: String,
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Handles loading and saving agent settings and credentials.
pub struct ConfigurationStore {
    settings_path: PathBuf,
    cred_path: PathBuf,
    session_path: PathBuf,
}

impl ConfigurationStore {
    pub fn new(context: &HostContext) -> Self {
        Self {
            settings_path: context.get_config_file(WellKnownConfigFile::Agent),
            cred_path: context.get_config_file(WellKnownConfigFile::Credentials),
            session_path: context.get_config_file(WellKnownConfigFile::Session),
        }
    }

    /// Whether the agent has been configured.
    pub fn is_configured(&self) -> bool {
        self.settings_path.is_file()
    }

    /// Whether credentials are stored.
    pub fn has_credentials(&self) -> bool {
        self.cred_path.is_file()
    }

    pub fn get_settings(&self) -> Result<AgentSettings> {
        IOUtil::load_object(&self.settings_path).context("Failed to load agent settings")
    }

    pub fn save_settings(&self, settings: &AgentSettings) -> Result<()> {
        IOUtil::save_object(settings, &self.settings_path).context("Failed to save agent settings")
    }

    pub fn delete_settings(&self) -> Result<()> {
        IOUtil::delete_file(&self.settings_path)
    }

    pub fn get_credentials(&self) -> Result<CredentialData> {
        IOUtil::load_object(&self.cred_path).context("Failed to load credentials")
    }

    pub fn save_credentials(&self, credentials: &CredentialData) -> Result<()> {
        IOUtil::save_object(credentials, &self.cred_path).context("Failed to save credentials")
    }

    pub fn delete_credentials(&self) -> Result<()> {
        IOUtil::delete_file(&self.cred_path)
    }

    /// The stale session left by a previous run, if any.
    pub fn get_session(&self) -> Option<SessionRecord> {
        if !self.session_path.is_file() {
            return None;
        }
        IOUtil::load_object(&self.session_path).ok()
    }

    pub fn save_session(&self, session: &SessionRecord) -> Result<()> {
        IOUtil::save_object(session, &self.session_path).context("Failed to save session file")
    }

    pub fn delete_session(&self) -> Result<()> {
        IOUtil::delete_file(&self.session_path)
    }
}
