// The listener's view of the control plane: an opaque message source with
// session, long-poll, acknowledge, and heartbeat operations.
//
// `ControlPlane` is a trait so the message listener and the agent pump are
// testable against an in-memory fake; `HttpControlPlane` is the production
// long-poll client.

use agent_common::{CredentialData, SessionRecord};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Long-poll timeout for the next-message request.
const GET_MESSAGE_TIMEOUT: Duration = Duration::from_secs(50);

/// Errors from control-plane operations, typed so callers can pick the
/// right recovery (refresh, conflict delay, backoff).
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("authentication rejected by the control plane")]
    Unauthorized,
    #[error("another session is already active for this agent")]
    SessionConflict,
    #[error("control plane returned HTTP {0}")]
    Http(u16),
    #[error("control plane request failed: {0}")]
    Transport(String),
}

/// A message dequeued from the agent's message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    #[serde(default)]
    pub message_id: u64,
    pub message_type: String,
    #[serde(default)]
    pub body: String,
}

/// Well-known message kinds the listener consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMessageKind {
    JobRequest,
    JobCancel,
    JobMetadataUpdate,
    AgentRefresh,
    Unknown,
}

impl AgentMessage {
    pub fn kind(&self) -> AgentMessageKind {
        match self.message_type.as_str() {
            "PipelineAgentJobRequest" | "JobRequest" => AgentMessageKind::JobRequest,
            "JobCancellation" => AgentMessageKind::JobCancel,
            "JobMetadataUpdate" => AgentMessageKind::JobMetadataUpdate,
            "AgentRefresh" => AgentMessageKind::AgentRefresh,
            _ => AgentMessageKind::Unknown,
        }
    }
}

/// Control-plane operations the listener core depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register a session for the agent. The returned session id scopes all
    /// subsequent polls.
    async fn create_session(
        &self,
        agent_id: u64,
        agent_name: &str,
    ) -> Result<SessionRecord, ControlPlaneError>;

    /// Delete the session; best-effort on shutdown paths.
    async fn delete_session(&self, session_id: Uuid) -> Result<(), ControlPlaneError>;

    /// Long-poll for the next message. `Ok(None)` means the poll timed out
    /// with nothing queued.
    async fn get_message(
        &self,
        session_id: Uuid,
        last_message_id: u64,
    ) -> Result<Option<AgentMessage>, ControlPlaneError>;

    /// Acknowledge a message, removing it from the server-side queue.
    async fn delete_message(
        &self,
        session_id: Uuid,
        message_id: u64,
    ) -> Result<(), ControlPlaneError>;

    /// Heartbeat emitted by the keep-alive task.
    async fn keep_alive(&self, session_id: Uuid) -> Result<(), ControlPlaneError>;

    /// Refresh the access token after an authentication failure. One
    /// attempt; a second 401 propagates.
    async fn refresh_token(&self) -> Result<(), ControlPlaneError>;
}

/// Production long-poll client over the control plane's HTTP surface.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    pool_id: u64,
    token: RwLock<String>,
    /// Path of the credentials file, re-read on token refresh.
    credentials_path: Option<std::path::PathBuf>,
    http_trace: bool,
}

impl HttpControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        pool_id: u64,
        credentials: CredentialData,
        credentials_path: Option<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(GET_MESSAGE_TIMEOUT + Duration::from_secs(10))
            .build()?;

        let token = credentials.token().cloned().unwrap_or_default();
        let http_trace = std::env::var(agent_common::constants::env_vars::HTTP_TRACE)
            .ok()
            .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pool_id,
            token: RwLock::new(token),
            credentials_path,
            http_trace,
        })
    }

    fn sessions_url(&self) -> String {
        format!(
            "{}/_apis/distributedtask/pools/{}/sessions",
            self.base_url, self.pool_id
        )
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/_apis/distributedtask/pools/{}/messages",
            self.base_url, self.pool_id
        )
    }

    async fn check(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
        what: &str,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let response = response.map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        let status = response.status();

        if self.http_trace {
            tracing::debug!("{} -> HTTP {}", what, status.as_u16());
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(ControlPlaneError::Unauthorized)
        } else if status == reqwest::StatusCode::CONFLICT {
            Err(ControlPlaneError::SessionConflict)
        } else if status.is_success() {
            Ok(response)
        } else {
            Err(ControlPlaneError::Http(status.as_u16()))
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_session(
        &self,
        agent_id: u64,
        agent_name: &str,
    ) -> Result<SessionRecord, ControlPlaneError> {
        let body = serde_json::json!({
            "agent": { "id": agent_id, "name": agent_name },
            "ownerName": format!("agent-{agent_name}"),
        });

        let token = self.token.read().clone();
        let response = self
            .check(
                self.client
                    .post(self.sessions_url())
                    .bearer_auth(token)
                    .header("Accept", "application/json;api-version=6.0-preview")
                    .json(&body)
                    .send()
                    .await,
                "session create",
            )
            .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SessionResponse {
            session_id: Uuid,
            #[serde(default)]
            owner_name: String,
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        Ok(SessionRecord {
            session_id: session.session_id,
            owner_name: session.owner_name,
        })
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), ControlPlaneError> {
        let token = self.token.read().clone();
        self.check(
            self.client
                .delete(format!("{}/{}", self.sessions_url(), session_id))
                .bearer_auth(token)
                .header("Accept", "application/json;api-version=6.0-preview")
                .send()
                .await,
            "session delete",
        )
        .await?;
        Ok(())
    }

    async fn get_message(
        &self,
        session_id: Uuid,
        last_message_id: u64,
    ) -> Result<Option<AgentMessage>, ControlPlaneError> {
        let url = format!(
            "{}?sessionId={}&lastMessageId={}",
            self.messages_url(),
            session_id,
            last_message_id
        );

        let token = self.token.read().clone();
        let result = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/json;api-version=6.0-preview")
            .timeout(GET_MESSAGE_TIMEOUT)
            .send()
            .await;

        // A long-poll timeout just means no message was queued.
        if let Err(ref e) = result {
            if e.is_timeout() {
                return Ok(None);
            }
        }

        let response = self.check(result, "message poll").await?;
        if response.status() == reqwest::StatusCode::ACCEPTED
            || response.status() == reqwest::StatusCode::NO_CONTENT
        {
            return Ok(None);
        }

        let message: AgentMessage = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        Ok(Some(message))
    }

    async fn delete_message(
        &self,
        session_id: Uuid,
        message_id: u64,
    ) -> Result<(), ControlPlaneError> {
        let token = self.token.read().clone();
        self.check(
            self.client
                .delete(format!(
                    "{}/{}?sessionId={}",
                    self.messages_url(),
                    message_id,
                    session_id
                ))
                .bearer_auth(token)
                .header("Accept", "application/json;api-version=6.0-preview")
                .send()
                .await,
            "message delete",
        )
        .await?;
        Ok(())
    }

    async fn keep_alive(&self, session_id: Uuid) -> Result<(), ControlPlaneError> {
        let token = self.token.read().clone();
        self.check(
            self.client
                .put(format!("{}/{}/keepalive", self.sessions_url(), session_id))
                .bearer_auth(token)
                .header("Accept", "application/json;api-version=6.0-preview")
                .send()
                .await,
            "keep alive",
        )
        .await?;
        Ok(())
    }

    async fn refresh_token(&self) -> Result<(), ControlPlaneError> {
        // Credentials on disk may have been rotated by an operator or a
        // side-channel refresher; re-reading them is the one refresh the
        // core performs before giving up.
        let path = self
            .credentials_path
            .as_ref()
            .ok_or(ControlPlaneError::Unauthorized)?;
        let credentials: CredentialData = agent_sdk::IOUtil::load_object(path)
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        match credentials.token() {
            Some(token) => {
                *self.token.write() = token.clone();
                Ok(())
            }
            None => Err(ControlPlaneError::Unauthorized),
        }
    }
}
