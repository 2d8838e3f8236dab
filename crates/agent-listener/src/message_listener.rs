// Session management and the long-poll surface of the listener: session
// create/resume with retries, next-message with one-shot token refresh,
// acknowledge, keep-alive heartbeats, and best-effort session deletion.

use agent_common::{ConfigurationStore, HostContext, SessionRecord, Tracing};
use agent_sdk::TraceWriter;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control_plane::{AgentMessage, ControlPlane, ControlPlaneError};

/// Maximum number of session-create retries before giving up.
const MAX_SESSION_CREATE_RETRIES: u32 = 30;

/// Delay between session-create retries.
const SESSION_CREATE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Delay before re-creating a session after a conflict.
const SESSION_CONFLICT_DELAY: Duration = Duration::from_secs(5);

/// Interval between keep-alive heartbeats.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(57);

/// Owns the session with the control plane.
pub struct MessageListener {
    control_plane: Arc<dyn ControlPlane>,
    trace: Tracing,
    store: ConfigurationStore,
    session: Option<SessionRecord>,
    last_message_id: u64,
    keep_alive_stop: CancellationToken,
    keep_alive_task: Option<JoinHandle<()>>,
}

impl MessageListener {
    pub fn new(context: &Arc<HostContext>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            trace: context.get_trace("MessageListener"),
            store: ConfigurationStore::new(context),
            session: None,
            last_message_id: 0,
            keep_alive_stop: CancellationToken::new(),
            keep_alive_task: None,
        }
    }

    /// The current session id, if a session is open.
    pub fn session_id(&self) -> Option<uuid::Uuid> {
        self.session.as_ref().map(|s| s.session_id)
    }

    /// Create (or resume) a session.
    ///
    /// A session file left behind by a crashed listener resumes the stale
    /// session instead of conflicting with it. Transient create failures
    /// retry up to `MAX_SESSION_CREATE_RETRIES` times.
    pub async fn create_session(
        &mut self,
        agent_id: u64,
        agent_name: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        if let Some(stale) = self.store.get_session() {
            self.trace.info(&format!(
                "Resuming session {} from the session file.",
                stale.session_id
            ));
            self.session = Some(stale);
            self.start_keep_alive();
            return Ok(());
        }

        let mut retry_count = 0u32;
        let mut refreshed = false;
        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("Session creation cancelled");
            }

            match self.control_plane.create_session(agent_id, agent_name).await {
                Ok(session) => {
                    self.trace.info(&format!(
                        "Session created: {} (owner: {})",
                        session.session_id, session.owner_name
                    ));
                    // The session file outlives a crash so the next start
                    // can resume instead of conflicting.
                    self.store
                        .save_session(&session)
                        .context("Failed to write the session file")?;
                    self.session = Some(session);
                    self.start_keep_alive();
                    return Ok(());
                }

                Err(ControlPlaneError::SessionConflict) => {
                    self.trace.warning(&format!(
                        "Session conflict; another agent instance may be running. Retrying in {}s...",
                        SESSION_CONFLICT_DELAY.as_secs()
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(SESSION_CONFLICT_DELAY) => {}
                        _ = cancel.cancelled() => anyhow::bail!("Session creation cancelled"),
                    }
                }

                Err(ControlPlaneError::Unauthorized) if !refreshed => {
                    // One refresh, then the next loop iteration retries.
                    refreshed = true;
                    self.trace
                        .warning("Session create rejected; refreshing credentials once.");
                    self.control_plane
                        .refresh_token()
                        .await
                        .context("Credential refresh failed during session creation")?;
                }

                Err(e @ ControlPlaneError::Unauthorized) => {
                    return Err(e).context("Session create rejected after a credential refresh");
                }

                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_SESSION_CREATE_RETRIES {
                        return Err(e).context(format!(
                            "Failed to create session after {MAX_SESSION_CREATE_RETRIES} retries"
                        ));
                    }
                    self.trace.warning(&format!(
                        "Failed to create session (attempt {retry_count}/{MAX_SESSION_CREATE_RETRIES}): {e}. Retrying in {}s...",
                        SESSION_CREATE_RETRY_DELAY.as_secs()
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(SESSION_CREATE_RETRY_DELAY) => {}
                        _ = cancel.cancelled() => anyhow::bail!("Session creation cancelled"),
                    }
                }
            }
        }
    }

    /// Long-poll for the next message.
    ///
    /// Returns `None` when the poll times out with nothing queued. An
    /// authentication failure triggers exactly one token refresh before
    /// the error propagates.
    pub async fn get_next_message(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<Option<AgentMessage>> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id)
            .ok_or_else(|| anyhow::anyhow!("No active session; call create_session first"))?;

        let mut refreshed = false;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let poll = tokio::select! {
                result = self.control_plane.get_message(session_id, self.last_message_id) => result,
                _ = cancel.cancelled() => return Ok(None),
            };

            match poll {
                Ok(Some(message)) => {
                    if message.message_id > 0 {
                        self.last_message_id = message.message_id;
                    }
                    self.trace.info(&format!(
                        "Received message #{}: type={}",
                        message.message_id, message.message_type
                    ));
                    return Ok(Some(message));
                }
                Ok(None) => return Ok(None),
                Err(ControlPlaneError::Unauthorized) if !refreshed => {
                    refreshed = true;
                    self.trace
                        .warning("Message poll rejected; refreshing the access token once.");
                    self.control_plane
                        .refresh_token()
                        .await
                        .context("Token refresh failed")?;
                }
                Err(e) => return Err(e).context("Failed to poll for messages"),
            }
        }
    }

    /// Acknowledge a processed message.
    pub async fn delete_message(&self, message: &AgentMessage) -> Result<()> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id)
            .ok_or_else(|| anyhow::anyhow!("No active session"))?;

        if let Err(e) = self
            .control_plane
            .delete_message(session_id, message.message_id)
            .await
        {
            self.trace.warning(&format!(
                "Failed to delete message {}: {e}",
                message.message_id
            ));
        }
        Ok(())
    }

    /// Delete the session and remove the session file. Best-effort; always
    /// called before process exit on non-abrupt paths.
    pub async fn delete_session(&mut self) {
        self.keep_alive_stop.cancel();
        if let Some(task) = self.keep_alive_task.take() {
            let _ = task.await;
        }

        if let Some(session) = self.session.take() {
            self.trace
                .info(&format!("Deleting session {}", session.session_id));
            if let Err(e) = self.control_plane.delete_session(session.session_id).await {
                self.trace
                    .warning(&format!("Failed to delete the session: {e}"));
            }
        }

        let _ = self.store.delete_session();
    }

    /// Independent heartbeat task that runs alongside the poll loop.
    fn start_keep_alive(&mut self) {
        let session_id = match self.session.as_ref() {
            Some(session) => session.session_id,
            None => return,
        };

        let control_plane = Arc::clone(&self.control_plane);
        let stop = self.keep_alive_stop.clone();
        let trace = self.trace.clone();
        self.keep_alive_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {}
                    _ = stop.cancelled() => break,
                }
                if let Err(e) = control_plane.keep_alive(session_id).await {
                    trace.verbose(&format!("Keep-alive failed: {e}"));
                }
            }
        }));
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeControlPlane;
    use super::*;
    use std::sync::atomic::Ordering;

    fn listener_with(
        control_plane: Arc<FakeControlPlane>,
        dir: &std::path::Path,
    ) -> MessageListener {
        let context = HostContext::new("Agent");
        context.set_root_override(dir.to_path_buf());
        MessageListener::new(&context, control_plane)
    }

    #[tokio::test]
    async fn create_session_writes_the_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();
        let mut listener = listener_with(Arc::clone(&plane), dir.path());

        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();

        assert!(listener.session_id().is_some());
        assert!(dir.path().join(".session").is_file());

        listener.delete_session().await;
        assert!(!dir.path().join(".session").is_file());
        assert_eq!(plane.deleted_sessions.lock().len(), 1);
    }

    #[tokio::test]
    async fn stale_session_file_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();

        {
            let context = HostContext::new("Agent");
            context.set_root_override(dir.path().to_path_buf());
            let store = ConfigurationStore::new(&context);
            store
                .save_session(&SessionRecord {
                    session_id: uuid::Uuid::new_v4(),
                    owner_name: "agent-build-01".into(),
                })
                .unwrap();
        }

        let mut listener = listener_with(Arc::clone(&plane), dir.path());
        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();

        // Resumed, not re-created.
        assert!(plane.sessions.lock().is_empty());
        assert!(listener.session_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn session_conflict_retries_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();
        plane.conflicts_remaining.store(2, Ordering::SeqCst);
        let mut listener = listener_with(Arc::clone(&plane), dir.path());

        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plane.sessions.lock().len(), 1);
    }

    #[tokio::test]
    async fn poll_refreshes_token_once_on_401() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();
        plane.unauthorized_polls.store(1, Ordering::SeqCst);
        plane.push_message(42, "PipelineAgentJobRequest", "{}");

        let mut listener = listener_with(Arc::clone(&plane), dir.path());
        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();

        let message = listener
            .get_next_message(CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id, 42);
        assert_eq!(plane.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_401_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();
        plane.unauthorized_polls.store(2, Ordering::SeqCst);

        let mut listener = listener_with(Arc::clone(&plane), dir.path());
        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();

        let result = listener.get_next_message(CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(plane.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_heartbeats_flow_until_session_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::new();
        let mut listener = listener_with(Arc::clone(&plane), dir.path());

        listener
            .create_session(7, "build-01", CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(plane.heartbeats.load(Ordering::SeqCst) >= 2);

        listener.delete_session().await;
        let count = plane.heartbeats.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(plane.heartbeats.load(Ordering::SeqCst), count);
    }
}
