// The worker's connection back to the control plane for timeline updates,
// console lines, log uploads, and the terminal job-completed event.
//
// `JobServer` is a trait so the queue and the job runner are testable with
// an in-memory fake; `HttpJobServer` is the production implementation built
// from the job request's system connection endpoint.

use agent_common::{NonRetryableError, TaskResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::timeline::TimelineRecord;

/// A batch of console lines for one timeline record.
#[derive(Debug, Clone)]
pub struct ConsoleLineBatch {
    pub record_id: Uuid,
    pub start_line: u64,
    pub lines: Vec<String>,
}

/// Server operations the worker core depends on.
#[async_trait]
pub trait JobServer: Send + Sync {
    /// Patch a batch of timeline records.
    async fn update_records(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        records: Vec<TimelineRecord>,
    ) -> Result<()>;

    /// Append web-console lines for one record.
    async fn append_console_lines(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        batch: ConsoleLineBatch,
    ) -> Result<()>;

    /// Upload a completed log page for a record.
    async fn upload_log(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        record_id: Uuid,
        path: &Path,
    ) -> Result<()>;

    /// Raise the terminal job-completed event.
    async fn raise_job_completed(
        &self,
        plan_id: Uuid,
        job_id: Uuid,
        result: TaskResult,
    ) -> Result<()>;

    /// Cumulative delay the server has imposed through throttling responses.
    fn accumulated_throttling(&self) -> Duration {
        Duration::ZERO
    }
}

/// Production implementation over the control plane's HTTP surface.
pub struct HttpJobServer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    http_trace: bool,
    throttled: parking_lot::Mutex<Duration>,
}

impl HttpJobServer {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for the job server")?;

        let http_trace = std::env::var(agent_common::constants::env_vars::HTTP_TRACE)
            .ok()
            .and_then(|v| agent_sdk::StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http_trace,
            throttled: parking_lot::Mutex::new(Duration::ZERO),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json;api-version=6.0-preview");
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Execute a request, accounting for throttling responses. A 429 adds
    /// the advertised retry delay to the accumulated total; the caller's
    /// queue surfaces that to the user once per job.
    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {what} request"))?;

        if self.http_trace {
            tracing::debug!("{} -> HTTP {}", what, response.status().as_u16());
        }

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            *self.throttled.lock() += Duration::from_secs(retry_after);
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(NonRetryableError::new(format!(
                "{what} rejected with HTTP {}: {}",
                status.as_u16(),
                body
            ))
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{what} failed with HTTP {}: {}", status.as_u16(), body);
        }

        Ok(response)
    }
}

#[async_trait]
impl JobServer for HttpJobServer {
    async fn update_records(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        records: Vec<TimelineRecord>,
    ) -> Result<()> {
        let url = format!(
            "{}/_apis/distributedtask/plans/{}/timelines/{}/records",
            self.base_url, plan_id, timeline_id
        );
        self.send(
            self.request(reqwest::Method::PATCH, &url)
                .json(&serde_json::json!({ "value": records, "count": records.len() })),
            "timeline record update",
        )
        .await?;
        Ok(())
    }

    async fn append_console_lines(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        batch: ConsoleLineBatch,
    ) -> Result<()> {
        let url = format!(
            "{}/_apis/distributedtask/plans/{}/timelines/{}/records/{}/feed",
            self.base_url, plan_id, timeline_id, batch.record_id
        );
        self.send(
            self.request(reqwest::Method::POST, &url).json(&serde_json::json!({
                "value": batch.lines,
                "startLine": batch.start_line,
            })),
            "console line append",
        )
        .await?;
        Ok(())
    }

    async fn upload_log(
        &self,
        plan_id: Uuid,
        timeline_id: Uuid,
        record_id: Uuid,
        path: &Path,
    ) -> Result<()> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read log page '{}'", path.display()))?;

        let url = format!(
            "{}/_apis/distributedtask/plans/{}/timelines/{}/records/{}/logs",
            self.base_url, plan_id, timeline_id, record_id
        );
        self.send(
            self.request(reqwest::Method::POST, &url)
                .header("Content-Type", "application/octet-stream")
                .body(content),
            "log upload",
        )
        .await?;
        Ok(())
    }

    async fn raise_job_completed(
        &self,
        plan_id: Uuid,
        job_id: Uuid,
        result: TaskResult,
    ) -> Result<()> {
        let url = format!(
            "{}/_apis/distributedtask/plans/{}/events",
            self.base_url, plan_id
        );
        self.send(
            self.request(reqwest::Method::POST, &url).json(&serde_json::json!({
                "name": "JobCompleted",
                "jobId": job_id,
                "result": result,
            })),
            "job completed event",
        )
        .await?;
        Ok(())
    }

    fn accumulated_throttling(&self) -> Duration {
        *self.throttled.lock()
    }
}
