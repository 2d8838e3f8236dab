// Agent self-update: version gate, package download with digest
// verification, and staging into the update directory. The listener exits
// with the updating return code once a package is staged; the service host
// relaunches the new binary.

use agent_common::constants::WellKnownDirectory;
use agent_common::{HostContext, Tracing};
use agent_sdk::TraceWriter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Body of an agent-refresh message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRefreshMessage {
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub download_url: Option<String>,
    /// Hex SHA-256 of the package, when the control plane provides one.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Applies an agent refresh. A trait so the message pump is testable with
/// a controllable fake.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Apply the refresh. Returns `true` when the listener must restart
    /// into the staged update.
    async fn apply(
        &self,
        message: &AgentRefreshMessage,
        cancel: CancellationToken,
    ) -> Result<bool>;
}

/// Production self-updater.
pub struct SelfUpdater {
    host_context: Arc<HostContext>,
    trace: Tracing,
}

impl SelfUpdater {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        let trace = host_context.get_trace("SelfUpdater");
        Self {
            host_context,
            trace,
        }
    }

    /// Whether the advertised version differs from the running one.
    pub fn needs_update(&self, target_version: &str) -> bool {
        !target_version.is_empty() && target_version != agent_sdk::AgentPackage::VERSION
    }

    /// Download and verify the package, then extract it into the update
    /// staging directory.
    async fn download_and_stage(
        &self,
        message: &AgentRefreshMessage,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let download_url = message
            .download_url
            .as_deref()
            .context("Agent refresh message carries no download URL")?;

        let update_dir = self.host_context.get_directory(WellKnownDirectory::Update);
        agent_sdk::IOUtil::delete_directory(&update_dir)?;
        agent_sdk::IOUtil::create_directory(&update_dir)?;

        self.trace.info(&format!(
            "Downloading agent package {} from {}",
            message.target_version, download_url
        ));

        let client = reqwest::Client::new();
        let response = tokio::select! {
            result = client.get(download_url).send() => {
                result.context("Package download request failed")?
            }
            _ = cancel.cancelled() => anyhow::bail!("Self-update cancelled"),
        };
        if !response.status().is_success() {
            anyhow::bail!(
                "Package download failed with HTTP {}",
                response.status().as_u16()
            );
        }

        let bytes = tokio::select! {
            result = response.bytes() => result.context("Package download failed mid-stream")?,
            _ = cancel.cancelled() => anyhow::bail!("Self-update cancelled"),
        };

        if let Some(ref expected) = message.checksum {
            let digest = hex::encode(Sha256::digest(&bytes));
            if !digest.eq_ignore_ascii_case(expected) {
                anyhow::bail!(
                    "Package digest mismatch: expected {expected}, computed {digest}"
                );
            }
            self.trace.info("Package digest verified.");
        }

        let package_path = update_dir.join("agent-package.tar.gz");
        tokio::fs::write(&package_path, &bytes)
            .await
            .with_context(|| format!("Failed to write '{}'", package_path.display()))?;

        extract_package(&package_path, &update_dir)?;
        self.trace.info(&format!(
            "Agent package staged at '{}'.",
            update_dir.display()
        ));

        Ok(update_dir)
    }
}

#[async_trait]
impl Updater for SelfUpdater {
    async fn apply(
        &self,
        message: &AgentRefreshMessage,
        cancel: CancellationToken,
    ) -> Result<bool> {
        if !self.needs_update(&message.target_version) {
            self.trace.info(&format!(
                "Already at version {}; no update needed.",
                agent_sdk::AgentPackage::VERSION
            ));
            return Ok(false);
        }

        self.download_and_stage(message, cancel).await?;
        Ok(true)
    }
}

/// Extract a gzipped tarball into the target directory.
fn extract_package(package: &std::path::Path, target: &std::path::Path) -> Result<()> {
    let file = std::fs::File::open(package)
        .with_context(|| format!("Failed to open '{}'", package.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(target)
        .with_context(|| format!("Failed to extract '{}'", package.display()))?;
    Ok(())
}
