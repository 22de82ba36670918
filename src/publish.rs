use anyhow::{Context, Result};
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::PublishConfig;
use crate::state::AppState;
use crate::tunnel::TunnelStatus;

/// Pushes the current tunnel URL (and catalog summary) into a JSON document
/// hosted in a remote repository, using the contents API: read the current
/// revision token, write back conditioned on it, retry once on conflict.
pub struct Publisher {
    client: reqwest::Client,
    config: PublishConfig,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    sha: String,
}

enum PutOutcome {
    Written,
    Conflict,
}

impl Publisher {
    pub fn new(config: PublishConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("lowkey-stream/0.1")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    fn document_url(&self) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.config.api_base, self.config.repo, self.config.config_path
        )
    }

    /// One read-modify-write cycle. Idempotent: publishing the same URL twice
    /// produces the same remote state.
    pub async fn publish(&self, tunnel_url: &str, catalog: &Catalog) -> Result<()> {
        let document = serde_json::json!({
            "tunnel_url": tunnel_url,
            "updated_at": chrono::Utc::now().to_rfc3339(),
            "server_status": "online",
            "videos": &catalog.videos,
        });
        let content = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec_pretty(&document)?);

        let sha = self.fetch_sha().await?;
        match self.put(&content, sha.as_deref()).await? {
            PutOutcome::Written => Ok(()),
            PutOutcome::Conflict => {
                // Someone else wrote between our read and write; re-read the
                // revision and retry exactly once.
                warn!("Remote config changed concurrently, retrying once");
                let sha = self.fetch_sha().await?;
                match self.put(&content, sha.as_deref()).await? {
                    PutOutcome::Written => Ok(()),
                    PutOutcome::Conflict => {
                        anyhow::bail!("Remote config conflicted twice, giving up")
                    }
                }
            }
        }
    }

    /// Current revision token of the remote document, `None` when the
    /// document does not exist yet.
    async fn fetch_sha(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.document_url())
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to fetch remote config")?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => {
                anyhow::bail!("Remote config authentication failed; check the publish token")
            }
            status if status.is_success() => {
                let file: RemoteFile = response
                    .json()
                    .await
                    .context("Failed to parse remote config metadata")?;
                Ok(Some(file.sha))
            }
            status => anyhow::bail!("Remote config fetch failed with {status}"),
        }
    }

    async fn put(&self, content_b64: &str, sha: Option<&str>) -> Result<PutOutcome> {
        let mut body = serde_json::json!({
            "message": format!(
                "Update tunnel URL - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            ),
            "content": content_b64,
        });
        if let Some(sha) = sha {
            body["sha"] = serde_json::Value::String(sha.to_string());
        }

        let response = self
            .client
            .put(self.document_url())
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .context("Failed to write remote config")?;

        match response.status() {
            status if status.is_success() => Ok(PutOutcome::Written),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Ok(PutOutcome::Conflict),
            StatusCode::UNAUTHORIZED => {
                anyhow::bail!("Remote config authentication failed; check the publish token")
            }
            status => anyhow::bail!("Remote config write failed with {status}"),
        }
    }
}

/// Long-lived task: publish whenever the tunnel reports a URL different from
/// the last one successfully pushed, and whenever the catalog changes while a
/// tunnel URL is live. Publish failures are logged, never fatal; the next
/// trigger retries naturally.
pub async fn run_publisher(
    publisher: Publisher,
    state: AppState,
    mut tunnel_rx: watch::Receiver<TunnelStatus>,
    mut catalog_changed_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut last_published_url: Option<String> = None;

    loop {
        let catalog_changed = tokio::select! {
            changed = tunnel_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                false
            }
            trigger = catalog_changed_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
                true
            }
            _ = cancel.cancelled() => break,
        };

        let status = tunnel_rx.borrow().clone();
        let Some(url) = status.url else {
            continue;
        };

        if !catalog_changed && last_published_url.as_deref() == Some(url.as_str()) {
            continue;
        }

        let catalog = state.catalog().await;
        match publisher.publish(&url, &catalog).await {
            Ok(()) => {
                info!("Published tunnel URL to remote config: {url}");
                last_published_url = Some(url);
            }
            Err(e) => {
                // last_published_url stays unset, so the next tunnel or
                // catalog event retries this URL.
                warn!("Failed to publish remote config: {e:#}");
            }
        }
    }

    info!("Publisher stopped");
}
