//! Controller background jobs.
//!
//! Three periodic maintenance loops run for the life of the process: the
//! offline sweeper, the node directory sync and deployment retention.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::database::Database;
use crate::models::Node;
use crate::utils;

/// Seconds between offline sweeps.
const OFFLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A host record as reported by the external node directory.
#[derive(Debug, Deserialize)]
struct DirectoryHost {
    hostname: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    online: bool,
    #[serde(default)]
    last_seen: Option<i64>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// The controller's background maintenance jobs.
pub struct Jobs {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    db: Database,
    /// HTTP client for the node directory.
    http: reqwest::Client,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl Jobs {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: Database, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            db,
            http: reqwest::Client::new(),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        tracing::info!("background jobs started");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());

        // Interval timers fire immediately on the first tick, which also
        // gives the node directory its startup sync.
        let mut offline_timer = tokio::time::interval(OFFLINE_SWEEP_INTERVAL);
        let mut node_sync_timer = tokio::time::interval(Duration::from_secs(self.config.node_sync_interval_seconds));
        let mut cleanup_timer = tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_seconds));

        loop {
            tokio::select! {
                _ = offline_timer.tick() => self.sweep_offline_agents().await,
                _ = node_sync_timer.tick() => self.sync_nodes().await,
                _ = cleanup_timer.tick() => self.cleanup_old_deployments().await,
                _ = shutdown.next() => break,
            }
        }

        tracing::debug!("background jobs shut down");
        Ok(())
    }

    /// Mark agents without a recent heartbeat offline.
    async fn sweep_offline_agents(&self) {
        let threshold = utils::now() - self.config.agent_timeout_seconds as i64;
        match self.db.mark_agents_offline(threshold).await {
            Ok(0) => tracing::debug!("checked for offline agents"),
            Ok(flipped) => tracing::info!(flipped, "marked stale agents offline"),
            Err(err) => tracing::warn!(error = ?err, "failed to mark agents offline"),
        }
    }

    /// Refresh the node roster from the external node directory.
    async fn sync_nodes(&self) {
        let url = match &self.config.node_directory_url {
            Some(url) => url,
            None => {
                tracing::debug!("node directory URL not configured, skipping node sync");
                return;
            }
        };

        let hosts: Vec<DirectoryHost> = match self.fetch_hosts(url).await {
            Ok(hosts) => hosts,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to fetch nodes from node directory");
                return;
            }
        };
        tracing::info!(count = hosts.len(), "syncing nodes from node directory");

        // Overlay has-agent from the current agent shadow records.
        let agents = match self.db.list_agents(false).await {
            Ok(agents) => agents,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to list agents");
                return;
            }
        };

        for host in hosts {
            let has_agent = agents.iter().any(|agent| agent.hostname == host.hostname);
            let node = Node {
                hostname: host.hostname.clone(),
                ip: host.ip,
                tags: host.tags,
                online: host.online,
                has_agent,
                last_seen: host.last_seen,
                metadata: host.metadata,
                synced_at: utils::now(),
            };
            if let Err(err) = self.db.upsert_node(node).await {
                tracing::warn!(error = ?err, hostname = %host.hostname, "failed to upsert node");
            }
        }
    }

    async fn fetch_hosts(&self, url: &str) -> Result<Vec<DirectoryHost>> {
        let response = self.http.get(format!("{}/api/v1/hosts", url)).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("node directory returned status {}", response.status());
        }
        Ok(response.json().await?)
    }

    /// Delete terminal deployments older than the retention window.
    async fn cleanup_old_deployments(&self) {
        let cutoff = utils::now() - self.config.deployment_retention_seconds as i64;
        match self.db.cleanup_old_deployments(cutoff).await {
            Ok(0) => tracing::debug!("no deployments eligible for cleanup"),
            Ok(removed) => tracing::info!(removed, "cleaned up old deployments"),
            Err(err) => tracing::warn!(error = ?err, "failed to cleanup old deployments"),
        }
    }
}
