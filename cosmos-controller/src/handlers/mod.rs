//! External component dispatchers.
//!
//! Components routed away from the in-agent handler are applied through one
//! of these collaborators: unmanaged scripts go to the bulk script
//! dispatcher, services go to the job orchestrator. Each dispatcher owns its
//! own HTTP integration; the planner routes between them and the stream
//! registry by handler variant.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::models::Component;

/// Client of the external bulk script dispatcher.
pub struct BulkDispatcher {
    url: Option<String>,
    http: reqwest::Client,
}

/// The dispatch request accepted by the bulk script dispatcher.
#[derive(Serialize)]
struct BulkScriptRequest<'a> {
    content: &'a str,
    targets: &'a [String],
    hash: &'a str,
}

impl BulkDispatcher {
    /// Create a new instance.
    pub fn new(url: Option<String>) -> Self {
        Self { url, http: reqwest::Client::new() }
    }

    /// Submit a script for one-shot execution on the target nodes.
    pub async fn deploy(&self, component: &Component, targets: &[String]) -> Result<()> {
        let url = match &self.url {
            Some(url) => url,
            None => bail!("bulk dispatcher URL not configured"),
        };
        let content = component.content.as_deref().unwrap_or_default();
        if content.is_empty() {
            bail!("content is required for bulk-dispatched scripts");
        }

        tracing::info!(component = %component.name, nodes = targets.len(), "deploying script via bulk dispatcher");
        let request = BulkScriptRequest {
            content,
            targets,
            hash: &component.hash,
        };
        let response = self
            .http
            .post(format!("{}/api/v1/scripts", url))
            .json(&request)
            .send()
            .await
            .context("error submitting script to bulk dispatcher")?;
        if !response.status().is_success() {
            bail!("bulk dispatcher returned status {}", response.status());
        }

        tracing::info!(component = %component.name, "script submitted to bulk dispatcher");
        Ok(())
    }
}

/// Client of the external job orchestrator.
pub struct OrchestratorDispatcher {
    url: Option<String>,
    http: reqwest::Client,
}

impl OrchestratorDispatcher {
    /// Create a new instance.
    pub fn new(url: Option<String>) -> Self {
        Self { url, http: reqwest::Client::new() }
    }

    /// Submit a service component's job payload to the orchestrator.
    pub async fn deploy(&self, component: &Component) -> Result<()> {
        let url = match &self.url {
            Some(url) => url,
            None => bail!("orchestrator URL not configured"),
        };
        let job = match &component.job {
            Some(job) => job,
            None => bail!("job payload is required for services"),
        };

        tracing::info!(component = %component.name, "deploying service to orchestrator");
        let response = self
            .http
            .post(format!("{}/v1/jobs", url))
            .json(&serde_json::json!({ "job": job }))
            .send()
            .await
            .context("error submitting job to orchestrator")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("orchestrator returned status {}: {}", status, body);
        }

        tracing::info!(component = %component.name, "service deployed to orchestrator");
        Ok(())
    }

    /// Delete a service component's job from the orchestrator.
    pub async fn remove(&self, component_name: &str) -> Result<()> {
        let url = match &self.url {
            Some(url) => url,
            None => bail!("orchestrator URL not configured"),
        };

        tracing::info!(component = %component_name, "removing service from orchestrator");
        let response = self
            .http
            .delete(format!("{}/v1/job/{}", url, component_name))
            .send()
            .await
            .context("error deleting job from orchestrator")?;
        if !response.status().is_success() {
            bail!("orchestrator returned status {}", response.status());
        }

        tracing::info!(component = %component_name, "service removed from orchestrator");
        Ok(())
    }
}
