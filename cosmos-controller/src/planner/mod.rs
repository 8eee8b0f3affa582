//! The deployment planner.
//!
//! Submitted configurations are diffed against stored component state and
//! turned into per-component imperative actions: removals first, then
//! updates, then additions. Failures are isolated per component; a deployment
//! is `completed` once every action has been dispatched, not once the fleet
//! has converged.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use cosmos_core::spec::{ComponentSpec, Configuration, Handler};
use cosmos_proto as proto;

use crate::config::Config;
use crate::database::Database;
use crate::grpc::StreamRegistry;
use crate::handlers::{BulkDispatcher, OrchestratorDispatcher};
use crate::models::{Component, ComponentDeployment, Deployment, DeploymentLog, Node};
use crate::utils;

/// The deployment planner.
pub struct Planner {
    /// The application's database system.
    db: Database,
    /// The registry of live agent streams.
    registry: Arc<StreamRegistry>,
    /// Dispatcher for unmanaged scripts.
    bulk: BulkDispatcher,
    /// Dispatcher for externally-orchestrated services.
    orchestrator: OrchestratorDispatcher,
}

impl Planner {
    /// Create a new instance.
    pub fn new(config: &Config, db: Database, registry: Arc<StreamRegistry>) -> Self {
        Self {
            db,
            registry,
            bulk: BulkDispatcher::new(config.bulk_dispatcher_url.clone()),
            orchestrator: OrchestratorDispatcher::new(config.orchestrator_url.clone()),
        }
    }

    /// Record a new deployment for the given desired configuration and spawn
    /// its processing task. This is the entry point used by the submission
    /// surface.
    pub async fn submit(self: &Arc<Self>, config: Configuration) -> Result<Deployment> {
        let envelope = serde_json::to_value(&config).context("error serializing configuration")?;
        let deployment = self.db.create_deployment(envelope).await?;
        let (planner, id) = (self.clone(), deployment.id);
        tokio::spawn(async move {
            if let Err(err) = planner.process_deployment(id, config).await {
                tracing::error!(error = ?err, deployment_id = %id, "error processing deployment");
            }
        });
        Ok(deployment)
    }

    /// Drive the given deployment to a terminal status.
    #[tracing::instrument(level = "info", skip(self, config))]
    pub async fn process_deployment(&self, deployment_id: Uuid, config: Configuration) -> Result<()> {
        self.db.update_deployment_status(deployment_id, "running", None).await?;

        if let Err(err) = self.plan_and_dispatch(deployment_id, config).await {
            self.db
                .update_deployment_status(deployment_id, "failed", Some(err.to_string()))
                .await?;
            return Err(err);
        }

        self.db.update_deployment_status(deployment_id, "completed", None).await?;
        tracing::info!(%deployment_id, "deployment processing completed");
        Ok(())
    }

    /// Diff desired against stored components and dispatch every resulting
    /// action. Per-component failures are logged & recorded, never fatal.
    async fn plan_and_dispatch(&self, deployment_id: Uuid, config: Configuration) -> Result<()> {
        let current = self.db.list_components().await.context("failed to list current components")?;
        let current: HashMap<&str, &Component> = current.iter().map(|component| (component.name.as_str(), component)).collect();
        let desired: HashMap<&str, &ComponentSpec> = config.components.iter().map(|spec| (spec.name.as_str(), spec)).collect();

        let to_remove: Vec<&Component> = current
            .iter()
            .filter(|(name, _)| !desired.contains_key(*name))
            .map(|(_, component)| *component)
            .collect();
        let to_update: Vec<&ComponentSpec> = config
            .components
            .iter()
            .filter(|spec| current.get(spec.name.as_str()).map(|component| component.hash != spec.hash).unwrap_or(false))
            .collect();
        let to_add: Vec<&ComponentSpec> = config
            .components
            .iter()
            .filter(|spec| !current.contains_key(spec.name.as_str()))
            .collect();

        tracing::info!(
            %deployment_id,
            to_remove = to_remove.len(),
            to_update = to_update.len(),
            to_add = to_add.len(),
            "deployment plan calculated",
        );

        for component in to_remove {
            if let Err(err) = self.remove_component(deployment_id, component).await {
                tracing::error!(error = ?err, component = %component.name, "failed to remove component");
                self.log_deployment(deployment_id, Some(&component.name), None, "remove", "failure", &err.to_string())
                    .await;
            }
        }

        for spec in to_update.into_iter().chain(to_add) {
            if let Err(err) = self.deploy_component(deployment_id, spec).await {
                tracing::error!(error = ?err, component = %spec.name, "failed to deploy component");
                self.log_deployment(deployment_id, Some(&spec.name), None, "deploy", "failure", &err.to_string())
                    .await;
            }
        }

        Ok(())
    }

    /// Persist & dispatch one desired component.
    async fn deploy_component(&self, deployment_id: Uuid, spec: &ComponentSpec) -> Result<()> {
        let handler = spec.effective_handler();
        let now = utils::now();
        let component = Component {
            name: spec.name.clone(),
            kind: spec.kind.as_str().to_string(),
            handler: handler.as_str().to_string(),
            hash: spec.hash.clone(),
            tags: spec.tags.clone(),
            content: spec.content.clone(),
            content_url: spec.content_url.clone(),
            content_url_encoding: spec.content_url_encoding.clone(),
            job: spec.job.clone(),
            health_check: spec.health_check.clone(),
            env: spec.env.clone(),
            args: spec.args.clone(),
            managed: spec.managed,
            deployment_id: Some(deployment_id),
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_component(component.clone()).await.context("failed to save component")?;

        let nodes = self.resolve_placement(&spec.tags).await.context("failed to resolve target nodes")?;
        tracing::info!(
            component = %spec.name,
            kind = %component.kind,
            handler = %component.handler,
            target_nodes = nodes.len(),
            "deploying component",
        );

        match handler {
            Handler::Agent => self.deploy_via_agent(deployment_id, &component, &nodes).await,
            Handler::ExternalBulk => self.deploy_via_bulk(deployment_id, &component, &nodes).await,
            Handler::ExternalOrchestrator => self.deploy_via_orchestrator(deployment_id, &component).await,
        }
    }

    /// Dispatch a component over the control streams of its target agents.
    ///
    /// The `deploying` rows MUST exist before the broadcast: an agent may
    /// reply faster than this task resumes, and the reply upserts into the
    /// pre-created row.
    async fn deploy_via_agent(&self, deployment_id: Uuid, component: &Component, nodes: &[Node]) -> Result<()> {
        let targets: Vec<String> = nodes.iter().filter(|node| node.has_agent).map(|node| node.hostname.clone()).collect();
        if targets.is_empty() {
            bail!("no agents available on target nodes");
        }

        tracing::info!(component = %component.name, targets = ?targets, "broadcasting deployment to agents");
        for hostname in &targets {
            let mut row = ComponentDeployment::new(&component.name, hostname, utils::now());
            row.deployment_id = Some(deployment_id);
            row.message = Some("Deployment command sent to agent".to_string());
            self.db.upsert_component_deployment(row).await?;
            self.log_deployment(deployment_id, Some(&component.name), Some(hostname), "deploy", "initiated", "Sent to agent")
                .await;
        }

        let errors = self.registry.broadcast_deployment(&build_deployment_message(component), &targets).await;
        for (hostname, err) in errors {
            tracing::warn!(error = ?err, %hostname, component = %component.name, "deployment send error");
        }
        Ok(())
    }

    /// Dispatch an unmanaged script through the external bulk dispatcher.
    async fn deploy_via_bulk(&self, deployment_id: Uuid, component: &Component, nodes: &[Node]) -> Result<()> {
        if component.kind != "script" {
            bail!("bulk dispatcher only supports scripts");
        }
        let targets: Vec<String> = nodes.iter().map(|node| node.hostname.clone()).collect();
        if targets.is_empty() {
            bail!("no target nodes found");
        }

        self.bulk.deploy(component, &targets).await?;
        for hostname in &targets {
            self.log_deployment(
                deployment_id,
                Some(&component.name),
                Some(hostname),
                "deploy",
                "success",
                "Deployed via bulk dispatcher",
            )
            .await;
        }
        Ok(())
    }

    /// Dispatch a service through the external orchestrator.
    async fn deploy_via_orchestrator(&self, deployment_id: Uuid, component: &Component) -> Result<()> {
        if component.kind != "service" {
            bail!("orchestrator only supports services");
        }
        if let Err(err) = self.orchestrator.deploy(component).await {
            self.log_deployment(deployment_id, Some(&component.name), None, "deploy", "failure", &err.to_string())
                .await;
            return Err(err);
        }
        self.log_deployment(deployment_id, Some(&component.name), None, "deploy", "success", "Deployed to orchestrator")
            .await;
        Ok(())
    }

    /// Remove one stored component through its handler.
    async fn remove_component(&self, deployment_id: Uuid, component: &Component) -> Result<()> {
        tracing::info!(component = %component.name, handler = %component.handler, "removing component");
        match component.handler.as_str() {
            "agent" => self.remove_via_agent(deployment_id, component).await,
            "external-orchestrator" => {
                if let Err(err) = self.orchestrator.remove(&component.name).await {
                    self.log_deployment(deployment_id, Some(&component.name), None, "remove", "failure", &err.to_string())
                        .await;
                    return Err(err);
                }
                self.db.delete_component(&component.name).await?;
                self.log_deployment(deployment_id, Some(&component.name), None, "remove", "success", "Removed from orchestrator")
                    .await;
                Ok(())
            }
            // Bulk-dispatched scripts keep no remote state to tear down.
            "external-bulk" => self.db.delete_component(&component.name).await,
            other => bail!("unknown handler: {}", other),
        }
    }

    /// Broadcast removal to every node holding the component, then drop the
    /// local rows.
    async fn remove_via_agent(&self, deployment_id: Uuid, component: &Component) -> Result<()> {
        let deployments = self.db.get_component_deployments(&component.name).await?;
        let targets: Vec<String> = deployments.iter().map(|deployment| deployment.node_hostname.clone()).collect();
        if targets.is_empty() {
            return self.db.delete_component(&component.name).await;
        }

        let errors = self.registry.broadcast_removal(&component.name, &targets).await;
        for hostname in &targets {
            self.db.delete_component_deployment(&component.name, hostname).await?;
            self.log_deployment(deployment_id, Some(&component.name), Some(hostname), "remove", "initiated", "Sent to agent")
                .await;
        }
        self.db.delete_component(&component.name).await?;

        if !errors.is_empty() {
            for (hostname, err) in &errors {
                tracing::warn!(error = ?err, %hostname, "removal send error");
            }
            bail!("{} removals failed to send", errors.len());
        }
        Ok(())
    }

    /// Resolve a component's placement tags to the currently eligible nodes.
    ///
    /// Empty tags select every online node; otherwise any node whose tags
    /// intersect the given set and which is currently online.
    pub async fn resolve_placement(&self, tags: &[String]) -> Result<Vec<Node>> {
        if tags.is_empty() {
            return self.db.list_nodes(true).await;
        }
        let nodes = self.db.nodes_by_tags(tags).await?;
        Ok(nodes.into_iter().filter(|node| node.online).collect())
    }

    /// Append a deployment log entry, logging rather than propagating
    /// failures: the audit trail never aborts planning.
    async fn log_deployment(&self, deployment_id: Uuid, component: Option<&str>, node: Option<&str>, operation: &str, status: &str, message: &str) {
        let entry = DeploymentLog {
            deployment_id,
            component_name: component.map(String::from),
            node_hostname: node.map(String::from),
            operation: operation.to_string(),
            status: status.to_string(),
            message: Some(message.to_string()),
            created_at: utils::now(),
        };
        if let Err(err) = self.db.append_deployment_log(entry).await {
            tracing::warn!(error = ?err, "failed to append deployment log entry");
        }
    }
}

/// Build the wire message for a component deployment command.
fn build_deployment_message(component: &Component) -> proto::ComponentDeployment {
    proto::ComponentDeployment {
        component_name: component.name.clone(),
        component_type: component.kind.clone(),
        hash: component.hash.clone(),
        content_url: component.content_url.clone().unwrap_or_default(),
        content_url_encoding: component.content_url_encoding.clone().unwrap_or_default(),
        content: component.content.clone().unwrap_or_default(),
        managed: component.managed,
        env: component.env.clone().unwrap_or_default(),
        args: component.args.clone().unwrap_or_default(),
        health_check: component.health_check.as_ref().map(|check| proto::HealthCheckConfig {
            component_name: component.name.clone(),
            r#type: check.kind.clone(),
            endpoint: check.endpoint.clone(),
            interval_seconds: check.interval_seconds,
            timeout_seconds: check.timeout_seconds,
            retries: check.retries,
        }),
    }
}
