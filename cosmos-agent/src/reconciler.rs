//! The agent reconciler.
//!
//! Three loops keep this host converged with controller intent: the
//! reconcile loop (detect dead processes, restart managed components, run due
//! health checks), the heartbeat loop, and the inbound command handler. The
//! inbound handler processes commands one at a time, which is what serializes
//! per-component operations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use cosmos_proto::{ComponentDeployment, ComponentRemoval, ControllerMessage, ControllerMessagePayload, HealthCheckConfig};

use crate::config::Config;
use crate::database::Database;
use crate::health::HealthChecker;
use crate::lifecycle::{Lifecycle, ProgressReporter};
use crate::models;
use crate::session::Session;
use crate::utils;

/// The agent reconciler.
pub struct Reconciler {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The agent's local store.
    db: Database,
    /// The component lifecycle engine.
    lifecycle: Arc<Lifecycle>,
    /// The health checker.
    health: Arc<HealthChecker>,
    /// The control session.
    session: Session,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, db: Database, lifecycle: Arc<Lifecycle>, health: Arc<HealthChecker>, session: Session,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            db,
            lifecycle,
            health,
            session,
            shutdown,
        }
    }

    /// Spawn the reconcile, heartbeat & inbound handler loops.
    pub fn spawn(self, inbound: mpsc::Receiver<ControllerMessage>) -> JoinHandle<Result<()>> {
        tracing::info!(
            reconcile_interval = self.config.reconcile_interval_seconds,
            heartbeat_interval = self.config.heartbeat_interval_seconds,
            "starting reconciler",
        );
        let this = Arc::new(self);
        let reconcile = tokio::spawn(this.clone().run_reconcile_loop());
        let heartbeat = tokio::spawn(this.clone().run_heartbeat_loop());
        let commands = tokio::spawn(this.run_command_loop(inbound));
        tokio::spawn(async move {
            let _res = reconcile.await;
            let _res = heartbeat.await;
            let _res = commands.await;
            Ok(())
        })
    }

    async fn run_reconcile_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut timer = tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_seconds));
        loop {
            tokio::select! {
                _ = timer.tick() => self.reconcile().await,
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut timer = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(err) = self.session.send_heartbeat().await {
                        tracing::debug!(error = ?err, "failed to send heartbeat");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// One reconciliation pass.
    async fn reconcile(&self) {
        tracing::debug!("running reconciliation");
        self.detect_dead_processes().await;
        self.restart_failed_components().await;
        self.run_health_checks().await;
    }

    /// Flip components whose process has died to `stopped` & report eagerly.
    async fn detect_dead_processes(&self) {
        let components = match self.db.list_components().await {
            Ok(components) => components,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to get components for liveness check");
                return;
            }
        };

        for component in components.iter().filter(|component| component.managed) {
            let mut status = match self.db.get_component_status(&component.name).await {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(error = ?err, component = %component.name, "failed to get component status");
                    continue;
                }
            };
            if status.status != "running" || status.pid <= 0 {
                continue;
            }
            if crate::lifecycle::is_process_alive(status.pid) {
                continue;
            }

            tracing::warn!(component = %component.name, pid = status.pid, "process no longer running, updating status");
            status.status = "stopped".to_string();
            status.message = "Process died unexpectedly".to_string();
            if let Err(err) = self.db.upsert_component_status(status).await {
                tracing::warn!(error = ?err, component = %component.name, "failed to update status");
                continue;
            }
            if let Err(err) = self.session.send_component_status(&component.name).await {
                tracing::debug!(error = ?err, component = %component.name, "failed to send component status");
            }
        }
    }

    /// Restart managed components that are stopped or failed.
    async fn restart_failed_components(&self) {
        let components = match self.db.list_components().await {
            Ok(components) => components,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to get components for restart check");
                return;
            }
        };

        for component in components.iter().filter(|component| component.managed) {
            let status = match self.db.get_component_status(&component.name).await {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(error = ?err, component = %component.name, "failed to get component status");
                    continue;
                }
            };
            if status.status != "stopped" && status.status != "failed" {
                continue;
            }

            tracing::info!(component = %component.name, "restarting component");
            match self.lifecycle.restart_component(&component.name).await {
                Ok(()) => {
                    let _res = self
                        .session
                        .send_deployment_result(&component.name, "restart", "success", "Component restarted successfully")
                        .await;
                }
                Err(err) => {
                    tracing::error!(error = ?err, component = %component.name, "failed to restart component");
                    let _res = self
                        .session
                        .send_deployment_result(&component.name, "restart", "failure", &format!("Failed to restart: {}", err))
                        .await;
                }
            }
        }
    }

    /// Run due health checks & surface components over their failure
    /// threshold.
    async fn run_health_checks(&self) {
        if let Err(err) = self.health.check_all_components().await {
            tracing::debug!(error = ?err, "health check error");
        }

        let failed = match self.health.failed_components().await {
            Ok(failed) => failed,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to get failing health checks");
                return;
            }
        };
        for check in failed {
            tracing::warn!(
                component = %check.component_name,
                consecutive_failures = check.consecutive_failures,
                "component failing health checks",
            );
            let _res = self
                .session
                .send_health_check_result(
                    &check.component_name,
                    &check.kind,
                    "failure",
                    &format!("Failed {} consecutive health checks", check.consecutive_failures),
                )
                .await;
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Inbound commands //////////////////////////////////////////////////////

    /// Process controller commands one at a time; this is what serializes
    /// per-component operations on this host.
    async fn run_command_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<ControllerMessage>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!("started processing controller messages");
        loop {
            let msg = tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::warn!("message channel closed, stopping processor");
                        return;
                    }
                },
                _ = shutdown.recv() => return,
            };

            match msg.payload {
                Some(ControllerMessagePayload::Deployment(deployment)) => self.handle_deployment(deployment).await,
                Some(ControllerMessagePayload::Removal(removal)) => self.handle_removal(removal).await,
                Some(ControllerMessagePayload::HealthConfig(config)) => self.handle_health_config(config).await,
                Some(ControllerMessagePayload::Ack(ack)) => tracing::debug!(message = %ack.message, "received acknowledgment"),
                None => tracing::warn!("received controller message without payload"),
            }
        }
    }

    async fn handle_deployment(&self, deployment: ComponentDeployment) {
        tracing::info!(
            component = %deployment.component_name,
            kind = %deployment.component_type,
            hash = %deployment.hash,
            "received deployment request",
        );
        let name = deployment.component_name.clone();
        let _res = self
            .session
            .send_deployment_result(&name, "deploy", "received", "Deployment request received by agent")
            .await;

        let component = match build_component(&deployment) {
            Ok(component) => component,
            Err(err) => {
                tracing::error!(error = ?err, component = %name, "invalid deployment command");
                let _res = self
                    .session
                    .send_deployment_result(&name, "deploy", "failure", &format!("Deployment failed: {}", err))
                    .await;
                return;
            }
        };

        let _res = self
            .session
            .send_deployment_result(&name, "deploy", "started", "Starting deployment execution")
            .await;

        let (operation, outcome) = match deployment.component_type.as_str() {
            "program" => ("deploy-program", self.lifecycle.deploy_program(component).await),
            "script" => ("deploy-script", self.lifecycle.deploy_script(component).await),
            other => ("deploy", Err(anyhow::anyhow!("unsupported component type: {}", other))),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(component = %name, "deployment successful");
                let _res = self
                    .session
                    .send_deployment_result(&name, operation, "success", "Deployment completed successfully")
                    .await;
                // Report the fresh PID promptly rather than waiting on the
                // next heartbeat.
                let _res = self.session.send_component_status(&name).await;
                self.log_local(&name, operation, "success", "Deployment completed successfully").await;

                if let Some(health_check) = deployment.health_check {
                    self.handle_health_config(health_check).await;
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, component = %name, "deployment failed");
                let _res = self
                    .session
                    .send_deployment_result(&name, operation, "failure", &format!("Deployment failed: {}", err))
                    .await;
                self.log_local(&name, operation, "failure", &err.to_string()).await;
            }
        }
    }

    async fn handle_removal(&self, removal: ComponentRemoval) {
        let name = removal.component_name;
        tracing::info!(component = %name, "received removal request");

        match self.lifecycle.remove_component(&name).await {
            Ok(()) => {
                tracing::info!(component = %name, "removal successful");
                let _res = self
                    .session
                    .send_deployment_result(&name, "remove", "success", "Component removed successfully")
                    .await;
                self.log_local(&name, "remove", "success", "Component removed successfully").await;
            }
            Err(err) => {
                tracing::error!(error = ?err, component = %name, "removal failed");
                let _res = self
                    .session
                    .send_deployment_result(&name, "remove", "failure", &format!("Removal failed: {}", err))
                    .await;
                self.log_local(&name, "remove", "failure", &err.to_string()).await;
            }
        }
    }

    async fn handle_health_config(&self, config: HealthCheckConfig) {
        tracing::debug!(
            component = %config.component_name,
            kind = %config.r#type,
            endpoint = %config.endpoint,
            "updating health check configuration",
        );
        let check = models::HealthCheck {
            component_name: config.component_name,
            kind: config.r#type,
            endpoint: config.endpoint,
            interval_seconds: config.interval_seconds,
            timeout_seconds: config.timeout_seconds,
            retries: config.retries,
            last_check_at: None,
            last_result: String::new(),
            consecutive_failures: 0,
        };
        if let Err(err) = self.db.upsert_health_check(check).await {
            tracing::warn!(error = ?err, "failed to update health check configuration");
        }
    }

    async fn log_local(&self, component_name: &str, operation: &str, status: &str, message: &str) {
        let log = models::DeploymentLog {
            component_name: component_name.to_string(),
            operation: operation.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: utils::now(),
        };
        if let Err(err) = self.db.append_deployment_log(log).await {
            tracing::warn!(error = ?err, "failed to append local deployment log");
        }
    }
}

/// Build the local component row for a deployment command.
fn build_component(deployment: &ComponentDeployment) -> Result<models::Component> {
    let now = utils::now();
    let mut component = models::Component {
        name: deployment.component_name.clone(),
        kind: deployment.component_type.clone(),
        hash: deployment.hash.clone(),
        content_url: Some(deployment.content_url.clone()).filter(|url| !url.is_empty()),
        content_url_encoding: Some(deployment.content_url_encoding.clone()).filter(|encoding| !encoding.is_empty()),
        content: Some(deployment.content.clone()).filter(|content| !content.is_empty()),
        executable: String::new(),
        env: None,
        args: None,
        managed: deployment.managed,
        created_at: now,
        updated_at: now,
    };
    if !deployment.env.is_empty() {
        component.set_env_map(&deployment.env)?;
    }
    if !deployment.args.is_empty() {
        component.set_args_vec(&deployment.args)?;
    }
    Ok(component)
}

/// The session satisfies the lifecycle engine's progress capability, keeping
/// the dependency one-way.
#[async_trait::async_trait]
impl ProgressReporter for Session {
    async fn report_progress(&self, component_name: &str, status: &str, message: &str) {
        if let Err(err) = self.send_deployment_result(component_name, "deploy", status, message).await {
            tracing::debug!(error = ?err, component = %component_name, "failed to report progress");
        }
    }

    async fn report_log_chunk(&self, component_name: &str, chunk: &str, offset: i64) {
        if let Err(err) = self.send_log_chunk(component_name, chunk, offset).await {
            tracing::debug!(error = ?err, component = %component_name, "failed to ship log chunk");
        }
    }
}
