//! The stream registry: hostname -> live control stream.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use tokio::sync::mpsc;

use cosmos_core::AppError;
use cosmos_proto::{Acknowledgment, ComponentDeployment, ComponentRemoval, ControllerMessage, ControllerMessagePayload, HealthCheckConfig};

use crate::grpc::RpcResult;

/// The outbound half of one agent's control stream.
pub type OutboundSender = mpsc::Sender<RpcResult<ControllerMessage>>;

/// Controller-side registry of live agent streams.
///
/// Each hostname is owned by at most one stream: registering replaces any
/// prior entry, and a deregistration is a no-op when another stream has since
/// taken over the name. Sends are best-effort; there is no queue surviving a
/// disconnect, reconvergence comes from agent-side reconciliation.
///
/// The registry is created at server start and owned by the application; its
/// lifecycle ends with the server.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, OutboundSender>>,
}

impl StreamRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the stream owning the given hostname, replacing any prior
    /// entry. Re-registering the current owner is a no-op.
    pub fn register(&self, hostname: &str, tx: OutboundSender) {
        let mut streams = self.streams.write().expect("streams lock poisoned");
        if streams.get(hostname).map(|current| current.same_channel(&tx)).unwrap_or(false) {
            return;
        }
        match streams.insert(hostname.to_string(), tx) {
            Some(_) => tracing::info!(%hostname, "agent stream replaced"),
            None => tracing::info!(%hostname, "agent stream registered"),
        }
    }

    /// Remove the given stream's registration.
    ///
    /// A no-op when a different stream has since taken over the hostname.
    pub fn deregister(&self, hostname: &str, tx: &OutboundSender) {
        let mut streams = self.streams.write().expect("streams lock poisoned");
        if streams.get(hostname).map(|current| current.same_channel(tx)).unwrap_or(false) {
            streams.remove(hostname);
            tracing::info!(%hostname, "agent stream removed");
        }
    }

    /// Get the outbound sender of the stream owning the given hostname.
    pub fn get(&self, hostname: &str) -> Option<OutboundSender> {
        self.streams.read().expect("streams lock poisoned").get(hostname).cloned()
    }

    /// The hostnames of all currently connected agents.
    pub fn connected_agents(&self) -> Vec<String> {
        self.streams.read().expect("streams lock poisoned").keys().cloned().collect()
    }

    /// Send a deployment command to one agent.
    pub async fn send_deployment(&self, hostname: &str, deployment: ComponentDeployment) -> Result<()> {
        tracing::info!(%hostname, component = %deployment.component_name, "sending deployment to agent");
        self.send(hostname, ControllerMessagePayload::Deployment(deployment)).await
    }

    /// Send a removal command to one agent.
    pub async fn send_removal(&self, hostname: &str, component_name: &str) -> Result<()> {
        tracing::info!(%hostname, component = %component_name, "sending removal to agent");
        self.send(
            hostname,
            ControllerMessagePayload::Removal(ComponentRemoval {
                component_name: component_name.to_string(),
            }),
        )
        .await
    }

    /// Send a health check configuration update to one agent.
    pub async fn send_health_config(&self, hostname: &str, config: HealthCheckConfig) -> Result<()> {
        self.send(hostname, ControllerMessagePayload::HealthConfig(config)).await
    }

    /// Send an acknowledgment to one agent.
    pub async fn send_ack(&self, hostname: &str, message: &str) -> Result<()> {
        self.send(
            hostname,
            ControllerMessagePayload::Ack(Acknowledgment {
                message: message.to_string(),
            }),
        )
        .await
    }

    /// Send a deployment command to every target agent, collecting per-agent
    /// failures instead of aborting.
    pub async fn broadcast_deployment(&self, deployment: &ComponentDeployment, targets: &[String]) -> Vec<(String, anyhow::Error)> {
        let mut errors = vec![];
        for hostname in targets {
            if let Err(err) = self.send_deployment(hostname, deployment.clone()).await {
                errors.push((hostname.clone(), err));
            }
        }
        errors
    }

    /// Send a removal command to every target agent, collecting per-agent
    /// failures instead of aborting.
    pub async fn broadcast_removal(&self, component_name: &str, targets: &[String]) -> Vec<(String, anyhow::Error)> {
        let mut errors = vec![];
        for hostname in targets {
            if let Err(err) = self.send_removal(hostname, component_name).await {
                errors.push((hostname.clone(), err));
            }
        }
        errors
    }

    async fn send(&self, hostname: &str, payload: ControllerMessagePayload) -> Result<()> {
        let tx = self.get(hostname).ok_or_else(|| AppError::NoStream(hostname.to_string()))?;
        let msg = ControllerMessage { payload: Some(payload) };
        if tx.send(Ok(msg)).await.is_err() {
            // The receiving stream is gone; the registry entry will be
            // replaced on reconnect.
            return Err(AppError::NoStream(hostname.to_string()).into());
        }
        Ok(())
    }
}
