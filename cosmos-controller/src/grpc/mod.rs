//! The agent control stream server.
//!
//! One bidirectional stream per agent carries all control traffic. The
//! [`StreamRegistry`] owns the set of live streams keyed by agent hostname and
//! is the single dispatch point for outbound commands; the gRPC service feeds
//! every inbound agent message into the store.

mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Streaming};

use crate::config::Config;
use crate::database::Database;
use crate::models;
use crate::utils;
use cosmos_proto::{
    AgentMessage, AgentMessagePayload, ComponentStatus, ControllerMessage, CosmosController, CosmosControllerServer, DeploymentResult, Heartbeat,
    HealthCheckResult, LogChunk,
};

pub use registry::{OutboundSender, StreamRegistry};

/// A result type used with the gRPC system.
pub type RpcResult<T> = ::std::result::Result<T, tonic::Status>;

/// The control stream server.
pub struct ControlServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    db: Database,
    /// The registry of live agent streams.
    registry: Arc<StreamRegistry>,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl ControlServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: Database, registry: Arc<StreamRegistry>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, db, registry, shutdown }
    }

    /// Spawn the gRPC server task.
    pub async fn spawn(self) -> Result<JoinHandle<()>> {
        let addr = format!("0.0.0.0:{}", self.config.grpc_port).parse().context("failed to parse listener address")?;
        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());

        let mut builder = Server::builder();
        if self.config.tls_enabled() {
            let tls = self.tls_config().await.context("error building server TLS config")?;
            builder = builder.tls_config(tls).context("error applying server TLS config")?;
            tracing::info!("control stream server using mutual TLS");
        }

        let service = CosmosControllerServer::new(self);
        let fut = builder.add_service(service).serve_with_shutdown(addr, async move {
            let _res = shutdown_rx.recv().await;
        });
        Ok(tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(error = ?err, "error from control stream server");
            }
            let _res = shutdown.send(());
        }))
    }

    /// Build the mutual TLS config from the configured PEM files.
    async fn tls_config(&self) -> Result<ServerTlsConfig> {
        let (cert, key, ca) = match (&self.config.tls_cert, &self.config.tls_key, &self.config.tls_ca) {
            (Some(cert), Some(key), Some(ca)) => (cert, key, ca),
            _ => anyhow::bail!("TLS is not fully configured"),
        };
        let cert = tokio::fs::read(cert).await.context("error reading TLS certificate")?;
        let key = tokio::fs::read(key).await.context("error reading TLS key")?;
        let ca = tokio::fs::read(ca).await.context("error reading TLS CA certificate")?;
        Ok(ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca)))
    }
}

#[tonic::async_trait]
impl CosmosController for ControlServer {
    /// Server streaming response type for the StreamAgentMessages method.
    type StreamAgentMessagesStream = ReceiverStream<RpcResult<ControllerMessage>>;

    /// Open the control stream for one agent.
    async fn stream_agent_messages(&self, request: Request<Streaming<AgentMessage>>) -> RpcResult<Response<Self::StreamAgentMessagesStream>> {
        // With mutual TLS, the verified certificate common name is the
        // canonical hostname; otherwise the first heartbeat identifies the
        // peer.
        let hostname = peer_common_name(&request);
        match &hostname {
            Some(hostname) => tracing::info!(%hostname, "agent connected with mTLS"),
            None => tracing::debug!("agent connected without certificate identity, waiting for heartbeat"),
        }

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(100);
        let session = AgentSession {
            db: self.db.clone(),
            registry: self.registry.clone(),
            tx,
        };
        tokio::spawn(session.run(hostname, inbound));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Extract the common name of the peer's verified TLS certificate, if any.
fn peer_common_name<T>(request: &Request<T>) -> Option<String> {
    let certs = request.peer_certs()?;
    let cert = certs.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string());
    cn
}

/// The server side of one agent's control stream.
struct AgentSession {
    db: Database,
    registry: Arc<StreamRegistry>,
    tx: mpsc::Sender<RpcResult<ControllerMessage>>,
}

impl AgentSession {
    /// Run the receive loop until the stream closes.
    async fn run(self, mut hostname: Option<String>, mut inbound: Streaming<AgentMessage>) {
        if let Some(hostname) = &hostname {
            self.registry.register(hostname, self.tx.clone());
        }

        loop {
            let msg = match inbound.message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::info!(hostname = ?hostname, "agent stream closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = ?err, hostname = ?hostname, "error receiving message from agent");
                    break;
                }
            };

            // Identify the peer from its first hostname-bearing message.
            if hostname.is_none() && !msg.hostname.is_empty() {
                tracing::info!(hostname = %msg.hostname, "agent identified via heartbeat");
                hostname = Some(msg.hostname.clone());
            }
            let peer = match &hostname {
                Some(hostname) => hostname.clone(),
                None => {
                    tracing::warn!("dropping message from unidentified agent");
                    continue;
                }
            };
            self.registry.register(&peer, self.tx.clone());

            if let Err(err) = self.handle_message(&peer, msg).await {
                tracing::error!(error = ?err, hostname = %peer, "error handling agent message");
            }
        }

        if let Some(hostname) = &hostname {
            self.registry.deregister(hostname, &self.tx);
        }
    }

    /// Fold one inbound agent message into the store.
    async fn handle_message(&self, hostname: &str, msg: AgentMessage) -> Result<()> {
        match msg.payload {
            Some(AgentMessagePayload::Heartbeat(heartbeat)) => self.handle_heartbeat(hostname, heartbeat).await,
            Some(AgentMessagePayload::ComponentStatus(status)) => self.handle_component_status(hostname, status).await,
            Some(AgentMessagePayload::HealthResult(result)) => self.handle_health_result(hostname, result).await,
            Some(AgentMessagePayload::DeploymentResult(result)) => self.handle_deployment_result(hostname, result).await,
            Some(AgentMessagePayload::LogChunk(chunk)) => self.handle_log_chunk(hostname, chunk),
            None => {
                tracing::warn!(%hostname, "received agent message without payload");
                Ok(())
            }
        }
    }

    async fn handle_heartbeat(&self, hostname: &str, heartbeat: Heartbeat) -> Result<()> {
        tracing::debug!(%hostname, version = %heartbeat.agent_version, "received heartbeat");
        let now = utils::now();
        self.db
            .upsert_agent(models::Agent {
                hostname: hostname.to_string(),
                agent_version: heartbeat.agent_version.clone(),
                last_heartbeat: now,
                online: true,
                component_count: heartbeat.component_statuses.len(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.db.upsert_node_from_heartbeat(hostname, now).await?;

        for status in heartbeat.component_statuses {
            if let Err(err) = self.handle_component_status(hostname, status).await {
                tracing::warn!(error = ?err, %hostname, "failed to handle component status from heartbeat");
            }
        }
        Ok(())
    }

    async fn handle_component_status(&self, hostname: &str, status: ComponentStatus) -> Result<()> {
        tracing::debug!(%hostname, component = %status.name, status = %status.status, "received component status");
        self.db
            .merge_component_deployment(&status.name, hostname, move |deployment| {
                deployment.status = status.status.clone();
                deployment.message = Some(status.message.clone());
                if status.pid > 0 {
                    deployment.pid = Some(status.pid);
                }
                if status.last_started_at > 0 {
                    deployment.last_started_at = Some(status.last_started_at);
                }
                deployment.last_updated = Some(utils::now());
            })
            .await
    }

    async fn handle_health_result(&self, hostname: &str, result: HealthCheckResult) -> Result<()> {
        tracing::debug!(%hostname, component = %result.component_name, result = %result.result, "received health check result");
        self.db
            .merge_component_deployment(&result.component_name, hostname, move |deployment| {
                deployment.health_status = Some(if result.result == "success" { "healthy" } else { "unhealthy" }.to_string());
                deployment.last_health_check = Some(utils::now());
                if !result.message.is_empty() {
                    deployment.message = Some(result.message.clone());
                }
            })
            .await
    }

    async fn handle_deployment_result(&self, hostname: &str, result: DeploymentResult) -> Result<()> {
        tracing::info!(
            %hostname,
            component = %result.component_name,
            operation = %result.operation,
            result = %result.result,
            "received deployment result",
        );
        // A confirmed removal must not resurrect the placement row the
        // planner already deleted.
        if result.operation == "remove" && result.result == "success" {
            return self.db.delete_component_deployment(&result.component_name, hostname).await;
        }
        self.db
            .merge_component_deployment(&result.component_name, hostname, move |deployment| {
                deployment.status = if result.result == "failure" || result.result == "failed" { "failed" } else { "running" }.to_string();
                deployment.message = Some(result.message.clone());
                let now = utils::now();
                deployment.deployed_at = Some(now);
                deployment.last_updated = Some(now);
            })
            .await
    }

    fn handle_log_chunk(&self, hostname: &str, chunk: LogChunk) -> Result<()> {
        tracing::debug!(
            %hostname,
            component = %chunk.component_name,
            offset = chunk.offset,
            bytes = chunk.log_data.len(),
            "received log chunk",
        );
        Ok(())
    }
}
