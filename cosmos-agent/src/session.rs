//! The agent control session.
//!
//! One long-lived bidirectional stream to the controller, managed by three
//! cooperating tasks: the connection manager (dial, open stream, run the
//! receive pump, reconnect), the send pump (drain the outbound queue into the
//! live stream, dropping messages while disconnected) and the receive pump
//! (surface controller commands on the bounded inbound channel).
//!
//! Nothing here retries individual messages: a dropped message is recovered
//! by the next reconciliation pass & heartbeat re-reporting current truth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::Streaming;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;

use crate::config::Config;
use crate::database::Database;
use crate::utils;
use cosmos_proto::{
    AgentMessage, AgentMessagePayload, ComponentStatus, ControllerMessage, CosmosControllerClient, DeploymentResult, Heartbeat, HealthCheckResult,
    LogChunk,
};

/// Capacity of the outbound & inbound channels.
const CHANNEL_CAPACITY: usize = 100;
/// How long an outbound enqueue may wait before erroring.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// How long an inbound enqueue may wait before the message is dropped.
const INBOUND_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to the agent's control session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The hostname this agent identifies as.
    hostname: String,
    /// The agent's local store.
    db: Database,

    /// Whether a live stream currently exists.
    connected: AtomicBool,
    /// The sender feeding the current connection's request stream.
    conn_tx: Mutex<Option<mpsc::Sender<AgentMessage>>>,
    /// The session-level outbound queue.
    outbound_tx: mpsc::Sender<AgentMessage>,
    /// The receiver half of the outbound queue, consumed by the send pump.
    outbound_rx: Mutex<Option<mpsc::Receiver<AgentMessage>>>,
    /// The session-level inbound queue feeding the reconciler.
    inbound_tx: mpsc::Sender<ControllerMessage>,

    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl Session {
    /// Create a new instance, returning the channel on which controller
    /// commands are surfaced.
    pub fn new(config: Arc<Config>, db: Database, shutdown: broadcast::Sender<()>) -> Result<(Self, mpsc::Receiver<ControllerMessage>)> {
        let hostname = config.node_hostname()?;
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                hostname,
                db,
                connected: AtomicBool::new(false),
                conn_tx: Mutex::new(None),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                inbound_tx,
                shutdown,
            }),
        };
        Ok((session, inbound_rx))
    }

    /// Spawn the connection manager & send pump.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let session = self.clone();
        tokio::spawn(async move {
            let outbound_rx = session
                .inner
                .outbound_rx
                .lock()
                .expect("outbound lock poisoned")
                .take()
                .context("session already spawned")?;
            let manager = tokio::spawn(session.clone().run_connection_manager());
            let pump = tokio::spawn(session.clone().run_send_pump(outbound_rx));
            let _res = manager.await;
            let _res = pump.await;
            Ok(())
        })
    }

    /// The hostname this agent identifies as.
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Whether a live stream currently exists.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    //////////////////////////////////////////////////////////////////////////
    // Connection management /////////////////////////////////////////////////

    async fn run_connection_manager(self) {
        tracing::info!(controller = %self.inner.config.controller_url, "starting control session");
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            match self.connect().await {
                Ok((conn_tx, inbound)) => {
                    self.set_connection(Some(conn_tx));
                    tracing::info!("connected to controller");
                    self.run_receive_pump(inbound).await;
                    self.set_connection(None);
                    tracing::warn!("connection lost to controller");
                }
                Err(err) => {
                    self.set_connection(None);
                    tracing::warn!(error = ?err, "failed to connect to controller");
                }
            }

            let delay = tokio::time::sleep(Duration::from_secs(self.inner.config.reconnect_interval_seconds));
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = delay => continue,
            }
        }
    }

    /// Dial the controller & open the control stream.
    async fn connect(&self) -> Result<(mpsc::Sender<AgentMessage>, Streaming<ControllerMessage>)> {
        let endpoint = self.endpoint().await?;
        let channel = endpoint.connect().await.context("failed to connect to controller")?;
        let mut client = CosmosControllerClient::new(channel);

        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let response = client
            .stream_agent_messages(ReceiverStream::new(conn_rx))
            .await
            .context("failed to open control stream")?;
        Ok((conn_tx, response.into_inner()))
    }

    async fn endpoint(&self) -> Result<Endpoint> {
        let config = &self.inner.config;
        let scheme = if config.tls_enabled() { "https" } else { "http" };
        let mut endpoint =
            Endpoint::from_shared(format!("{}://{}", scheme, config.controller_url)).context("invalid controller URL")?;
        if let (Some(cert), Some(key), Some(ca)) = (&config.tls_cert, &config.tls_key, &config.tls_ca) {
            let cert = tokio::fs::read(cert).await.context("error reading TLS certificate")?;
            let key = tokio::fs::read(key).await.context("error reading TLS key")?;
            let ca = tokio::fs::read(ca).await.context("error reading TLS CA certificate")?;
            let tls = ClientTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .ca_certificate(Certificate::from_pem(ca));
            endpoint = endpoint.tls_config(tls).context("error applying client TLS config")?;
        }
        Ok(endpoint)
    }

    fn set_connection(&self, conn_tx: Option<mpsc::Sender<AgentMessage>>) {
        self.inner.connected.store(conn_tx.is_some(), Ordering::SeqCst);
        *self.inner.conn_tx.lock().expect("connection lock poisoned") = conn_tx;
    }

    fn connection(&self) -> Option<mpsc::Sender<AgentMessage>> {
        self.inner.conn_tx.lock().expect("connection lock poisoned").clone()
    }

    /// Read controller messages until the stream closes, surfacing them on
    /// the bounded inbound channel.
    async fn run_receive_pump(&self, mut inbound: Streaming<ControllerMessage>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let msg = tokio::select! {
                msg = inbound.message() => msg,
                _ = shutdown.recv() => return,
            };
            let msg = match msg {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::info!("controller closed the stream");
                    return;
                }
                // Cancellation & unavailability are a normal close; the
                // connection manager reconnects either way.
                Err(status) if matches!(status.code(), Code::Cancelled | Code::Unavailable) => {
                    tracing::info!(code = ?status.code(), "stream closed");
                    return;
                }
                Err(status) => {
                    tracing::warn!(error = ?status, "error receiving from controller");
                    return;
                }
            };

            match self.inner.inbound_tx.send_timeout(msg, INBOUND_ENQUEUE_TIMEOUT).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!("incoming message channel full, dropping message");
                }
                Err(SendTimeoutError::Closed(_)) => return,
            }
        }
    }

    /// Drain the outbound queue into the live stream; messages sent while
    /// disconnected are dropped.
    async fn run_send_pump(self, mut outbound_rx: mpsc::Receiver<AgentMessage>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let msg = tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
                _ = shutdown.recv() => return,
            };

            if !self.is_connected() {
                tracing::debug!("not connected, dropping message");
                continue;
            }
            let conn_tx = match self.connection() {
                Some(conn_tx) => conn_tx,
                None => continue,
            };
            if conn_tx.send(msg).await.is_err() {
                tracing::warn!("failed to send message");
                self.inner.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Outbound messages /////////////////////////////////////////////////////

    fn envelope(&self, payload: AgentMessagePayload) -> AgentMessage {
        AgentMessage {
            hostname: self.inner.hostname.clone(),
            timestamp: utils::now(),
            payload: Some(payload),
        }
    }

    async fn enqueue(&self, msg: AgentMessage, what: &str) -> Result<()> {
        self.inner
            .outbound_tx
            .send_timeout(msg, SEND_TIMEOUT)
            .await
            .map_err(|_err| anyhow!("timeout sending {}", what))
    }

    /// Send a heartbeat bundling the status of every local component.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let components = self.inner.db.list_components().await.context("failed to get components")?;
        let mut component_statuses = Vec::with_capacity(components.len());
        for component in components {
            match self.inner.db.get_component_status(&component.name).await {
                Ok(status) => component_statuses.push(proto_status(&status)),
                Err(err) => {
                    tracing::warn!(error = ?err, component = %component.name, "failed to get component status");
                }
            }
        }

        let msg = self.envelope(AgentMessagePayload::Heartbeat(Heartbeat {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            component_statuses,
        }));
        self.enqueue(msg, "heartbeat").await
    }

    /// Eagerly report one component's current status.
    pub async fn send_component_status(&self, component_name: &str) -> Result<()> {
        let status = self.inner.db.get_component_status(component_name).await.context("failed to get status")?;
        let msg = self.envelope(AgentMessagePayload::ComponentStatus(proto_status(&status)));
        self.enqueue(msg, "component status").await
    }

    /// Report a health check outcome.
    pub async fn send_health_check_result(&self, component_name: &str, check_type: &str, result: &str, message: &str) -> Result<()> {
        let msg = self.envelope(AgentMessagePayload::HealthResult(HealthCheckResult {
            component_name: component_name.to_string(),
            check_type: check_type.to_string(),
            result: result.to_string(),
            message: message.to_string(),
            timestamp: utils::now(),
        }));
        self.enqueue(msg, "health check result").await
    }

    /// Report the outcome of a deployment-related operation.
    pub async fn send_deployment_result(&self, component_name: &str, operation: &str, result: &str, message: &str) -> Result<()> {
        let msg = self.envelope(AgentMessagePayload::DeploymentResult(DeploymentResult {
            component_name: component_name.to_string(),
            operation: operation.to_string(),
            result: result.to_string(),
            message: message.to_string(),
            timestamp: utils::now(),
        }));
        self.enqueue(msg, "deployment result").await
    }

    /// Ship a chunk of captured component output.
    pub async fn send_log_chunk(&self, component_name: &str, log_data: &str, offset: i64) -> Result<()> {
        let msg = self.envelope(AgentMessagePayload::LogChunk(LogChunk {
            component_name: component_name.to_string(),
            log_data: log_data.to_string(),
            offset,
            timestamp: utils::now(),
        }));
        self.enqueue(msg, "log chunk").await
    }
}

/// Map a stored component status onto the wire.
fn proto_status(status: &crate::models::ComponentStatus) -> ComponentStatus {
    ComponentStatus {
        name: status.component_name.clone(),
        status: status.status.clone(),
        message: status.message.clone(),
        pid: status.pid,
        restart_count: status.restart_count,
        last_started_at: status.last_started_at.unwrap_or_default(),
    }
}
