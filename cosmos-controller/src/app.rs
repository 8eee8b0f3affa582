use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::grpc::{ControlServer, StreamRegistry};
use crate::jobs::Jobs;
use crate::planner::Planner;

/// The application object for when the Cosmos controller is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    db: Database,
    /// The registry of live agent streams.
    _registry: Arc<StreamRegistry>,
    /// The deployment planner; the entry point used by the submission
    /// surface to drive new deployments.
    pub planner: Arc<Planner>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the control stream server.
    control_server: JoinHandle<()>,
    /// The join handle of the background jobs task.
    jobs_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;

        // The stream registry is created here and lives exactly as long as
        // the server; it is never ambient state.
        let registry = Arc::new(StreamRegistry::new());

        let control_server = ControlServer::new(config.clone(), db.clone(), registry.clone(), shutdown_tx.clone())
            .spawn()
            .await
            .context("error setting up control stream server")?;

        let jobs_handle = Jobs::new(config.clone(), db.clone(), shutdown_tx.clone()).spawn();

        let planner = Arc::new(Planner::new(&config, db.clone(), registry.clone()));

        Ok(Self {
            _config: config,
            db,
            _registry: registry,
            planner,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            control_server,
            jobs_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Cosmos controller is shutting down");
        if let Err(err) = self.jobs_handle.await.context("error joining background jobs handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down background jobs");
        }
        if let Err(err) = self.control_server.await {
            tracing::error!(error = ?err, "error joining control stream server task");
        }
        if let Err(err) = self.db.close().await {
            tracing::error!(error = ?err, "error closing database");
        }

        tracing::debug!("Cosmos controller shutdown complete");
        Ok(())
    }
}
