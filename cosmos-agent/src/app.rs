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
use crate::health::HealthChecker;
use crate::lifecycle::Lifecycle;
use crate::reconciler::Reconciler;
use crate::session::Session;

/// The application object for when the Cosmos agent is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the control session.
    session_handle: JoinHandle<Result<()>>,
    /// The join handle of the reconciler.
    reconciler_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .context("error creating agent data directory")?;

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;

        let lifecycle = Arc::new(Lifecycle::new(db.clone(), &config.data_dir));
        let health = Arc::new(HealthChecker::new(db.clone(), crate::lifecycle::is_process_alive).context("error building health checker")?);

        let (session, inbound_rx) = Session::new(config.clone(), db.clone(), shutdown_tx.clone()).context("error building control session")?;
        let session_handle = session.spawn();

        // Unmanaged script output streams upstream through the session.
        lifecycle.set_progress_reporter(Arc::new(session.clone()));

        let reconciler = Reconciler::new(config.clone(), db.clone(), lifecycle, health, session, shutdown_tx.clone());
        let reconciler_handle = reconciler.spawn(inbound_rx);

        Ok(Self {
            _config: config,
            db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            session_handle,
            reconciler_handle,
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
        tracing::debug!("Cosmos agent is shutting down");
        if let Err(err) = self.reconciler_handle.await.context("error joining reconciler handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down reconciler");
        }
        if let Err(err) = self.session_handle.await.context("error joining session handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down control session");
        }
        if let Err(err) = self.db.close().await {
            tracing::error!(error = ?err, "error closing database");
        }

        tracing::debug!("Cosmos agent shutdown complete");
        Ok(())
    }
}
