//! Database management.
//!
//! The agent's local store lives under `<data-dir>/agent.db` and records the
//! installed components, their runtime status, health check state and a local
//! deployment log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, Tree};

use crate::config::Config;
use crate::models::{Component, ComponentStatus, DeploymentLog, HealthCheck};
use crate::utils;

/// The directory name of the local store inside the agent data dir.
const DB_DIR: &str = "agent.db";
/// The DB tree used for installed components.
const TREE_COMPONENTS: &str = "components";
/// The DB tree used for component runtime status.
const TREE_COMPONENT_STATUSES: &str = "component_statuses";
/// The DB tree used for health check configuration & counters.
const TREE_HEALTH_CHECKS: &str = "health_checks";
/// The DB tree used for the local deployment log.
const TREE_DEPLOYMENT_LOGS: &str = "deployment_logs";

/// An abstraction over the agent database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
    components: Tree,
    component_statuses: Tree,
    health_checks: Tree,
    deployment_logs: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.data_dir).join(DB_DIR);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for agent database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let inner = Arc::new(DatabaseInner {
                components: db.open_tree(TREE_COMPONENTS)?,
                component_statuses: db.open_tree(TREE_COMPONENT_STATUSES)?,
                health_checks: db.open_tree(TREE_HEALTH_CHECKS)?,
                deployment_logs: db.open_tree(TREE_DEPLOYMENT_LOGS)?,
                db,
            });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, mapping join errors into
    /// an anyhow error.
    pub async fn spawn_blocking<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(|err| anyhow!("error joining database task: {}", err))
    }

    /// Flush all dirty buffers to disk.
    pub async fn close(&self) -> Result<()> {
        let db = self.inner.db.clone();
        Self::spawn_blocking(move || -> Result<()> {
            db.flush().context("error flushing database state")?;
            Ok(())
        })
        .await?
    }

    /// Insert or update a component by name, preserving `created_at` of any
    /// existing row.
    pub async fn upsert_component(&self, mut component: Component) -> Result<()> {
        let tree = self.inner.components.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let key = component.name.clone();
            tree.update_and_fetch(key.as_bytes(), |old| {
                if let Some(existing) = old.and_then(|data| utils::decode_model::<Component>(data).ok()) {
                    component.created_at = existing.created_at;
                }
                component.updated_at = utils::now();
                utils::encode_model(&component).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Fetch a component by name.
    pub async fn get_component(&self, name: &str) -> Result<Option<Component>> {
        let (tree, name) = (self.inner.components.clone(), name.to_string());
        Self::spawn_blocking(move || -> Result<Option<Component>> {
            tree.get(name.as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// List all installed components.
    pub async fn list_components(&self) -> Result<Vec<Component>> {
        let tree = self.inner.components.clone();
        Self::spawn_blocking(move || -> Result<Vec<Component>> {
            tree.iter()
                .values()
                .map(|res| res.map_err(anyhow::Error::from).and_then(|data| utils::decode_model::<Component>(&data)))
                .collect()
        })
        .await?
    }

    /// Delete a component, cascading to its status & health check.
    pub async fn delete_component(&self, name: &str) -> Result<()> {
        let inner = self.inner.clone();
        let name = name.to_string();
        Self::spawn_blocking(move || -> Result<()> {
            inner.components.remove(name.as_bytes())?;
            inner.component_statuses.remove(name.as_bytes())?;
            inner.health_checks.remove(name.as_bytes())?;
            Ok(())
        })
        .await?
    }

    /// Insert or update a component's runtime status, touching `updated_at`.
    pub async fn upsert_component_status(&self, mut status: ComponentStatus) -> Result<()> {
        let tree = self.inner.component_statuses.clone();
        Self::spawn_blocking(move || -> Result<()> {
            status.updated_at = utils::now();
            let data = utils::encode_model(&status)?;
            tree.insert(status.component_name.as_bytes(), data)?;
            Ok(())
        })
        .await?
    }

    /// Fetch a component's runtime status.
    ///
    /// A missing row synthesizes the `unknown` default so callers never need
    /// to special-case components that have not yet started.
    pub async fn get_component_status(&self, name: &str) -> Result<ComponentStatus> {
        let (tree, name) = (self.inner.component_statuses.clone(), name.to_string());
        Self::spawn_blocking(move || -> Result<ComponentStatus> {
            match tree.get(name.as_bytes())? {
                Some(data) => utils::decode_model(&data),
                None => Ok(ComponentStatus {
                    component_name: name,
                    status: "unknown".to_string(),
                    message: String::new(),
                    pid: 0,
                    last_started_at: None,
                    last_checked_at: utils::now(),
                    restart_count: 0,
                    updated_at: utils::now(),
                }),
            }
        })
        .await?
    }

    /// Insert or update a component's health check record.
    pub async fn upsert_health_check(&self, check: HealthCheck) -> Result<()> {
        let tree = self.inner.health_checks.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let data = utils::encode_model(&check)?;
            tree.insert(check.component_name.as_bytes(), data)?;
            Ok(())
        })
        .await?
    }

    /// Fetch a component's health check record; `None` means no check is
    /// configured, which is not an error.
    pub async fn get_health_check(&self, name: &str) -> Result<Option<HealthCheck>> {
        let (tree, name) = (self.inner.health_checks.clone(), name.to_string());
        Self::spawn_blocking(move || -> Result<Option<HealthCheck>> {
            tree.get(name.as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// Append an entry to the local deployment log.
    pub async fn append_deployment_log(&self, mut log: DeploymentLog) -> Result<()> {
        let (db, tree) = (self.inner.db.clone(), self.inner.deployment_logs.clone());
        Self::spawn_blocking(move || -> Result<()> {
            log.timestamp = utils::now();
            let key = format!("{:020}", db.generate_id()?);
            tree.insert(key.as_bytes(), utils::encode_model(&log)?)?;
            Ok(())
        })
        .await?
    }
}
