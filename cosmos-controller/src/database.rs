//! Database management.
//!
//! The controller store is a typed repository over sled trees, one tree per
//! record family. Natural-key upserts are serialized per key through sled's
//! atomic `update_and_fetch`, so concurrent writers to the same key cannot
//! interleave partial updates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, Tree};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Agent, Component, ComponentDeployment, Deployment, DeploymentLog, Node, TERMINAL_DEPLOYMENT_STATUSES};
use crate::utils;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/cosmos/db";
/// The DB tree used for deployment records.
const TREE_DEPLOYMENTS: &str = "deployments";
/// The DB tree used for desired component state.
const TREE_COMPONENTS: &str = "components";
/// The DB tree used for per-(component, node) deployment state.
const TREE_COMPONENT_DEPLOYMENTS: &str = "component_deployments";
/// The DB tree used for agent shadow records.
const TREE_AGENTS: &str = "agents";
/// The DB tree used for node records.
const TREE_NODES: &str = "nodes";
/// The DB tree used for the append-only deployment log.
const TREE_DEPLOYMENT_LOGS: &str = "deployment_logs";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// The key of a (component, node) deployment row.
fn component_deployment_key(component_name: &str, node_hostname: &str) -> String {
    format!("{}/{}", component_name, node_hostname)
}

/// An abstraction over the controller database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
    deployments: Tree,
    components: Tree,
    component_deployments: Tree,
    agents: Tree,
    nodes: Tree,
    deployment_logs: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for controller database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner {
                deployments: db.open_tree(TREE_DEPLOYMENTS)?,
                components: db.open_tree(TREE_COMPONENTS)?,
                component_deployments: db.open_tree(TREE_COMPONENT_DEPLOYMENTS)?,
                agents: db.open_tree(TREE_AGENTS)?,
                nodes: db.open_tree(TREE_NODES)?,
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

    //////////////////////////////////////////////////////////////////////////
    // Deployments ///////////////////////////////////////////////////////////

    /// Create a new deployment record in `pending` state from the given
    /// configuration envelope.
    pub async fn create_deployment(&self, configuration: serde_json::Value) -> Result<Deployment> {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            configuration,
            status: "pending".to_string(),
            created_at: utils::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        let (tree, model) = (self.inner.deployments.clone(), deployment.clone());
        Self::spawn_blocking(move || -> Result<()> {
            let data = utils::encode_model(&model)?;
            tree.insert(model.id.to_string().as_bytes(), data)?;
            Ok(())
        })
        .await??;
        Ok(deployment)
    }

    /// Fetch a deployment by ID.
    pub async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        let tree = self.inner.deployments.clone();
        Self::spawn_blocking(move || -> Result<Option<Deployment>> {
            tree.get(id.to_string().as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// List deployments, newest first.
    pub async fn list_deployments(&self, limit: usize, offset: usize) -> Result<Vec<Deployment>> {
        let tree = self.inner.deployments.clone();
        Self::spawn_blocking(move || -> Result<Vec<Deployment>> {
            let mut deployments = tree
                .iter()
                .values()
                .map(|res| res.map_err(anyhow::Error::from).and_then(|data| utils::decode_model::<Deployment>(&data)))
                .collect::<Result<Vec<_>>>()?;
            deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(deployments.into_iter().skip(offset).take(limit).collect())
        })
        .await?
    }

    /// Update the status of a deployment, stamping `started_at` on the
    /// transition to `running` and `completed_at` on terminal transitions.
    ///
    /// Unknown deployment IDs are a no-op.
    pub async fn update_deployment_status(&self, id: Uuid, status: &str, error_message: Option<String>) -> Result<()> {
        let tree = self.inner.deployments.clone();
        let status = status.to_string();
        Self::spawn_blocking(move || -> Result<()> {
            tree.update_and_fetch(id.to_string().as_bytes(), |old| {
                let mut deployment: Deployment = match old.and_then(|data| utils::decode_model(data).ok()) {
                    Some(deployment) => deployment,
                    None => return old.map(|data| data.to_vec()),
                };
                let now = utils::now();
                deployment.status = status.clone();
                match status.as_str() {
                    "running" => deployment.started_at = Some(now),
                    "completed" | "failed" => deployment.completed_at = Some(now),
                    _ => {}
                }
                if let Some(message) = error_message.clone() {
                    deployment.error_message = Some(message);
                }
                utils::encode_model(&deployment).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Delete terminal deployments created before the cutoff, returning the
    /// number removed. Deployment logs are retained for audit.
    pub async fn cleanup_old_deployments(&self, cutoff: i64) -> Result<usize> {
        let tree = self.inner.deployments.clone();
        Self::spawn_blocking(move || -> Result<usize> {
            let mut removed = 0;
            for entry in tree.iter() {
                let (key, data) = entry?;
                let deployment: Deployment = match utils::decode_model(&data) {
                    Ok(deployment) => deployment,
                    Err(_) => continue,
                };
                if deployment.created_at < cutoff && TERMINAL_DEPLOYMENT_STATUSES.contains(&deployment.status.as_str()) {
                    tree.remove(key)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?
    }

    //////////////////////////////////////////////////////////////////////////
    // Deployment log ////////////////////////////////////////////////////////

    /// Append an entry to the deployment log.
    pub async fn append_deployment_log(&self, log: DeploymentLog) -> Result<()> {
        let (db, tree) = (self.inner.db.clone(), self.inner.deployment_logs.clone());
        Self::spawn_blocking(move || -> Result<()> {
            // Monotonic sequence keeps per-deployment entries ordered.
            let seq = db.generate_id()?;
            let key = format!("{}/{:020}", log.deployment_id, seq);
            tree.insert(key.as_bytes(), utils::encode_model(&log)?)?;
            Ok(())
        })
        .await?
    }

    /// Fetch log entries for a deployment, newest first.
    pub async fn get_deployment_logs(&self, deployment_id: Uuid, limit: usize) -> Result<Vec<DeploymentLog>> {
        let tree = self.inner.deployment_logs.clone();
        Self::spawn_blocking(move || -> Result<Vec<DeploymentLog>> {
            let prefix = format!("{}/", deployment_id);
            let mut logs = tree
                .scan_prefix(prefix.as_bytes())
                .values()
                .map(|res| res.map_err(anyhow::Error::from).and_then(|data| utils::decode_model::<DeploymentLog>(&data)))
                .collect::<Result<Vec<_>>>()?;
            logs.reverse();
            logs.truncate(limit);
            Ok(logs)
        })
        .await?
    }

    //////////////////////////////////////////////////////////////////////////
    // Components ////////////////////////////////////////////////////////////

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

    /// List all stored components.
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

    /// Delete a component by name.
    pub async fn delete_component(&self, name: &str) -> Result<()> {
        let (tree, name) = (self.inner.components.clone(), name.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(name.as_bytes())?;
            Ok(())
        })
        .await?
    }

    //////////////////////////////////////////////////////////////////////////
    // Component deployments /////////////////////////////////////////////////

    /// Insert or update a (component, node) deployment row, preserving
    /// `created_at` of any existing row.
    pub async fn upsert_component_deployment(&self, mut deployment: ComponentDeployment) -> Result<()> {
        let tree = self.inner.component_deployments.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let key = component_deployment_key(&deployment.component_name, &deployment.node_hostname);
            tree.update_and_fetch(key.as_bytes(), |old| {
                if let Some(existing) = old.and_then(|data| utils::decode_model::<ComponentDeployment>(data).ok()) {
                    deployment.created_at = existing.created_at;
                }
                utils::encode_model(&deployment).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Apply a partial update to a (component, node) deployment row, creating
    /// a fresh row first when none exists.
    ///
    /// This is the write path for agent events: each event carries only the
    /// fields it knows about, and the closure folds them into current state.
    pub async fn merge_component_deployment<F>(&self, component_name: &str, node_hostname: &str, apply: F) -> Result<()>
    where
        F: Fn(&mut ComponentDeployment) + Send + 'static,
    {
        let tree = self.inner.component_deployments.clone();
        let (component_name, node_hostname) = (component_name.to_string(), node_hostname.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            let key = component_deployment_key(&component_name, &node_hostname);
            tree.update_and_fetch(key.as_bytes(), |old| {
                let mut deployment = old
                    .and_then(|data| utils::decode_model::<ComponentDeployment>(data).ok())
                    .unwrap_or_else(|| ComponentDeployment::new(&component_name, &node_hostname, utils::now()));
                apply(&mut deployment);
                utils::encode_model(&deployment).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Fetch a single (component, node) deployment row.
    pub async fn get_component_deployment(&self, component_name: &str, node_hostname: &str) -> Result<Option<ComponentDeployment>> {
        let tree = self.inner.component_deployments.clone();
        let key = component_deployment_key(component_name, node_hostname);
        Self::spawn_blocking(move || -> Result<Option<ComponentDeployment>> {
            tree.get(key.as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// List deployment rows for one component across all nodes.
    pub async fn get_component_deployments(&self, component_name: &str) -> Result<Vec<ComponentDeployment>> {
        let tree = self.inner.component_deployments.clone();
        let prefix = format!("{}/", component_name);
        Self::spawn_blocking(move || -> Result<Vec<ComponentDeployment>> {
            tree.scan_prefix(prefix.as_bytes())
                .values()
                .map(|res| res.map_err(anyhow::Error::from).and_then(|data| utils::decode_model::<ComponentDeployment>(&data)))
                .collect()
        })
        .await?
    }

    /// List deployment rows for one node across all components.
    pub async fn get_node_deployments(&self, node_hostname: &str) -> Result<Vec<ComponentDeployment>> {
        let (tree, node_hostname) = (self.inner.component_deployments.clone(), node_hostname.to_string());
        Self::spawn_blocking(move || -> Result<Vec<ComponentDeployment>> {
            let mut deployments = vec![];
            for entry in tree.iter().values() {
                let deployment: ComponentDeployment = utils::decode_model(&entry?)?;
                if deployment.node_hostname == node_hostname {
                    deployments.push(deployment);
                }
            }
            Ok(deployments)
        })
        .await?
    }

    /// List all deployment rows, optionally filtered by status.
    pub async fn list_component_deployments(&self, status: Option<String>) -> Result<Vec<ComponentDeployment>> {
        let tree = self.inner.component_deployments.clone();
        Self::spawn_blocking(move || -> Result<Vec<ComponentDeployment>> {
            let mut deployments = vec![];
            for entry in tree.iter().values() {
                let deployment: ComponentDeployment = utils::decode_model(&entry?)?;
                if status.as_deref().map(|status| deployment.status == status).unwrap_or(true) {
                    deployments.push(deployment);
                }
            }
            Ok(deployments)
        })
        .await?
    }

    /// Delete the deployment row of one (component, node) pair.
    pub async fn delete_component_deployment(&self, component_name: &str, node_hostname: &str) -> Result<()> {
        let tree = self.inner.component_deployments.clone();
        let key = component_deployment_key(component_name, node_hostname);
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(key.as_bytes())?;
            Ok(())
        })
        .await?
    }

    //////////////////////////////////////////////////////////////////////////
    // Agents ////////////////////////////////////////////////////////////////

    /// Insert or update an agent shadow record by hostname, preserving
    /// `created_at` of any existing row.
    pub async fn upsert_agent(&self, mut agent: Agent) -> Result<()> {
        let tree = self.inner.agents.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let key = agent.hostname.clone();
            tree.update_and_fetch(key.as_bytes(), |old| {
                if let Some(existing) = old.and_then(|data| utils::decode_model::<Agent>(data).ok()) {
                    agent.created_at = existing.created_at;
                }
                agent.updated_at = utils::now();
                utils::encode_model(&agent).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Fetch an agent record by hostname.
    pub async fn get_agent(&self, hostname: &str) -> Result<Option<Agent>> {
        let (tree, hostname) = (self.inner.agents.clone(), hostname.to_string());
        Self::spawn_blocking(move || -> Result<Option<Agent>> {
            tree.get(hostname.as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// List agents ordered by hostname.
    pub async fn list_agents(&self, online_only: bool) -> Result<Vec<Agent>> {
        let tree = self.inner.agents.clone();
        Self::spawn_blocking(move || -> Result<Vec<Agent>> {
            let mut agents = vec![];
            for entry in tree.iter().values() {
                let agent: Agent = utils::decode_model(&entry?)?;
                if !online_only || agent.online {
                    agents.push(agent);
                }
            }
            Ok(agents)
        })
        .await?
    }

    /// Mark agents whose last heartbeat predates the threshold as offline,
    /// returning the number flipped.
    ///
    /// Only the `online: true -> false` transition is performed here; agents
    /// come back online through their own heartbeats.
    pub async fn mark_agents_offline(&self, threshold: i64) -> Result<usize> {
        let tree = self.inner.agents.clone();
        Self::spawn_blocking(move || -> Result<usize> {
            let mut flipped = 0;
            for entry in tree.iter() {
                let (key, data) = entry?;
                let agent: Agent = match utils::decode_model(&data) {
                    Ok(agent) => agent,
                    Err(_) => continue,
                };
                if agent.online && agent.last_heartbeat < threshold {
                    tree.update_and_fetch(key, |old| {
                        let mut agent: Agent = match old.and_then(|data| utils::decode_model(data).ok()) {
                            Some(agent) => agent,
                            None => return None,
                        };
                        if agent.last_heartbeat < threshold {
                            agent.online = false;
                            agent.updated_at = utils::now();
                        }
                        utils::encode_model(&agent).ok().or_else(|| old.map(|data| data.to_vec()))
                    })?;
                    flipped += 1;
                }
            }
            Ok(flipped)
        })
        .await?
    }

    //////////////////////////////////////////////////////////////////////////
    // Nodes /////////////////////////////////////////////////////////////////

    /// Insert or update a node record by hostname; the write path of the node
    /// directory sync.
    pub async fn upsert_node(&self, node: Node) -> Result<()> {
        let tree = self.inner.nodes.clone();
        Self::spawn_blocking(move || -> Result<()> {
            let data = utils::encode_model(&node)?;
            tree.insert(node.hostname.as_bytes(), data)?;
            Ok(())
        })
        .await?
    }

    /// Record a node sighting from an agent heartbeat.
    ///
    /// Creates the node with the default `all` tag when unknown, otherwise
    /// only refreshes liveness fields so directory-synced tags survive.
    pub async fn upsert_node_from_heartbeat(&self, hostname: &str, now: i64) -> Result<()> {
        let (tree, hostname) = (self.inner.nodes.clone(), hostname.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.update_and_fetch(hostname.as_bytes(), |old| {
                let mut node = old.and_then(|data| utils::decode_model::<Node>(data).ok()).unwrap_or_else(|| Node {
                    hostname: hostname.clone(),
                    ip: None,
                    tags: vec!["all".to_string()],
                    online: true,
                    has_agent: true,
                    last_seen: None,
                    metadata: None,
                    synced_at: now,
                });
                node.online = true;
                node.has_agent = true;
                node.last_seen = Some(now);
                utils::encode_model(&node).ok().or_else(|| old.map(|data| data.to_vec()))
            })?;
            Ok(())
        })
        .await?
    }

    /// Fetch a node record by hostname.
    pub async fn get_node(&self, hostname: &str) -> Result<Option<Node>> {
        let (tree, hostname) = (self.inner.nodes.clone(), hostname.to_string());
        Self::spawn_blocking(move || -> Result<Option<Node>> {
            tree.get(hostname.as_bytes())?.map(|data| utils::decode_model(&data)).transpose()
        })
        .await?
    }

    /// List nodes ordered by hostname.
    pub async fn list_nodes(&self, online_only: bool) -> Result<Vec<Node>> {
        let tree = self.inner.nodes.clone();
        Self::spawn_blocking(move || -> Result<Vec<Node>> {
            let mut nodes = vec![];
            for entry in tree.iter().values() {
                let node: Node = utils::decode_model(&entry?)?;
                if !online_only || node.online {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        })
        .await?
    }

    /// List nodes whose tag set intersects the given tags.
    pub async fn nodes_by_tags(&self, tags: &[String]) -> Result<Vec<Node>> {
        let (tree, tags) = (self.inner.nodes.clone(), tags.to_vec());
        Self::spawn_blocking(move || -> Result<Vec<Node>> {
            let mut nodes = vec![];
            for entry in tree.iter().values() {
                let node: Node = utils::decode_model(&entry?)?;
                if node.tags.iter().any(|tag| tags.contains(tag)) {
                    nodes.push(node);
                }
            }
            Ok(nodes)
        })
        .await?
    }
}
