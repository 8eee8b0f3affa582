//! Persistent data models of the controller.
//!
//! All timestamps are unix seconds, matching the wire format of the control
//! protocol. Status fields hold the protocol's plain string values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cosmos_core::spec::HealthCheckSpec;

/// Deployment statuses considered terminal.
pub const TERMINAL_DEPLOYMENT_STATUSES: [&str; 2] = ["completed", "failed"];

/// A submitted deployment: the opaque configuration envelope plus lifecycle
/// state.
///
/// The configuration is stored as raw JSON so that the planner contract (diff
/// by component) is independent of configuration schema evolution.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub configuration: serde_json::Value,
    /// One of: pending, running, completed, failed.
    pub status: String,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// The stored desired state of one component.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Component {
    pub name: String,
    /// One of: script, program, service.
    pub kind: String,
    /// One of: agent, external-bulk, external-orchestrator.
    pub handler: String,
    pub hash: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub content_url_encoding: Option<String>,
    /// Opaque job payload for the external orchestrator.
    #[serde(default)]
    pub job: Option<serde_json::Value>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub managed: bool,
    /// The deployment which last wrote this component.
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-(component, node) deployment state.
///
/// One row per placement; (component_name, node_hostname) is the natural key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ComponentDeployment {
    pub component_name: String,
    pub node_hostname: String,
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    /// One of: deploying, running, failed, stopped.
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub last_started_at: Option<i64>,
    #[serde(default)]
    pub last_health_check: Option<i64>,
    /// One of: healthy, unhealthy; unset means unknown.
    #[serde(default)]
    pub health_status: Option<String>,
    #[serde(default)]
    pub deployed_at: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
    pub created_at: i64,
}

impl ComponentDeployment {
    /// A fresh row for the given placement with everything else unset.
    pub fn new(component_name: &str, node_hostname: &str, created_at: i64) -> Self {
        Self {
            component_name: component_name.to_string(),
            node_hostname: node_hostname.to_string(),
            deployment_id: None,
            status: "deploying".to_string(),
            message: None,
            pid: None,
            last_started_at: None,
            last_health_check: None,
            health_status: None,
            deployed_at: None,
            last_updated: None,
            created_at,
        }
    }
}

/// The controller's shadow record of one agent, updated from heartbeats.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Agent {
    pub hostname: String,
    pub agent_version: String,
    pub last_heartbeat: i64,
    pub online: bool,
    pub component_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A node known to the fleet, synchronized from the node directory and from
/// agent heartbeats.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub tags: Vec<String>,
    pub online: bool,
    pub has_agent: bool,
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub synced_at: i64,
}

/// An append-only audit entry for deployment activity.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentLog {
    pub deployment_id: Uuid,
    #[serde(default)]
    pub component_name: Option<String>,
    #[serde(default)]
    pub node_hostname: Option<String>,
    /// One of: deploy, remove, restart.
    pub operation: String,
    /// One of: initiated, success, failure.
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: i64,
}
