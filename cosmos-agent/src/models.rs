//! Persistent data models of the agent's local store.
//!
//! All timestamps are unix seconds. Status fields hold the protocol's plain
//! string values so that local state flows into heartbeats unchanged.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A component installed on this host.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Component {
    pub name: String,
    /// One of: script, program.
    pub kind: String,
    pub hash: String,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub content_url_encoding: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// The resolved executable path on disk.
    #[serde(default)]
    pub executable: String,
    /// Environment overlay, stored as an opaque JSON blob.
    #[serde(default)]
    pub env: Option<String>,
    /// Argument list, stored as an opaque JSON blob.
    #[serde(default)]
    pub args: Option<String>,
    pub managed: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Component {
    /// Decode the environment overlay.
    pub fn env_map(&self) -> Result<HashMap<String, String>> {
        match &self.env {
            Some(env) if !env.is_empty() => serde_json::from_str(env).context("error decoding component env"),
            _ => Ok(HashMap::new()),
        }
    }

    /// Encode & store the environment overlay.
    pub fn set_env_map(&mut self, env: &HashMap<String, String>) -> Result<()> {
        self.env = Some(serde_json::to_string(env).context("error encoding component env")?);
        Ok(())
    }

    /// Decode the argument list.
    pub fn args_vec(&self) -> Result<Vec<String>> {
        match &self.args {
            Some(args) if !args.is_empty() => serde_json::from_str(args).context("error decoding component args"),
            _ => Ok(vec![]),
        }
    }

    /// Encode & store the argument list.
    pub fn set_args_vec(&mut self, args: &[String]) -> Result<()> {
        self.args = Some(serde_json::to_string(args).context("error encoding component args")?);
        Ok(())
    }
}

/// The runtime status of a component on this host.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ComponentStatus {
    pub component_name: String,
    /// One of: unknown, running, stopped, failed.
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub last_started_at: Option<i64>,
    pub last_checked_at: i64,
    #[serde(default)]
    pub restart_count: i32,
    pub updated_at: i64,
}

/// Health check configuration & counters for one component.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthCheck {
    pub component_name: String,
    /// One of: http, tcp, process.
    pub kind: String,
    /// Probe target; ignored for process checks.
    #[serde(default)]
    pub endpoint: String,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub retries: i32,
    #[serde(default)]
    pub last_check_at: Option<i64>,
    /// One of: success, failure, reset; empty before the first probe.
    #[serde(default)]
    pub last_result: String,
    #[serde(default)]
    pub consecutive_failures: i32,
}

/// A local audit entry for deployment activity on this host.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentLog {
    pub component_name: String,
    /// One of: deploy, deploy-program, deploy-script, remove, restart.
    pub operation: String,
    /// One of: success, failure.
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: i64,
}
