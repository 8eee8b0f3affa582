//! Desired-configuration models.
//!
//! A [`Configuration`] is the declarative document submitted by clients: a
//! list of named components with content, placement tags and optional health
//! checks. The controller's planner diffs it against stored state, so these
//! models are the stable contract of the system.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A full desired configuration submitted for deployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Configuration {
    /// The full set of desired components; anything stored but absent here
    /// is removed.
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

/// The desired state of one named component.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ComponentSpec {
    /// The component kind.
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    /// The unique name of the component; its placement slot.
    pub name: String,
    /// Hex SHA-256 over the component content; the artifact identity.
    ///
    /// Any change to content changes the hash, and an unchanged hash is the
    /// no-op signal for redeployment.
    pub hash: String,
    /// Placement tags selecting eligible nodes; empty selects all online nodes.
    #[serde(default)]
    pub tags: Vec<String>,
    /// The dispatcher used to apply this component; derived from the kind
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<Handler>,
    /// Inline content, used for scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// URL from which program content is downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    /// Encoding of the downloaded content: `plain` (default), `tar.gz`/`tgz`
    /// or `zip`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url_encoding: Option<String>,
    /// Opaque job payload handed to the external orchestrator for `service`
    /// components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<serde_json::Value>,
    /// Managed components are supervised and restarted; unmanaged scripts run
    /// once.
    #[serde(default)]
    pub managed: bool,
    /// Optional health check applied after deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    /// Environment overlay for the launched process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Arguments appended to the executable invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl ComponentSpec {
    /// The handler used to apply this component, deriving the default from
    /// the component kind when none was given.
    pub fn effective_handler(&self) -> Handler {
        if let Some(handler) = self.handler {
            return handler;
        }
        match self.kind {
            ComponentKind::Script if self.managed => Handler::Agent,
            ComponentKind::Script => Handler::ExternalBulk,
            ComponentKind::Program => Handler::Agent,
            ComponentKind::Service => Handler::ExternalOrchestrator,
        }
    }
}

/// The kind of workload a component describes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// A shell script, shipped inline.
    Script,
    /// A native program, shipped by content URL.
    Program,
    /// An externally-orchestrated service.
    Service,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Program => "program",
            Self::Service => "service",
        }
    }
}

/// The dispatcher used to apply a component.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Handler {
    /// Delivered over the control stream and supervised by the agent.
    #[serde(rename = "agent")]
    Agent,
    /// Submitted to the external bulk script dispatcher; scripts only.
    #[serde(rename = "external-bulk")]
    ExternalBulk,
    /// Submitted to the external job orchestrator; services only.
    #[serde(rename = "external-orchestrator")]
    ExternalOrchestrator,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::ExternalBulk => "external-bulk",
            Self::ExternalOrchestrator => "external-orchestrator",
        }
    }
}

/// Health check configuration attached to a component.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthCheckSpec {
    /// The probe type: `http`, `tcp` or `process`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Probe target; ignored for process checks.
    #[serde(default)]
    pub endpoint: String,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub retries: i32,
}

/// Compute the hex SHA-256 content hash used as artifact identity.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
