//! Runtime configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The port reserved for the operator-facing HTTP API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// The port on which agent control streams are accepted.
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub data_path: String,

    /// Path to the server's PEM certificate; enables mutual TLS together with
    /// `tls_key` and `tls_ca`.
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// Path to the server's PEM private key.
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Path to the CA certificate used to verify agent certificates.
    #[serde(default)]
    pub tls_ca: Option<String>,

    /// Base URL of the external bulk script dispatcher, if any.
    #[serde(default)]
    pub bulk_dispatcher_url: Option<String>,
    /// Base URL of the external job orchestrator, if any.
    #[serde(default)]
    pub orchestrator_url: Option<String>,
    /// Base URL of the external node directory, if any.
    #[serde(default)]
    pub node_directory_url: Option<String>,

    /// Seconds without a heartbeat after which an agent is marked offline.
    #[serde(default = "default_agent_timeout_seconds")]
    pub agent_timeout_seconds: u64,
    /// Seconds between node directory synchronizations.
    #[serde(default = "default_node_sync_interval_seconds")]
    pub node_sync_interval_seconds: u64,
    /// Seconds between deployment retention sweeps.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Age in seconds beyond which terminal deployments are deleted.
    #[serde(default = "default_deployment_retention_seconds")]
    pub deployment_retention_seconds: u64,
}

fn default_http_port() -> u16 {
    8090
}

fn default_grpc_port() -> u16 {
    9091
}

fn default_agent_timeout_seconds() -> u64 {
    120
}

fn default_node_sync_interval_seconds() -> u64 {
    60 * 5
}

fn default_cleanup_interval_seconds() -> u64 {
    60 * 60 * 24
}

fn default_deployment_retention_seconds() -> u64 {
    60 * 60 * 24 * 30
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        if config.tls_cert.is_some() != config.tls_key.is_some() || config.tls_cert.is_some() != config.tls_ca.is_some() {
            bail!("TLS_CERT, TLS_KEY & TLS_CA must be set together");
        }
        Ok(config)
    }

    /// A bool indicating if mutual TLS is configured for agent streams.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some() && self.tls_ca.is_some()
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir")?;
        Ok((
            std::sync::Arc::new(Self {
                http_port: 8090,
                grpc_port: 9091,
                data_path: tmpdir.path().to_string_lossy().to_string(),
                tls_cert: None,
                tls_key: None,
                tls_ca: None,
                bulk_dispatcher_url: None,
                orchestrator_url: None,
                node_directory_url: None,
                agent_timeout_seconds: default_agent_timeout_seconds(),
                node_sync_interval_seconds: default_node_sync_interval_seconds(),
                cleanup_interval_seconds: default_cleanup_interval_seconds(),
                deployment_retention_seconds: default_deployment_retention_seconds(),
            }),
            tmpdir,
        ))
    }
}
