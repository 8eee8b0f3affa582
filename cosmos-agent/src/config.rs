//! Runtime configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The `host:port` of the controller's stream endpoint.
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    /// The agent's working directory for programs, scripts, logs & its local
    /// store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Hostname override; the OS hostname is used when unset.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Placement tags advertised for this host.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Path to the agent's PEM certificate; enables mutual TLS together with
    /// `tls_key` and `tls_ca`.
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// Path to the agent's PEM private key.
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Path to the CA certificate used to verify the controller.
    #[serde(default)]
    pub tls_ca: Option<String>,

    /// Seconds between reconnection attempts to the controller.
    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u64,
    /// Seconds between local reconciliation passes.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
    /// Seconds between heartbeats.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
}

fn default_controller_url() -> String {
    "controller:9091".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/cosmos/agent".to_string()
}

fn default_reconnect_interval_seconds() -> u64 {
    5
}

fn default_reconcile_interval_seconds() -> u64 {
    30
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
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

    /// A bool indicating if mutual TLS is configured for the control stream.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some() && self.tls_ca.is_some()
    }

    /// The hostname this agent identifies as.
    pub fn node_hostname(&self) -> Result<String> {
        if let Some(hostname) = &self.hostname {
            return Ok(hostname.clone());
        }
        let hostname = nix::unistd::gethostname().context("failed to get hostname")?;
        Ok(hostname.to_string_lossy().to_string())
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir")?;
        Ok((
            std::sync::Arc::new(Self {
                controller_url: default_controller_url(),
                data_dir: tmpdir.path().to_string_lossy().to_string(),
                hostname: Some("testing".to_string()),
                tags: vec!["all".to_string()],
                tls_cert: None,
                tls_key: None,
                tls_ca: None,
                reconnect_interval_seconds: default_reconnect_interval_seconds(),
                reconcile_interval_seconds: default_reconcile_interval_seconds(),
                heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            }),
            tmpdir,
        ))
    }
}
