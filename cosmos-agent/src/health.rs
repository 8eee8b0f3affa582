//! The component health checker.
//!
//! Each component may carry one health check record; probes run when due
//! (`last_check_at + interval` elapsed) and maintain a consecutive-failure
//! counter that the reconciler surfaces upstream once it crosses the
//! configured retry threshold.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;

use crate::database::Database;
use crate::models::HealthCheck;
use crate::utils;

/// The probe timeout applied when a check has none configured.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The component health checker for this host.
pub struct HealthChecker {
    /// The agent's local store.
    db: Database,
    /// HTTP client for http probes; redirects are never followed.
    http: reqwest::Client,
    /// Process liveness probe, injected to keep probes decoupled from the
    /// lifecycle engine.
    check_process: fn(i32) -> bool,
}

impl HealthChecker {
    /// Create a new instance.
    pub fn new(db: Database, check_process: fn(i32) -> bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("error building health check HTTP client")?;
        Ok(Self { db, http, check_process })
    }

    /// Run every due health check across all installed components.
    pub async fn check_all_components(&self) -> Result<()> {
        let components = self.db.list_components().await.context("failed to get components")?;
        for component in components {
            let check = match self.db.get_health_check(&component.name).await {
                Ok(Some(check)) => check,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = ?err, component = %component.name, "failed to get health check");
                    continue;
                }
            };
            if !check_is_due(&check, utils::now()) {
                continue;
            }
            if let Err(err) = self.run_health_check(&component.name).await {
                tracing::debug!(error = ?err, component = %component.name, "health check failed");
            }
        }
        Ok(())
    }

    /// Run one component's health check now, updating its counters. Returns
    /// the probe error, if any, after recording it.
    pub async fn run_health_check(&self, component_name: &str) -> Result<()> {
        let mut check = match self.db.get_health_check(component_name).await.context("failed to get health check")? {
            Some(check) => check,
            None => return Ok(()),
        };

        let probe = match check.kind.as_str() {
            "http" => self.probe_http(&check.endpoint, check.timeout_seconds).await,
            "tcp" => self.probe_tcp(&check.endpoint, check.timeout_seconds).await,
            "process" => self.probe_process(component_name).await,
            other => bail!("unsupported health check type: {}", other),
        };

        check.last_check_at = Some(utils::now());
        match &probe {
            Ok(()) => {
                check.last_result = "success".to_string();
                check.consecutive_failures = 0;
                tracing::debug!(component = %component_name, kind = %check.kind, "health check passed");
            }
            Err(err) => {
                check.last_result = "failure".to_string();
                check.consecutive_failures += 1;
                tracing::warn!(
                    component = %component_name,
                    kind = %check.kind,
                    consecutive_failures = check.consecutive_failures,
                    "health check failed: {}", err,
                );
            }
        }
        self.db.upsert_health_check(check).await.context("failed to update health check")?;

        probe
    }

    /// GET the endpoint; any 2xx status is success. Redirects are failures.
    async fn probe_http(&self, endpoint: &str, timeout_seconds: i32) -> Result<()> {
        let timeout = probe_timeout(timeout_seconds);
        let response = self
            .http
            .get(endpoint)
            .timeout(timeout)
            .send()
            .await
            .context("request failed")?;
        if !response.status().is_success() {
            bail!("unhealthy status code: {}", response.status());
        }
        Ok(())
    }

    /// Dial the endpoint; success iff the connection lands within the
    /// timeout.
    async fn probe_tcp(&self, endpoint: &str, timeout_seconds: i32) -> Result<()> {
        let timeout = probe_timeout(timeout_seconds);
        match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(_conn)) => Ok(()),
            Ok(Err(err)) => Err(err).context("connection failed"),
            Err(_) => bail!("connection timed out after {:?}", timeout),
        }
    }

    /// Success iff the component reports `running` with a live PID.
    async fn probe_process(&self, component_name: &str) -> Result<()> {
        let status = self.db.get_component_status(component_name).await.context("failed to get component status")?;
        if status.status != "running" {
            bail!("component is not running (status: {})", status.status);
        }
        if status.pid <= 0 {
            bail!("invalid PID: {}", status.pid);
        }
        if !(self.check_process)(status.pid) {
            bail!("process {} is not running", status.pid);
        }
        Ok(())
    }

    /// Health checks that have crossed their failure threshold.
    pub async fn failed_components(&self) -> Result<Vec<HealthCheck>> {
        let components = self.db.list_components().await.context("failed to get components")?;
        let mut failed = vec![];
        for component in components {
            let check = match self.db.get_health_check(&component.name).await {
                Ok(Some(check)) => check,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = ?err, component = %component.name, "failed to get health check");
                    continue;
                }
            };
            if check.retries > 0 && check.consecutive_failures >= check.retries {
                failed.push(check);
            }
        }
        Ok(failed)
    }

    /// Reset a component's failure counter.
    pub async fn reset_failure_count(&self, component_name: &str) -> Result<()> {
        let mut check = match self.db.get_health_check(component_name).await.context("failed to get health check")? {
            Some(check) => check,
            None => return Ok(()),
        };
        check.consecutive_failures = 0;
        check.last_result = "reset".to_string();
        self.db.upsert_health_check(check).await
    }
}

/// A check is due when it has never run or its interval has elapsed.
pub fn check_is_due(check: &HealthCheck, now: i64) -> bool {
    match check.last_check_at {
        None => true,
        Some(last) => now > last + check.interval_seconds as i64,
    }
}

/// The effective probe timeout; configured values below one second fall back
/// to the default.
fn probe_timeout(timeout_seconds: i32) -> Duration {
    if timeout_seconds >= 1 {
        Duration::from_secs(timeout_seconds as u64)
    } else {
        DEFAULT_PROBE_TIMEOUT
    }
}
