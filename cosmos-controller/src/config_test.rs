use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("HTTP_PORT".into(), "8080".into()),
        ("GRPC_PORT".into(), "9999".into()),
        ("DATA_PATH".into(), "/tmp/cosmos-controller".into()),
        ("TLS_CERT".into(), "/etc/cosmos/controller.crt".into()),
        ("TLS_KEY".into(), "/etc/cosmos/controller.key".into()),
        ("TLS_CA".into(), "/etc/cosmos/ca.crt".into()),
        ("BULK_DISPATCHER_URL".into(), "http://dispatcher:8000".into()),
        ("ORCHESTRATOR_URL".into(), "http://orchestrator:4646".into()),
        ("NODE_DIRECTORY_URL".into(), "http://directory:8000".into()),
        ("AGENT_TIMEOUT_SECONDS".into(), "90".into()),
        ("NODE_SYNC_INTERVAL_SECONDS".into(), "60".into()),
        ("CLEANUP_INTERVAL_SECONDS".into(), "3600".into()),
        ("DEPLOYMENT_RETENTION_SECONDS".into(), "86400".into()),
    ])?;

    assert_eq!(config.http_port, 8080);
    assert_eq!(config.grpc_port, 9999);
    assert_eq!(config.data_path, "/tmp/cosmos-controller");
    assert!(config.tls_enabled(), "expected TLS to be enabled with all three paths set");
    assert_eq!(config.bulk_dispatcher_url.as_deref(), Some("http://dispatcher:8000"));
    assert_eq!(config.orchestrator_url.as_deref(), Some("http://orchestrator:4646"));
    assert_eq!(config.node_directory_url.as_deref(), Some("http://directory:8000"));
    assert_eq!(config.agent_timeout_seconds, 90);
    assert_eq!(config.node_sync_interval_seconds, 60);
    assert_eq!(config.cleanup_interval_seconds, 3600);
    assert_eq!(config.deployment_retention_seconds, 86400);

    Ok(())
}

#[test]
fn config_deserializes_from_empty_env_with_defaults() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;

    assert_eq!(config.http_port, 8090);
    assert_eq!(config.grpc_port, 9091);
    assert_eq!(config.data_path, crate::database::DEFAULT_DATA_PATH);
    assert!(!config.tls_enabled(), "expected TLS to be disabled by default");
    assert!(config.bulk_dispatcher_url.is_none());
    assert!(config.orchestrator_url.is_none());
    assert!(config.node_directory_url.is_none());
    assert_eq!(config.agent_timeout_seconds, 120);
    assert_eq!(config.node_sync_interval_seconds, 300);
    assert_eq!(config.cleanup_interval_seconds, 86400);
    assert_eq!(config.deployment_retention_seconds, 2592000);

    Ok(())
}
