use std::collections::HashMap;

use anyhow::Result;

use crate::config::Config;
use crate::database::Database;
use crate::models::{Component, ComponentStatus, DeploymentLog, HealthCheck};
use crate::utils;

async fn new_test_db() -> Result<(Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    Ok((db, tmpdir))
}

fn test_component(name: &str) -> Component {
    Component {
        name: name.to_string(),
        kind: "script".to_string(),
        hash: "aaa".to_string(),
        content_url: None,
        content_url_encoding: None,
        content: Some("#!/bin/sh\necho ok\n".to_string()),
        executable: String::new(),
        env: None,
        args: None,
        managed: true,
        created_at: utils::now(),
        updated_at: utils::now(),
    }
}

#[tokio::test]
async fn missing_component_status_synthesizes_unknown() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let status = db.get_component_status("ghost").await?;
    assert_eq!(status.component_name, "ghost");
    assert_eq!(status.status, "unknown");
    assert_eq!(status.pid, 0);
    assert!(status.last_checked_at > 0, "synthesized default carries a fresh last_checked_at");
    Ok(())
}

#[tokio::test]
async fn missing_health_check_is_not_an_error() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;
    assert!(db.get_health_check("ghost").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn component_round_trips_with_env_and_args_blobs() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let mut component = test_component("sensor");
    let mut env = HashMap::new();
    env.insert("PORT".to_string(), "8080".to_string());
    component.set_env_map(&env)?;
    component.set_args_vec(&["--verbose".to_string()])?;
    db.upsert_component(component).await?;

    let stored = db.get_component("sensor").await?.expect("component should exist");
    assert_eq!(stored.env_map()?.get("PORT").map(String::as_str), Some("8080"));
    assert_eq!(stored.args_vec()?, vec!["--verbose".to_string()]);
    assert_eq!(db.list_components().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn empty_env_and_args_decode_to_defaults() -> Result<()> {
    let component = test_component("sensor");
    assert!(component.env_map()?.is_empty());
    assert!(component.args_vec()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_component_cascades_to_status_and_health_check() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    db.upsert_component(test_component("sensor")).await?;
    db.upsert_component_status(ComponentStatus {
        component_name: "sensor".to_string(),
        status: "running".to_string(),
        message: String::new(),
        pid: 4242,
        last_started_at: Some(utils::now()),
        last_checked_at: utils::now(),
        restart_count: 0,
        updated_at: 0,
    })
    .await?;
    db.upsert_health_check(HealthCheck {
        component_name: "sensor".to_string(),
        kind: "tcp".to_string(),
        endpoint: "localhost:8080".to_string(),
        interval_seconds: 30,
        timeout_seconds: 5,
        retries: 3,
        last_check_at: None,
        last_result: String::new(),
        consecutive_failures: 0,
    })
    .await?;

    db.delete_component("sensor").await?;

    assert!(db.get_component("sensor").await?.is_none());
    assert!(db.get_health_check("sensor").await?.is_none());
    let status = db.get_component_status("sensor").await?;
    assert_eq!(status.status, "unknown", "cascaded status synthesizes the default again");
    Ok(())
}

#[tokio::test]
async fn component_status_upsert_touches_updated_at() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    db.upsert_component_status(ComponentStatus {
        component_name: "sensor".to_string(),
        status: "running".to_string(),
        message: "Process started successfully".to_string(),
        pid: 4242,
        last_started_at: Some(utils::now()),
        last_checked_at: utils::now(),
        restart_count: 2,
        updated_at: 0,
    })
    .await?;

    let stored = db.get_component_status("sensor").await?;
    assert_eq!(stored.status, "running");
    assert_eq!(stored.pid, 4242);
    assert_eq!(stored.restart_count, 2);
    assert!(stored.updated_at > 0, "upsert must touch updated_at");
    Ok(())
}

#[tokio::test]
async fn deployment_log_appends() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;
    db.append_deployment_log(DeploymentLog {
        component_name: "sensor".to_string(),
        operation: "deploy-script".to_string(),
        status: "success".to_string(),
        message: "Deployment completed successfully".to_string(),
        timestamp: 0,
    })
    .await?;
    Ok(())
}
