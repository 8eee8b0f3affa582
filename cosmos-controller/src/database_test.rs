use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use crate::models::{Agent, Component, ComponentDeployment, DeploymentLog, Node};
use crate::utils;

async fn new_test_db() -> Result<(Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    Ok((db, tmpdir))
}

fn test_component(name: &str, hash: &str) -> Component {
    Component {
        name: name.to_string(),
        kind: "script".to_string(),
        handler: "agent".to_string(),
        hash: hash.to_string(),
        tags: vec!["all".to_string()],
        content: Some("#!/bin/sh\necho ok\n".to_string()),
        content_url: None,
        content_url_encoding: None,
        job: None,
        health_check: None,
        env: None,
        args: None,
        managed: true,
        deployment_id: None,
        created_at: utils::now(),
        updated_at: utils::now(),
    }
}

fn test_node(hostname: &str, tags: &[&str], online: bool, has_agent: bool) -> Node {
    Node {
        hostname: hostname.to_string(),
        ip: None,
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        online,
        has_agent,
        last_seen: None,
        metadata: None,
        synced_at: utils::now(),
    }
}

#[tokio::test]
async fn deployment_status_transitions_stamp_timestamps() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let deployment = db.create_deployment(json!({"components": []})).await?;
    assert_eq!(deployment.status, "pending");
    assert!(deployment.started_at.is_none());

    db.update_deployment_status(deployment.id, "running", None).await?;
    let running = db.get_deployment(deployment.id).await?.expect("deployment should exist");
    assert_eq!(running.status, "running");
    assert!(running.started_at.is_some(), "running transition should stamp started_at");
    assert!(running.completed_at.is_none());

    db.update_deployment_status(deployment.id, "failed", Some("boom".into())).await?;
    let failed = db.get_deployment(deployment.id).await?.expect("deployment should exist");
    assert_eq!(failed.status, "failed");
    assert!(failed.completed_at.is_some(), "terminal transition should stamp completed_at");
    assert_eq!(failed.error_message.as_deref(), Some("boom"));

    Ok(())
}

#[tokio::test]
async fn update_status_of_unknown_deployment_is_noop() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;
    db.update_deployment_status(Uuid::new_v4(), "running", None).await?;
    assert!(db.list_deployments(10, 0).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn list_deployments_newest_first_with_paging() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let mut ids = vec![];
    for offset in 0..3 {
        let deployment = db.create_deployment(json!({ "seq": offset })).await?;
        ids.push(deployment.id);
    }
    // Creation timestamps are second-granular; all three share one, so only
    // assert the full set & paging behavior.
    let all = db.list_deployments(10, 0).await?;
    assert_eq!(all.len(), 3);
    let page = db.list_deployments(2, 2).await?;
    assert_eq!(page.len(), 1);

    Ok(())
}

#[tokio::test]
async fn upsert_component_preserves_created_at() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let mut component = test_component("sensor", "aaa");
    component.created_at = 42;
    db.upsert_component(component.clone()).await?;

    component.hash = "bbb".to_string();
    component.created_at = 99;
    db.upsert_component(component).await?;

    let stored = db.get_component("sensor").await?.expect("component should exist");
    assert_eq!(stored.hash, "bbb");
    assert_eq!(stored.created_at, 42, "second upsert should keep the original created_at");

    db.delete_component("sensor").await?;
    assert!(db.get_component("sensor").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn component_deployments_are_unique_per_placement() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    db.upsert_component_deployment(ComponentDeployment::new("sensor", "node-1", utils::now())).await?;
    db.upsert_component_deployment(ComponentDeployment::new("sensor", "node-2", utils::now())).await?;
    db.upsert_component_deployment(ComponentDeployment::new("sensor", "node-1", utils::now())).await?;

    let deployments = db.get_component_deployments("sensor").await?;
    assert_eq!(deployments.len(), 2, "one row per (component, node) pair");

    let node_deployments = db.get_node_deployments("node-1").await?;
    assert_eq!(node_deployments.len(), 1);

    db.delete_component_deployment("sensor", "node-1").await?;
    assert_eq!(db.get_component_deployments("sensor").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn merge_component_deployment_folds_partial_updates() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    // First event arrives before any pre-created row: a fresh row appears.
    db.merge_component_deployment("sensor", "node-1", |deployment| {
        deployment.status = "running".to_string();
        deployment.pid = Some(4242);
    })
    .await?;

    // A later health event must not clobber the status or pid.
    db.merge_component_deployment("sensor", "node-1", |deployment| {
        deployment.health_status = Some("healthy".to_string());
    })
    .await?;

    let stored = db.get_component_deployment("sensor", "node-1").await?.expect("row should exist");
    assert_eq!(stored.status, "running");
    assert_eq!(stored.pid, Some(4242));
    assert_eq!(stored.health_status.as_deref(), Some("healthy"));
    Ok(())
}

#[tokio::test]
async fn list_component_deployments_filters_by_status() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    db.merge_component_deployment("a", "node-1", |deployment| deployment.status = "running".to_string()).await?;
    db.merge_component_deployment("b", "node-1", |deployment| deployment.status = "failed".to_string()).await?;

    assert_eq!(db.list_component_deployments(None).await?.len(), 2);
    let failed = db.list_component_deployments(Some("failed".into())).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].component_name, "b");
    Ok(())
}

#[tokio::test]
async fn offline_sweep_only_flips_stale_agents() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;
    let now = utils::now();

    for (hostname, last_heartbeat, online) in [("fresh", now, true), ("stale", now - 600, true), ("gone", now - 600, false)] {
        db.upsert_agent(Agent {
            hostname: hostname.to_string(),
            agent_version: "0.1.0".to_string(),
            last_heartbeat,
            online,
            component_count: 0,
            created_at: now,
            updated_at: now,
        })
        .await?;
    }

    let flipped = db.mark_agents_offline(now - 120).await?;
    assert_eq!(flipped, 1, "only the stale online agent should flip");

    let online: Vec<String> = db.list_agents(true).await?.into_iter().map(|agent| agent.hostname).collect();
    assert_eq!(online, vec!["fresh".to_string()], "agents with recent heartbeats stay online");
    Ok(())
}

#[tokio::test]
async fn heartbeat_node_upsert_preserves_directory_tags() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    // Unknown node: created with the default tag.
    db.upsert_node_from_heartbeat("node-1", utils::now()).await?;
    let node = db.get_node("node-1").await?.expect("node should exist");
    assert_eq!(node.tags, vec!["all".to_string()]);
    assert!(node.online && node.has_agent);

    // Directory-synced tags survive subsequent heartbeats.
    db.upsert_node(test_node("node-1", &["all", "edge"], false, false)).await?;
    db.upsert_node_from_heartbeat("node-1", utils::now()).await?;
    let node = db.get_node("node-1").await?.expect("node should exist");
    assert_eq!(node.tags, vec!["all".to_string(), "edge".to_string()]);
    assert!(node.online && node.has_agent);
    Ok(())
}

#[tokio::test]
async fn nodes_by_tags_matches_any_intersection() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    db.upsert_node(test_node("a", &["web"], true, true)).await?;
    db.upsert_node(test_node("b", &["db", "edge"], true, true)).await?;
    db.upsert_node(test_node("c", &["batch"], false, true)).await?;

    let matched = db.nodes_by_tags(&["edge".to_string(), "web".to_string()]).await?;
    let mut hostnames: Vec<String> = matched.into_iter().map(|node| node.hostname).collect();
    hostnames.sort();
    assert_eq!(hostnames, vec!["a".to_string(), "b".to_string()]);

    let online = db.list_nodes(true).await?;
    assert_eq!(online.len(), 2);
    Ok(())
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_deployments() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;

    let old_completed = db.create_deployment(json!({})).await?;
    db.update_deployment_status(old_completed.id, "completed", None).await?;
    let old_running = db.create_deployment(json!({})).await?;
    db.update_deployment_status(old_running.id, "running", None).await?;

    // A cutoff in the future makes both "old"; only the terminal one goes.
    let removed = db.cleanup_old_deployments(utils::now() + 60).await?;
    assert_eq!(removed, 1);

    let remaining = db.list_deployments(10, 0).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, old_running.id);
    Ok(())
}

#[tokio::test]
async fn deployment_logs_append_and_read_newest_first() -> Result<()> {
    let (db, _tmpdir) = new_test_db().await?;
    let deployment_id = Uuid::new_v4();

    for seq in 0..3 {
        db.append_deployment_log(DeploymentLog {
            deployment_id,
            component_name: Some(format!("component-{}", seq)),
            node_hostname: None,
            operation: "deploy".to_string(),
            status: "initiated".to_string(),
            message: None,
            created_at: utils::now(),
        })
        .await?;
    }
    // Logs for other deployments must not leak in.
    db.append_deployment_log(DeploymentLog {
        deployment_id: Uuid::new_v4(),
        component_name: None,
        node_hostname: None,
        operation: "remove".to_string(),
        status: "initiated".to_string(),
        message: None,
        created_at: utils::now(),
    })
    .await?;

    let logs = db.get_deployment_logs(deployment_id, 2).await?;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].component_name.as_deref(), Some("component-2"), "newest entry first");
    Ok(())
}
