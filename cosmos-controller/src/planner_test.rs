use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use cosmos_core::spec::{ComponentKind, ComponentSpec, Configuration};
use cosmos_proto::{ControllerMessage, ControllerMessagePayload};

use crate::config::Config;
use crate::database::Database;
use crate::grpc::{RpcResult, StreamRegistry};
use crate::models::Node;
use crate::planner::Planner;
use crate::utils;

async fn new_test_planner() -> Result<(Arc<Planner>, Database, Arc<StreamRegistry>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let registry = Arc::new(StreamRegistry::new());
    let planner = Arc::new(Planner::new(&config, db.clone(), registry.clone()));
    Ok((planner, db, registry, tmpdir))
}

async fn seed_nodes(db: &Database, hostnames: &[&str]) -> Result<()> {
    for hostname in hostnames {
        db.upsert_node(Node {
            hostname: hostname.to_string(),
            ip: None,
            tags: vec!["all".to_string()],
            online: true,
            has_agent: true,
            last_seen: Some(utils::now()),
            metadata: None,
            synced_at: utils::now(),
        })
        .await?;
    }
    Ok(())
}

fn script_spec(name: &str, hash: &str) -> ComponentSpec {
    ComponentSpec {
        kind: ComponentKind::Script,
        name: name.to_string(),
        hash: hash.to_string(),
        tags: vec!["all".to_string()],
        handler: None,
        content: Some("#!/bin/sh\nsleep 300\n".to_string()),
        content_url: None,
        content_url_encoding: None,
        job: None,
        managed: true,
        health_check: None,
        env: None,
        args: None,
    }
}

fn config_of(components: Vec<ComponentSpec>) -> Configuration {
    Configuration { components }
}

type Outbound = mpsc::Receiver<RpcResult<ControllerMessage>>;

fn register_fake_agent(registry: &StreamRegistry, hostname: &str) -> Outbound {
    let (tx, rx) = mpsc::channel(100);
    registry.register(hostname, tx);
    rx
}

fn recv_payload(rx: &mut Outbound) -> Option<ControllerMessagePayload> {
    match rx.try_recv() {
        Ok(Ok(msg)) => msg.payload,
        _ => None,
    }
}

#[tokio::test]
async fn deployment_pre_creates_rows_and_broadcasts() -> Result<()> {
    let (planner, db, registry, _tmpdir) = new_test_planner().await?;
    seed_nodes(&db, &["node-1", "node-2", "node-3"]).await?;
    let mut rx = register_fake_agent(&registry, "node-1");

    let deployment = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(deployment.id, config_of(vec![script_spec("sensor", "aaa")])).await?;

    // Deployment is terminal once actions are dispatched, not once agents
    // have converged.
    let stored = db.get_deployment(deployment.id).await?.expect("deployment should exist");
    assert_eq!(stored.status, "completed");
    assert!(stored.completed_at.is_some());

    let component = db.get_component("sensor").await?.expect("component should be stored");
    assert_eq!(component.hash, "aaa");
    assert_eq!(component.handler, "agent");

    // One `deploying` row per resolved node, present even for the two nodes
    // with no live stream.
    let rows = db.get_component_deployments("sensor").await?;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.status == "deploying"));
    assert!(rows.iter().all(|row| row.deployment_id == Some(deployment.id)));

    match recv_payload(&mut rx) {
        Some(ControllerMessagePayload::Deployment(sent)) => {
            assert_eq!(sent.component_name, "sensor");
            assert_eq!(sent.hash, "aaa");
            assert!(sent.managed);
        }
        other => panic!("expected a deployment command, got {:?}", other.is_some()),
    }

    let logs = db.get_deployment_logs(deployment.id, 10).await?;
    assert_eq!(logs.len(), 3, "one initiated entry per target node");
    Ok(())
}

#[tokio::test]
async fn resubmitting_identical_configuration_is_a_noop() -> Result<()> {
    let (planner, db, registry, _tmpdir) = new_test_planner().await?;
    seed_nodes(&db, &["node-1"]).await?;
    let mut rx = register_fake_agent(&registry, "node-1");

    let config = config_of(vec![script_spec("sensor", "aaa")]);
    let first = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(first.id, config.clone()).await?;
    assert!(recv_payload(&mut rx).is_some(), "first submission must broadcast");

    let second = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(second.id, config).await?;

    let stored = db.get_deployment(second.id).await?.expect("deployment should exist");
    assert_eq!(stored.status, "completed");
    assert!(recv_payload(&mut rx).is_none(), "unchanged hash must not broadcast");
    assert_eq!(db.get_component_deployments("sensor").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn hash_change_redeploys_component() -> Result<()> {
    let (planner, db, registry, _tmpdir) = new_test_planner().await?;
    seed_nodes(&db, &["node-1"]).await?;
    let mut rx = register_fake_agent(&registry, "node-1");

    let first = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(first.id, config_of(vec![script_spec("sensor", "aaa")])).await?;
    assert!(recv_payload(&mut rx).is_some());

    let second = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(second.id, config_of(vec![script_spec("sensor", "bbb")])).await?;

    let component = db.get_component("sensor").await?.expect("component should exist");
    assert_eq!(component.hash, "bbb");
    match recv_payload(&mut rx) {
        Some(ControllerMessagePayload::Deployment(sent)) => assert_eq!(sent.hash, "bbb"),
        other => panic!("expected a deployment command, got {:?}", other.is_some()),
    }
    Ok(())
}

#[tokio::test]
async fn empty_configuration_removes_existing_components() -> Result<()> {
    let (planner, db, registry, _tmpdir) = new_test_planner().await?;
    seed_nodes(&db, &["node-1"]).await?;
    let mut rx = register_fake_agent(&registry, "node-1");

    let first = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(first.id, config_of(vec![script_spec("sensor", "aaa")])).await?;
    assert!(recv_payload(&mut rx).is_some());

    let second = db.create_deployment(serde_json::json!({})).await?;
    planner.process_deployment(second.id, config_of(vec![])).await?;

    assert!(db.get_component("sensor").await?.is_none(), "omitted component must be removed");
    assert!(db.get_component_deployments("sensor").await?.is_empty());
    match recv_payload(&mut rx) {
        Some(ControllerMessagePayload::Removal(removal)) => assert_eq!(removal.component_name, "sensor"),
        other => panic!("expected a removal command, got {:?}", other.is_some()),
    }
    Ok(())
}

#[tokio::test]
async fn per_component_failures_do_not_fail_the_deployment() -> Result<()> {
    let (planner, db, registry, _tmpdir) = new_test_planner().await?;
    seed_nodes(&db, &["node-1"]).await?;
    let mut rx = register_fake_agent(&registry, "node-1");

    // A service with no orchestrator configured fails its dispatch; the
    // script must still go out and the deployment must still complete.
    let mut service = script_spec("svc", "ccc");
    service.kind = ComponentKind::Service;
    service.managed = false;

    let deployment = db.create_deployment(serde_json::json!({})).await?;
    planner
        .process_deployment(deployment.id, config_of(vec![service, script_spec("sensor", "aaa")]))
        .await?;

    let stored = db.get_deployment(deployment.id).await?.expect("deployment should exist");
    assert_eq!(stored.status, "completed");
    assert!(recv_payload(&mut rx).is_some(), "healthy component still dispatched");

    let logs = db.get_deployment_logs(deployment.id, 10).await?;
    assert!(
        logs.iter().any(|log| log.component_name.as_deref() == Some("svc") && log.status == "failure"),
        "failed component surfaces in the deployment log",
    );
    Ok(())
}

#[tokio::test]
async fn placement_resolution_requires_online_and_intersecting_tags() -> Result<()> {
    let (planner, db, _registry, _tmpdir) = new_test_planner().await?;

    for (hostname, tags, online) in [
        ("a", vec!["web"], true),
        ("b", vec!["db"], true),
        ("c", vec!["web"], false),
    ] {
        db.upsert_node(Node {
            hostname: hostname.to_string(),
            ip: None,
            tags: tags.into_iter().map(String::from).collect(),
            online,
            has_agent: true,
            last_seen: None,
            metadata: None,
            synced_at: utils::now(),
        })
        .await?;
    }

    let all = planner.resolve_placement(&[]).await?;
    let mut hostnames: Vec<String> = all.into_iter().map(|node| node.hostname).collect();
    hostnames.sort();
    assert_eq!(hostnames, vec!["a".to_string(), "b".to_string()], "empty tags select every online node");

    let web = planner.resolve_placement(&["web".to_string()]).await?;
    assert_eq!(web.len(), 1, "offline nodes are never eligible");
    assert_eq!(web[0].hostname, "a");
    Ok(())
}
