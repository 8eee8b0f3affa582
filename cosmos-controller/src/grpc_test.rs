use anyhow::Result;
use tokio::sync::mpsc;

use cosmos_proto::{ComponentDeployment, ControllerMessage, ControllerMessagePayload};

use crate::grpc::{OutboundSender, RpcResult, StreamRegistry};

fn new_stream() -> (OutboundSender, mpsc::Receiver<RpcResult<ControllerMessage>>) {
    mpsc::channel(100)
}

fn test_deployment(name: &str) -> ComponentDeployment {
    ComponentDeployment {
        component_name: name.to_string(),
        component_type: "script".to_string(),
        hash: "aaa".to_string(),
        managed: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn register_replaces_prior_stream_for_hostname() -> Result<()> {
    let registry = StreamRegistry::new();
    let (tx1, mut rx1) = new_stream();
    let (tx2, mut rx2) = new_stream();

    registry.register("node-1", tx1);
    registry.register("node-1", tx2);

    registry.send_deployment("node-1", test_deployment("sensor")).await?;
    assert!(rx1.try_recv().is_err(), "replaced stream must not receive");
    let msg = rx2.try_recv().expect("latest stream should receive")?;
    assert!(matches!(msg.payload, Some(ControllerMessagePayload::Deployment(_))));
    Ok(())
}

#[tokio::test]
async fn deregister_is_noop_after_takeover() -> Result<()> {
    let registry = StreamRegistry::new();
    let (tx1, _rx1) = new_stream();
    let (tx2, _rx2) = new_stream();

    registry.register("node-1", tx1.clone());
    registry.register("node-1", tx2.clone());

    // The old stream going away must not evict the new owner.
    registry.deregister("node-1", &tx1);
    assert!(registry.get("node-1").is_some());

    registry.deregister("node-1", &tx2);
    assert!(registry.get("node-1").is_none());
    Ok(())
}

#[tokio::test]
async fn send_without_registered_stream_errors() -> Result<()> {
    let registry = StreamRegistry::new();
    let res = registry.send_removal("nowhere", "sensor").await;
    assert!(res.is_err(), "sends are best-effort and fail with no stream");
    Ok(())
}

#[tokio::test]
async fn broadcast_collects_per_host_errors() -> Result<()> {
    let registry = StreamRegistry::new();
    let (tx, mut rx) = new_stream();
    registry.register("node-1", tx);

    let errors = registry
        .broadcast_deployment(&test_deployment("sensor"), &["node-1".to_string(), "node-2".to_string()])
        .await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "node-2");
    assert!(rx.try_recv().is_ok(), "connected host still receives its copy");
    Ok(())
}

#[tokio::test]
async fn connected_agents_lists_registered_hostnames() -> Result<()> {
    let registry = StreamRegistry::new();
    let (tx1, _rx1) = new_stream();
    let (tx2, _rx2) = new_stream();
    registry.register("node-1", tx1);
    registry.register("node-2", tx2);

    let mut connected = registry.connected_agents();
    connected.sort();
    assert_eq!(connected, vec!["node-1".to_string(), "node-2".to_string()]);
    Ok(())
}
