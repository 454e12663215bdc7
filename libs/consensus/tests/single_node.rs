//! Single-node cluster behavior: self-election, the barrier property, and
//! durability across restart.

use async_trait::async_trait;
use hivemind_consensus::{ConsensusConfig, ConsensusNode, RaftMessage, RaftTransport};
use hivemind_registry::{Registry, RegistryCommand, RegistryReply};
use hivemind_types::{NodeId, NodeInfo};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct NullTransport;

#[async_trait]
impl RaftTransport for NullTransport {
    async fn send(&self, _to: NodeId, _msg: RaftMessage) {}
}

fn ticker() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(5));
        loop {
            interval.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn start_node(dir: &Path, registry: Arc<Registry>) -> ConsensusNode {
    ConsensusNode::start(
        NodeId(1),
        Vec::new(),
        ConsensusConfig::default(),
        Arc::new(NullTransport),
        registry,
        dir,
        ticker(),
    )
    .unwrap()
}

/// Retries the NoOp barrier until the node has elected itself.
async fn barrier(node: &ConsensusNode) {
    for _ in 0..200 {
        if node.process(RegistryCommand::NoOp).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("single-node cluster never elected a leader");
}

#[tokio::test]
async fn single_node_elects_and_processes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let node = start_node(dir.path(), registry.clone());

    barrier(&node).await;

    let reply = node
        .process(RegistryCommand::NewNodeId {
            addr: "localhost:7767".into(),
        })
        .await
        .unwrap();
    assert_eq!(reply, RegistryReply::NodeId(NodeId(1)));
    assert_eq!(registry.nodes().len(), 1);
    assert!(registry.applied_index() > 0);

    node.stop().await;
}

#[tokio::test]
async fn barrier_observes_prior_commits() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let node = start_node(dir.path(), registry.clone());
    barrier(&node).await;

    node.process(RegistryCommand::AddNode {
        info: NodeInfo::new(NodeId(7), "localhost:7070"),
    })
    .await
    .unwrap();

    // Once a barrier returns, every earlier commit is visible locally.
    node.process(RegistryCommand::NoOp).await.unwrap();
    assert!(registry.node(NodeId(7)).is_some());

    node.stop().await;
}

#[tokio::test]
async fn committed_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let registry = Arc::new(Registry::new());
        let node = start_node(dir.path(), registry.clone());
        barrier(&node).await;
        node.process(RegistryCommand::AddNode {
            info: NodeInfo::new(NodeId(9), "localhost:9090"),
        })
        .await
        .unwrap();
        node.stop().await;
    }

    let registry = Arc::new(Registry::new());
    let node = start_node(dir.path(), registry.clone());
    barrier(&node).await;
    assert!(
        registry.node(NodeId(9)).is_some(),
        "log replay restored the directory"
    );
    node.stop().await;
}

#[tokio::test]
async fn conflicts_are_results_not_failures() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let node = start_node(dir.path(), registry.clone());
    barrier(&node).await;

    node.process(RegistryCommand::AddNode {
        info: NodeInfo::new(NodeId(2), "localhost:1111"),
    })
    .await
    .unwrap();
    let err = node
        .process(RegistryCommand::AddNode {
            info: NodeInfo::new(NodeId(2), "localhost:2222"),
        })
        .await
        .unwrap_err();
    assert_eq!(err.category(), "conflict");

    // The engine keeps going after a conflicting command.
    node.process(RegistryCommand::NoOp).await.unwrap();
    node.stop().await;
}
