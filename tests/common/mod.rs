//! Common test utilities for integration tests.

pub mod guest;

use std::time::Duration;
use trove_cluster::service::CreateRequest;
use trove_cluster::store::InMemoryStore;
use trove_cluster::{
    ClusterId, ClusterOrchestrator, ClusterRecordStore, ClusterService, Datastore,
    EngineRegistry, InstanceDef, NodeId, NodeStatus, Timeouts,
};

pub use guest::*;

pub type Orchestrator = ClusterOrchestrator<InMemoryStore, ScriptedGuest>;

/// Millisecond timeouts so failure paths finish quickly
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        poll_interval: Duration::from_millis(5),
        ready: Duration::from_millis(200),
        operation: Duration::from_secs(10),
        rpc: Duration::from_secs(1),
        upgrade: Duration::from_millis(200),
    }
}

pub fn orchestrator(guest: ScriptedGuest) -> Orchestrator {
    orchestrator_with(guest, fast_timeouts())
}

pub fn orchestrator_with(guest: ScriptedGuest, timeouts: Timeouts) -> Orchestrator {
    let store = InMemoryStore::new();
    let guest = guest.reporting_to(store.clone());
    ClusterOrchestrator::new(store, guest, EngineRegistry::builtin(), timeouts)
}

pub fn service(orchestrator: &Orchestrator) -> ClusterService<'_, InMemoryStore> {
    ClusterService::new(orchestrator.store(), orchestrator.registry())
}

pub fn create_request(engine: &str, version: &str, types: &[&[&str]]) -> CreateRequest {
    CreateRequest {
        name: "prod".to_string(),
        tenant: "tenant-1".to_string(),
        datastore: Datastore {
            engine: engine.to_string(),
            version: version.to_string(),
        },
        instances: types
            .iter()
            .map(|t| InstanceDef::new("m1.large", Some(10)).with_types(t.iter().copied()))
            .collect(),
    }
}

/// Report every listed node as provisioned, with an address
pub fn provision(orchestrator: &Orchestrator, nodes: &[NodeId]) {
    for (i, node) in nodes.iter().enumerate() {
        let ip = format!("10.0.0.{}", i + 10);
        service(orchestrator)
            .report_node_status(*node, NodeStatus::BuildPending, Some(&ip))
            .unwrap();
    }
}

pub fn node_ids(orchestrator: &Orchestrator, cluster: ClusterId) -> Vec<NodeId> {
    orchestrator
        .store()
        .list_nodes(cluster)
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect()
}

/// Create a cluster from `types`, provision its nodes and build it
pub fn built_cluster(orchestrator: &Orchestrator, engine: &str, types: &[&[&str]]) -> ClusterId {
    let (cluster, task) = service(orchestrator)
        .create(&create_request(engine, "7.0", types))
        .unwrap();
    provision(orchestrator, &node_ids(orchestrator, cluster.id));
    orchestrator.run(&task).unwrap();
    orchestrator.guest().clear();
    cluster.id
}

pub fn statuses(orchestrator: &Orchestrator, cluster: ClusterId) -> Vec<NodeStatus> {
    orchestrator
        .store()
        .list_nodes(cluster)
        .unwrap()
        .iter()
        .map(|n| n.status)
        .collect()
}
