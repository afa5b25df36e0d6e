//! Orchestration integration tests
//!
//! Drives clusters through the service and orchestrator against an in-memory
//! store and a scripted guest.

#[allow(dead_code)]
mod common;

use common::*;
use serde_json::{json, Value};
use std::time::Duration;
use trove_cluster::store::JsonFileStore;
use trove_cluster::{
    ClusterOrchestrator, ClusterRecordStore, ClusterService, EngineRegistry, Error, InstanceDef,
    NodeStatus, TaskStatus, ValidationError,
};

// =============================================================================
// Create
// =============================================================================

#[test]
fn test_create_initializes_on_node_covering_required_types() {
    let orch = orchestrator(ScriptedGuest::new());
    let request = create_request(
        "couchbase",
        "7.0",
        &[&["data"], &["index", "query"], &["data", "index", "query"]],
    );
    let (cluster, task) = service(&orch).create(&request).unwrap();
    let ids = node_ids(&orch, cluster.id);
    provision(&orch, &ids);

    orch.run(&task).unwrap();

    let guest = orch.guest();
    assert_eq!(
        guest.methods(),
        vec![
            "initialize_cluster",
            "add_nodes",
            "cluster_complete",
            "cluster_complete",
            "cluster_complete"
        ]
    );

    let init = &guest.calls_to("initialize_cluster")[0];
    assert_eq!(init.node, ids[2]);
    let hosts: Vec<&str> = init.request["args"]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["host"].as_str().unwrap())
        .collect();
    assert_eq!(hosts, vec!["10.0.0.12", "10.0.0.10", "10.0.0.11"]);

    let add = &guest.calls_to("add_nodes")[0];
    assert_eq!(add.node, ids[2]);
    assert_eq!(add.request["args"]["nodes"].as_array().unwrap().len(), 2);

    assert!(statuses(&orch, cluster.id).iter().all(|s| *s == NodeStatus::Ready));
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

#[test]
fn test_create_failed_rebalance_marks_nodes_failed() {
    let guest = ScriptedGuest::new().on("add_nodes", Reply::Value(json!([false, "disk full"])));
    let orch = orchestrator(guest);
    let request = create_request("couchbase", "7.0", &[&[], &[], &[]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();
    provision(&orch, &node_ids(&orch, cluster.id));

    match orch.run(&task) {
        Err(Error::RebalanceFailed(detail)) => assert!(detail.contains("disk full")),
        other => panic!("expected a failed rebalance, got {:?}", other),
    }

    assert!(orch.guest().calls_to("cluster_complete").is_empty());
    assert!(statuses(&orch, cluster.id).iter().all(|s| *s == NodeStatus::Failed));
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

#[test]
fn test_create_gives_up_when_nodes_never_become_ready() {
    let orch = orchestrator(ScriptedGuest::new());
    let request = create_request("cassandra", "4.1", &[&[], &[]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();

    orch.run(&task).unwrap();

    assert!(orch.guest().calls().is_empty());
    assert_eq!(
        statuses(&orch, cluster.id),
        vec![NodeStatus::Failed, NodeStatus::Failed]
    );
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

#[test]
fn test_create_stops_when_a_node_fails_to_build() {
    let orch = orchestrator(ScriptedGuest::new());
    let request = create_request("couchbase", "7.0", &[&[], &[]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();
    let ids = node_ids(&orch, cluster.id);
    provision(&orch, &ids[..1]);
    service(&orch)
        .report_node_status(ids[1], NodeStatus::Failed, None)
        .unwrap();

    let start = std::time::Instant::now();
    orch.run(&task).unwrap();
    assert!(start.elapsed() < fast_timeouts().ready);

    assert!(orch.guest().calls().is_empty());
    assert!(statuses(&orch, cluster.id).iter().all(|s| *s == NodeStatus::Failed));
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

#[test]
fn test_create_without_coordinator_candidate() {
    let orch = orchestrator(ScriptedGuest::new());
    let request = create_request("couchbase", "7.0", &[&["data"], &["index", "query"]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();
    provision(&orch, &node_ids(&orch, cluster.id));

    assert!(matches!(orch.run(&task), Err(Error::NoCoordinatorFound(id)) if id == cluster.id));
    assert!(orch.guest().calls().is_empty());
    assert!(statuses(&orch, cluster.id).iter().all(|s| *s == NodeStatus::Failed));
}

#[test]
fn test_create_guest_timeout_is_returned() {
    let orch = orchestrator(ScriptedGuest::new().on("initialize_cluster", Reply::Timeout));
    let request = create_request("couchbase", "7.0", &[&[], &[]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();
    provision(&orch, &node_ids(&orch, cluster.id));

    assert!(matches!(orch.run(&task), Err(Error::RpcTimeout { .. })));
    assert!(statuses(&orch, cluster.id).iter().all(|s| *s == NodeStatus::Failed));
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

#[test]
fn test_create_operation_timeout_is_swallowed() {
    let timeouts = trove_cluster::Timeouts {
        operation: Duration::ZERO,
        ..fast_timeouts()
    };
    let orch = orchestrator_with(ScriptedGuest::new(), timeouts);
    let request = create_request("couchbase", "7.0", &[&[]]);
    let (cluster, task) = service(&orch).create(&request).unwrap();
    provision(&orch, &node_ids(&orch, cluster.id));

    orch.run(&task).unwrap();

    assert!(orch.guest().calls().is_empty());
    assert_eq!(statuses(&orch, cluster.id), vec![NodeStatus::Failed]);
    let cluster = orch.store().get_cluster(cluster.id).unwrap();
    assert_eq!(cluster.task_status, TaskStatus::None);
}

// =============================================================================
// Grow
// =============================================================================

#[test]
fn test_grow_shares_cluster_secret_with_new_nodes() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);
    let existing = node_ids(&orch, cluster);

    let instances = vec![
        InstanceDef::new("m1.large", Some(10)),
        InstanceDef::new("m1.large", Some(10)),
    ];
    let (added, task) = service(&orch).grow(cluster, &instances).unwrap();
    assert_eq!(added[0].name, "prod-member-3");
    assert_eq!(added[1].name, "prod-member-4");
    let added: Vec<_> = added.iter().map(|n| n.id).collect();
    provision(&orch, &added);

    orch.run(&task).unwrap();

    let guest = orch.guest();
    assert_eq!(
        guest.methods(),
        vec![
            "get_cluster_password",
            "store_cluster_password",
            "store_cluster_password",
            "add_nodes",
            "cluster_complete",
            "cluster_complete"
        ]
    );
    assert_eq!(guest.calls_to("get_cluster_password")[0].node, existing[0]);
    for call in guest.calls_to("store_cluster_password") {
        assert!(added.contains(&call.node));
        assert_eq!(call.request["args"]["password"], "s3cret");
    }
    assert_eq!(guest.calls_to("add_nodes")[0].node, existing[0]);

    assert_eq!(statuses(&orch, cluster), vec![NodeStatus::Ready; 4]);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_grow_without_shared_secret() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "cassandra", &[&[]]);

    let (added, task) = service(&orch)
        .grow(cluster, &[InstanceDef::new("m1.large", Some(10))])
        .unwrap();
    provision(&orch, &[added[0].id]);
    orch.run(&task).unwrap();

    assert_eq!(orch.guest().methods(), vec!["add_nodes", "cluster_complete"]);
}

#[test]
fn test_grow_readiness_timeout_detaches_new_nodes() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);

    let (added, task) = service(&orch)
        .grow(cluster, &[InstanceDef::new("m1.large", Some(10))])
        .unwrap();
    orch.run(&task).unwrap();

    assert!(orch.guest().calls().is_empty());
    assert_eq!(statuses(&orch, cluster), vec![NodeStatus::Ready; 2]);
    let stray = orch.store().get_node(added[0].id).unwrap();
    assert_eq!(stray.status, NodeStatus::Failed);
    assert_eq!(stray.cluster_id, None);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_cluster_stays_operable_after_failed_grow() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);
    let ids = node_ids(&orch, cluster);

    let (_, task) = service(&orch)
        .grow(cluster, &[InstanceDef::new("m1.large", Some(10))])
        .unwrap();
    orch.run(&task).unwrap();

    let task = service(&orch).upgrade(cluster, "7.1").unwrap();
    orch.run(&task).unwrap();
    assert_eq!(orch.store().get_cluster(cluster).unwrap().datastore.version, "7.1");

    let task = service(&orch).shrink(cluster, &[ids[1]]).unwrap();
    orch.run(&task).unwrap();
    assert_eq!(node_ids(&orch, cluster), vec![ids[0]]);
}

#[test]
fn test_grow_with_failed_new_node_detaches_all_new_nodes() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[]]);

    let instances = vec![
        InstanceDef::new("m1.large", Some(10)),
        InstanceDef::new("m1.large", Some(10)),
    ];
    let (added, task) = service(&orch).grow(cluster, &instances).unwrap();
    provision(&orch, &[added[0].id]);
    service(&orch)
        .report_node_status(added[1].id, NodeStatus::Failed, None)
        .unwrap();

    let start = std::time::Instant::now();
    orch.run(&task).unwrap();
    assert!(start.elapsed() < fast_timeouts().ready);

    assert!(orch.guest().calls().is_empty());
    assert_eq!(statuses(&orch, cluster), vec![NodeStatus::Ready]);
    for node in &added {
        let node = orch.store().get_node(node.id).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.cluster_id, None);
    }
}

#[test]
fn test_grow_failed_rebalance_detaches_new_nodes() {
    let guest = ScriptedGuest::new().on("add_nodes", Reply::Value(json!([false, "disk full"])));
    let orch = orchestrator(guest);
    let cluster = built_cluster(&orch, "cassandra", &[&[]]);

    let (added, task) = service(&orch)
        .grow(cluster, &[InstanceDef::new("m1.large", Some(10))])
        .unwrap();
    provision(&orch, &[added[0].id]);

    assert!(matches!(orch.run(&task), Err(Error::RebalanceFailed(_))));
    assert!(orch.guest().calls_to("cluster_complete").is_empty());
    assert_eq!(statuses(&orch, cluster), vec![NodeStatus::Ready]);
    assert_eq!(orch.store().get_node(added[0].id).unwrap().cluster_id, None);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_grow_rejects_mismatched_flavor() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[]]);

    let err = service(&orch)
        .grow(cluster, &[InstanceDef::new("m1.small", Some(10))])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::FlavorsNotEqual)));
    assert_eq!(node_ids(&orch, cluster).len(), 1);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

// =============================================================================
// Shrink
// =============================================================================

#[test]
fn test_shrink_removes_detaches_and_deletes_nodes() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[], &[]]);
    let ids = node_ids(&orch, cluster);

    let task = service(&orch).shrink(cluster, &[ids[2]]).unwrap();
    orch.run(&task).unwrap();

    let remove = orch.guest().calls_to("remove_nodes");
    assert_eq!(remove.len(), 1);
    assert_eq!(remove[0].node, ids[0]);
    assert_eq!(remove[0].request["args"]["nodes"][0]["host"], "10.0.0.12");

    assert_eq!(node_ids(&orch, cluster), vec![ids[0], ids[1]]);
    assert!(matches!(orch.store().get_node(ids[2]), Err(Error::NodeNotFound(_))));
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_shrink_validation_happens_before_any_guest_call() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "vertica", &[&[], &[], &[]]);
    let ids = node_ids(&orch, cluster);

    let err = service(&orch).shrink(cluster, &[ids[0]]).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::TooFewNodes { min: 3, got: 2, .. })
    ));
    assert!(orch.guest().calls().is_empty());
    assert_eq!(node_ids(&orch, cluster).len(), 3);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_shrink_failed_rebalance_keeps_nodes() {
    let guest = ScriptedGuest::new().on("remove_nodes", Reply::Value(json!([false, "rebalance stuck"])));
    let orch = orchestrator(guest);
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[], &[]]);
    let ids = node_ids(&orch, cluster);

    let task = service(&orch).shrink(cluster, &[ids[1]]).unwrap();
    match orch.run(&task) {
        Err(Error::RebalanceFailed(detail)) => assert_eq!(detail, "rebalance stuck"),
        other => panic!("expected a failed rebalance, got {:?}", other),
    }

    assert_eq!(node_ids(&orch, cluster), ids);
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
}

// =============================================================================
// Upgrade
// =============================================================================

#[test]
fn test_upgrade_rolls_through_nodes_and_sets_version() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[], &[]]);
    let ids = node_ids(&orch, cluster);

    let task = service(&orch).upgrade(cluster, "7.1").unwrap();
    orch.run(&task).unwrap();

    let upgrades = orch.guest().calls_to("upgrade");
    let nodes: Vec<_> = upgrades.iter().map(|c| c.node).collect();
    assert_eq!(nodes, ids);
    assert!(upgrades.iter().all(|c| c.request["args"]["version"] == "7.1"));

    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.datastore.version, "7.1");
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(statuses(&orch, cluster), vec![NodeStatus::Ready; 3]);
}

#[test]
fn test_upgrade_stops_at_node_that_does_not_return() {
    let orch = orchestrator(ScriptedGuest::new().on("upgrade", Reply::Value(Value::Null)));
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);

    let task = service(&orch).upgrade(cluster, "7.1").unwrap();
    orch.run(&task).unwrap();

    assert_eq!(orch.guest().calls_to("upgrade").len(), 1);
    assert_eq!(
        statuses(&orch, cluster),
        vec![NodeStatus::Failed, NodeStatus::Ready]
    );
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.datastore.version, "7.0");
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_upgrade_fault_fails_the_node() {
    let orch = orchestrator(ScriptedGuest::new().on("upgrade", Reply::Fault("package missing".to_string())));
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);

    let task = service(&orch).upgrade(cluster, "7.1").unwrap();
    match orch.run(&task) {
        Err(Error::RpcFault { detail, .. }) => assert_eq!(detail, "package missing"),
        other => panic!("expected a guest fault, got {:?}", other),
    }

    assert_eq!(orch.guest().calls_to("upgrade").len(), 1);
    assert_eq!(
        statuses(&orch, cluster),
        vec![NodeStatus::Failed, NodeStatus::Ready]
    );
    let record = orch.store().get_cluster(cluster).unwrap();
    assert_eq!(record.datastore.version, "7.0");
    assert_eq!(record.task_status, TaskStatus::None);
}

#[test]
fn test_upgrade_to_current_version_is_rejected() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[]]);

    assert!(matches!(
        service(&orch).upgrade(cluster, "7.0"),
        Err(Error::AlreadyAtVersion { .. })
    ));
}

// =============================================================================
// Delete and task lock
// =============================================================================

#[test]
fn test_delete_removes_cluster_and_nodes() {
    let orch = orchestrator(ScriptedGuest::new());
    let cluster = built_cluster(&orch, "couchbase", &[&[], &[]]);
    let ids = node_ids(&orch, cluster);

    let task = service(&orch).delete(cluster).unwrap();
    orch.run(&task).unwrap();

    assert!(orch.store().list_clusters().unwrap().is_empty());
    assert!(matches!(orch.store().get_cluster(cluster), Err(Error::ClusterNotFound(_))));
    for id in ids {
        assert!(orch.store().get_node(id).is_err());
    }
    assert!(orch.guest().calls().is_empty());
}

#[test]
fn test_busy_cluster_rejects_operations_until_reset() {
    let orch = orchestrator(ScriptedGuest::new());
    let request = create_request("couchbase", "7.0", &[&[], &[]]);
    let (cluster, _task) = service(&orch).create(&request).unwrap();

    let err = service(&orch)
        .grow(cluster.id, &[InstanceDef::new("m1.large", Some(10))])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ClusterBusy { current: TaskStatus::BuildingInitial, .. }
    ));
    assert!(matches!(service(&orch).delete(cluster.id), Err(Error::ClusterBusy { .. })));

    let failed = service(&orch).reset_status(cluster.id).unwrap();
    assert_eq!(failed.len(), 2);
    assert_eq!(statuses(&orch, cluster.id), vec![NodeStatus::Failed; 2]);

    let task = service(&orch).delete(cluster.id).unwrap();
    orch.run(&task).unwrap();
    assert!(orch.store().list_clusters().unwrap().is_empty());
}

// =============================================================================
// File-backed store
// =============================================================================

#[test]
fn test_create_with_file_store_persists_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.json");
    let registry = EngineRegistry::builtin();

    let store = JsonFileStore::open(&path).unwrap();
    let request = create_request("couchbase", "7.0", &[&[], &[]]);
    let (cluster, task) = ClusterService::new(&store, &registry).create(&request).unwrap();
    for (i, node) in store.list_nodes(cluster.id).unwrap().iter().enumerate() {
        ClusterService::new(&store, &registry)
            .report_node_status(node.id, NodeStatus::Ready, Some(&format!("10.1.0.{}", i + 1)))
            .unwrap();
    }

    let orch = ClusterOrchestrator::new(store, ScriptedGuest::new(), registry, fast_timeouts());
    orch.run(&task).unwrap();
    assert_eq!(orch.guest().calls_to("cluster_complete").len(), 2);

    let reopened = JsonFileStore::open(&path).unwrap();
    let record = reopened.get_cluster(cluster.id).unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
    let nodes = reopened.list_nodes(cluster.id).unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Ready));
    assert_eq!(nodes[0].ip.as_deref(), Some("10.1.0.1"));
}
