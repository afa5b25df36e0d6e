//! Cluster orchestration state machine
//!
//! Every operation moves a cluster from its task status back to NONE:
//!
//! - create: wait for all nodes, initialize on a coordinator, add the rest,
//!   complete every node
//! - grow: wait for the new nodes, add them through an existing coordinator
//! - shrink: remove nodes through a remaining coordinator, then detach and
//!   delete them
//! - upgrade: upgrade nodes one at a time, waiting for each to return
//! - delete: delete every node, then the cluster record
//!
//! Guest calls are issued one after the other. The caller (see
//! [`crate::service::ClusterService`]) has already taken the task lock; the
//! orchestrator always releases it when an operation ends.

mod context;

pub use context::{OperationContext, OperationId};

use crate::config::{EngineRegistry, Timeouts, TopologyRules};
use crate::error::{Error, Result};
use crate::guest::{GuestApi, GuestRpcClient};
use crate::poller::NodeReadinessPoller;
use crate::store::ClusterRecordStore;
use crate::types::{
    ClusterId, ClusterRecord, NodeDescription, NodeId, NodeInfo, NodeRecord, NodeStatus,
    ServiceTypes, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A unit of orchestration work, as a task queue would carry it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ClusterTask {
    Create { cluster: ClusterId },
    Grow { cluster: ClusterId, nodes: Vec<NodeId> },
    Shrink { cluster: ClusterId, nodes: Vec<NodeId> },
    Upgrade { cluster: ClusterId, version: String },
    Delete { cluster: ClusterId },
}

impl ClusterTask {
    pub fn cluster(&self) -> ClusterId {
        match self {
            ClusterTask::Create { cluster }
            | ClusterTask::Grow { cluster, .. }
            | ClusterTask::Shrink { cluster, .. }
            | ClusterTask::Upgrade { cluster, .. }
            | ClusterTask::Delete { cluster } => *cluster,
        }
    }

    /// Task status held while this task runs
    pub fn status(&self) -> TaskStatus {
        match self {
            ClusterTask::Create { .. } => TaskStatus::BuildingInitial,
            ClusterTask::Grow { .. } => TaskStatus::GrowingCluster,
            ClusterTask::Shrink { .. } => TaskStatus::ShrinkingCluster,
            ClusterTask::Upgrade { .. } => TaskStatus::UpgradingCluster,
            ClusterTask::Delete { .. } => TaskStatus::Deleting,
        }
    }
}

/// First node whose service types cover every required type
pub fn select_coordinator<'a>(nodes: &'a [NodeInfo], required: &ServiceTypes) -> Option<&'a NodeInfo> {
    nodes.iter().find(|node| node.services().is_superset(required))
}

/// Drives cluster operations against a record store and guest agents
pub struct ClusterOrchestrator<S, G> {
    store: S,
    guest: G,
    registry: EngineRegistry,
    timeouts: Timeouts,
    poller: NodeReadinessPoller,
    rpc_version: String,
}

impl<S: ClusterRecordStore, G: GuestRpcClient> ClusterOrchestrator<S, G> {
    pub fn new(store: S, guest: G, registry: EngineRegistry, timeouts: Timeouts) -> Self {
        Self {
            store,
            guest,
            registry,
            poller: NodeReadinessPoller::new(timeouts.poll_interval),
            timeouts,
            rpc_version: "1.0".to_string(),
        }
    }

    pub fn with_rpc_version(mut self, version: impl Into<String>) -> Self {
        self.rpc_version = version.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn guest(&self) -> &G {
        &self.guest
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Run a queued task
    pub fn run(&self, task: &ClusterTask) -> Result<()> {
        match task {
            ClusterTask::Create { cluster } => self.create(*cluster),
            ClusterTask::Grow { cluster, nodes } => self.grow(*cluster, nodes),
            ClusterTask::Shrink { cluster, nodes } => self.shrink(*cluster, nodes),
            ClusterTask::Upgrade { cluster, version } => self.upgrade(*cluster, version),
            ClusterTask::Delete { cluster } => self.delete(*cluster),
        }
    }

    /// Bring a freshly provisioned cluster to a clustered, serving state.
    ///
    /// Any failure marks every node FAILED. A timeout of this operation is
    /// logged and swallowed; other errors are returned.
    pub fn create(&self, cluster_id: ClusterId) -> Result<()> {
        let ctx = self.begin(cluster_id, TaskStatus::BuildingInitial);
        let outcome = self.create_cluster(&ctx);
        if outcome.is_err() {
            self.update_statuses_on_failure(cluster_id);
        }
        self.finish(&ctx, outcome)
    }

    fn create_cluster(&self, ctx: &OperationContext) -> Result<()> {
        let cluster = self.store.get_cluster(ctx.cluster())?;
        let rules = self.rules(&cluster)?;
        let nodes = self.store.list_nodes(cluster.id)?;
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();

        if !self.wait_ready(ctx, &ids, self.timeouts.ready)? {
            warn!(cluster = %cluster.id, "nodes did not become ready, giving up on cluster");
            self.mark_failed(&ids);
            return Ok(());
        }

        let nodes = node_infos(nodes)?;
        let coordinator = select_coordinator(&nodes, &rules.required_types)
            .ok_or(Error::NoCoordinatorFound(cluster.id))?;
        info!(cluster = %cluster.id, coordinator = %coordinator.id(), "initializing cluster");

        let others: Vec<NodeInfo> = nodes
            .iter()
            .filter(|n| n.id() != coordinator.id())
            .cloned()
            .collect();

        // Coordinator first so the engine takes its services as the defaults.
        let descriptions: Vec<NodeDescription> = std::iter::once(coordinator)
            .chain(others.iter())
            .map(NodeInfo::description)
            .collect();

        let api = self.api();
        self.guest_call(ctx, |t| api.initialize_cluster(coordinator, descriptions, t))?;
        self.rebalance_in(ctx, coordinator, &others)?;
        self.complete(ctx, &nodes)?;

        info!(cluster = %cluster.id, nodes = nodes.len(), "cluster created");
        Ok(())
    }

    /// Add already provisioned nodes to a serving cluster.
    ///
    /// Failures leave the existing nodes alone and are returned. New nodes that
    /// never joined (not ready in time, or a failure before the rebalance) are
    /// marked FAILED and detached, so the cluster keeps its prior topology.
    pub fn grow(&self, cluster_id: ClusterId, new_nodes: &[NodeId]) -> Result<()> {
        let ctx = self.begin(cluster_id, TaskStatus::GrowingCluster);
        let outcome = self.grow_cluster(&ctx, new_nodes);
        self.finish(&ctx, outcome)
    }

    fn grow_cluster(&self, ctx: &OperationContext, new_nodes: &[NodeId]) -> Result<()> {
        let cluster = self.store.get_cluster(ctx.cluster())?;
        let rules = self.rules(&cluster)?;
        let (added, existing) = split_nodes(self.store.list_nodes(cluster.id)?, new_nodes)?;

        let ready = match self.wait_ready(ctx, new_nodes, self.timeouts.ready) {
            Ok(ready) => ready,
            Err(e) => {
                self.abandon(cluster.id, new_nodes);
                return Err(e);
            }
        };
        if !ready {
            warn!(cluster = %cluster.id, "new nodes did not become ready, not growing");
            self.abandon(cluster.id, new_nodes);
            return Ok(());
        }

        let added = match self.join_nodes(ctx, &cluster, rules, existing, added) {
            Ok(added) => added,
            Err(e) => {
                self.abandon(cluster.id, new_nodes);
                return Err(e);
            }
        };
        self.complete(ctx, &added)?;

        info!(cluster = %cluster.id, "cluster grown");
        Ok(())
    }

    /// Hand the cluster secret to the new nodes and rebalance them in
    fn join_nodes(
        &self,
        ctx: &OperationContext,
        cluster: &ClusterRecord,
        rules: &TopologyRules,
        existing: Vec<NodeRecord>,
        added: Vec<NodeRecord>,
    ) -> Result<Vec<NodeInfo>> {
        let existing = node_infos(existing)?;
        let added = node_infos(added)?;
        let coordinator = select_coordinator(&existing, &rules.required_types)
            .or_else(|| existing.first())
            .ok_or(Error::NoCoordinatorFound(cluster.id))?;
        info!(
            cluster = %cluster.id,
            coordinator = %coordinator.id(),
            added = added.len(),
            "growing cluster"
        );

        let api = self.api();
        if rules.share_cluster_secret {
            let password = self.guest_call(ctx, |t| api.get_cluster_password(coordinator, t))?;
            for node in &added {
                let password = password.clone();
                self.guest_call(ctx, |t| api.store_cluster_password(node, password, t))?;
            }
        }

        self.rebalance_in(ctx, coordinator, &added)?;
        Ok(added)
    }

    /// Remove nodes from a cluster, then detach and delete them.
    pub fn shrink(&self, cluster_id: ClusterId, removal: &[NodeId]) -> Result<()> {
        let ctx = self.begin(cluster_id, TaskStatus::ShrinkingCluster);
        let outcome = self.shrink_cluster(&ctx, removal);
        self.finish(&ctx, outcome)
    }

    fn shrink_cluster(&self, ctx: &OperationContext, removal: &[NodeId]) -> Result<()> {
        let cluster = self.store.get_cluster(ctx.cluster())?;
        let rules = self.rules(&cluster)?;
        let (removed, remaining) = split_nodes(self.store.list_nodes(cluster.id)?, removal)?;

        let remaining = node_infos(remaining)?;
        let removed = node_infos(removed)?;
        let coordinator = select_coordinator(&remaining, &rules.required_types)
            .or_else(|| remaining.first())
            .ok_or(Error::NoCoordinatorFound(cluster.id))?;
        info!(
            cluster = %cluster.id,
            coordinator = %coordinator.id(),
            removed = removed.len(),
            "shrinking cluster"
        );

        let api = self.api();
        let descriptions = removed.iter().map(NodeInfo::description).collect();
        let (success, detail) =
            self.guest_call(ctx, |t| api.remove_nodes(coordinator, descriptions, t))?;
        if !success {
            return Err(Error::RebalanceFailed(detail));
        }

        for node in &removed {
            self.store.detach_node(node.id())?;
            self.store.delete_node(node.id())?;
            debug!(cluster = %cluster.id, node = %node.id(), "node removed");
        }

        info!(cluster = %cluster.id, "cluster shrunk");
        Ok(())
    }

    /// Upgrade every node to `version`, one at a time.
    ///
    /// A node that does not come back is marked FAILED and the upgrade stops;
    /// the cluster version only changes once every node is upgraded.
    pub fn upgrade(&self, cluster_id: ClusterId, version: &str) -> Result<()> {
        let ctx = self.begin(cluster_id, TaskStatus::UpgradingCluster);
        let outcome = self.upgrade_cluster(&ctx, version);
        self.finish(&ctx, outcome)
    }

    fn upgrade_cluster(&self, ctx: &OperationContext, version: &str) -> Result<()> {
        let cluster = self.store.get_cluster(ctx.cluster())?;
        let nodes = node_infos(self.store.list_nodes(cluster.id)?)?;
        let api = self.api();

        for node in &nodes {
            info!(cluster = %cluster.id, node = %node.id(), version, "upgrading node");
            self.store.set_node_status(node.id(), NodeStatus::Upgrading)?;
            if let Err(e) = self.guest_call(ctx, |t| api.upgrade(node, version, t)) {
                self.mark_failed(&[node.id()]);
                return Err(e);
            }

            if !self.wait_ready(ctx, &[node.id()], self.timeouts.upgrade)? {
                warn!(cluster = %cluster.id, node = %node.id(), "node did not return from upgrade");
                self.mark_failed(&[node.id()]);
                return Ok(());
            }
        }

        self.store.set_datastore_version(cluster.id, version)?;
        info!(cluster = %cluster.id, version, "cluster upgraded");
        Ok(())
    }

    /// Delete every node, then the cluster record.
    pub fn delete(&self, cluster_id: ClusterId) -> Result<()> {
        let ctx = self.begin(cluster_id, TaskStatus::Deleting);
        match self.delete_cluster(&ctx) {
            Ok(()) => {
                info!(cluster = %cluster_id, elapsed = ?ctx.elapsed(), "cluster deleted");
                Ok(())
            }
            Err(e) => self.finish(&ctx, Err(e)),
        }
    }

    fn delete_cluster(&self, ctx: &OperationContext) -> Result<()> {
        for node in self.store.list_nodes(ctx.cluster())? {
            ctx.check()?;
            self.store.detach_node(node.id)?;
            self.store.delete_node(node.id)?;
            debug!(cluster = %ctx.cluster(), node = %node.id, "node deleted");
        }
        self.store.delete_cluster(ctx.cluster())
    }

    // === Shared steps ===

    fn begin(&self, cluster_id: ClusterId, task: TaskStatus) -> OperationContext {
        let ctx = OperationContext::start(cluster_id, task, self.timeouts.operation);
        info!(cluster = %cluster_id, operation = %ctx.id(), task = %task, "operation started");
        ctx
    }

    /// Release the task lock and settle the outcome: this operation's own
    /// timeout is swallowed, every other error is returned.
    fn finish(&self, ctx: &OperationContext, outcome: Result<()>) -> Result<()> {
        let released = self.store.set_task_status(ctx.cluster(), TaskStatus::None);
        if let Err(e) = &released {
            error!(cluster = %ctx.cluster(), error = %e, "failed to release task lock");
        }

        match outcome {
            Ok(()) => {
                info!(
                    cluster = %ctx.cluster(),
                    operation = %ctx.id(),
                    task = %ctx.task(),
                    elapsed = ?ctx.elapsed(),
                    "operation finished"
                );
                released
            }
            Err(e) if e.is_timeout_of(ctx.id()) => {
                warn!(
                    cluster = %ctx.cluster(),
                    operation = %ctx.id(),
                    task = %ctx.task(),
                    "operation timed out"
                );
                released
            }
            Err(e) => {
                error!(
                    cluster = %ctx.cluster(),
                    operation = %ctx.id(),
                    task = %ctx.task(),
                    error = %e,
                    "operation failed"
                );
                Err(e)
            }
        }
    }

    fn api(&self) -> GuestApi<'_, G> {
        GuestApi::new(&self.guest, &self.rpc_version)
    }

    fn rules(&self, cluster: &ClusterRecord) -> Result<&TopologyRules> {
        self.registry.resolve(&cluster.datastore.engine)
    }

    /// Issue one guest call within the operation's budget
    fn guest_call<T>(&self, ctx: &OperationContext, call: impl FnOnce(Duration) -> Result<T>) -> Result<T> {
        ctx.check()?;
        match call(ctx.cap(self.timeouts.rpc)) {
            Err(Error::RpcTimeout { .. }) if ctx.expired() => Err(ctx.timed_out()),
            other => other,
        }
    }

    fn wait_ready(&self, ctx: &OperationContext, nodes: &[NodeId], timeout: Duration) -> Result<bool> {
        ctx.check()?;
        let ready = self.poller.wait_ready(&self.store, nodes, ctx.cap(timeout))?;
        if !ready && ctx.expired() {
            return Err(ctx.timed_out());
        }
        Ok(ready)
    }

    /// Ask the coordinator to add and rebalance `nodes` into the cluster
    fn rebalance_in(&self, ctx: &OperationContext, coordinator: &NodeInfo, nodes: &[NodeInfo]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let api = self.api();
        let descriptions = nodes.iter().map(NodeInfo::description).collect();
        let (success, detail) = self.guest_call(ctx, |t| api.add_nodes(coordinator, descriptions, t))?;
        if !success {
            return Err(Error::RebalanceFailed(detail));
        }
        debug!(cluster = %ctx.cluster(), added = nodes.len(), detail = %detail, "rebalance done");
        Ok(())
    }

    fn complete(&self, ctx: &OperationContext, nodes: &[NodeInfo]) -> Result<()> {
        let api = self.api();
        for node in nodes {
            self.guest_call(ctx, |t| api.cluster_complete(node, t))?;
            self.store.set_node_status(node.id(), NodeStatus::Ready)?;
        }
        Ok(())
    }

    fn mark_failed(&self, nodes: &[NodeId]) {
        for id in nodes {
            if let Err(e) = self.store.set_node_status(*id, NodeStatus::Failed) {
                warn!(node = %id, error = %e, "failed to mark node FAILED");
            }
        }
    }

    /// Mark nodes that never joined FAILED and take them out of the cluster
    fn abandon(&self, cluster_id: ClusterId, nodes: &[NodeId]) {
        self.mark_failed(nodes);
        for id in nodes {
            if let Err(e) = self.store.detach_node(*id) {
                warn!(cluster = %cluster_id, node = %id, error = %e, "failed to detach node");
            }
        }
        warn!(cluster = %cluster_id, nodes = nodes.len(), "detached nodes that did not join");
    }

    /// Mark every node of the cluster FAILED
    fn update_statuses_on_failure(&self, cluster_id: ClusterId) {
        match self.store.list_nodes(cluster_id) {
            Ok(nodes) => {
                let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
                self.mark_failed(&ids);
            }
            Err(e) => warn!(cluster = %cluster_id, error = %e, "cannot mark nodes FAILED"),
        }
    }
}

fn node_infos(nodes: Vec<NodeRecord>) -> Result<Vec<NodeInfo>> {
    nodes.into_iter().map(NodeInfo::from_record).collect()
}

/// Split the cluster's nodes into those listed in `ids` and the rest, both in store order
fn split_nodes(nodes: Vec<NodeRecord>, ids: &[NodeId]) -> Result<(Vec<NodeRecord>, Vec<NodeRecord>)> {
    let (selected, rest): (Vec<NodeRecord>, Vec<NodeRecord>) =
        nodes.into_iter().partition(|n| ids.contains(&n.id));
    if let Some(missing) = ids.iter().find(|id| !selected.iter().any(|n| n.id == **id)) {
        return Err(Error::NodeNotFound(*missing));
    }
    Ok((selected, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Placement, ServiceTypes};

    fn info(types: &[&str]) -> NodeInfo {
        NodeInfo::from_record(NodeRecord {
            id: NodeId::new(),
            name: "m".to_string(),
            cluster_id: None,
            services: ServiceTypes::new(types.iter().copied()),
            flavor: "f".to_string(),
            volume_size: None,
            placement: Placement::default(),
            ip: Some("10.0.0.1".to_string()),
            status: NodeStatus::Ready,
        })
        .unwrap()
    }

    #[test]
    fn coordinator_is_first_node_covering_required_types() {
        let required = ServiceTypes::new(["data", "index", "query"]);
        let nodes = vec![
            info(&["data"]),
            info(&["index", "query"]),
            info(&["data", "index", "query"]),
            info(&["data", "index", "query", "fts"]),
        ];
        let coordinator = select_coordinator(&nodes, &required).unwrap();
        assert_eq!(coordinator.id(), nodes[2].id());

        assert!(select_coordinator(&nodes[..2], &required).is_none());
    }

    #[test]
    fn split_rejects_unknown_ids() {
        let a = info(&["data"]).record;
        let b = info(&["data"]).record;
        let (selected, rest) = split_nodes(vec![a.clone(), b.clone()], &[b.id]).unwrap();
        assert_eq!(selected[0].id, b.id);
        assert_eq!(rest[0].id, a.id);

        assert!(matches!(
            split_nodes(vec![a], &[NodeId::new()]),
            Err(Error::NodeNotFound(_))
        ));
    }

    #[test]
    fn task_knows_its_status() {
        let cluster = ClusterId::new();
        let task = ClusterTask::Upgrade {
            cluster,
            version: "7.0".to_string(),
        };
        assert_eq!(task.status(), TaskStatus::UpgradingCluster);
        assert_eq!(task.cluster(), cluster);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "upgrade");
    }
}
