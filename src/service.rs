//! Caller-facing cluster operations.
//!
//! The service checks request shape and topology, writes the records a
//! request implies and takes the per-cluster task lock. It hands back a
//! [`ClusterTask`] for the orchestrator to run; nothing here talks to guests.

use crate::config::EngineRegistry;
use crate::error::{Error, Result};
use crate::orchestrator::ClusterTask;
use crate::store::ClusterRecordStore;
use crate::topology;
use crate::types::{
    ClusterId, ClusterRecord, Datastore, InstanceDef, NodeId, NodeRecord, NodeStatus,
    ServiceTypes, TaskStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Cluster-create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub tenant: String,
    pub datastore: Datastore,
    pub instances: Vec<InstanceDef>,
}

pub struct ClusterService<'a, S: ?Sized> {
    store: &'a S,
    registry: &'a EngineRegistry,
}

impl<'a, S: ClusterRecordStore + ?Sized> ClusterService<'a, S> {
    pub fn new(store: &'a S, registry: &'a EngineRegistry) -> Self {
        Self { store, registry }
    }

    pub fn list(&self) -> Result<Vec<ClusterRecord>> {
        self.store.list_clusters()
    }

    pub fn show(&self, cluster_id: ClusterId) -> Result<(ClusterRecord, Vec<NodeRecord>)> {
        let cluster = self.store.get_cluster(cluster_id)?;
        let nodes = self.store.list_nodes(cluster_id)?;
        Ok((cluster, nodes))
    }

    /// Check a create request without writing anything
    pub fn validate(&self, request: &CreateRequest) -> Result<Vec<ServiceTypes>> {
        let engine = &request.datastore.engine;
        let rules = self.registry.resolve(engine)?;
        Ok(topology::validate_create(engine, &request.instances, rules)?)
    }

    /// Record a new cluster in BUILDING_INITIAL with one BUILDING node per instance
    pub fn create(&self, request: &CreateRequest) -> Result<(ClusterRecord, ClusterTask)> {
        let types = self.validate(request)?;

        let mut cluster = ClusterRecord::new(&request.name, &request.tenant, request.datastore.clone());
        cluster.task_status = TaskStatus::BuildingInitial;
        self.store.insert_cluster(&cluster)?;

        let mut inserted = Vec::with_capacity(request.instances.len());
        for (index, (instance, services)) in request.instances.iter().zip(types).enumerate() {
            let node = new_node(&cluster, index + 1, instance, services);
            if let Err(e) = self.store.insert_node(&node) {
                self.discard(cluster.id, &inserted);
                return Err(e);
            }
            inserted.push(node.id);
        }

        info!(
            cluster = %cluster.id,
            name = %cluster.name,
            datastore = %cluster.datastore,
            nodes = request.instances.len(),
            "cluster accepted"
        );
        let task = ClusterTask::Create { cluster: cluster.id };
        Ok((cluster, task))
    }

    /// Add instances to a cluster. The new nodes must look like the existing ones.
    pub fn grow(&self, cluster_id: ClusterId, instances: &[InstanceDef]) -> Result<(Vec<NodeRecord>, ClusterTask)> {
        let cluster = self.quiescent_cluster(cluster_id)?;
        let engine = &cluster.datastore.engine;
        let rules = self.registry.resolve(engine)?;
        let existing = self.store.list_nodes(cluster_id)?;
        let types = topology::validate_grow(engine, &existing, instances, rules)?;

        self.store.begin_task(cluster_id, TaskStatus::GrowingCluster)?;

        let first = next_member_index(&cluster, &existing);
        let nodes: Vec<NodeRecord> = instances
            .iter()
            .zip(types)
            .enumerate()
            .map(|(i, (instance, services))| new_node(&cluster, first + i, instance, services))
            .collect();

        for node in &nodes {
            if let Err(e) = self.store.insert_node(node) {
                self.release(cluster_id);
                return Err(e);
            }
        }

        info!(cluster = %cluster_id, added = nodes.len(), "grow accepted");
        let task = ClusterTask::Grow {
            cluster: cluster_id,
            nodes: nodes.iter().map(|n| n.id).collect(),
        };
        Ok((nodes, task))
    }

    /// Remove nodes; the remaining nodes must still form a valid cluster
    pub fn shrink(&self, cluster_id: ClusterId, removal: &[NodeId]) -> Result<ClusterTask> {
        let cluster = self.quiescent_cluster(cluster_id)?;
        let engine = &cluster.datastore.engine;
        let rules = self.registry.resolve(engine)?;
        let existing = self.store.list_nodes(cluster_id)?;
        topology::validate_shrink(engine, &existing, removal, rules)?;

        self.store.begin_task(cluster_id, TaskStatus::ShrinkingCluster)?;

        info!(cluster = %cluster_id, removed = removal.len(), "shrink accepted");
        Ok(ClusterTask::Shrink {
            cluster: cluster_id,
            nodes: removal.to_vec(),
        })
    }

    pub fn upgrade(&self, cluster_id: ClusterId, version: &str) -> Result<ClusterTask> {
        let cluster = self.quiescent_cluster(cluster_id)?;
        if cluster.datastore.version == version {
            return Err(Error::AlreadyAtVersion {
                cluster: cluster_id,
                version: version.to_string(),
            });
        }

        self.store.begin_task(cluster_id, TaskStatus::UpgradingCluster)?;

        info!(cluster = %cluster_id, from = %cluster.datastore.version, to = version, "upgrade accepted");
        Ok(ClusterTask::Upgrade {
            cluster: cluster_id,
            version: version.to_string(),
        })
    }

    pub fn delete(&self, cluster_id: ClusterId) -> Result<ClusterTask> {
        self.store.begin_task(cluster_id, TaskStatus::Deleting)?;
        info!(cluster = %cluster_id, "delete accepted");
        Ok(ClusterTask::Delete { cluster: cluster_id })
    }

    /// Operator reset of a stuck cluster: the task lock is released and nodes
    /// left mid-operation are marked FAILED. Returns the nodes marked.
    pub fn reset_status(&self, cluster_id: ClusterId) -> Result<Vec<NodeId>> {
        self.store.set_task_status(cluster_id, TaskStatus::None)?;

        let mut failed = Vec::new();
        for node in self.store.list_nodes(cluster_id)? {
            if node.status.is_transitional() {
                self.store.set_node_status(node.id, NodeStatus::Failed)?;
                failed.push(node.id);
            }
        }

        warn!(cluster = %cluster_id, failed = failed.len(), "cluster status reset");
        Ok(failed)
    }

    /// Status (and optionally address) reported by a node's guest
    pub fn report_node_status(&self, node_id: NodeId, status: NodeStatus, ip: Option<&str>) -> Result<()> {
        if let Some(ip) = ip {
            self.store.set_node_address(node_id, ip)?;
        }
        self.store.set_node_status(node_id, status)
    }

    fn quiescent_cluster(&self, cluster_id: ClusterId) -> Result<ClusterRecord> {
        let cluster = self.store.get_cluster(cluster_id)?;
        if !cluster.task_status.is_quiescent() {
            return Err(Error::ClusterBusy {
                cluster: cluster_id,
                current: cluster.task_status,
            });
        }
        Ok(cluster)
    }

    /// Remove a partly recorded cluster
    fn discard(&self, cluster_id: ClusterId, nodes: &[NodeId]) {
        for id in nodes {
            if let Err(e) = self.store.delete_node(*id) {
                warn!(cluster = %cluster_id, node = %id, error = %e, "failed to remove node record");
            }
        }
        if let Err(e) = self.store.delete_cluster(cluster_id) {
            warn!(cluster = %cluster_id, error = %e, "failed to remove cluster record");
        }
    }

    fn release(&self, cluster_id: ClusterId) {
        if let Err(e) = self.store.set_task_status(cluster_id, TaskStatus::None) {
            warn!(cluster = %cluster_id, error = %e, "failed to release task lock");
        }
    }
}

fn new_node(cluster: &ClusterRecord, index: usize, instance: &InstanceDef, services: ServiceTypes) -> NodeRecord {
    NodeRecord {
        id: NodeId::new(),
        name: format!("{}-member-{}", cluster.name, index),
        cluster_id: Some(cluster.id),
        services,
        flavor: instance.flavor.clone(),
        volume_size: instance.volume_size,
        placement: instance.placement.clone(),
        ip: None,
        status: NodeStatus::Building,
    }
}

/// Member number following the highest one in use
fn next_member_index(cluster: &ClusterRecord, nodes: &[NodeRecord]) -> usize {
    let prefix = format!("{}-member-", cluster.name);
    nodes
        .iter()
        .filter_map(|n| n.name.strip_prefix(&prefix)?.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
        + 1
}
