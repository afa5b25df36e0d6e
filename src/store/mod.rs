//! Record store trait and implementations for cluster and node rows

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;

use crate::error::{Error, Result};
use crate::types::{ClusterId, ClusterRecord, NodeId, NodeRecord, NodeStatus, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Trait defining how cluster and node records are persisted
///
/// The orchestrator reads and writes records only through this trait, so the
/// backing storage (a JSON document on disk, memory for tests, a database)
/// is interchangeable. Nodes are returned in insertion order.
pub trait ClusterRecordStore {
    // === Query Operations ===

    /// List all clusters
    fn list_clusters(&self) -> Result<Vec<ClusterRecord>>;

    /// Get a cluster by id
    fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord>;

    /// List the nodes currently attached to a cluster
    fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<NodeRecord>>;

    /// Get a node by id, attached or not
    fn get_node(&self, id: NodeId) -> Result<NodeRecord>;

    /// Live status of a node
    fn node_status(&self, id: NodeId) -> Result<NodeStatus> {
        Ok(self.get_node(id)?.status)
    }

    // === Cluster Rows ===

    /// Insert a new cluster row
    fn insert_cluster(&self, cluster: &ClusterRecord) -> Result<()>;

    /// Delete a cluster row (no node may still be attached)
    fn delete_cluster(&self, id: ClusterId) -> Result<()>;

    /// Atomically move the task status from NONE to `task`.
    ///
    /// Fails with [`Error::ClusterBusy`] when another task holds the cluster.
    fn begin_task(&self, id: ClusterId, task: TaskStatus) -> Result<ClusterRecord>;

    /// Unconditionally set the task status
    fn set_task_status(&self, id: ClusterId, task: TaskStatus) -> Result<()>;

    /// Record the datastore version the cluster now runs
    fn set_datastore_version(&self, id: ClusterId, version: &str) -> Result<()>;

    // === Node Rows ===

    /// Insert a new node row
    fn insert_node(&self, node: &NodeRecord) -> Result<()>;

    /// Update a node's live status
    fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<()>;

    /// Record the address a node's guest reported
    fn set_node_address(&self, id: NodeId, ip: &str) -> Result<()>;

    /// Detach a node from its cluster (cluster id becomes `None`)
    fn detach_node(&self, id: NodeId) -> Result<()>;

    /// Delete a node row
    fn delete_node(&self, id: NodeId) -> Result<()>;
}

/// Cluster and node rows as held by the bundled stores
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Records {
    #[serde(default)]
    clusters: Vec<ClusterRecord>,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

impl Records {
    fn cluster(&self, id: ClusterId) -> Result<&ClusterRecord> {
        self.clusters
            .iter()
            .find(|c| c.id == id)
            .ok_or(Error::ClusterNotFound(id))
    }

    fn cluster_mut(&mut self, id: ClusterId) -> Result<&mut ClusterRecord> {
        self.clusters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(Error::ClusterNotFound(id))
    }

    fn node(&self, id: NodeId) -> Result<&NodeRecord> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or(Error::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(Error::NodeNotFound(id))
    }

    pub(crate) fn list_clusters(&self) -> Vec<ClusterRecord> {
        self.clusters.clone()
    }

    pub(crate) fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord> {
        self.cluster(id).cloned()
    }

    pub(crate) fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<NodeRecord>> {
        self.cluster(cluster)?;
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.cluster_id == Some(cluster))
            .cloned()
            .collect())
    }

    pub(crate) fn get_node(&self, id: NodeId) -> Result<NodeRecord> {
        self.node(id).cloned()
    }

    pub(crate) fn insert_cluster(&mut self, cluster: &ClusterRecord) -> Result<()> {
        if self.clusters.iter().any(|c| c.id == cluster.id) {
            return Err(Error::Other(format!("Cluster '{}' already exists", cluster.id)));
        }
        self.clusters.push(cluster.clone());
        Ok(())
    }

    pub(crate) fn delete_cluster(&mut self, id: ClusterId) -> Result<()> {
        self.cluster(id)?;
        if self.nodes.iter().any(|n| n.cluster_id == Some(id)) {
            return Err(Error::ClusterNotEmpty(id));
        }
        self.clusters.retain(|c| c.id != id);
        Ok(())
    }

    pub(crate) fn begin_task(&mut self, id: ClusterId, task: TaskStatus) -> Result<ClusterRecord> {
        let cluster = self.cluster_mut(id)?;
        if !cluster.task_status.is_quiescent() {
            return Err(Error::ClusterBusy {
                cluster: id,
                current: cluster.task_status,
            });
        }
        cluster.task_status = task;
        cluster.updated = Utc::now();
        Ok(cluster.clone())
    }

    pub(crate) fn set_task_status(&mut self, id: ClusterId, task: TaskStatus) -> Result<()> {
        let cluster = self.cluster_mut(id)?;
        cluster.task_status = task;
        cluster.updated = Utc::now();
        Ok(())
    }

    pub(crate) fn set_datastore_version(&mut self, id: ClusterId, version: &str) -> Result<()> {
        let cluster = self.cluster_mut(id)?;
        cluster.datastore.version = version.to_string();
        cluster.updated = Utc::now();
        Ok(())
    }

    pub(crate) fn insert_node(&mut self, node: &NodeRecord) -> Result<()> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(Error::Other(format!("Node '{}' already exists", node.id)));
        }
        if let Some(cluster) = node.cluster_id {
            self.cluster(cluster)?;
        }
        self.nodes.push(node.clone());
        Ok(())
    }

    pub(crate) fn set_node_status(&mut self, id: NodeId, status: NodeStatus) -> Result<()> {
        self.node_mut(id)?.status = status;
        Ok(())
    }

    pub(crate) fn set_node_address(&mut self, id: NodeId, ip: &str) -> Result<()> {
        self.node_mut(id)?.ip = Some(ip.to_string());
        Ok(())
    }

    pub(crate) fn detach_node(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.cluster_id = None;
        Ok(())
    }

    pub(crate) fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        self.nodes.retain(|n| n.id != id);
        Ok(())
    }
}
