//! In-memory record store

use super::{ClusterRecordStore, Records};
use crate::error::Result;
use crate::types::{ClusterId, ClusterRecord, NodeId, NodeRecord, NodeStatus, TaskStatus};
use parking_lot::Mutex;
use std::sync::Arc;

/// Record store kept in process memory.
///
/// Clones share the same records, so a clone can be handed to another thread
/// that plays the part of guests reporting their status.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<Records>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterRecordStore for InMemoryStore {
    fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        Ok(self.records.lock().list_clusters())
    }

    fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord> {
        self.records.lock().get_cluster(id)
    }

    fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<NodeRecord>> {
        self.records.lock().list_nodes(cluster)
    }

    fn get_node(&self, id: NodeId) -> Result<NodeRecord> {
        self.records.lock().get_node(id)
    }

    fn insert_cluster(&self, cluster: &ClusterRecord) -> Result<()> {
        self.records.lock().insert_cluster(cluster)
    }

    fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        self.records.lock().delete_cluster(id)
    }

    fn begin_task(&self, id: ClusterId, task: TaskStatus) -> Result<ClusterRecord> {
        self.records.lock().begin_task(id, task)
    }

    fn set_task_status(&self, id: ClusterId, task: TaskStatus) -> Result<()> {
        self.records.lock().set_task_status(id, task)
    }

    fn set_datastore_version(&self, id: ClusterId, version: &str) -> Result<()> {
        self.records.lock().set_datastore_version(id, version)
    }

    fn insert_node(&self, node: &NodeRecord) -> Result<()> {
        self.records.lock().insert_node(node)
    }

    fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<()> {
        self.records.lock().set_node_status(id, status)
    }

    fn set_node_address(&self, id: NodeId, ip: &str) -> Result<()> {
        self.records.lock().set_node_address(id, ip)
    }

    fn detach_node(&self, id: NodeId) -> Result<()> {
        self.records.lock().detach_node(id)
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        self.records.lock().delete_node(id)
    }
}
