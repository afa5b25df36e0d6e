//! Readiness polling for cluster nodes.

use crate::error::Result;
use crate::store::ClusterRecordStore;
use crate::types::{NodeId, NodeStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Blocking poller that waits for a set of nodes to become ready.
#[derive(Debug, Clone)]
pub struct NodeReadinessPoller {
    interval: Duration,
    ready: Vec<NodeStatus>,
}

impl NodeReadinessPoller {
    /// Poller counting BUILD_PENDING and READY as ready
    pub fn new(interval: Duration) -> Self {
        Self::with_ready_states(interval, vec![NodeStatus::BuildPending, NodeStatus::Ready])
    }

    pub fn with_ready_states(interval: Duration, ready: Vec<NodeStatus>) -> Self {
        Self { interval, ready }
    }

    fn is_ready(&self, status: NodeStatus) -> bool {
        self.ready.contains(&status)
    }

    /// Poll until every node is ready (`Ok(true)`), or until `timeout`
    /// elapses or a node reports FAILED (`Ok(false)`). Store errors are
    /// returned as-is.
    pub fn wait_ready<S>(&self, store: &S, nodes: &[NodeId], timeout: Duration) -> Result<bool>
    where
        S: ClusterRecordStore + ?Sized,
    {
        let start = Instant::now();
        let mut pending: Vec<NodeId> = nodes.to_vec();

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for id in pending {
                let status = store.node_status(id)?;
                if status == NodeStatus::Failed {
                    warn!(node = %id, "node failed while waiting for readiness");
                    return Ok(false);
                }
                if !self.is_ready(status) {
                    still_pending.push(id);
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                debug!(nodes = nodes.len(), elapsed = ?start.elapsed(), "all nodes ready");
                return Ok(true);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(
                    pending = pending.len(),
                    ?timeout,
                    "timed out waiting for nodes to become ready"
                );
                return Ok(false);
            }

            thread::sleep(self.interval.min(timeout - elapsed));
        }
    }
}
