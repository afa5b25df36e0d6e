//! Error types for trove-cluster

use crate::orchestrator::OperationId;
use crate::types::{ClusterId, NodeId, TaskStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rejections raised while checking a request against an engine's topology rules.
/// Nothing has been mutated when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown service type '{service}' for {engine}; valid types are: {valid}")]
    UnknownType {
        engine: String,
        service: String,
        valid: String,
    },

    #[error("Cluster is missing required service type(s): {missing}")]
    MissingRequiredType { missing: String },

    #[error("All instances of a cluster must have the same flavor")]
    FlavorsNotEqual,

    #[error("All instances of a cluster must have the same volume size")]
    VolumeSizesNotEqual,

    #[error("A positive volume size is required for {engine}")]
    VolumeSizeRequired { engine: String },

    #[error("Volumes are not supported for {engine}")]
    VolumeNotSupported { engine: String },

    #[error("{engine} clusters need at least {min} node(s), got {got}")]
    TooFewNodes { engine: String, min: usize, got: usize },

    #[error("Node {0} is not a member of this cluster")]
    NotAMember(NodeId),

    #[error("No instances were given")]
    NoInstances,
}

/// Errors that can occur during cluster operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cluster '{0}' not found")]
    ClusterNotFound(ClusterId),

    #[error("Node '{0}' not found")]
    NodeNotFound(NodeId),

    #[error("Cluster '{cluster}' is busy with {current}")]
    ClusterBusy { cluster: ClusterId, current: TaskStatus },

    #[error("Cluster '{0}' still has nodes")]
    ClusterNotEmpty(ClusterId),

    #[error("Unknown datastore engine '{0}'")]
    UnknownEngine(String),

    #[error("Cluster '{cluster}' already runs version {version}")]
    AlreadyAtVersion { cluster: ClusterId, version: String },

    #[error("Node '{0}' has not reported an address")]
    NoAddress(NodeId),

    #[error("No node of cluster '{0}' can act as coordinator")]
    NoCoordinatorFound(ClusterId),

    #[error("Rebalance failed: {0}")]
    RebalanceFailed(String),

    #[error("Guest call {method} to node '{node}' timed out")]
    RpcTimeout { node: NodeId, method: String },

    #[error("Guest call {method} to node '{node}' failed: {detail}")]
    RpcFault {
        node: NodeId,
        method: String,
        detail: String,
    },

    #[error("Operation {operation} timed out after {elapsed:?}")]
    OperationTimeout {
        operation: OperationId,
        elapsed: Duration,
    },

    #[error("Invalid configuration for {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this is the expiry of the given operation's own deadline.
    pub fn is_timeout_of(&self, operation: OperationId) -> bool {
        matches!(self, Error::OperationTimeout { operation: op, .. } if *op == operation)
    }
}
