//! trove-cluster: cluster orchestration for a Database-as-a-Service control plane
//!
//! This library drives multi-node database clusters through their lifecycle
//! (create, grow, shrink, upgrade, delete). Nodes run guest agents that are
//! reached through a [`GuestRpcClient`]; cluster and node records live in a
//! [`ClusterRecordStore`]. The [`ClusterService`] validates requests and takes
//! the per-cluster task lock, the [`ClusterOrchestrator`] carries the task out.

pub mod config;
pub mod error;
pub mod guest;
pub mod orchestrator;
pub mod poller;
pub mod service;
pub mod store;
pub mod topology;
pub mod types;

pub use config::{EngineRegistry, OrchestratorConfig, Timeouts, TopologyRules};
pub use error::{Error, Result, ValidationError};
pub use guest::{GuestApi, GuestRpcClient};
pub use orchestrator::{ClusterOrchestrator, ClusterTask};
pub use poller::NodeReadinessPoller;
pub use service::ClusterService;
pub use store::ClusterRecordStore;
pub use types::{
    ClusterId, ClusterRecord, Datastore, InstanceDef, NodeDescription, NodeId, NodeInfo,
    NodeRecord, NodeStatus, ServiceTypes, TaskStatus,
};
