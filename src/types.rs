//! Core types for cluster orchestration

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a cluster record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    /// Generate a fresh cluster id
    pub fn new() -> Self {
        ClusterId(Uuid::new_v4())
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClusterId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(ClusterId)
            .map_err(|e| format!("Invalid cluster id '{}': {}", s, e))
    }
}

/// Identifier of a node (a database instance that belongs, or belonged, to a cluster)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh node id
    pub fn new() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(NodeId)
            .map_err(|e| format!("Invalid node id '{}': {}", s, e))
    }
}

/// Per-cluster task marker. Anything other than `None` means an
/// orchestration operation owns the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    None,
    BuildingInitial,
    GrowingCluster,
    ShrinkingCluster,
    UpgradingCluster,
    Deleting,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::None => "NONE",
            TaskStatus::BuildingInitial => "BUILDING_INITIAL",
            TaskStatus::GrowingCluster => "GROWING_CLUSTER",
            TaskStatus::ShrinkingCluster => "SHRINKING_CLUSTER",
            TaskStatus::UpgradingCluster => "UPGRADING_CLUSTER",
            TaskStatus::Deleting => "DELETING",
        }
    }

    /// Whether no operation holds the cluster
    pub fn is_quiescent(&self) -> bool {
        matches!(self, TaskStatus::None)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live status of a node as last reported by its guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    New,
    Building,
    /// Guest is prepared and waiting to be clustered
    BuildPending,
    Ready,
    Upgrading,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::New => "NEW",
            NodeStatus::Building => "BUILDING",
            NodeStatus::BuildPending => "BUILD_PENDING",
            NodeStatus::Ready => "READY",
            NodeStatus::Upgrading => "UPGRADING",
            NodeStatus::Failed => "FAILED",
        }
    }

    /// Statuses an interrupted operation can leave behind
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            NodeStatus::New | NodeStatus::Building | NodeStatus::BuildPending | NodeStatus::Upgrading
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "new" => Ok(NodeStatus::New),
            "building" | "build" => Ok(NodeStatus::Building),
            "build_pending" => Ok(NodeStatus::BuildPending),
            "ready" | "active" | "running" => Ok(NodeStatus::Ready),
            "upgrading" => Ok(NodeStatus::Upgrading),
            "failed" => Ok(NodeStatus::Failed),
            _ => Err(format!(
                "Invalid node status '{}'. Must be new, building, build_pending, ready, upgrading, or failed",
                s
            )),
        }
    }
}

/// Ordered set of service types a node provides (e.g. `data,index`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceTypes(BTreeSet<String>);

impl ServiceTypes {
    pub fn new<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        ServiceTypes(types.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.0.contains(service)
    }

    pub fn is_superset(&self, other: &ServiceTypes) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Types in `self` that are missing from `other`
    pub fn difference<'a>(&'a self, other: &'a ServiceTypes) -> impl Iterator<Item = &'a str> {
        self.0.difference(&other.0).map(String::as_str)
    }

    pub fn extend(&mut self, other: &ServiceTypes) {
        self.0.extend(other.0.iter().cloned());
    }
}

impl fmt::Display for ServiceTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(","))
    }
}

impl FromStr for ServiceTypes {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ServiceTypes::new(
            s.split(',').map(str::trim).filter(|t| !t.is_empty()),
        ))
    }
}

/// Datastore engine and version a cluster runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub engine: String,
    pub version: String,
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.engine, self.version)
    }
}

/// Persisted cluster row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub name: String,
    pub tenant: String,
    pub datastore: Datastore,
    pub task_status: TaskStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ClusterRecord {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>, datastore: Datastore) -> Self {
        let now = Utc::now();
        Self {
            id: ClusterId::new(),
            name: name.into(),
            tenant: tenant.into(),
            datastore,
            task_status: TaskStatus::None,
            created: now,
            updated: now,
        }
    }
}

/// Where a node's compute instance is placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Persisted node row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    /// `None` once the node has been detached from its cluster
    pub cluster_id: Option<ClusterId>,
    pub services: ServiceTypes,
    pub flavor: String,
    pub volume_size: Option<u32>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub ip: Option<String>,
    pub status: NodeStatus,
}

/// One instance in a create or grow request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDef {
    pub flavor: String,
    #[serde(default)]
    pub volume_size: Option<u32>,
    /// Declared service types; empty means the engine's defaults
    #[serde(default, rename = "type")]
    pub types: Vec<String>,
    #[serde(default)]
    pub placement: Placement,
}

impl InstanceDef {
    pub fn new(flavor: impl Into<String>, volume_size: Option<u32>) -> Self {
        Self {
            flavor: flavor.into(),
            volume_size,
            ..Default::default()
        }
    }

    pub fn with_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&NodeRecord> for InstanceDef {
    fn from(node: &NodeRecord) -> Self {
        Self {
            flavor: node.flavor.clone(),
            volume_size: node.volume_size,
            types: node.services.iter().map(str::to_string).collect(),
            placement: node.placement.clone(),
        }
    }
}

/// A node as described to a guest agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub host: String,
    pub services: ServiceTypes,
}

/// Transient view of a node built for one orchestration operation
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub record: NodeRecord,
    pub ip: String,
}

impl NodeInfo {
    /// Build from a record; the node must have reported an address
    pub fn from_record(record: NodeRecord) -> Result<Self> {
        let ip = record.ip.clone().ok_or(Error::NoAddress(record.id))?;
        Ok(Self { record, ip })
    }

    pub fn id(&self) -> NodeId {
        self.record.id
    }

    pub fn services(&self) -> &ServiceTypes {
        &self.record.services
    }

    pub fn description(&self) -> NodeDescription {
        NodeDescription {
            host: self.ip.clone(),
            services: self.record.services.clone(),
        }
    }
}
