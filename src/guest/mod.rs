//! Guest agent calls
//!
//! Every node runs a guest agent that executes engine-specific administrative
//! commands. The orchestrator reaches it through [`GuestRpcClient`], one
//! synchronous, timeout-bounded call at a time, and uses the typed
//! [`GuestApi`] on top of it.

mod command;

pub use command::CommandGuestClient;

use crate::error::{Error, Result};
use crate::types::{NodeDescription, NodeInfo};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Methods a guest agent understands, with their arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum GuestMethod {
    InitializeCluster { nodes: Vec<NodeDescription> },
    AddNodes { nodes: Vec<NodeDescription> },
    RemoveNodes { nodes: Vec<NodeDescription> },
    ClusterComplete,
    GetClusterPassword,
    StoreClusterPassword { password: String },
    Upgrade { version: String },
}

impl GuestMethod {
    pub fn name(&self) -> &'static str {
        match self {
            GuestMethod::InitializeCluster { .. } => "initialize_cluster",
            GuestMethod::AddNodes { .. } => "add_nodes",
            GuestMethod::RemoveNodes { .. } => "remove_nodes",
            GuestMethod::ClusterComplete => "cluster_complete",
            GuestMethod::GetClusterPassword => "get_cluster_password",
            GuestMethod::StoreClusterPassword { .. } => "store_cluster_password",
            GuestMethod::Upgrade { .. } => "upgrade",
        }
    }
}

/// Versioned request envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestRequest {
    pub version: String,
    #[serde(flatten)]
    pub method: GuestMethod,
}

/// Transport for guest calls
pub trait GuestRpcClient {
    /// Call `request` on the guest of `node` and wait up to `timeout` for its reply.
    ///
    /// Fails with [`Error::RpcTimeout`] when no reply arrives in time and with
    /// [`Error::RpcFault`] when the guest reports an error.
    fn call(&self, node: &NodeInfo, request: &GuestRequest, timeout: Duration) -> Result<Value>;
}

/// Typed guest surface used by the orchestrator
pub struct GuestApi<'a, G: GuestRpcClient + ?Sized> {
    client: &'a G,
    version: &'a str,
}

impl<'a, G: GuestRpcClient + ?Sized> GuestApi<'a, G> {
    pub fn new(client: &'a G, version: &'a str) -> Self {
        Self { client, version }
    }

    fn call(&self, node: &NodeInfo, method: GuestMethod, timeout: Duration) -> Result<Value> {
        debug!(node = %node.id(), method = method.name(), ?timeout, "guest call");
        let request = GuestRequest {
            version: self.version.to_string(),
            method,
        };
        self.client.call(node, &request, timeout)
    }

    /// Set up the cluster on the coordinator; `nodes` lists the coordinator first
    pub fn initialize_cluster(
        &self,
        node: &NodeInfo,
        nodes: Vec<NodeDescription>,
        timeout: Duration,
    ) -> Result<()> {
        self.call(node, GuestMethod::InitializeCluster { nodes }, timeout)
            .map(|_| ())
    }

    /// Add nodes and rebalance; returns the guest's (success, detail)
    pub fn add_nodes(
        &self,
        node: &NodeInfo,
        nodes: Vec<NodeDescription>,
        timeout: Duration,
    ) -> Result<(bool, String)> {
        let method = GuestMethod::AddNodes { nodes };
        let name = method.name();
        parse_outcome(name, self.call(node, method, timeout)?)
    }

    /// Remove nodes and rebalance; returns the guest's (success, detail)
    pub fn remove_nodes(
        &self,
        node: &NodeInfo,
        nodes: Vec<NodeDescription>,
        timeout: Duration,
    ) -> Result<(bool, String)> {
        let method = GuestMethod::RemoveNodes { nodes };
        let name = method.name();
        parse_outcome(name, self.call(node, method, timeout)?)
    }

    pub fn cluster_complete(&self, node: &NodeInfo, timeout: Duration) -> Result<()> {
        self.call(node, GuestMethod::ClusterComplete, timeout)
            .map(|_| ())
    }

    pub fn get_cluster_password(&self, node: &NodeInfo, timeout: Duration) -> Result<String> {
        match self.call(node, GuestMethod::GetClusterPassword, timeout)? {
            Value::String(password) => Ok(password),
            other => Err(Error::RpcFault {
                node: node.id(),
                method: "get_cluster_password".to_string(),
                detail: format!("expected a string, got {}", other),
            }),
        }
    }

    pub fn store_cluster_password(
        &self,
        node: &NodeInfo,
        password: String,
        timeout: Duration,
    ) -> Result<()> {
        self.call(node, GuestMethod::StoreClusterPassword { password }, timeout)
            .map(|_| ())
    }

    pub fn upgrade(&self, node: &NodeInfo, version: &str, timeout: Duration) -> Result<()> {
        let method = GuestMethod::Upgrade {
            version: version.to_string(),
        };
        self.call(node, method, timeout).map(|_| ())
    }
}

/// Decode a `[success, detail]` reply. Anything else is a failed rebalance.
fn parse_outcome(method: &str, reply: Value) -> Result<(bool, String)> {
    if let Value::Array(items) = &reply {
        if let [Value::Bool(success), Value::String(detail)] = items.as_slice() {
            return Ok((*success, detail.clone()));
        }
    }
    Err(Error::RebalanceFailed(format!(
        "malformed reply to {}: {}",
        method, reply
    )))
}
