//! Scripted guest agent

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use trove_cluster::guest::GuestRequest;
use trove_cluster::store::InMemoryStore;
use trove_cluster::{ClusterRecordStore, Error, GuestRpcClient, NodeId, NodeInfo, NodeStatus, Result};

/// What the guest does when a method is called
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Fault(String),
    Timeout,
}

/// A recorded guest call
#[derive(Debug, Clone)]
pub struct Call {
    pub node: NodeId,
    pub method: &'static str,
    pub request: Value,
}

/// Guest double that answers from a script and records every call.
///
/// Unscripted methods answer like a healthy guest: rebalances succeed,
/// the cluster password is "s3cret" and everything else returns null. An
/// unscripted upgrade reports the node READY again through the attached store.
#[derive(Default)]
pub struct ScriptedGuest {
    calls: Mutex<Vec<Call>>,
    script: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    reporter: Option<InMemoryStore>,
}

impl ScriptedGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next call of `method`
    pub fn on(self, method: &'static str, reply: Reply) -> Self {
        self.script.lock().entry(method).or_default().push_back(reply);
        self
    }

    /// Report node status changes to `store`, as a real guest would
    pub fn reporting_to(mut self, store: InMemoryStore) -> Self {
        self.reporter = Some(store);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.method).collect()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn default_reply(method: &str) -> Value {
        match method {
            "add_nodes" | "remove_nodes" => json!([true, "rebalanced"]),
            "get_cluster_password" => json!("s3cret"),
            _ => Value::Null,
        }
    }
}

impl GuestRpcClient for ScriptedGuest {
    fn call(&self, node: &NodeInfo, request: &GuestRequest, _timeout: Duration) -> Result<Value> {
        let method = request.method.name();
        self.calls.lock().push(Call {
            node: node.id(),
            method,
            request: serde_json::to_value(request)?,
        });

        let scripted = self
            .script
            .lock()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        match scripted {
            None => {
                if let (Some(store), "upgrade") = (&self.reporter, method) {
                    store.set_node_status(node.id(), NodeStatus::Ready)?;
                }
                Ok(Self::default_reply(method))
            }
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Fault(detail)) => Err(Error::RpcFault {
                node: node.id(),
                method: method.to_string(),
                detail,
            }),
            Some(Reply::Timeout) => Err(Error::RpcTimeout {
                node: node.id(),
                method: method.to_string(),
            }),
        }
    }
}
