//! Configuration for the orchestrator and the per-engine topology rules.

use crate::error::{Error, Result};
use crate::types::ServiceTypes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// JSON document holding cluster and node records
    pub store_path: PathBuf,
    pub timeouts: TimeoutConfig,
    pub guest: GuestConfig,
    /// Engine rules; entries replace the builtin rules of the same name
    pub engines: BTreeMap<String, TopologyRules>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/trove-cluster/records.json"),
            timeouts: TimeoutConfig::default(),
            guest: GuestConfig::default(),
            engines: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            field: path.display().to_string(),
            reason: format!("Failed to read config file: {}", e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| Error::Config {
            field: path.display().to_string(),
            reason: format!("Failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;

        if self.guest.command.as_os_str().is_empty() {
            return Err(Error::Config {
                field: "guest.command".to_string(),
                reason: "Guest command must not be empty".to_string(),
            });
        }

        for (name, rules) in &self.engines {
            rules.validate(name)?;
        }

        Ok(())
    }

    /// Builtin engine rules merged with the configured ones
    pub fn registry(&self) -> EngineRegistry {
        let mut registry = EngineRegistry::builtin();
        for (name, rules) in &self.engines {
            registry.register(name.clone(), rules.clone());
        }
        registry
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from(&self.timeouts)
    }
}

/// Timeout settings as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Sleep between two readiness checks
    pub poll_interval_ms: u64,
    /// How long nodes get to become ready
    pub ready_timeout_secs: u64,
    /// Budget for a whole create/grow/shrink/upgrade/delete operation
    pub operation_timeout_secs: u64,
    /// Upper bound for a single guest call
    pub rpc_timeout_secs: u64,
    /// How long one node gets to come back after an upgrade
    pub upgrade_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            ready_timeout_secs: 900,
            operation_timeout_secs: 36_000,
            rpc_timeout_secs: 600,
            upgrade_timeout_secs: 1_800,
        }
    }
}

impl TimeoutConfig {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("timeouts.poll_interval_ms", self.poll_interval_ms),
            ("timeouts.ready_timeout_secs", self.ready_timeout_secs),
            ("timeouts.operation_timeout_secs", self.operation_timeout_secs),
            ("timeouts.rpc_timeout_secs", self.rpc_timeout_secs),
            ("timeouts.upgrade_timeout_secs", self.upgrade_timeout_secs),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(Error::Config {
                    field: field.to_string(),
                    reason: "Must be non-zero".to_string(),
                });
            }
        }

        if self.poll_interval_ms >= self.ready_timeout_secs.saturating_mul(1000) {
            return Err(Error::Config {
                field: "timeouts.poll_interval_ms".to_string(),
                reason: "Poll interval must be shorter than the ready timeout".to_string(),
            });
        }

        Ok(())
    }
}

/// Resolved timeouts handed to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub poll_interval: Duration,
    pub ready: Duration,
    pub operation: Duration,
    pub rpc: Duration,
    pub upgrade: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            ready: Duration::from_secs(config.ready_timeout_secs),
            operation: Duration::from_secs(config.operation_timeout_secs),
            rpc: Duration::from_secs(config.rpc_timeout_secs),
            upgrade: Duration::from_secs(config.upgrade_timeout_secs),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// How guest calls are delivered by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Program run once per guest call
    pub command: PathBuf,
    /// Extra arguments placed before the per-call arguments
    pub args: Vec<String>,
    /// Version stamped on every request envelope
    pub rpc_version: String,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("trove-guest-call"),
            args: Vec::new(),
            rpc_version: "1.0".to_string(),
        }
    }
}

/// Topology rules for one datastore engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRules {
    pub valid_types: ServiceTypes,
    pub required_types: ServiceTypes,
    /// Types given to an instance that declares none
    pub default_types: ServiceTypes,
    /// Every node must carry every required type
    #[serde(default)]
    pub require_all_services: bool,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,
    #[serde(default = "default_true")]
    pub volume_support: bool,
    /// New nodes receive the coordinator's cluster secret on grow
    #[serde(default)]
    pub share_cluster_secret: bool,
}

fn default_min_nodes() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl TopologyRules {
    fn validate(&self, engine: &str) -> Result<()> {
        let invalid = |field: &str, reason: &str| Error::Config {
            field: format!("engines.{}.{}", engine, field),
            reason: reason.to_string(),
        };

        if self.valid_types.is_empty() {
            return Err(invalid("valid_types", "At least one service type is required"));
        }
        if !self.valid_types.is_superset(&self.required_types) {
            return Err(invalid("required_types", "Must be a subset of valid_types"));
        }
        if self.default_types.is_empty() || !self.valid_types.is_superset(&self.default_types) {
            return Err(invalid("default_types", "Must be a non-empty subset of valid_types"));
        }
        if self.min_nodes == 0 {
            return Err(invalid("min_nodes", "Must be non-zero"));
        }

        Ok(())
    }

    fn couchbase() -> Self {
        Self {
            valid_types: ServiceTypes::new(["data", "index", "query", "fts", "eventing", "analytics"]),
            required_types: ServiceTypes::new(["data", "index", "query"]),
            default_types: ServiceTypes::new(["data", "index", "query"]),
            require_all_services: false,
            min_nodes: 1,
            volume_support: true,
            share_cluster_secret: true,
        }
    }

    fn cassandra() -> Self {
        Self {
            valid_types: ServiceTypes::new(["data"]),
            required_types: ServiceTypes::new(["data"]),
            default_types: ServiceTypes::new(["data"]),
            require_all_services: true,
            min_nodes: 1,
            volume_support: true,
            share_cluster_secret: false,
        }
    }

    fn mongodb() -> Self {
        Self {
            valid_types: ServiceTypes::new(["shard", "config_server", "query_router"]),
            required_types: ServiceTypes::new(["shard", "config_server", "query_router"]),
            default_types: ServiceTypes::new(["shard"]),
            require_all_services: false,
            min_nodes: 3,
            volume_support: true,
            share_cluster_secret: true,
        }
    }

    fn vertica() -> Self {
        Self {
            valid_types: ServiceTypes::new(["member"]),
            required_types: ServiceTypes::new(["member"]),
            default_types: ServiceTypes::new(["member"]),
            require_all_services: true,
            min_nodes: 3,
            volume_support: true,
            share_cluster_secret: true,
        }
    }
}

/// Engine name to topology rules
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, TopologyRules>,
}

impl EngineRegistry {
    /// Registry with the engines supported out of the box
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("couchbase", TopologyRules::couchbase());
        registry.register("cassandra", TopologyRules::cassandra());
        registry.register("mongodb", TopologyRules::mongodb());
        registry.register("vertica", TopologyRules::vertica());
        registry
    }

    pub fn register(&mut self, engine: impl Into<String>, rules: TopologyRules) {
        self.engines.insert(engine.into(), rules);
    }

    pub fn resolve(&self, engine: &str) -> Result<&TopologyRules> {
        self.engines
            .get(engine)
            .ok_or_else(|| Error::UnknownEngine(engine.to_string()))
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }
}
