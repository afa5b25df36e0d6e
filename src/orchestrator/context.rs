//! Operation identity and deadline

use crate::error::Error;
use crate::types::{ClusterId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identity of one orchestration operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Budget of a single create/grow/shrink/upgrade/delete run.
///
/// Expiry is cooperative: it is checked before each guest call and each
/// readiness wait, and every wait is capped to what is left.
#[derive(Debug, Clone)]
pub struct OperationContext {
    id: OperationId,
    cluster: ClusterId,
    task: TaskStatus,
    started: Instant,
    budget: Duration,
}

impl OperationContext {
    pub fn start(cluster: ClusterId, task: TaskStatus, budget: Duration) -> Self {
        Self {
            id: OperationId::new(),
            cluster,
            task,
            started: Instant::now(),
            budget,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    pub fn task(&self) -> TaskStatus {
        self.task
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// `timeout`, shortened to the remaining budget
    pub fn cap(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// The timeout error owned by this operation
    pub fn timed_out(&self) -> Error {
        Error::OperationTimeout {
            operation: self.id,
            elapsed: self.elapsed(),
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.expired() {
            Err(self.timed_out())
        } else {
            Ok(())
        }
    }
}
