//! Seams between the queue and the rest of the engine.

use async_trait::async_trait;
use std::sync::Arc;

use super::task::DownloadTask;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::policy::PolicyStore;

/// Verdict of the [`DispatchGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Admit,
    /// Park the queue until conditions change.
    Blocked(String),
}

/// Consulted before the head of the queue is dispatched.
pub trait DispatchGate: Send + Sync {
    fn admit(&self, task: &DownloadTask) -> GateDecision;
}

/// Makes room in the store before a download is persisted.
#[async_trait]
pub trait CapacityGuard: Send + Sync {
    /// Free space for `incoming_bytes` that will be written for `uid`.
    /// Returns the bytes reclaimed, or `QuotaExceeded` when the budget cannot
    /// be met.
    async fn make_room(&self, incoming_bytes: u64, uid: &str) -> Result<u64>;
}

/// Gate driven by the network policy and the current connection class.
pub struct NetworkGate {
    policy: Arc<PolicyStore>,
    connectivity: Connectivity,
}

impl NetworkGate {
    pub fn new(policy: Arc<PolicyStore>, connectivity: Connectivity) -> Self {
        Self {
            policy,
            connectivity,
        }
    }
}

impl DispatchGate for NetworkGate {
    fn admit(&self, _task: &DownloadTask) -> GateDecision {
        let class = self.connectivity.current();
        if self.policy.download_allowed(class) {
            GateDecision::Admit
        } else {
            GateDecision::Blocked(format!("{} network not allowed", class.as_str()))
        }
    }
}

/// Gate that never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl DispatchGate for OpenGate {
    fn admit(&self, _task: &DownloadTask) -> GateDecision {
        GateDecision::Admit
    }
}
