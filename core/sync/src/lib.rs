//! Outbox sync engine
//!
//! This module replays locally queued mutations against a remote authority:
//! - Durable operation queue with strict per-key ordering
//! - Optimistic view: committed snapshots with pending operations applied
//! - Background worker with one lane per resource key
//! - Retry with exponential backoff and an attempt budget
//! - Conflict resolution strategies
//! - Reachability tracking

pub mod conflict;
pub mod engine;
pub mod lane;
pub mod optimistic;
pub mod queue;
pub mod reachability;
pub mod remote;
pub mod retry;
pub mod worker;

// Re-export main types
pub use conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, Resolution, StrategyResolver};
pub use engine::{OutboxClient, SyncConfig};
pub use lane::{LaneEvent, LaneState};
pub use optimistic::{MergePatchProjector, OptimisticState, Projector, View};
pub use queue::{decode_payload, Mutation, OperationHandle, OperationQueue, Outcome};
pub use reachability::{Connectivity, ReachabilityMonitor, ReachabilityProbe};
pub use remote::{
    Fault, HttpEndpoint, MemoryEndpoint, RemoteEndpoint, RemoteResponse, SubmitRequest,
    TransportError,
};
pub use retry::RetryConfig;
pub use worker::{SyncWorker, SyncWorkerHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = StrategyResolver::default();
        let _monitor = ReachabilityMonitor::default();
    }
}
