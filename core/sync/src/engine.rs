//! Sync configuration and the client-facing facade that ties the queue, the
//! optimistic view and the worker together.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use outbox_common::{Operation, OperationId, ResourceKey, Result};
use outbox_storage::DurableStore;

use crate::conflict::{ConflictResolver, ConflictStrategy, StrategyResolver};
use crate::optimistic::{OptimisticState, Projector, View};
use crate::queue::{Mutation, OperationHandle, OperationQueue};
use crate::reachability::ReachabilityMonitor;
use crate::remote::RemoteEndpoint;
use crate::retry::RetryConfig;
use crate::worker::{SyncWorker, SyncWorkerHandle};

/// Configuration for the sync worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff and attempt budget for retryable failures.
    pub retry: RetryConfig,
    /// Maximum number of lanes sending at the same time.
    pub max_concurrent_sends: usize,
    /// A send with no response after this long is a retryable timeout.
    pub send_timeout: Duration,
    /// Maximum payload rewrites per operation before it fails.
    pub max_conflict_retries: u32,
    /// How long a lane holds work while offline before probing anyway.
    pub offline_probe_interval: Duration,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_concurrent_sends: 4,
            send_timeout: Duration::from_secs(30),
            max_conflict_retries: 3,
            offline_probe_interval: Duration::from_secs(30),
            conflict_strategy: ConflictStrategy::Reject,
        }
    }
}

/// Entry point for applications.
///
/// Enqueue and view reads are synchronous and work whether or not a worker
/// is running; `start_sync` replays the queue in the background.
pub struct OutboxClient {
    queue: Arc<OperationQueue>,
    reachability: ReachabilityMonitor,
    config: SyncConfig,
}

impl OutboxClient {
    /// Open a client over `store`, restoring any queued work and committed
    /// snapshots.
    ///
    /// # Errors
    /// - `Storage` if the store cannot be read
    pub fn open(
        store: Arc<dyn DurableStore>,
        projector: Arc<dyn Projector>,
        config: SyncConfig,
    ) -> Result<Self> {
        let optimistic = Arc::new(OptimisticState::new(projector));
        let queue = Arc::new(OperationQueue::open(store, optimistic)?);
        info!("Outbox opened with {} stored operations", queue.len());

        Ok(Self {
            queue,
            reachability: ReachabilityMonitor::new(),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Connectivity monitor consulted by workers started from this client.
    pub fn reachability(&self) -> &ReachabilityMonitor {
        &self.reachability
    }

    /// Durably enqueue a mutation and apply it to the view.
    ///
    /// # Errors
    /// - `StorageFull` / `Storage` if the mutation could not be persisted
    pub fn enqueue_mutation(
        &self,
        kind: impl Into<String>,
        payload: Value,
        resource_key: ResourceKey,
    ) -> Result<OperationHandle> {
        self.queue.enqueue(kind, payload, resource_key)
    }

    /// Enqueue a typed mutation.
    pub fn enqueue<M: Mutation>(
        &self,
        resource_key: ResourceKey,
        mutation: &M,
    ) -> Result<OperationHandle> {
        self.queue.enqueue_mutation(resource_key, mutation)
    }

    /// Current optimistic view.
    pub fn view(&self) -> Arc<View> {
        self.queue.optimistic().view()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Value> {
        self.queue.optimistic().get(key)
    }

    /// Re-render hook for presentation layers.
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.queue.optimistic().subscribe()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.queue.operations()
    }

    pub fn failed(&self) -> Vec<Operation> {
        self.queue.failed()
    }

    pub fn discard(&self, id: &OperationId) -> Result<()> {
        self.queue.discard(id)
    }

    pub fn resubmit(&self, id: &OperationId) -> Result<OperationHandle> {
        self.queue.resubmit(id)
    }

    pub fn handle(&self, id: &OperationId) -> Option<OperationHandle> {
        self.queue.handle(id)
    }

    /// Replace a resource's baseline with data fetched from the server.
    pub fn reconcile(&self, key: &ResourceKey, snapshot: Value) -> Result<()> {
        self.queue.reconcile(key, snapshot)
    }

    /// Resolver built from the configured strategy and the view's projector.
    pub fn resolver(&self) -> StrategyResolver {
        StrategyResolver::new(self.config.conflict_strategy)
            .with_projector(self.queue.optimistic().projector().clone())
    }

    /// Start replaying the queue against `remote`.
    pub fn start_sync(&self, remote: Arc<dyn RemoteEndpoint>) -> SyncWorkerHandle {
        self.start_sync_with_resolver(remote, Arc::new(self.resolver()))
    }

    /// Start replaying the queue with a custom conflict resolver.
    pub fn start_sync_with_resolver(
        &self,
        remote: Arc<dyn RemoteEndpoint>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> SyncWorkerHandle {
        SyncWorker::new(self.queue.clone(), remote, resolver, self.config.clone())
            .with_reachability(&self.reachability)
            .start()
    }
}
