//! Background replay of queued operations.
//!
//! A supervisor task spawns one lane task per resource key with work. Lanes
//! run concurrently, bounded by a semaphore; within a lane operations are
//! sent strictly one at a time in `seq` order.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use outbox_common::{Error, ErrorClass, Operation, OperationId, ResourceKey, Result, SyncError};

use crate::conflict::{ConflictInfo, ConflictResolver, Resolution};
use crate::engine::SyncConfig;
use crate::lane::{LaneEvent, LaneState};
use crate::queue::OperationQueue;
use crate::reachability::{Connectivity, ReachabilityMonitor};
use crate::remote::{RemoteEndpoint, RemoteResponse, SubmitRequest, TransportError};

/// What a lane does after handling one send.
enum Next {
    /// Look at the key's next operation right away.
    Continue,
    /// Wait before looking again.
    Backoff(Duration),
}

struct LaneEntry {
    state: LaneState,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

/// State shared by the supervisor and every lane.
struct Shared {
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteEndpoint>,
    resolver: Arc<dyn ConflictResolver>,
    config: SyncConfig,
    reachability: Option<ReachabilityMonitor>,
    permits: Semaphore,
    lanes: Mutex<HashMap<ResourceKey, LaneEntry>>,
}

impl Shared {
    fn lanes(&self) -> MutexGuard<'_, HashMap<ResourceKey, LaneEntry>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, key: &ResourceKey, event: LaneEvent) {
        if let Some(entry) = self.lanes().get_mut(key) {
            match entry.state.on(event) {
                Ok(next) => entry.state = next,
                Err(e) => warn!("Lane {}: {}", key, e),
            }
        }
    }

    fn report(&self, connectivity: Connectivity) {
        if let Some(monitor) = &self.reachability {
            monitor.set(connectivity);
        }
    }

    /// Remove the lane if its key has no more work.
    ///
    /// Runs under the lanes lock, which the supervisor also holds while
    /// deciding whether to spawn; an enqueue racing with retirement either
    /// shows up in `peek_next` here or finds no lane and gets a new one.
    fn retire(&self, key: &ResourceKey) -> bool {
        let mut lanes = self.lanes();
        if self.queue.peek_next(key).is_some() {
            return false;
        }
        lanes.remove(key);
        true
    }
}

/// Replays queued operations against a remote endpoint.
pub struct SyncWorker {
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteEndpoint>,
    resolver: Arc<dyn ConflictResolver>,
    config: SyncConfig,
    reachability: Option<ReachabilityMonitor>,
}

impl SyncWorker {
    /// Create a new worker.
    pub fn new(
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteEndpoint>,
        resolver: Arc<dyn ConflictResolver>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            resolver,
            config,
            reachability: None,
        }
    }

    /// Hold work while `monitor` reports offline and wake every lane when
    /// it comes back online.
    pub fn with_reachability(mut self, monitor: &ReachabilityMonitor) -> Self {
        self.reachability = Some(monitor.clone());
        self
    }

    /// Spawn the supervisor. Must be called within a Tokio runtime.
    pub fn start(self) -> SyncWorkerHandle {
        let shared = Arc::new(Shared {
            permits: Semaphore::new(self.config.max_concurrent_sends.max(1)),
            queue: self.queue,
            remote: self.remote,
            resolver: self.resolver,
            config: self.config,
            reachability: self.reachability,
            lanes: Mutex::new(HashMap::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("Sync worker started against {} endpoint", shared.remote.name());
        let supervisor = tokio::spawn(supervise(shared.clone(), shutdown_rx));

        SyncWorkerHandle {
            shared,
            shutdown_tx,
            supervisor: Some(supervisor),
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut connectivity = shared.reachability.as_ref().map(|m| m.subscribe());

    // Work left over from before this worker existed.
    let mut keys: Vec<ResourceKey> = shared.queue.pending_keys().into_iter().collect();

    loop {
        keys.extend(shared.queue.take_dirty());
        for key in keys.drain(..) {
            spawn_lane(&shared, key, &shutdown);
        }

        tokio::select! {
            _ = shared.queue.wait_for_work() => {}
            changed = wait_connectivity(&mut connectivity) => {
                if changed == Some(Connectivity::Online) {
                    let lanes = shared.lanes();
                    debug!("Back online, waking {} lanes", lanes.len());
                    for entry in lanes.values() {
                        entry.wake.notify_waiters();
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let tasks: Vec<JoinHandle<()>> = shared
        .lanes()
        .values_mut()
        .filter_map(|entry| entry.task.take())
        .collect();
    join_all(tasks).await;

    match shared.queue.release_in_flight() {
        Ok(_) => {}
        Err(e) => error!("Failed to release abandoned sends: {}", e),
    }
    shared.lanes().clear();
    info!("Sync worker stopped");
}

/// Next connectivity transition, or never if no monitor is attached.
async fn wait_connectivity(
    rx: &mut Option<watch::Receiver<Connectivity>>,
) -> Option<Connectivity> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn spawn_lane(shared: &Arc<Shared>, key: ResourceKey, shutdown: &watch::Receiver<bool>) {
    let mut lanes = shared.lanes();
    if lanes.contains_key(&key) {
        return;
    }

    let wake = Arc::new(Notify::new());
    debug!("Starting lane {}", key);
    let task = tokio::spawn(run_lane(
        shared.clone(),
        key.clone(),
        wake.clone(),
        shutdown.clone(),
    ));
    lanes.insert(
        key,
        LaneEntry {
            state: LaneState::Idle,
            wake,
            task: Some(task),
        },
    );
}

async fn run_lane(
    shared: Arc<Shared>,
    key: ResourceKey,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut probe = false;
    let mut rebases: Option<(OperationId, u32)> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(op) = shared.queue.peek_next(&key) else {
            if shared.retire(&key) {
                debug!("Lane {} drained", key);
                return;
            }
            continue;
        };

        if let (Some(monitor), false) = (&shared.reachability, probe) {
            let mut connectivity = monitor.subscribe();
            if *connectivity.borrow_and_update() == Connectivity::Offline {
                debug!("Lane {} holding {} while offline", key, op.id);
                tokio::select! {
                    _ = async {
                        let _ = connectivity.wait_for(|c| *c == Connectivity::Online).await;
                    } => {}
                    _ = sleep(shared.config.offline_probe_interval) => {}
                    _ = shutdown.changed() => break,
                }
                shared.advance(&key, LaneEvent::Wake);
                probe = true;
                continue;
            }
        }
        probe = false;

        let permit = tokio::select! {
            permit = shared.permits.acquire() => permit,
            _ = shutdown.changed() => break,
        };
        let Ok(_permit) = permit else {
            break;
        };

        let next = match shared.queue.mark_in_flight(&op.id) {
            Ok(true) => match shared.queue.get(&op.id) {
                Some(op) => {
                    shared.advance(
                        &key,
                        LaneEvent::Dispatch {
                            op: op.id,
                            attempt: op.attempt,
                        },
                    );
                    let request = SubmitRequest::from_operation(&op);
                    let response = tokio::select! {
                        response = timeout(shared.config.send_timeout, shared.remote.submit(&request)) => {
                            response.unwrap_or(Err(TransportError::Timeout))
                        }
                        // Abandoned; the operation stays in flight until released.
                        _ = shutdown.changed() => break,
                    };
                    let next = handle_response(&shared, &op, response, &mut rebases)
                        .unwrap_or_else(|e| storage_backoff(&shared, &op, e));
                    match &next {
                        Next::Continue => shared.advance(&key, LaneEvent::Settled),
                        Next::Backoff(delay) => {
                            shared.advance(&key, LaneEvent::Retry { delay: *delay })
                        }
                    }
                    next
                }
                None => Next::Continue,
            },
            // The store refused the transition; look again later.
            Ok(false) => Next::Backoff(shared.config.retry.delay_for_attempt(1)),
            Err(e) => storage_backoff(&shared, &op, e),
        };
        drop(_permit);

        if let Next::Backoff(delay) = next {
            debug!("Lane {} backing off {:?}", key, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            shared.advance(&key, LaneEvent::Wake);
        }
    }

    shared.advance(&key, LaneEvent::Stop);
}

fn storage_backoff(shared: &Shared, op: &Operation, err: Error) -> Next {
    error!("Storage failure on {}: {}", op.id, err);
    // Put a send whose outcome could not be recorded back in line.
    if let Err(e) = shared
        .queue
        .mark_retry(&op.id, SyncError::retryable(err.to_string()))
    {
        debug!("Could not requeue {}: {}", op.id, e);
    }
    Next::Backoff(shared.config.retry.delay_for_attempt(op.attempt.max(1)))
}

fn handle_response(
    shared: &Shared,
    op: &Operation,
    response: std::result::Result<RemoteResponse, TransportError>,
    rebases: &mut Option<(OperationId, u32)>,
) -> Result<Next> {
    let queue = &shared.queue;

    if !matches!(response, Err(TransportError::Unreachable(_))) {
        shared.report(Connectivity::Online);
    }

    match response {
        Ok(RemoteResponse::Applied { snapshot }) => {
            queue.mark_committed(&op.id, snapshot)?;
            Ok(Next::Continue)
        }
        Ok(RemoteResponse::Conflict(info)) => resolve_conflict(shared, op, info, rebases),
        Ok(RemoteResponse::Rejected { reason }) => {
            fail(queue, op, SyncError::terminal(reason))?;
            Ok(Next::Continue)
        }
        Err(err) => match err.class() {
            ErrorClass::Conflict => {
                resolve_conflict(shared, op, ConflictInfo::new(err.to_string()), rebases)
            }
            ErrorClass::Retryable => {
                if matches!(err, TransportError::Unreachable(_)) {
                    shared.report(Connectivity::Offline);
                }
                retry(shared, op, err.to_sync_error())
            }
            _ => {
                fail(queue, op, err.to_sync_error())?;
                Ok(Next::Continue)
            }
        },
    }
}

fn retry(shared: &Shared, op: &Operation, error: SyncError) -> Result<Next> {
    let retry = &shared.config.retry;
    if retry.is_exhausted(op.attempt) {
        let error = SyncError::new(
            ErrorClass::RetriesExhausted,
            format!("gave up after {} attempts: {}", op.attempt, error.message),
        );
        fail(&shared.queue, op, error)?;
        return Ok(Next::Continue);
    }

    let delay = retry.delay_for_attempt(op.attempt);
    debug!("Retrying {} in {:?} ({})", op.id, delay, error);
    shared.queue.mark_retry(&op.id, error)?;
    Ok(Next::Backoff(delay))
}

fn resolve_conflict(
    shared: &Shared,
    op: &Operation,
    info: ConflictInfo,
    rebases: &mut Option<(OperationId, u32)>,
) -> Result<Next> {
    let queue = &shared.queue;
    let resolution = shared.resolver.resolve(op, &info);
    debug!("Conflict on {}: {:?}", op.id, resolution);

    match resolution {
        Resolution::RetryWithPayload(payload) => {
            let count = match rebases {
                Some((id, count)) if *id == op.id => *count,
                _ => 0,
            };
            if count >= shared.config.max_conflict_retries {
                let error = SyncError::conflict(format!(
                    "still conflicting after {} rebases: {}",
                    count, info.message
                ));
                fail(queue, op, error)?;
                return Ok(Next::Continue);
            }
            *rebases = Some((op.id, count + 1));
            queue.rebase(&op.id, payload, SyncError::conflict(info.message))?;
        }
        Resolution::CommitNoOp => {
            // Without a server snapshot the effect is folded into the baseline
            queue.mark_committed(&op.id, info.server_snapshot)?;
        }
        Resolution::Reject(reason) => {
            fail(queue, op, SyncError::conflict(reason))?;
        }
    }
    Ok(Next::Continue)
}

fn fail(queue: &OperationQueue, op: &Operation, error: SyncError) -> Result<()> {
    warn!("Operation {} on {} failed: {}", op.id, op.resource_key, error);
    queue.fail_with_successors(&op.id, error)?;
    Ok(())
}

/// Handle to a running worker.
pub struct SyncWorkerHandle {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncWorkerHandle {
    /// Current state of every live lane.
    pub fn lane_states(&self) -> BTreeMap<ResourceKey, LaneState> {
        self.shared
            .lanes()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.state.clone()))
            .collect()
    }

    /// Wait until no operation is left to send.
    pub async fn wait_idle(&self) {
        let mut active = self.shared.queue.subscribe_active();
        // The sender lives in the queue, which this handle keeps alive.
        let _ = active.wait_for(|count| *count == 0).await;
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop every lane. Sends on the wire are abandoned and their
    /// operations return to `Pending`.
    ///
    /// # Errors
    /// - `Shutdown` if the supervisor task panicked
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .await
                .map_err(|e| Error::Shutdown(format!("Sync supervisor failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for SyncWorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictStrategy, StrategyResolver};
    use crate::optimistic::{MergePatchProjector, OptimisticState};
    use crate::remote::{Fault, MemoryEndpoint};
    use crate::retry::RetryConfig;
    use outbox_common::OperationStatus;
    use outbox_storage::{DurableStore, MemoryStore};
    use serde_json::json;

    fn key(k: &str) -> ResourceKey {
        ResourceKey::new(k).unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig {
            retry: RetryConfig::new(None)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(false),
            send_timeout: Duration::from_millis(200),
            offline_probe_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        }
    }

    fn setup() -> (Arc<OperationQueue>, Arc<MemoryEndpoint>) {
        let (_, queue, remote) = setup_with_store();
        (queue, remote)
    }

    fn setup_with_store() -> (MemoryStore, Arc<OperationQueue>, Arc<MemoryEndpoint>) {
        let store = MemoryStore::new();
        let projector = Arc::new(MergePatchProjector);
        let queue = OperationQueue::open(
            Arc::new(store.clone()),
            Arc::new(OptimisticState::new(projector.clone())),
        )
        .unwrap();
        (store, Arc::new(queue), Arc::new(MemoryEndpoint::new(projector)))
    }

    fn start(
        queue: &Arc<OperationQueue>,
        remote: &Arc<MemoryEndpoint>,
        config: SyncConfig,
    ) -> SyncWorkerHandle {
        let resolver = Arc::new(StrategyResolver::new(config.conflict_strategy));
        start_with_resolver(queue, remote, resolver, config)
    }

    fn start_with_resolver(
        queue: &Arc<OperationQueue>,
        remote: &Arc<MemoryEndpoint>,
        resolver: Arc<dyn ConflictResolver>,
        config: SyncConfig,
    ) -> SyncWorkerHandle {
        SyncWorker::new(queue.clone(), remote.clone(), resolver, config).start()
    }

    async fn settle(handle: &SyncWorkerHandle) {
        timeout(Duration::from_secs(5), handle.wait_idle())
            .await
            .expect("queue did not drain");
    }

    #[tokio::test]
    async fn test_drains_queue() {
        let (queue, remote) = setup();
        let a = queue.enqueue("patch", json!({"reps": 5}), key("s1")).unwrap();
        let b = queue.enqueue("patch", json!({"weight": 40}), key("s1")).unwrap();

        let worker = start(&queue, &remote, config());
        settle(&worker).await;

        assert_eq!(remote.applied(), vec![a.id(), b.id()]);
        assert!(queue.is_empty());
        assert_eq!(
            queue.optimistic().get(&key("s1")),
            Some(json!({"reps": 5, "weight": 40}))
        );
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_while_running() {
        let (queue, remote) = setup();
        let worker = start(&queue, &remote, config());

        let handle = queue.enqueue("patch", json!({"reps": 5}), key("s1")).unwrap();
        timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(remote.resource(&key("s1")), Some(json!({"reps": 5})));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted_quarantines() {
        let (queue, remote) = setup();
        let k = key("s1");
        for _ in 0..2 {
            remote.push_fault(&k, Fault::Unavailable);
        }
        let a = queue.enqueue("patch", json!({"reps": 5}), k.clone()).unwrap();
        let b = queue.enqueue("patch", json!({"reps": 6}), k.clone()).unwrap();

        let mut config = config();
        config.retry = config.retry.with_max_attempts(Some(2));
        let worker = start(&queue, &remote, config);
        settle(&worker).await;

        let a = queue.get(&a.id()).unwrap();
        assert_eq!(a.status, OperationStatus::Failed);
        assert_eq!(a.attempt, 2);
        assert_eq!(a.last_error.unwrap().class, ErrorClass::RetriesExhausted);
        assert_eq!(
            queue.get(&b.id()).unwrap().last_error.unwrap().class,
            ErrorClass::DependencyFailed
        );
        assert_eq!(remote.arrivals().len(), 2);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebase_then_commit() {
        let (queue, remote) = setup();
        let k = key("s1");
        remote.seed(&k, json!({"reps": 3}));

        let handle = queue
            .enqueue("patch", json!({"weight": 40, "base_version": 0}), k.clone())
            .unwrap();
        let mut config = config();
        config.conflict_strategy = ConflictStrategy::Rebase;
        let worker = start(&queue, &remote, config);
        settle(&worker).await;

        assert_eq!(handle.wait().await.unwrap(), crate::queue::Outcome::Committed);
        assert_eq!(remote.resource(&k), Some(json!({"reps": 3, "weight": 40})));
        assert_eq!(remote.arrivals().len(), 2);
        assert_eq!(queue.optimistic().get(&k), Some(json!({"reps": 3, "weight": 40})));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_already_applied_conflict_commits_server_snapshot() {
        let (store, queue, remote) = setup_with_store();
        let k = key("s1");
        remote.push_fault(
            &k,
            Fault::Conflict(
                ConflictInfo::new("stale")
                    .with_server_version(1)
                    .with_server_snapshot(json!({"reps": 5, "sets": 2})),
            ),
        );
        let handle = queue
            .enqueue("patch", json!({"reps": 5, "base_version": 0}), k.clone())
            .unwrap();

        let resolver = StrategyResolver::new(ConflictStrategy::Reject)
            .with_projector(Arc::new(MergePatchProjector));
        let worker = start_with_resolver(&queue, &remote, Arc::new(resolver), config());
        settle(&worker).await;

        assert_eq!(handle.wait().await.unwrap(), crate::queue::Outcome::Committed);
        assert!(remote.applied().is_empty());
        assert!(store.get_all().unwrap().is_empty());
        assert_eq!(
            store.snapshots().unwrap(),
            vec![(k.clone(), json!({"reps": 5, "sets": 2}))]
        );
        assert_eq!(queue.optimistic().get(&k), Some(json!({"reps": 5, "sets": 2})));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_noop_without_snapshot_keeps_effect() {
        let (store, queue, remote) = setup_with_store();
        let k = key("s1");
        queue.reconcile(&k, json!({"sets": 2})).unwrap();
        remote.push_fault(&k, Fault::Conflict(ConflictInfo::new("duplicate")));
        let handle = queue.enqueue("patch", json!({"reps": 5}), k.clone()).unwrap();
        assert_eq!(queue.optimistic().get(&k), Some(json!({"reps": 5, "sets": 2})));

        let resolver = |_: &Operation, _: &ConflictInfo| Resolution::CommitNoOp;
        let worker = start_with_resolver(&queue, &remote, Arc::new(resolver), config());
        settle(&worker).await;

        assert_eq!(handle.wait().await.unwrap(), crate::queue::Outcome::Committed);
        assert_eq!(handle.status(), OperationStatus::Committed);
        assert!(store.get_all().unwrap().is_empty());
        assert_eq!(
            store.snapshots().unwrap(),
            vec![(k.clone(), json!({"reps": 5, "sets": 2}))]
        );
        assert_eq!(queue.optimistic().get(&k), Some(json!({"reps": 5, "sets": 2})));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_retry_budget() {
        let (queue, remote) = setup();
        let k = key("s1");
        for _ in 0..3 {
            remote.push_fault(&k, Fault::Conflict(ConflictInfo::new("busy").with_server_version(9)));
        }
        let handle = queue.enqueue("patch", json!({"reps": 1}), k.clone()).unwrap();

        let mut config = config();
        config.conflict_strategy = ConflictStrategy::Rebase;
        config.max_conflict_retries = 1;
        let worker = start(&queue, &remote, config);
        settle(&worker).await;

        let crate::queue::Outcome::Failed(err) = handle.wait().await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(err.class, ErrorClass::Conflict);
        assert_eq!(remote.arrivals().len(), 2);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_timeout_is_retryable() {
        let (queue, remote) = setup();
        let k = key("slow");
        remote.set_latency(&k, Duration::from_millis(100));
        let handle = queue.enqueue("patch", json!({"reps": 1}), k.clone()).unwrap();

        let mut config = config();
        config.send_timeout = Duration::from_millis(10);
        config.retry = config.retry.with_max_attempts(Some(2));
        let worker = start(&queue, &remote, config);
        settle(&worker).await;

        let op = queue.get(&handle.id()).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.last_error.unwrap().message.contains("timed out"));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_monitor_holds_then_wakes() {
        let (queue, remote) = setup();
        let monitor = ReachabilityMonitor::with_initial(Connectivity::Offline);
        let mut config = config();
        config.offline_probe_interval = Duration::from_secs(60);

        let worker = SyncWorker::new(
            queue.clone(),
            remote.clone(),
            Arc::new(StrategyResolver::default()),
            config,
        )
        .with_reachability(&monitor)
        .start();

        let handle = queue.enqueue("patch", json!({"reps": 5}), key("s1")).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(remote.arrivals().is_empty());
        assert_eq!(handle.status(), OperationStatus::Pending);
        assert_eq!(worker.lane_states().get(&key("s1")), Some(&LaneState::Idle));

        monitor.set(Connectivity::Online);
        settle(&worker).await;
        assert_eq!(remote.applied(), vec![handle.id()]);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_in_flight() {
        let (queue, remote) = setup();
        let k = key("slow");
        remote.set_latency(&k, Duration::from_secs(30));
        let handle = queue.enqueue("patch", json!({}), k.clone()).unwrap();

        let mut config = config();
        config.send_timeout = Duration::from_secs(60);
        let worker = start(&queue, &remote, config);

        let mut rx = handle.subscribe();
        rx.wait_for(|op| op.status == OperationStatus::InFlight)
            .await
            .unwrap();
        worker.shutdown().await.unwrap();

        assert_eq!(handle.status(), OperationStatus::Pending);
        assert_eq!(handle.snapshot().attempt, 1);
    }
}
