//! In-process remote authority for testing and simulation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use outbox_common::{Operation, OperationId, OperationStatus, ResourceKey};

use crate::conflict::{split_base_version, ConflictInfo};
use crate::optimistic::Projector;
use crate::reachability::ReachabilityProbe;
use crate::remote::{RemoteEndpoint, RemoteResponse, SubmitRequest, TransportError};

/// A scripted failure for the next request on a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Respond with HTTP 503.
    Unavailable,
    /// Fail as if the network were down.
    Unreachable,
    /// Fail with a timeout before applying.
    Timeout,
    /// Apply the operation, then lose the response.
    DropResponse,
    /// Report a conflict.
    Conflict(ConflictInfo),
    /// Reject as invalid.
    Reject(String),
}

type Validator = Box<dyn Fn(&SubmitRequest) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Resource {
    version: u64,
    value: Value,
}

#[derive(Default)]
struct Inner {
    offline: bool,
    resources: HashMap<ResourceKey, Resource>,
    responses: HashMap<OperationId, RemoteResponse>,
    faults: HashMap<ResourceKey, VecDeque<Fault>>,
    latency: HashMap<ResourceKey, Duration>,
    arrivals: Vec<SubmitRequest>,
    applied: Vec<OperationId>,
}

/// In-memory remote endpoint.
///
/// Applies operations with a projector, versions every resource, honors the
/// idempotency key and checks an optional `base_version` payload field.
/// Faults and latency can be scripted per resource.
pub struct MemoryEndpoint {
    projector: Arc<dyn Projector>,
    validator: Option<Validator>,
    inner: Mutex<Inner>,
}

impl MemoryEndpoint {
    /// Create a new, online, empty endpoint.
    pub fn new(projector: Arc<dyn Projector>) -> Self {
        Self {
            projector,
            validator: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Reject requests for which `validator` returns a reason.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&SubmitRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !self.lock().offline
    }

    /// Queue a fault for the next request on `key`.
    pub fn push_fault(&self, key: &ResourceKey, fault: Fault) {
        self.lock().faults.entry(key.clone()).or_default().push_back(fault);
    }

    /// Delay every request on `key`.
    pub fn set_latency(&self, key: &ResourceKey, latency: Duration) {
        self.lock().latency.insert(key.clone(), latency);
    }

    /// Overwrite a resource as if another writer changed it.
    pub fn seed(&self, key: &ResourceKey, value: Value) {
        let mut inner = self.lock();
        let resource = inner.resources.entry(key.clone()).or_default();
        resource.version += 1;
        resource.value = value;
    }

    /// Current server state of a resource.
    pub fn resource(&self, key: &ResourceKey) -> Option<Value> {
        self.lock()
            .resources
            .get(key)
            .map(|r| r.value.clone())
            .filter(|v| !v.is_null())
    }

    /// Current server version of a resource.
    pub fn version(&self, key: &ResourceKey) -> u64 {
        self.lock().resources.get(key).map_or(0, |r| r.version)
    }

    /// Every request that reached the server, in arrival order.
    pub fn arrivals(&self) -> Vec<SubmitRequest> {
        self.lock().arrivals.clone()
    }

    /// Ids of operations applied, in application order. Duplicates never
    /// appear.
    pub fn applied(&self) -> Vec<OperationId> {
        self.lock().applied.clone()
    }

    fn apply(&self, request: &SubmitRequest) -> RemoteResponse {
        let mut inner = self.lock();
        if let Some(response) = inner.responses.get(&request.idempotency_key) {
            debug!("Duplicate submission {} answered from cache", request.idempotency_key);
            return response.clone();
        }

        if let Some(reason) = self.validator.as_ref().and_then(|v| v(request)) {
            let response = RemoteResponse::Rejected { reason };
            inner.responses.insert(request.idempotency_key, response.clone());
            return response;
        }

        let resource = inner
            .resources
            .entry(request.resource_key.clone())
            .or_default();

        let (payload, base_version) = split_base_version(&request.payload);
        if let Some(base) = base_version {
            if base != resource.version {
                return RemoteResponse::Conflict(
                    ConflictInfo::new(format!(
                        "expected version {}, server is at {}",
                        base, resource.version
                    ))
                    .with_server_version(resource.version)
                    .with_server_snapshot(resource.value.clone()),
                );
            }
        }

        let op = Operation {
            id: request.idempotency_key,
            resource_key: request.resource_key.clone(),
            kind: request.kind.clone(),
            payload,
            status: OperationStatus::InFlight,
            seq: 0,
            created_at: Utc::now(),
            attempt: 0,
            last_error: None,
        };
        resource.value = self.projector.apply(&request.resource_key, &resource.value, &op);
        resource.version += 1;
        let snapshot = resource.value.clone();

        let response = RemoteResponse::Applied {
            snapshot: Some(snapshot),
        };
        inner.applied.push(request.idempotency_key);
        inner.responses.insert(request.idempotency_key, response.clone());
        response
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryEndpoint {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteResponse, TransportError> {
        let (latency, fault) = {
            let mut inner = self.lock();
            if inner.offline {
                return Err(TransportError::Unreachable("network is offline".to_string()));
            }
            inner.arrivals.push(request.clone());
            let fault = inner
                .faults
                .get_mut(&request.resource_key)
                .and_then(|faults| faults.pop_front());
            (inner.latency.get(&request.resource_key).copied(), fault)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match fault {
            None => Ok(self.apply(request)),
            Some(Fault::Unavailable) => Err(TransportError::Status {
                code: 503,
                body: "service unavailable".to_string(),
            }),
            Some(Fault::Unreachable) => {
                Err(TransportError::Unreachable("connection reset".to_string()))
            }
            Some(Fault::Timeout) => Err(TransportError::Timeout),
            Some(Fault::DropResponse) => {
                self.apply(request);
                Err(TransportError::Timeout)
            }
            Some(Fault::Conflict(info)) => Ok(RemoteResponse::Conflict(info)),
            Some(Fault::Reject(reason)) => Ok(RemoteResponse::Rejected { reason }),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for MemoryEndpoint {
    async fn is_reachable(&self) -> bool {
        self.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::MergePatchProjector;
    use serde_json::json;

    fn endpoint() -> MemoryEndpoint {
        MemoryEndpoint::new(Arc::new(MergePatchProjector))
    }

    fn request(key: &str, payload: Value) -> SubmitRequest {
        SubmitRequest {
            idempotency_key: OperationId::generate(),
            resource_key: ResourceKey::new(key).unwrap(),
            kind: "log_set".to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_apply_returns_snapshot() {
        let remote = endpoint();
        let response = remote.submit(&request("s1", json!({"reps": 5}))).await.unwrap();

        assert_eq!(
            response,
            RemoteResponse::Applied {
                snapshot: Some(json!({"reps": 5}))
            }
        );
        assert_eq!(remote.version(&ResourceKey::new("s1").unwrap()), 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_idempotent() {
        let remote = endpoint();
        let counter = remote
            .submit(&request("s1", json!({"count": 1})))
            .await
            .unwrap();
        let req = request("s1", json!({"count": 2}));

        let first = remote.submit(&req).await.unwrap();
        let second = remote.submit(&req).await.unwrap();

        assert_ne!(counter, first);
        assert_eq!(first, second);
        assert_eq!(remote.applied().len(), 2);
        assert_eq!(remote.version(&req.resource_key), 2);
    }

    #[tokio::test]
    async fn test_offline_is_unreachable() {
        let remote = endpoint();
        remote.set_online(false);

        let err = remote.submit(&request("s1", json!({}))).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(remote.arrivals().is_empty());
        assert!(!remote.is_reachable().await);
    }

    #[tokio::test]
    async fn test_stale_base_version_conflicts() {
        let remote = endpoint();
        let key = ResourceKey::new("s1").unwrap();
        remote.seed(&key, json!({"reps": 3}));

        let response = remote
            .submit(&request("s1", json!({"reps": 5, "base_version": 0})))
            .await
            .unwrap();
        let RemoteResponse::Conflict(info) = response else {
            panic!("expected conflict, got {:?}", response);
        };
        assert_eq!(info.server_version, Some(1));
        assert_eq!(info.server_snapshot, Some(json!({"reps": 3})));

        let response = remote
            .submit(&request("s1", json!({"reps": 5, "base_version": 1})))
            .await
            .unwrap();
        assert_eq!(
            response,
            RemoteResponse::Applied {
                snapshot: Some(json!({"reps": 5}))
            }
        );
    }

    #[tokio::test]
    async fn test_faults_consumed_in_order() {
        let remote = endpoint();
        let key = ResourceKey::new("s1").unwrap();
        remote.push_fault(&key, Fault::Unavailable);
        remote.push_fault(&key, Fault::Reject("bad reps".to_string()));

        let req = request("s1", json!({"reps": -1}));
        assert!(matches!(
            remote.submit(&req).await,
            Err(TransportError::Status { code: 503, .. })
        ));
        assert_eq!(
            remote.submit(&req).await.unwrap(),
            RemoteResponse::Rejected {
                reason: "bad reps".to_string()
            }
        );
        assert!(matches!(
            remote.submit(&req).await,
            Ok(RemoteResponse::Applied { .. })
        ));
        assert_eq!(remote.arrivals().len(), 3);
    }

    #[tokio::test]
    async fn test_validator_rejects() {
        let remote = endpoint().with_validator(|req| {
            (req.payload.get("reps").and_then(Value::as_i64) < Some(0))
                .then(|| "reps must be positive".to_string())
        });

        let response = remote.submit(&request("s1", json!({"reps": -2}))).await.unwrap();
        assert!(matches!(response, RemoteResponse::Rejected { .. }));
        assert!(remote.applied().is_empty());
    }
}
