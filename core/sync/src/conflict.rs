//! Conflict resolution for operations the remote rejected with a state
//! mismatch.
//!
//! Resolution is a pure function of the local operation and the conflict
//! report: no network or storage access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use outbox_common::Operation;

use crate::optimistic::Projector;

/// Payload field carrying the server version an operation was built against.
pub const BASE_VERSION_FIELD: &str = "base_version";

/// Split the version precondition off a payload.
///
/// `base_version` is protocol, not resource data: projectors apply the
/// returned payload and never store the field.
pub fn split_base_version(payload: &Value) -> (Value, Option<u64>) {
    let mut payload = payload.clone();
    let base_version = match &mut payload {
        Value::Object(fields) => fields.remove(BASE_VERSION_FIELD).and_then(|v| v.as_u64()),
        _ => None,
    };
    (payload, base_version)
}

/// Information the remote returned about a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Server's current version of the resource, if versioned.
    #[serde(default)]
    pub server_version: Option<u64>,
    /// Server's current state of the resource.
    #[serde(default)]
    pub server_snapshot: Option<Value>,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// When the conflict was detected.
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    /// Create a conflict report with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            server_version: None,
            server_snapshot: None,
            message: message.into(),
            detected_at: Utc::now(),
        }
    }

    /// Attach the server's version.
    pub fn with_server_version(mut self, version: u64) -> Self {
        self.server_version = Some(version);
        self
    }

    /// Attach the server's current state.
    pub fn with_server_snapshot(mut self, snapshot: Value) -> Self {
        self.server_snapshot = Some(snapshot);
        self
    }
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Resend with a transformed payload (e.g. rebased on the server version).
    RetryWithPayload(Value),
    /// The server already reflects the intended effect; treat as success.
    CommitNoOp,
    /// Irreconcilable; mark the operation failed.
    Reject(String),
}

/// Decides what happens to an operation the remote reported in conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, op: &Operation, conflict: &ConflictInfo) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Operation, &ConflictInfo) -> Resolution + Send + Sync,
{
    fn resolve(&self, op: &Operation, conflict: &ConflictInfo) -> Resolution {
        self(op, conflict)
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Rebase the payload onto the server's version and resend.
    Rebase,
    /// Accept the server state and drop the local effect.
    ServerWins,
    /// Fail the operation and surface it to the caller.
    Reject,
}

/// Resolver driven by a fixed strategy.
///
/// With a projector attached, an operation whose effect is already present
/// in the server snapshot (applying it changes nothing) is committed as a
/// no-op regardless of the strategy.
pub struct StrategyResolver {
    strategy: ConflictStrategy,
    projector: Option<Arc<dyn Projector>>,
}

impl StrategyResolver {
    /// Create a new resolver with the given strategy.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            projector: None,
        }
    }

    /// Detect already-applied effects using `projector`.
    pub fn with_projector(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projector = Some(projector);
        self
    }

    /// Get the resolution strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    fn already_applied(&self, op: &Operation, conflict: &ConflictInfo) -> bool {
        match (&self.projector, &conflict.server_snapshot) {
            (Some(projector), Some(snapshot)) => {
                projector.apply(&op.resource_key, snapshot, op) == *snapshot
            }
            _ => false,
        }
    }

    fn rebase(&self, op: &Operation, conflict: &ConflictInfo) -> Resolution {
        let Some(version) = conflict.server_version else {
            return Resolution::Reject(format!(
                "cannot rebase without a server version: {}",
                conflict.message
            ));
        };
        let Value::Object(fields) = &op.payload else {
            return Resolution::Reject(format!(
                "cannot rebase a non-object payload of kind {}",
                op.kind
            ));
        };
        if fields.get(BASE_VERSION_FIELD).and_then(Value::as_u64) == Some(version) {
            return Resolution::Reject(format!(
                "conflict persists after rebasing onto version {}: {}",
                version, conflict.message
            ));
        }

        let mut rebased = fields.clone();
        rebased.insert(BASE_VERSION_FIELD.to_string(), Value::from(version));
        Resolution::RetryWithPayload(Value::Object(rebased))
    }
}

impl Default for StrategyResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::Reject)
    }
}

impl ConflictResolver for StrategyResolver {
    fn resolve(&self, op: &Operation, conflict: &ConflictInfo) -> Resolution {
        if self.already_applied(op, conflict) {
            return Resolution::CommitNoOp;
        }

        match self.strategy {
            ConflictStrategy::Rebase => self.rebase(op, conflict),
            ConflictStrategy::ServerWins => Resolution::CommitNoOp,
            ConflictStrategy::Reject => Resolution::Reject(conflict.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::MergePatchProjector;
    use outbox_common::ResourceKey;
    use serde_json::json;

    fn op(payload: Value) -> Operation {
        Operation::new(1, ResourceKey::new("s1").unwrap(), "log_set", payload)
    }

    #[test]
    fn test_strategy_table() {
        let conflict = ConflictInfo::new("version mismatch")
            .with_server_version(4)
            .with_server_snapshot(json!({"reps": 3}));

        let cases = [
            (
                ConflictStrategy::Rebase,
                json!({"reps": 5}),
                Resolution::RetryWithPayload(json!({"reps": 5, "base_version": 4})),
            ),
            (
                ConflictStrategy::Rebase,
                json!({"reps": 5, "base_version": 2}),
                Resolution::RetryWithPayload(json!({"reps": 5, "base_version": 4})),
            ),
            (
                ConflictStrategy::Rebase,
                json!({"reps": 5, "base_version": 4}),
                Resolution::Reject(
                    "conflict persists after rebasing onto version 4: version mismatch".to_string(),
                ),
            ),
            (
                ConflictStrategy::Rebase,
                json!([1, 2]),
                Resolution::Reject("cannot rebase a non-object payload of kind log_set".to_string()),
            ),
            (ConflictStrategy::ServerWins, json!({"reps": 5}), Resolution::CommitNoOp),
            (
                ConflictStrategy::Reject,
                json!({"reps": 5}),
                Resolution::Reject("version mismatch".to_string()),
            ),
        ];

        for (strategy, payload, expected) in cases {
            let resolver = StrategyResolver::new(strategy);
            assert_eq!(
                resolver.resolve(&op(payload.clone()), &conflict),
                expected,
                "strategy {:?} payload {}",
                strategy,
                payload
            );
        }
    }

    #[test]
    fn test_rebase_without_version_rejects() {
        let resolver = StrategyResolver::new(ConflictStrategy::Rebase);
        let resolution = resolver.resolve(&op(json!({"reps": 5})), &ConflictInfo::new("stale"));
        assert!(matches!(resolution, Resolution::Reject(_)));
    }

    #[test]
    fn test_already_applied_commits_noop() {
        let resolver = StrategyResolver::new(ConflictStrategy::Reject)
            .with_projector(Arc::new(MergePatchProjector));

        let conflict = ConflictInfo::new("duplicate").with_server_snapshot(json!({"reps": 5}));
        assert_eq!(
            resolver.resolve(&op(json!({"reps": 5})), &conflict),
            Resolution::CommitNoOp
        );

        let conflict = ConflictInfo::new("stale").with_server_snapshot(json!({"reps": 3}));
        assert!(matches!(
            resolver.resolve(&op(json!({"reps": 5})), &conflict),
            Resolution::Reject(_)
        ));
    }

    #[test]
    fn test_versioned_payload_already_applied() {
        let resolver = StrategyResolver::new(ConflictStrategy::Reject)
            .with_projector(Arc::new(MergePatchProjector));
        let conflict = ConflictInfo::new("stale")
            .with_server_version(1)
            .with_server_snapshot(json!({"reps": 5}));

        assert_eq!(
            resolver.resolve(&op(json!({"reps": 5, "base_version": 0})), &conflict),
            Resolution::CommitNoOp
        );
    }

    #[test]
    fn test_split_base_version() {
        assert_eq!(
            split_base_version(&json!({"reps": 5, "base_version": 2})),
            (json!({"reps": 5}), Some(2))
        );
        assert_eq!(split_base_version(&json!({"reps": 5})), (json!({"reps": 5}), None));
        assert_eq!(split_base_version(&json!([1])), (json!([1]), None));
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |_: &Operation, _: &ConflictInfo| Resolution::CommitNoOp;
        assert_eq!(
            resolver.resolve(&op(json!({})), &ConflictInfo::new("x")),
            Resolution::CommitNoOp
        );
    }

    #[test]
    fn test_conflict_info_deserializes_partial_body() {
        let info: ConflictInfo =
            serde_json::from_str(r#"{"server_version": 7, "message": "stale"}"#).unwrap();
        assert_eq!(info.server_version, Some(7));
        assert!(info.server_snapshot.is_none());
        assert_eq!(info.message, "stale");
    }
}
