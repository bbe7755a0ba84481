//! Optimistic state: the local view with every queued operation applied on
//! top of the last committed server snapshot.
//!
//! The view is a pure fold over `(baseline, pending operations)`; nothing
//! here touches the network or storage, and reads never block on either.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use outbox_common::{Operation, OperationId, ResourceKey};

use crate::conflict::split_base_version;

/// Materialized state per resource. Absent resources have no entry.
pub type View = BTreeMap<ResourceKey, Value>;

/// Projects one operation onto a resource's current value.
///
/// Must be pure and deterministic: the same inputs always yield the same
/// output, so a restarted process rebuilds an identical view. `current` is
/// `Value::Null` when the resource does not exist; returning `Value::Null`
/// removes it.
pub trait Projector: Send + Sync {
    fn apply(&self, key: &ResourceKey, current: &Value, op: &Operation) -> Value;
}

impl<F> Projector for F
where
    F: Fn(&ResourceKey, &Value, &Operation) -> Value + Send + Sync,
{
    fn apply(&self, key: &ResourceKey, current: &Value, op: &Operation) -> Value {
        self(key, current, op)
    }
}

/// Applies each payload as a JSON merge patch (RFC 7386).
///
/// Operations whose kind is `"delete"` remove the resource. A `base_version`
/// precondition in the payload is not merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePatchProjector;

impl Projector for MergePatchProjector {
    fn apply(&self, _key: &ResourceKey, current: &Value, op: &Operation) -> Value {
        if op.kind == "delete" {
            return Value::Null;
        }
        let (patch, _) = split_base_version(&op.payload);
        let mut next = current.clone();
        merge_patch(&mut next, &patch);
        next
    }
}

/// Apply an RFC 7386 merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (field, value) in patch {
            if value.is_null() {
                target.remove(field);
            } else {
                merge_patch(target.entry(field.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Fold the active operations for one resource onto its baseline value.
fn project_key<'a>(
    projector: &dyn Projector,
    key: &ResourceKey,
    base: &Value,
    ops: impl IntoIterator<Item = &'a Operation>,
) -> Value {
    ops.into_iter()
        .filter(|op| op.is_active() && &op.resource_key == key)
        .fold(base.clone(), |value, op| projector.apply(key, &value, op))
}

/// Build a view from a baseline and operations.
///
/// Operations are applied in `seq` order; terminal operations are skipped.
pub fn project(projector: &dyn Projector, baseline: &View, ops: &[Operation]) -> View {
    let mut ordered: Vec<&Operation> = ops.iter().filter(|op| op.is_active()).collect();
    ordered.sort_by_key(|op| op.seq);

    let mut view = baseline.clone();
    for op in ordered {
        let current = view.get(&op.resource_key).cloned().unwrap_or(Value::Null);
        set_or_remove(&mut view, &op.resource_key, projector.apply(&op.resource_key, &current, op));
    }
    view
}

fn set_or_remove(view: &mut View, key: &ResourceKey, value: Value) {
    if value.is_null() {
        view.remove(key);
    } else {
        view.insert(key.clone(), value);
    }
}

#[derive(Default)]
struct ViewState {
    /// Last committed server snapshot per resource.
    baseline: View,
    /// Active operations by `seq`.
    pending: BTreeMap<u64, Operation>,
    /// `seq` lookup for `pending`.
    ids: HashMap<OperationId, u64>,
}

impl ViewState {
    fn lane_value(&self, projector: &dyn Projector, key: &ResourceKey) -> Value {
        let base = self.baseline.get(key).cloned().unwrap_or(Value::Null);
        project_key(projector, key, &base, self.pending.values())
    }
}

/// Derived local view consumed by presentation layers.
pub struct OptimisticState {
    projector: Arc<dyn Projector>,
    state: Mutex<ViewState>,
    tx: watch::Sender<Arc<View>>,
}

impl OptimisticState {
    /// Create an empty optimistic state.
    pub fn new(projector: Arc<dyn Projector>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(View::new()));
        Self {
            projector,
            state: Mutex::new(ViewState::default()),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The projector used for every fold.
    pub fn projector(&self) -> &Arc<dyn Projector> {
        &self.projector
    }

    /// Project one operation onto `view`, returning the new view.
    pub fn apply(&self, view: &View, op: &Operation) -> View {
        let mut next = view.clone();
        let current = view.get(&op.resource_key).cloned().unwrap_or(Value::Null);
        set_or_remove(
            &mut next,
            &op.resource_key,
            self.projector.apply(&op.resource_key, &current, op),
        );
        next
    }

    /// Current view.
    pub fn view(&self) -> Arc<View> {
        self.tx.borrow().clone()
    }

    /// Current value of one resource.
    pub fn get(&self, key: &ResourceKey) -> Option<Value> {
        self.tx.borrow().get(key).cloned()
    }

    /// Last committed server snapshots.
    pub fn baseline(&self) -> View {
        self.lock().baseline.clone()
    }

    /// Subscribe to view changes. Every apply and reconcile publishes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.tx.subscribe()
    }

    /// Replace a resource's baseline with authoritative server data and
    /// reapply its still-pending operations on top.
    pub fn reconcile(&self, key: &ResourceKey, snapshot: Value) {
        let mut state = self.lock();
        set_or_remove(&mut state.baseline, key, snapshot);
        debug!("Reconciled baseline for {}", key);
        self.refresh_key(&state, key);
    }

    /// Replace everything, e.g. after loading from the durable store.
    pub(crate) fn restore(&self, baseline: View, ops: impl IntoIterator<Item = Operation>) {
        let mut state = self.lock();
        state.baseline = baseline;
        state.pending.clear();
        state.ids.clear();
        for op in ops.into_iter().filter(|op| op.is_active()) {
            state.ids.insert(op.id, op.seq);
            state.pending.insert(op.seq, op);
        }

        let ops: Vec<Operation> = state.pending.values().cloned().collect();
        let view = project(self.projector.as_ref(), &state.baseline, &ops);
        self.tx.send_replace(Arc::new(view));
    }

    /// Start tracking an operation, or replace a tracked one (same `seq`).
    pub(crate) fn track(&self, op: &Operation) {
        let mut state = self.lock();
        let appended = state
            .pending
            .last_key_value()
            .map_or(true, |(last, _)| *last < op.seq);

        state.ids.insert(op.id, op.seq);
        state.pending.insert(op.seq, op.clone());

        if appended {
            let view = self.apply(&self.tx.borrow(), op);
            self.tx.send_replace(Arc::new(view));
        } else {
            self.refresh_key(&state, &op.resource_key);
        }
    }

    /// Stop tracking an operation (failed or discarded); its effect is rolled
    /// back.
    pub(crate) fn forget(&self, id: &OperationId) {
        let mut state = self.lock();
        let Some(seq) = state.ids.remove(id) else {
            return;
        };
        if let Some(op) = state.pending.remove(&seq) {
            self.refresh_key(&state, &op.resource_key);
        }
    }

    /// Baseline value after folding `op` into the current baseline.
    pub(crate) fn folded_baseline(&self, op: &Operation) -> Value {
        let state = self.lock();
        let base = state.baseline.get(&op.resource_key).cloned().unwrap_or(Value::Null);
        self.projector.apply(&op.resource_key, &base, op)
    }

    /// A committed operation leaves the pending set and `baseline` becomes
    /// its resource's new committed snapshot.
    pub(crate) fn settle(&self, op: &Operation, baseline: Value) {
        let mut state = self.lock();
        if let Some(seq) = state.ids.remove(&op.id) {
            state.pending.remove(&seq);
        }
        set_or_remove(&mut state.baseline, &op.resource_key, baseline);
        self.refresh_key(&state, &op.resource_key);
    }

    fn refresh_key(&self, state: &ViewState, key: &ResourceKey) {
        let value = state.lane_value(self.projector.as_ref(), key);
        self.tx.send_modify(|view| set_or_remove(Arc::make_mut(view), key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> ResourceKey {
        ResourceKey::new(k).unwrap()
    }

    fn op(seq: u64, k: &str, payload: Value) -> Operation {
        Operation::new(seq, key(k), "patch", payload)
    }

    fn state() -> OptimisticState {
        OptimisticState::new(Arc::new(MergePatchProjector))
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &json!({"a": null, "b": {"c": 5}, "e": [1]}));
        assert_eq!(target, json!({"b": {"c": 5, "d": 3}, "e": [1]}));

        let mut scalar = json!(4);
        merge_patch(&mut scalar, &json!({"x": 1}));
        assert_eq!(scalar, json!({"x": 1}));
    }

    #[test]
    fn test_apply_is_pure() {
        let state = state();
        let before = View::new();
        let after = state.apply(&before, &op(1, "s1", json!({"reps": 5})));

        assert!(before.is_empty());
        assert_eq!(after.get(&key("s1")), Some(&json!({"reps": 5})));
        // Nothing was tracked
        assert!(state.view().is_empty());
    }

    #[test]
    fn test_track_applies_in_seq_order() {
        let state = state();
        state.track(&op(1, "s1", json!({"reps": 5})));
        state.track(&op(2, "s1", json!({"reps": 8, "weight": 40})));

        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 8, "weight": 40})));
    }

    #[test]
    fn test_out_of_order_track_recomputes() {
        let state = state();
        state.track(&op(2, "s1", json!({"reps": 8})));
        state.track(&op(1, "s1", json!({"reps": 5, "note": "warmup"})));

        // seq 2 still wins over seq 1
        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 8, "note": "warmup"})));
    }

    #[test]
    fn test_reconcile_reapplies_pending() {
        let state = state();
        state.track(&op(1, "s1", json!({"reps": 5})));

        state.reconcile(&key("s1"), json!({"reps": 3, "sets": 2}));
        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 5, "sets": 2})));
        assert_eq!(state.baseline().get(&key("s1")), Some(&json!({"reps": 3, "sets": 2})));
    }

    #[test]
    fn test_forget_rolls_back() {
        let state = state();
        state.reconcile(&key("s1"), json!({"reps": 3}));
        let first = op(1, "s1", json!({"reps": 5}));
        state.track(&first);

        state.forget(&first.id);
        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 3})));
    }

    #[test]
    fn test_settle_without_snapshot_keeps_effect() {
        let state = state();
        let first = op(1, "s1", json!({"reps": 5}));
        state.track(&first);
        state.track(&op(2, "s1", json!({"weight": 40})));

        let baseline = state.folded_baseline(&first);
        state.settle(&first, baseline);

        assert_eq!(state.baseline().get(&key("s1")), Some(&json!({"reps": 5})));
        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 5, "weight": 40})));
    }

    #[test]
    fn test_base_version_stays_out_of_view() {
        let state = state();
        state.reconcile(&key("s1"), json!({"reps": 3}));
        let first = op(1, "s1", json!({"reps": 5, "base_version": 0}));
        state.track(&first);

        assert_eq!(state.get(&key("s1")), Some(json!({"reps": 5})));
        assert_eq!(state.folded_baseline(&first), json!({"reps": 5}));
    }

    #[test]
    fn test_delete_kind_removes_resource() {
        let state = state();
        state.reconcile(&key("s1"), json!({"reps": 3}));
        state.track(&Operation::new(1, key("s1"), "delete", json!({})));

        assert!(state.get(&key("s1")).is_none());
    }

    #[test]
    fn test_restore_matches_incremental() {
        let incremental = state();
        let ops = vec![
            op(1, "s1", json!({"reps": 5})),
            op(2, "s2", json!({"done": true})),
            op(3, "s1", json!({"weight": 40})),
        ];
        incremental.reconcile(&key("s1"), json!({"sets": 1}));
        for op in &ops {
            incremental.track(op);
        }

        let restored = state();
        restored.restore(incremental.baseline(), ops);

        assert_eq!(*restored.view(), *incremental.view());
    }

    #[tokio::test]
    async fn test_subscribers_notified() {
        let state = state();
        let mut rx = state.subscribe();

        state.track(&op(1, "s1", json!({"reps": 5})));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().get(&key("s1")), Some(&json!({"reps": 5})));
    }
}
