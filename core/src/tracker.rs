//! Per-session feature status table and event correlation.
//!
//! Two kinds of awaiting state live here and expire through the same
//! mechanism: pending events (resolved by the host calling the expected
//! method) and awaiting confirmations (resolved by the operator echoing a
//! token back). Every armed entry owns the abort handle of its expiry timer
//! and a generation number, so a timer can only ever evict the entry it was
//! armed for.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::Span;

use crate::features::FeatureRegistry;

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// How long a pending event waits for the host's follow-up call.
    pub callback_window: Duration,
    /// How long an emitted token stays confirmable.
    pub confirmation_window: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            callback_window: DEFAULT_CALLBACK_TIMEOUT,
            confirmation_window: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStatus {
    pub name: String,
    pub is_passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent {
    pub event_type: String,
    pub expected_callback: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Registration order; lower wins when several events expect the same call.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingConfirmation {
    pub event_type: String,
    pub expected: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Matched,
    Mismatch { expected: String },
    NotAwaiting,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Pending,
    Confirmation,
}

impl Slot {
    fn as_str(self) -> &'static str {
        match self {
            Slot::Pending => "pending_event",
            Slot::Confirmation => "awaiting_confirmation",
        }
    }
}

struct Armed<T> {
    value: T,
    generation: u64,
    expiry: AbortHandle,
}

impl<T> Armed<T> {
    fn disarm(self) -> T {
        self.expiry.abort();
        self.value
    }
}

struct TrackerState {
    statuses: BTreeMap<String, FeatureStatus>,
    pending: HashMap<String, Armed<PendingEvent>>,
    confirmations: HashMap<String, Armed<AwaitingConfirmation>>,
    next_generation: u64,
}

impl TrackerState {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn apply_call(&mut self, id: &str, success: bool) -> bool {
        let Some(status) = self.statuses.get_mut(id) else {
            return false;
        };
        if status.is_passed {
            return false;
        }
        status.is_passed = success;
        success
    }
}

impl Drop for TrackerState {
    fn drop(&mut self) {
        for entry in self.pending.values() {
            entry.expiry.abort();
        }
        for entry in self.confirmations.values() {
            entry.expiry.abort();
        }
    }
}

/// Cheap to clone; all clones share one session's state.
///
/// Timer-arming operations spawn onto the ambient tokio runtime and must be
/// called from within one.
#[derive(Clone)]
pub struct FeatureTracker {
    registry: Arc<FeatureRegistry>,
    policy: ExpiryPolicy,
    state: Arc<Mutex<TrackerState>>,
    span: Span,
}

impl FeatureTracker {
    pub fn new(registry: Arc<FeatureRegistry>, policy: ExpiryPolicy, span: Span) -> Self {
        let statuses = registry
            .ids()
            .map(|id| {
                (
                    id.to_string(),
                    FeatureStatus {
                        name: id.to_string(),
                        is_passed: false,
                    },
                )
            })
            .collect();
        Self {
            registry,
            policy,
            state: Arc::new(Mutex::new(TrackerState {
                statuses,
                pending: HashMap::new(),
                confirmations: HashMap::new(),
                next_generation: 0,
            })),
            span,
        }
    }

    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true when this call flipped the feature to passed. Unknown ids
    /// and already-passed features are left untouched.
    pub fn record_feature_call(&self, id: &str, success: bool) -> bool {
        let passed = self.lock().apply_call(id, success);
        if passed {
            tracing::info!(parent: &self.span, event = "feature_passed", feature = id, "Feature passed");
        }
        passed
    }

    pub fn is_passed(&self, id: &str) -> Option<bool> {
        self.lock().statuses.get(id).map(|status| status.is_passed)
    }

    /// Snapshot in registry order.
    pub fn statuses(&self) -> Vec<FeatureStatus> {
        let state = self.lock();
        self.registry
            .ids()
            .filter_map(|id| state.statuses.get(id).cloned())
            .collect()
    }

    /// Clears every pass flag except the registry's protected ids. Pending
    /// events and confirmations are cleared separately.
    pub fn reset(&self) {
        let mut state = self.lock();
        for status in state.statuses.values_mut() {
            if !self.registry.is_protected(&status.name) {
                status.is_passed = false;
            }
        }
        tracing::info!(parent: &self.span, event = "tracker_reset", "Feature status reset");
    }

    /// Registers (or re-registers) a pending event. Returns `None` when the
    /// event has no expected callback.
    pub fn record_pending_event(&self, event_type: &str, data: Option<Value>) -> Option<PendingEvent> {
        let expected_callback = self.registry.expected_callback(event_type)?.to_string();
        let mut state = self.lock();
        let generation = state.bump_generation();
        let event = PendingEvent {
            event_type: event_type.to_string(),
            expected_callback,
            timestamp: Utc::now(),
            data,
            sequence: generation,
        };
        let expiry = self.arm(
            Slot::Pending,
            event_type.to_string(),
            generation,
            self.policy.callback_window,
        );
        let previous = state.pending.insert(
            event_type.to_string(),
            Armed {
                value: event.clone(),
                generation,
                expiry,
            },
        );
        if let Some(previous) = previous {
            previous.disarm();
        }
        tracing::debug!(
            parent: &self.span,
            event = "pending_event_recorded",
            event_type,
            expected_callback = %event.expected_callback,
            "Waiting for host callback"
        );
        Some(event)
    }

    pub fn pending_event_by_method(&self, method: &str) -> Option<PendingEvent> {
        self.lock()
            .pending
            .values()
            .filter(|entry| entry.value.expected_callback == method)
            .min_by_key(|entry| entry.value.sequence)
            .map(|entry| entry.value.clone())
    }

    pub fn clear_pending_event(&self, event_type: &str) -> Option<PendingEvent> {
        self.lock().pending.remove(event_type).map(Armed::disarm)
    }

    pub fn clear_pending_events(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.pending.len();
        for (_, entry) in state.pending.drain() {
            entry.disarm();
        }
        cleared
    }

    pub fn pending_events(&self) -> Vec<PendingEvent> {
        let mut events: Vec<PendingEvent> = self
            .lock()
            .pending
            .values()
            .map(|entry| entry.value.clone())
            .collect();
        events.sort_by_key(|event| event.sequence);
        events
    }

    /// Resolves the oldest pending event expecting `method`, marking its
    /// originating event as passed.
    pub fn resolve_inbound_call(&self, method: &str) -> Option<PendingEvent> {
        let mut state = self.lock();
        let key = state
            .pending
            .values()
            .filter(|entry| entry.value.expected_callback == method)
            .min_by_key(|entry| entry.value.sequence)
            .map(|entry| entry.value.event_type.clone())?;
        let resolved = state.pending.remove(&key).map(Armed::disarm)?;
        state.apply_call(&resolved.event_type, true);
        drop(state);

        tracing::info!(
            parent: &self.span,
            event = "pending_event_resolved",
            event_type = %resolved.event_type,
            method,
            "Host reacted to notification"
        );
        Some(resolved)
    }

    /// Stores `expected` as the only value accepted for `event_type`,
    /// replacing any earlier one.
    pub fn expect_confirmation(&self, event_type: &str, expected: String) -> Option<AwaitingConfirmation> {
        if !self.registry.contains(event_type) {
            return None;
        }
        let mut state = self.lock();
        let generation = state.bump_generation();
        let awaiting = AwaitingConfirmation {
            event_type: event_type.to_string(),
            expected,
            timestamp: Utc::now(),
        };
        let expiry = self.arm(
            Slot::Confirmation,
            event_type.to_string(),
            generation,
            self.policy.confirmation_window,
        );
        let previous = state.confirmations.insert(
            event_type.to_string(),
            Armed {
                value: awaiting.clone(),
                generation,
                expiry,
            },
        );
        if let Some(previous) = previous {
            previous.disarm();
        }
        Some(awaiting)
    }

    pub fn awaiting_confirmation(&self, event_type: &str) -> Option<AwaitingConfirmation> {
        self.lock()
            .confirmations
            .get(event_type)
            .map(|entry| entry.value.clone())
    }

    pub fn confirm(&self, event_type: &str, message: &str) -> ConfirmationOutcome {
        let mut state = self.lock();
        let Some(entry) = state.confirmations.get(event_type) else {
            return ConfirmationOutcome::NotAwaiting;
        };
        if entry.value.expected != message {
            let expected = entry.value.expected.clone();
            drop(state);
            tracing::info!(
                parent: &self.span,
                event = "confirmation_mismatch",
                event_type,
                expected = %expected,
                actual = message,
                "Confirmation message does not match"
            );
            return ConfirmationOutcome::Mismatch { expected };
        }
        if let Some(entry) = state.confirmations.remove(event_type) {
            entry.disarm();
        }
        state.apply_call(event_type, true);
        drop(state);

        tracing::info!(parent: &self.span, event = "confirmation_matched", event_type, "Host surfaced the expected value");
        ConfirmationOutcome::Matched
    }

    pub fn clear_confirmation(&self, event_type: &str) -> Option<AwaitingConfirmation> {
        self.lock().confirmations.remove(event_type).map(Armed::disarm)
    }

    pub fn clear_confirmations(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.confirmations.len();
        for (_, entry) in state.confirmations.drain() {
            entry.disarm();
        }
        cleared
    }

    fn arm(&self, slot: Slot, key: String, generation: u64, window: Duration) -> AbortHandle {
        let deadline = tokio::time::Instant::now() + window;
        let state = Arc::downgrade(&self.state);
        let span = self.span.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = match slot {
                Slot::Pending => {
                    let current = state
                        .pending
                        .get(&key)
                        .is_some_and(|entry| entry.generation == generation);
                    current && state.pending.remove(&key).is_some()
                }
                Slot::Confirmation => {
                    let current = state
                        .confirmations
                        .get(&key)
                        .is_some_and(|entry| entry.generation == generation);
                    current && state.confirmations.remove(&key).is_some()
                }
            };
            drop(state);
            if evicted {
                tracing::debug!(
                    parent: &span,
                    event = "awaiting_state_expired",
                    slot = slot.as_str(),
                    event_type = %key,
                    "Expired without a host reaction"
                );
            }
        })
        .abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FeatureTracker {
        FeatureTracker::new(
            Arc::new(FeatureRegistry::mcp()),
            ExpiryPolicy::default(),
            Span::none(),
        )
    }

    #[test]
    fn every_feature_starts_unpassed() {
        let tracker = tracker();
        let statuses = tracker.statuses();
        assert_eq!(statuses.len(), tracker.registry().len());
        assert!(statuses.iter().all(|status| !status.is_passed));
    }

    #[test]
    fn first_success_sticks() {
        let tracker = tracker();
        assert!(tracker.record_feature_call("prompts/get", true));
        assert!(!tracker.record_feature_call("prompts/get", false));
        assert_eq!(tracker.is_passed("prompts/get"), Some(true));
    }

    #[test]
    fn failure_then_success_passes() {
        let tracker = tracker();
        assert!(!tracker.record_feature_call("prompts/get", false));
        assert!(tracker.record_feature_call("prompts/get", true));
    }

    #[test]
    fn unknown_feature_is_ignored() {
        let tracker = tracker();
        assert!(!tracker.record_feature_call("initialize", true));
        assert_eq!(tracker.is_passed("initialize"), None);
    }

    #[test]
    fn reset_keeps_protected_features() {
        let tracker = tracker();
        let ids: Vec<String> = tracker.registry().ids().map(str::to_string).collect();
        for id in &ids {
            tracker.record_feature_call(id, true);
        }
        tracker.reset();
        for status in tracker.statuses() {
            assert_eq!(
                status.is_passed,
                tracker.registry().is_protected(&status.name),
                "{}",
                status.name
            );
        }
    }

    #[tokio::test]
    async fn unmapped_event_is_not_tracked() {
        let tracker = tracker();
        assert!(tracker.record_pending_event("ping", None).is_none());
        assert!(tracker.pending_events().is_empty());
    }

    #[tokio::test]
    async fn inbound_call_resolves_pending_event() {
        let tracker = tracker();
        let pending = tracker
            .record_pending_event("notifications/resources/list_changed", None)
            .expect("mapped event");
        assert_eq!(pending.expected_callback, "resources/list");
        assert_eq!(
            tracker
                .pending_event_by_method("resources/list")
                .map(|event| event.event_type),
            Some("notifications/resources/list_changed".to_string())
        );

        let resolved = tracker.resolve_inbound_call("resources/list").expect("resolved");
        assert_eq!(resolved.event_type, "notifications/resources/list_changed");
        assert_eq!(
            tracker.is_passed("notifications/resources/list_changed"),
            Some(true)
        );
        assert!(tracker.pending_events().is_empty());
    }

    #[tokio::test]
    async fn unrelated_call_leaves_pending_event() {
        let tracker = tracker();
        tracker.record_pending_event("notifications/tools/list_changed", None);
        assert!(tracker.resolve_inbound_call("resources/list").is_none());
        assert_eq!(tracker.pending_events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_event_expires_silently() {
        let tracker = tracker();
        tracker.record_pending_event("notifications/resources/list_changed", None);
        tokio::time::sleep(DEFAULT_CALLBACK_TIMEOUT + Duration::from_secs(1)).await;

        assert!(tracker.pending_events().is_empty());
        assert!(tracker.resolve_inbound_call("resources/list").is_none());
        assert_eq!(
            tracker.is_passed("notifications/resources/list_changed"),
            Some(false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refiring_rearms_the_timeout() {
        let tracker = tracker();
        tracker.record_pending_event("notifications/prompts/list_changed", None);
        tokio::time::sleep(Duration::from_secs(3)).await;
        tracker.record_pending_event("notifications/prompts/list_changed", None);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(tracker.pending_events().len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(tracker.pending_events().is_empty());
    }

    #[tokio::test]
    async fn clear_pending_event_returns_removed_entry() {
        let tracker = tracker();
        tracker.record_pending_event("notifications/tools/list_changed", Some(serde_json::json!({"k": 1})));
        let cleared = tracker
            .clear_pending_event("notifications/tools/list_changed")
            .expect("entry");
        assert_eq!(cleared.data, Some(serde_json::json!({"k": 1})));
        assert!(tracker.clear_pending_event("notifications/tools/list_changed").is_none());
    }

    #[tokio::test]
    async fn shared_callback_resolves_oldest_registration_first() {
        let registry = FeatureRegistry::new(
            ["resources/list"],
            ["notifications/a", "notifications/b"],
            vec![
                ("notifications/b".to_string(), "resources/list".to_string()),
                ("notifications/a".to_string(), "resources/list".to_string()),
            ],
            Vec::<String>::new(),
        )
        .expect("valid registry");
        let tracker = FeatureTracker::new(Arc::new(registry), ExpiryPolicy::default(), Span::none());

        tracker.record_pending_event("notifications/b", None);
        tracker.record_pending_event("notifications/a", None);

        let first = tracker.resolve_inbound_call("resources/list").expect("first");
        assert_eq!(first.event_type, "notifications/b");
        assert_eq!(tracker.is_passed("notifications/a"), Some(false));

        let second = tracker.resolve_inbound_call("resources/list").expect("second");
        assert_eq!(second.event_type, "notifications/a");
    }

    #[tokio::test]
    async fn only_latest_confirmation_value_is_accepted() {
        let tracker = tracker();
        tracker.expect_confirmation("notifications/message", "first".to_string());
        tracker.expect_confirmation("notifications/message", "second".to_string());

        assert_eq!(
            tracker.confirm("notifications/message", "first"),
            ConfirmationOutcome::Mismatch {
                expected: "second".to_string()
            }
        );
        assert_eq!(tracker.is_passed("notifications/message"), Some(false));

        assert_eq!(
            tracker.confirm("notifications/message", "second"),
            ConfirmationOutcome::Matched
        );
        assert_eq!(tracker.is_passed("notifications/message"), Some(true));
        assert_eq!(
            tracker.confirm("notifications/message", "second"),
            ConfirmationOutcome::NotAwaiting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_expires_with_its_own_window() {
        let tracker = FeatureTracker::new(
            Arc::new(FeatureRegistry::mcp()),
            ExpiryPolicy {
                callback_window: Duration::from_secs(5),
                confirmation_window: Duration::from_secs(30),
            },
            Span::none(),
        );
        tracker.expect_confirmation("notifications/progress", "0.5".to_string());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tracker.awaiting_confirmation("notifications/progress").is_some());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            tracker.confirm("notifications/progress", "0.5"),
            ConfirmationOutcome::NotAwaiting
        );
    }
}
