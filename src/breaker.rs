//! Per-provider and per-vendor circuit breaking.
//!
//! The state machine is a pure function over a tagged state; the manager
//! keeps an in-process mirror per breaker key so checks stay synchronous,
//! and persists each transition to the shared store best-effort with a
//! short TTL so sibling processes converge on provider outages.
//!
//! Failure policy: upstream 5xx and timeouts always count; network errors
//! only when the deployment opts in (decided by the caller via
//! `ProxyError::is_breaker_failure`); client 4xx never count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::{BreakerConfig, Provider};
use crate::store::{keys, SharedStore};

/// How long a persisted breaker state outlives its last transition.
const PERSIST_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed {
        failures: u32,
    },
    Open {
        opened_at_ms: i64,
        /// Manually opened breakers ignore the timer until manually cleared.
        #[serde(default)]
        manual: bool,
    },
    HalfOpen {
        successes: u32,
    },
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::Closed { failures: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    Failure,
    ManualReset,
    ManualOpen,
}

/// Admission verdict for one breaker scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    Allow,
    /// Open window elapsed; this one call probes the upstream.
    Probe,
    Reject,
}

/// Pure state transition, exactly the table from the breaker design.
pub fn transition(
    state: BreakerState,
    event: BreakerEvent,
    now_ms: i64,
    config: &BreakerConfig,
) -> BreakerState {
    match (state, event) {
        (_, BreakerEvent::ManualReset) => BreakerState::Closed { failures: 0 },
        (_, BreakerEvent::ManualOpen) => BreakerState::Open {
            opened_at_ms: now_ms,
            manual: true,
        },
        (BreakerState::Closed { failures }, BreakerEvent::Failure) => {
            let failures = failures + 1;
            if failures >= config.failure_threshold {
                BreakerState::Open {
                    opened_at_ms: now_ms,
                    manual: false,
                }
            } else {
                BreakerState::Closed { failures }
            }
        }
        (BreakerState::Closed { .. }, BreakerEvent::Success) => {
            BreakerState::Closed { failures: 0 }
        }
        (BreakerState::HalfOpen { successes }, BreakerEvent::Success) => {
            let successes = successes + 1;
            if successes >= config.half_open_success_threshold {
                BreakerState::Closed { failures: 0 }
            } else {
                BreakerState::HalfOpen { successes }
            }
        }
        (BreakerState::HalfOpen { .. }, BreakerEvent::Failure) => BreakerState::Open {
            opened_at_ms: now_ms,
            manual: false,
        },
        // Events landing while open (e.g. an in-flight call that started
        // before the trip) do not move the state.
        (open @ BreakerState::Open { .. }, _) => open,
    }
}

/// Admission check for a state; promotion to half-open happens in the
/// manager so it is observed atomically per breaker key.
fn verdict(state: &BreakerState, now_ms: i64, config: &BreakerConfig) -> BreakerVerdict {
    match state {
        BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => BreakerVerdict::Allow,
        BreakerState::Open { manual: true, .. } => BreakerVerdict::Reject,
        BreakerState::Open { opened_at_ms, .. } => {
            if now_ms >= opened_at_ms + config.open_duration_ms as i64 {
                BreakerVerdict::Probe
            } else {
                BreakerVerdict::Reject
            }
        }
    }
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub trip_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct BreakerEntry {
    state: BreakerState,
    trip_count: u64,
    last_error: Option<String>,
}

/// Breaker manager over both scopes (provider id and vendor scope).
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    entries: RwLock<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn scope_keys(provider: &Provider) -> (String, String) {
        (
            keys::breaker_provider(&provider.id),
            keys::breaker_vendor(&provider.vendor_scope()),
        )
    }

    /// Read-only check used while filtering candidates: true when either
    /// scope would reject right now. Does not consume the half-open probe.
    pub async fn is_blocked(&self, provider: &Provider) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let (provider_key, vendor_key) = Self::scope_keys(provider);
        let entries = self.entries.read().await;
        [provider_key, vendor_key].iter().any(|key| {
            entries
                .get(key)
                .map(|e| verdict(&e.state, now_ms, &provider.breaker) == BreakerVerdict::Reject)
                .unwrap_or(false)
        })
    }

    /// Whether the provider may receive a request now.
    ///
    /// Rejects when either the provider breaker or its vendor breaker is
    /// open; an elapsed open window promotes that scope to half-open and
    /// permits this single call as the probe.
    pub async fn acquire(&self, provider: &Provider) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let (provider_key, vendor_key) = Self::scope_keys(provider);
        let mut entries = self.entries.write().await;
        for key in [provider_key, vendor_key] {
            let entry = entries.entry(key.clone()).or_default();
            match verdict(&entry.state, now_ms, &provider.breaker) {
                BreakerVerdict::Allow => {}
                BreakerVerdict::Probe => {
                    entry.state = BreakerState::HalfOpen { successes: 0 };
                    self.persist(&key, entry.state).await;
                }
                BreakerVerdict::Reject => {
                    entry.trip_count += 1;
                    tracing::debug!(
                        breaker = %key,
                        provider = %provider.id,
                        "Circuit open, provider excluded"
                    );
                    return false;
                }
            }
        }
        true
    }

    pub async fn record_success(&self, provider: &Provider) {
        self.apply(provider, BreakerEvent::Success, None).await;
    }

    pub async fn record_failure(&self, provider: &Provider, error: &str) {
        self.apply(provider, BreakerEvent::Failure, Some(error.to_string()))
            .await;
    }

    /// Operator override: force a breaker open until manually cleared.
    pub async fn manual_open(&self, provider: &Provider) {
        self.apply(provider, BreakerEvent::ManualOpen, None).await;
    }

    /// Operator override: clear both scopes back to closed.
    pub async fn manual_reset(&self, provider: &Provider) {
        self.apply(provider, BreakerEvent::ManualReset, None).await;
    }

    async fn apply(&self, provider: &Provider, event: BreakerEvent, error: Option<String>) {
        let now_ms = Utc::now().timestamp_millis();
        let (provider_key, vendor_key) = Self::scope_keys(provider);
        let mut entries = self.entries.write().await;
        for key in [provider_key, vendor_key] {
            let entry = entries.entry(key.clone()).or_default();
            let before = entry.state;
            entry.state = transition(before, event, now_ms, &provider.breaker);
            if let Some(error) = &error {
                entry.last_error = Some(error.clone());
            }
            if before != entry.state {
                if matches!(entry.state, BreakerState::Open { .. }) {
                    entry.trip_count += 1;
                    tracing::warn!(
                        breaker = %key,
                        provider = %provider.id,
                        ?before,
                        "Circuit breaker opened"
                    );
                } else {
                    tracing::info!(
                        breaker = %key,
                        provider = %provider.id,
                        state = ?entry.state,
                        "Circuit breaker transition"
                    );
                }
                self.persist(&key, entry.state).await;
            }
        }
    }

    /// Best-effort persistence so sibling processes see the transition.
    async fn persist(&self, key: &str, state: BreakerState) {
        let payload = match serde_json::to_string(&state) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Err(e) = self.store.set_ex(key, &payload, PERSIST_TTL).await {
            tracing::debug!(breaker = %key, error = %e, "Breaker state persist failed");
        }
    }

    /// Adopt persisted state for breakers this process has not seen yet.
    /// Called lazily by the resolver before filtering.
    pub async fn hydrate(&self, provider: &Provider) {
        let (provider_key, vendor_key) = Self::scope_keys(provider);
        for key in [provider_key, vendor_key] {
            {
                let entries = self.entries.read().await;
                if entries.contains_key(&key) {
                    continue;
                }
            }
            let Ok(Some(raw)) = self.store.get(&key).await else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<BreakerState>(&raw) else {
                continue;
            };
            let mut entries = self.entries.write().await;
            entries.entry(key).or_insert_with(|| BreakerEntry {
                state,
                ..Default::default()
            });
        }
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(key, entry)| BreakerSnapshot {
                key: key.clone(),
                state: entry.state,
                trip_count: entry.trip_count,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn state_of(&self, key: &str) -> Option<BreakerState> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::test_provider;
    use crate::store::MemoryStore;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            open_duration_ms: 1000,
            half_open_success_threshold: 3,
            max_retry_attempts: 3,
        }
    }

    #[test]
    fn closed_counts_failures_until_threshold() {
        let cfg = config();
        let mut state = BreakerState::default();
        for i in 1..5 {
            state = transition(state, BreakerEvent::Failure, 0, &cfg);
            assert_eq!(state, BreakerState::Closed { failures: i });
        }
        state = transition(state, BreakerEvent::Failure, 42, &cfg);
        assert_eq!(
            state,
            BreakerState::Open {
                opened_at_ms: 42,
                manual: false
            }
        );
    }

    #[test]
    fn closed_success_resets_failure_count() {
        let cfg = config();
        let state = transition(
            BreakerState::Closed { failures: 4 },
            BreakerEvent::Success,
            0,
            &cfg,
        );
        assert_eq!(state, BreakerState::Closed { failures: 0 });
    }

    #[test]
    fn open_rejects_inside_window_and_probes_after() {
        let cfg = config();
        let open = BreakerState::Open {
            opened_at_ms: 1000,
            manual: false,
        };
        assert_eq!(verdict(&open, 1500, &cfg), BreakerVerdict::Reject);
        assert_eq!(verdict(&open, 2000, &cfg), BreakerVerdict::Probe);
        assert_eq!(verdict(&open, 5000, &cfg), BreakerVerdict::Probe);
    }

    #[test]
    fn half_open_success_closes_after_threshold() {
        let cfg = config();
        let mut state = BreakerState::HalfOpen { successes: 0 };
        state = transition(state, BreakerEvent::Success, 0, &cfg);
        assert_eq!(state, BreakerState::HalfOpen { successes: 1 });
        state = transition(state, BreakerEvent::Success, 0, &cfg);
        assert_eq!(state, BreakerState::HalfOpen { successes: 2 });
        state = transition(state, BreakerEvent::Success, 0, &cfg);
        assert_eq!(state, BreakerState::Closed { failures: 0 });
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let cfg = config();
        let state = transition(
            BreakerState::HalfOpen { successes: 2 },
            BreakerEvent::Failure,
            7777,
            &cfg,
        );
        assert_eq!(
            state,
            BreakerState::Open {
                opened_at_ms: 7777,
                manual: false
            }
        );
    }

    #[test]
    fn manual_overrides_from_any_state() {
        let cfg = config();
        for from in [
            BreakerState::Closed { failures: 3 },
            BreakerState::Open {
                opened_at_ms: 5,
                manual: false,
            },
            BreakerState::HalfOpen { successes: 1 },
        ] {
            assert_eq!(
                transition(from, BreakerEvent::ManualReset, 0, &cfg),
                BreakerState::Closed { failures: 0 }
            );
            assert_eq!(
                transition(from, BreakerEvent::ManualOpen, 9, &cfg),
                BreakerState::Open {
                    opened_at_ms: 9,
                    manual: true
                }
            );
        }
    }

    #[test]
    fn manual_open_ignores_the_timer() {
        let cfg = config();
        let state = BreakerState::Open {
            opened_at_ms: 0,
            manual: true,
        };
        assert_eq!(verdict(&state, i64::MAX, &cfg), BreakerVerdict::Reject);
    }

    #[tokio::test]
    async fn five_failures_open_both_scopes() {
        let breaker = CircuitBreaker::new(Arc::new(MemoryStore::new()));
        let mut provider = test_provider("pa");
        provider.breaker = config();
        for _ in 0..5 {
            assert!(breaker.acquire(&provider).await);
            breaker.record_failure(&provider, "HTTP 503").await;
        }
        assert!(!breaker.acquire(&provider).await);
        let state = breaker
            .state_of(&keys::breaker_provider("pa"))
            .await
            .unwrap();
        assert!(matches!(state, BreakerState::Open { .. }));
    }

    #[tokio::test]
    async fn probe_after_window_then_success_closes() {
        let breaker = CircuitBreaker::new(Arc::new(MemoryStore::new()));
        let mut provider = test_provider("pa");
        provider.breaker = BreakerConfig {
            failure_threshold: 1,
            open_duration_ms: 30,
            half_open_success_threshold: 1,
            max_retry_attempts: 3,
        };
        breaker.record_failure(&provider, "HTTP 500").await;
        assert!(!breaker.acquire(&provider).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // First call after the window is the probe.
        assert!(breaker.acquire(&provider).await);
        breaker.record_success(&provider).await;
        assert!(breaker.acquire(&provider).await);
        let state = breaker
            .state_of(&keys::breaker_provider("pa"))
            .await
            .unwrap();
        assert_eq!(state, BreakerState::Closed { failures: 0 });
    }

    #[tokio::test]
    async fn vendor_scope_isolates_sibling_providers() {
        let breaker = CircuitBreaker::new(Arc::new(MemoryStore::new()));
        let mut a = test_provider("pa");
        a.vendor_id = Some("anthropic".into());
        a.breaker = config();
        let mut b = test_provider("pb");
        b.vendor_id = Some("anthropic".into());
        b.breaker = config();

        for _ in 0..5 {
            breaker.record_failure(&a, "HTTP 502").await;
        }
        // Same vendor scope is open, so the sibling is rejected too.
        assert!(!breaker.acquire(&b).await);

        let mut c = test_provider("pc");
        c.vendor_id = Some("openai".into());
        c.provider_type = crate::models::ProviderType::OpenaiCompatible;
        c.breaker = config();
        assert!(breaker.acquire(&c).await);
    }

    #[tokio::test]
    async fn hydrate_adopts_persisted_state() {
        let store = Arc::new(MemoryStore::new());
        let mut provider = test_provider("pa");
        provider.breaker = config();

        let first = CircuitBreaker::new(store.clone());
        for _ in 0..5 {
            first.record_failure(&provider, "HTTP 500").await;
        }

        // A fresh process adopts the open state from the store.
        let second = CircuitBreaker::new(store);
        second.hydrate(&provider).await;
        assert!(!second.acquire(&provider).await);
    }
}
