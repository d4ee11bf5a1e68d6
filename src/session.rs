//! Session context: id allocation, request sequencing, per-session state.
//!
//! A session is a five-minute rolling window of related requests. Hot
//! fields (sequence counter, last provider, aggregate counters) live in the
//! shared store under `session:{id}:*` with the session TTL; request and
//! response payloads are stored only when the deployment opts in, written
//! fire-and-forget off the request path.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::store::{keys, SharedStore};

/// Client-supplied session ids are normalized to this alphabet and length.
const MAX_SESSION_ID_LEN: usize = 64;

pub struct SessionManager {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    store_messages: bool,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration, store_messages: bool) -> Self {
        Self {
            store,
            ttl,
            store_messages,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // ── id allocation ────────────────────────────────────────────────────

    /// Extract a client-provided session hint from headers or body.
    ///
    /// Anthropic clients carry `metadata.user_id` of the form
    /// `user_…_account_…_session_{uuid}`; other clients may send an
    /// explicit `x-session-id` header.
    pub fn extract_client_session_id(
        headers: &HeaderMap,
        body: &serde_json::Value,
    ) -> Option<String> {
        if let Some(header) = headers
            .get("x-session-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Some(header.to_string());
        }
        let metadata_user = body
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())?;
        // Prefer the session component when the client encodes one.
        match metadata_user.rsplit_once("session_") {
            Some((_, session)) if !session.is_empty() => Some(session.to_string()),
            _ => Some(metadata_user.to_string()),
        }
    }

    /// Resolve the session id for a request: claim the client's id when one
    /// was provided, otherwise derive a deterministic id so immediate
    /// client retries land in the same session.
    pub fn get_or_create_session_id(
        user_id: &str,
        key_id: &str,
        client_session_id: Option<&str>,
        first_message_hash: &str,
    ) -> String {
        if let Some(client) = client_session_id {
            let normalized = normalize_session_id(client);
            if !normalized.is_empty() {
                return normalized;
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(b"cch:session:");
        hasher.update(user_id.as_bytes());
        hasher.update(b":");
        hasher.update(key_id.as_bytes());
        hasher.update(b":");
        hasher.update(first_message_hash.as_bytes());
        let digest = hasher.finalize();
        format!("auto-{}", hex::encode(&digest[..8]))
    }

    /// Stable hash of the first message for deterministic session ids.
    pub fn first_message_hash(body: &serde_json::Value) -> String {
        let first = body
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|m| m.first())
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let raw = serde_json::to_string(&first).unwrap_or_default();
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(&digest[..8])
    }

    // ── sequencing ───────────────────────────────────────────────────────

    /// Atomically advance and return the session's request sequence.
    ///
    /// Strictly increasing and gap-free as long as the store is reachable;
    /// returns 0 (a sentinel clients never see as a real sequence) when the
    /// store is down, keeping the request itself alive.
    pub async fn next_request_sequence(&self, session_id: &str) -> i64 {
        let key = keys::session_field(session_id, "seq");
        match self.store.incr_ex(&key, self.ttl).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Sequence allocation failed");
                0
            }
        }
    }

    // ── hot fields ───────────────────────────────────────────────────────

    /// Refresh the session TTL after activity.
    pub async fn touch(&self, session_id: &str) {
        for field in ["seq", "last_provider", "counters"] {
            let key = keys::session_field(session_id, field);
            if let Err(e) = self.store.expire(&key, self.ttl).await {
                tracing::debug!(session = %session_id, error = %e, "Session touch failed");
                return;
            }
        }
    }

    pub async fn last_provider_id(&self, session_id: &str) -> Option<String> {
        let key = keys::session_field(session_id, "last_provider");
        self.store.get(&key).await.ok().flatten()
    }

    /// Record the provider that served this session last (affinity hint).
    /// A stale value is acceptable; failures only cost affinity.
    pub async fn set_last_provider_id(&self, session_id: &str, provider_id: &str) {
        let key = keys::session_field(session_id, "last_provider");
        if let Err(e) = self.store.set_ex(&key, provider_id, self.ttl).await {
            tracing::debug!(session = %session_id, error = %e, "Affinity write failed");
        }
    }

    /// Aggregate per-session usage counters.
    pub async fn record_usage(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        duration_ms: u64,
    ) {
        for (field, value) in [
            ("input_tokens", input_tokens as f64),
            ("output_tokens", output_tokens as f64),
            ("cost_usd", cost_usd),
            ("duration_ms", duration_ms as f64),
        ] {
            let key = keys::session_field(session_id, field);
            if let Err(e) = self.store.incr_by_float_ex(&key, value, self.ttl).await {
                tracing::debug!(session = %session_id, error = %e, "Session counter update failed");
                return;
            }
        }
    }

    /// Remember the input size of the session's last request; the usage
    /// estimator reads it to split cache-creation from cache-read tokens.
    pub async fn set_last_input_tokens(&self, session_id: &str, input_tokens: u64) {
        let key = keys::session_field(session_id, "last_input_tokens");
        if let Err(e) = self
            .store
            .set_ex(&key, &input_tokens.to_string(), self.ttl)
            .await
        {
            tracing::debug!(session = %session_id, error = %e, "Last-input write failed");
        }
    }

    pub async fn last_input_tokens(&self, session_id: &str) -> Option<u64> {
        let key = keys::session_field(session_id, "last_input_tokens");
        self.store
            .get(&key)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
    }

    // ── payload storage (policy-gated) ───────────────────────────────────

    /// Persist a request/response payload for the session, if the
    /// deployment opted in. Write-behind: never blocks the request path.
    pub fn store_payload(&self, session_id: &str, field: &'static str, payload: String) {
        if !self.store_messages {
            return;
        }
        let store = self.store.clone();
        let key = keys::session_payload(session_id, field);
        let ttl = self.ttl;
        let session = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_ex(&key, &payload, ttl).await {
                tracing::debug!(session = %session, error = %e, "Session payload write failed");
            }
        });
    }
}

/// Lowercase, keep `[a-z0-9._-]`, cap length. Everything else maps to `-`.
fn normalize_session_id(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .take(MAX_SESSION_ID_LEN)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.starts_with('-') {
        out.remove(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(300),
            false,
        )
    }

    #[test]
    fn extracts_session_from_anthropic_metadata() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({
            "metadata": {
                "user_id": "user_abc_account_def_session_0f1e2d3c"
            }
        });
        assert_eq!(
            SessionManager::extract_client_session_id(&headers, &body).as_deref(),
            Some("0f1e2d3c")
        );
    }

    #[test]
    fn header_hint_wins_over_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "client-session-1".parse().unwrap());
        let body = serde_json::json!({"metadata": {"user_id": "user_x_session_y"}});
        assert_eq!(
            SessionManager::extract_client_session_id(&headers, &body).as_deref(),
            Some("client-session-1")
        );
    }

    #[test]
    fn missing_hints_yield_none() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({"messages": []});
        assert!(SessionManager::extract_client_session_id(&headers, &body).is_none());
    }

    #[test]
    fn derived_ids_are_deterministic_per_context() {
        let a = SessionManager::get_or_create_session_id("u1", "k1", None, "hash1");
        let b = SessionManager::get_or_create_session_id("u1", "k1", None, "hash1");
        let c = SessionManager::get_or_create_session_id("u1", "k1", None, "hash2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("auto-"));
    }

    #[test]
    fn client_ids_are_normalized() {
        let id = SessionManager::get_or_create_session_id(
            "u1",
            "k1",
            Some("  My Session/ID!! "),
            "h",
        );
        assert_eq!(id, "my-session-id--");
    }

    #[tokio::test]
    async fn sequences_are_gap_free_under_concurrency() {
        let manager = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.next_request_sequence("s1").await
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        let expected: Vec<i64> = (1..=100).collect();
        assert_eq!(seen, expected, "sequence must be 1..=100 with no gaps");
    }

    #[tokio::test]
    async fn sequences_are_per_session() {
        let manager = manager();
        assert_eq!(manager.next_request_sequence("a").await, 1);
        assert_eq!(manager.next_request_sequence("a").await, 2);
        assert_eq!(manager.next_request_sequence("b").await, 1);
    }

    #[tokio::test]
    async fn affinity_round_trips() {
        let manager = manager();
        assert_eq!(manager.last_provider_id("s1").await, None);
        manager.set_last_provider_id("s1", "p9").await;
        assert_eq!(manager.last_provider_id("s1").await.as_deref(), Some("p9"));
    }

    #[tokio::test]
    async fn last_input_tokens_round_trip() {
        let manager = manager();
        assert_eq!(manager.last_input_tokens("s1").await, None);
        manager.set_last_input_tokens("s1", 1234).await;
        assert_eq!(manager.last_input_tokens("s1").await, Some(1234));
    }
}
