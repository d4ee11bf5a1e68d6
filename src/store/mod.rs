//! Shared counter store with pluggable backends.
//!
//! All rate-limit counters, session state and circuit-breaker state live
//! behind the [`SharedStore`] trait so multiple gateway processes can share
//! them through Redis, while tests and single-process deployments run on the
//! in-memory backend with identical semantics.
//!
//! Every multi-step operation the limiter depends on (trim-and-sum,
//! compare-and-insert) is a single trait method, executed atomically by the
//! backend: a Lua script in Redis, a mutex-serialized closure in memory.
//! Callers never read-modify-write counters from application code.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Channel used to broadcast configuration invalidations between processes.
pub const INVALIDATION_CHANNEL: &str = "provider_cache_invalidate";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store operation timed out")]
    Timeout,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an atomic compare-and-insert into a bounded sorted set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckAndInsert {
    /// Whether the caller may proceed.
    pub allowed: bool,
    /// Live cardinality after the operation.
    pub count: u64,
    /// Whether this call inserted the member (caller owns the removal).
    pub inserted: bool,
}

/// Result of an atomic bounded cost reservation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostAdmit {
    /// Whether the reservation was applied.
    pub allowed: bool,
    /// Window total after the operation (unchanged when denied).
    pub current: f64,
}

/// Key-value + sorted-set operations required by the gateway.
///
/// Scores are millisecond timestamps throughout. A `ttl` of zero means
/// "no expiry".
#[async_trait]
pub trait SharedStore: Send + Sync {
    // ── plain values ─────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Extend a key's TTL without touching the value. No-op if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    // ── counters ─────────────────────────────────────────────────────────

    /// `INCRBYFLOAT` + `EXPIRE` in one step; returns the new value.
    async fn incr_by_float_ex(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64>;

    /// Integer `INCR` + `EXPIRE` in one step; returns the new value.
    /// Used for gap-free session sequences.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>>;

    // ── sorted sets ──────────────────────────────────────────────────────

    /// Unconditional `ZADD` + `EXPIRE`.
    async fn zadd_ex(&self, key: &str, member: &str, score: f64, ttl: Duration) -> StoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Drop members scored below `cutoff`, then return the cardinality.
    async fn zcount_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<u64>;

    /// Drop members scored below `cutoff`, then sum the cost component of
    /// the remaining members (format `{timestamp_ms}:{request_id}:{cost}`).
    async fn zsum_costs_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<f64>;

    /// Atomic bounded float increment: add `delta` iff the stored value plus
    /// `delta` stays within `limit`. This is the no-double-spend primitive
    /// for fixed cost windows.
    async fn incr_if_sum_below(
        &self,
        key: &str,
        delta: f64,
        limit: f64,
        ttl: Duration,
    ) -> StoreResult<CostAdmit>;

    /// Atomic bounded rolling-window reservation: trim below `cutoff`, sum
    /// the cost components, and insert `member` carrying `cost` iff the sum
    /// plus `cost` stays within `limit`.
    async fn zadd_if_sum_below(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cutoff: f64,
        cost: f64,
        limit: f64,
        ttl: Duration,
    ) -> StoreResult<CostAdmit>;

    /// Atomic bounded insert: trim below `cutoff`, then insert `member` iff
    /// it is absent and the live count is below `limit`. An already-present
    /// member is allowed without insertion (its score is refreshed).
    async fn zadd_if_below(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> StoreResult<CheckAndInsert>;

    // ── pub/sub ──────────────────────────────────────────────────────────

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Subscribe to a channel; messages arrive on the returned receiver
    /// until the subscription task is dropped.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> StoreResult<tokio::sync::mpsc::Receiver<String>>;
}

/// Key naming helpers shared by all store clients.
pub mod keys {
    /// Fixed cost window: `{subject}:{id}:cost_{scope}_{suffix}`.
    pub fn fixed_cost(subject: &str, id: &str, scope: &str, suffix: &str) -> String {
        format!("{subject}:{id}:cost_{scope}_{suffix}")
    }

    /// Rolling cost window sorted set.
    pub fn rolling_cost(subject: &str, id: &str, scope: &str) -> String {
        format!("{subject}:{id}:cost_{scope}_rolling")
    }

    /// RPM timestamp sorted set.
    pub fn rpm(subject: &str, id: &str) -> String {
        format!("{subject}:{id}:rpm")
    }

    /// Live-session sorted set for concurrency tracking.
    pub fn sessions(subject: &str, id: &str) -> String {
        format!("{subject}:{id}:sessions")
    }

    pub fn session_field(session_id: &str, field: &str) -> String {
        format!("session:{session_id}:{field}")
    }

    pub fn session_payload(session_id: &str, field: &str) -> String {
        format!("session:{session_id}:payload:{field}")
    }

    pub fn breaker_provider(provider_id: &str) -> String {
        format!("breaker:provider:{provider_id}")
    }

    pub fn breaker_vendor(scope: &str) -> String {
        format!("breaker:vendor:{scope}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(
            keys::fixed_cost("key", "k1", "daily", "0930"),
            "key:k1:cost_daily_0930"
        );
        assert_eq!(
            keys::rolling_cost("user", "u1", "five_hour"),
            "user:u1:cost_five_hour_rolling"
        );
        assert_eq!(keys::sessions("provider", "p1"), "provider:p1:sessions");
        assert_eq!(
            keys::breaker_vendor("anthropic:claude"),
            "breaker:vendor:anthropic:claude"
        );
    }
}
