//! Multi-window rate limiting over the shared store.
//!
//! Six limit categories per (subject, scope): rolling 5-hour, daily
//! (fixed or rolling), weekly, monthly, lifetime total, RPM and concurrent
//! sessions. Cost admission is reservation-based: the estimated request
//! cost is reserved in every configured window as one atomic store
//! operation per window, so two requests racing on the last dollar of
//! quota cannot both be admitted. After the request completes the
//! reservation is settled to the actual cost (or released on paths that
//! never reached an upstream).
//!
//! The limiter itself is never a reason to reject: when the store is
//! unreachable or slow (> 50 ms) the check fails open, logs a warning and
//! bumps `fail_open_count`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveTime, Timelike, Utc};
use tokio::sync::RwLock;

use crate::db::ConfigDb;
use crate::models::{DailyResetMode, QuotaLimits};
use crate::store::{keys, CheckAndInsert, SharedStore};

const STORE_OP_TIMEOUT: Duration = Duration::from_millis(50);
const FIVE_HOURS_MS: i64 = 5 * 3600 * 1000;
const DAY_MS: i64 = 24 * 3600 * 1000;
const RPM_WINDOW_MS: i64 = 60_000;
const TOTAL_COST_CACHE_TTL: Duration = Duration::from_secs(300);

/// Why a request was not admitted.
#[derive(Debug, Clone)]
pub struct LimitExceeded {
    /// e.g. `key_five_hour`, `user_rpm`, `provider_concurrent`.
    pub scope: String,
    pub current: f64,
    pub limit: f64,
    pub message: String,
}

/// Admission decision: `None` reason means allowed.
#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub allowed: bool,
    pub reason: Option<LimitExceeded>,
}

impl LimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: LimitExceeded) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Result of the concurrency compare-and-insert.
#[derive(Debug, Clone, Copy)]
pub struct SessionTrack {
    pub allowed: bool,
    pub count: u64,
    /// When true the caller owns the later `untrack` call.
    pub tracked: bool,
}

/// One window holding a cost reservation.
#[derive(Debug, Clone)]
enum ReservedWindow {
    Rolling {
        key: String,
        member: String,
        score: f64,
        ttl: Duration,
    },
    Fixed {
        key: String,
        reserved: f64,
        ttl: Duration,
    },
}

/// Reserved estimated cost across a subject's windows. Settle with the
/// actual cost after accounting, or release on paths that never spent.
#[derive(Debug, Default)]
pub struct CostReservation {
    subject: String,
    id: String,
    request_id: String,
    windows: Vec<ReservedWindow>,
}

impl CostReservation {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Display label for limit messages; the wire format keeps the subject in
/// English and the reason in the operator's language.
fn subject_label(subject: &str) -> &'static str {
    match subject {
        "user" => "User",
        "key" => "Key",
        "provider" => "Provider",
        _ => "Subject",
    }
}

fn window_message(subject: &str, scope: &str, current: f64, limit: f64) -> String {
    let label = subject_label(subject);
    let noun = match scope {
        "five_hour" => "5小时消费上限已达到",
        "daily" => "每日消费上限已达到",
        "weekly" => "每周消费上限已达到",
        "monthly" => "每月消费上限已达到",
        "total" => "总消费上限已达到",
        _ => "消费上限已达到",
    };
    format!("{label} {noun}（{current:.4}/{limit}）")
}

#[derive(Clone)]
struct CachedTotal {
    value: f64,
    fetched_at: Instant,
}

/// Rate limit service over a [`SharedStore`].
pub struct RateLimitService {
    store: Arc<dyn SharedStore>,
    db: ConfigDb,
    enabled: bool,
    session_ttl: Duration,
    fail_open_count: AtomicU64,
    /// (subject_column, id) → lifetime spend, cached 5 minutes.
    total_costs: RwLock<HashMap<(&'static str, String), CachedTotal>>,
}

impl RateLimitService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        db: ConfigDb,
        enabled: bool,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            db,
            enabled,
            session_ttl,
            fail_open_count: AtomicU64::new(0),
            total_costs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of checks that failed open because the store was unavailable.
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open_count.load(Ordering::Relaxed)
    }

    /// Run a store operation under the fail-open policy. `None` means the
    /// store was unavailable and the caller must treat the check as passed.
    async fn store_op<T, F>(&self, what: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = crate::store::StoreResult<T>>,
    {
        match tokio::time::timeout(STORE_OP_TIMEOUT, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op = what, error = %e, "Shared store error, failing open");
                None
            }
            Err(_) => {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op = what, "Shared store timeout, failing open");
                None
            }
        }
    }

    // ── cost windows ─────────────────────────────────────────────────────

    /// Reserve `estimated_cost` in every configured window, in order
    /// 5h → daily → weekly → monthly; first exceedance wins and rolls back
    /// the windows already reserved.
    pub async fn check_cost_limits(
        &self,
        subject: &str,
        id: &str,
        limits: &QuotaLimits,
        reset_time: &str,
        reset_mode: DailyResetMode,
        estimated_cost: f64,
        request_id: &str,
    ) -> (LimitDecision, CostReservation) {
        let mut reservation = CostReservation {
            subject: subject.to_string(),
            id: id.to_string(),
            request_id: request_id.to_string(),
            windows: Vec::new(),
        };
        if !self.enabled {
            return (LimitDecision::allow(), reservation);
        }
        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{now_ms}:{request_id}:{estimated_cost}");

        // Window plan, in check order.
        struct Plan {
            scope: &'static str,
            limit: f64,
            rolling: bool,
            key: String,
            window_ms: i64,
            ttl: Duration,
        }
        let mut plans = Vec::new();
        if let Some(limit) = limits.five_hour_usd {
            plans.push(Plan {
                scope: "five_hour",
                limit,
                rolling: true,
                key: keys::rolling_cost(subject, id, "five_hour"),
                window_ms: FIVE_HOURS_MS,
                ttl: Duration::from_millis(FIVE_HOURS_MS as u64),
            });
        }
        if let Some(limit) = limits.daily_usd {
            match reset_mode {
                DailyResetMode::Rolling => plans.push(Plan {
                    scope: "daily",
                    limit,
                    rolling: true,
                    key: keys::rolling_cost(subject, id, "daily"),
                    window_ms: DAY_MS,
                    ttl: Duration::from_millis(DAY_MS as u64),
                }),
                DailyResetMode::Fixed => plans.push(Plan {
                    scope: "daily",
                    limit,
                    rolling: false,
                    key: keys::fixed_cost(subject, id, "daily", &reset_suffix(reset_time)),
                    window_ms: 0,
                    ttl: until_next_local_reset(reset_time),
                }),
            }
        }
        for (scope, limit) in [("weekly", limits.weekly_usd), ("monthly", limits.monthly_usd)] {
            if let Some(limit) = limit {
                plans.push(Plan {
                    scope,
                    limit,
                    rolling: false,
                    key: keys::fixed_cost(subject, id, scope, &calendar_suffix(scope)),
                    window_ms: 0,
                    ttl: if scope == "weekly" {
                        Duration::from_secs(8 * 24 * 3600)
                    } else {
                        Duration::from_secs(32 * 24 * 3600)
                    },
                });
            }
        }

        for plan in plans {
            let admit = if plan.rolling {
                self.store_op(
                    "rolling_reserve",
                    self.store.zadd_if_sum_below(
                        &plan.key,
                        &member,
                        now_ms as f64,
                        (now_ms - plan.window_ms) as f64,
                        estimated_cost,
                        plan.limit,
                        plan.ttl,
                    ),
                )
                .await
            } else {
                self.store_op(
                    "fixed_reserve",
                    self.store
                        .incr_if_sum_below(&plan.key, estimated_cost, plan.limit, plan.ttl),
                )
                .await
            };
            match admit {
                // Fail-open: this window is neither checked nor reserved.
                None => continue,
                Some(admit) if admit.allowed => {
                    reservation.windows.push(if plan.rolling {
                        ReservedWindow::Rolling {
                            key: plan.key,
                            member: member.clone(),
                            score: now_ms as f64,
                            ttl: plan.ttl,
                        }
                    } else {
                        ReservedWindow::Fixed {
                            key: plan.key,
                            reserved: estimated_cost,
                            ttl: plan.ttl,
                        }
                    });
                }
                Some(admit) => {
                    let reason = LimitExceeded {
                        scope: format!("{subject}_{}", plan.scope),
                        current: admit.current,
                        limit: plan.limit,
                        message: window_message(subject, plan.scope, admit.current, plan.limit),
                    };
                    self.release(reservation).await;
                    return (LimitDecision::deny(reason), CostReservation::default());
                }
            }
        }

        (LimitDecision::allow(), reservation)
    }

    /// Replace a reservation with the actual request cost.
    pub async fn settle(&self, reservation: CostReservation, actual_cost: f64) {
        let now_ms = Utc::now().timestamp_millis();
        for window in &reservation.windows {
            match window {
                ReservedWindow::Rolling {
                    key,
                    member,
                    score,
                    ttl,
                } => {
                    self.store_op("settle_zrem", self.store.zrem(key, member)).await;
                    if actual_cost > 0.0 {
                        let settled =
                            format!("{now_ms}:{}:{actual_cost}", reservation.request_id);
                        self.store_op(
                            "settle_zadd",
                            self.store.zadd_ex(key, &settled, *score, *ttl),
                        )
                        .await;
                    }
                }
                ReservedWindow::Fixed { key, reserved, ttl } => {
                    let delta = actual_cost - reserved;
                    if delta.abs() > f64::EPSILON {
                        self.store_op(
                            "settle_incr",
                            self.store.incr_by_float_ex(key, delta, *ttl),
                        )
                        .await;
                    }
                }
            }
        }
        if actual_cost > 0.0 {
            self.invalidate_total(subject_column_for(&reservation.subject), &reservation.id)
                .await;
        }
    }

    /// Roll a reservation back without recording any cost.
    pub async fn release(&self, reservation: CostReservation) {
        for window in &reservation.windows {
            match window {
                ReservedWindow::Rolling { key, member, .. } => {
                    self.store_op("release_zrem", self.store.zrem(key, member)).await;
                }
                ReservedWindow::Fixed { key, reserved, ttl } => {
                    if *reserved > 0.0 {
                        self.store_op(
                            "release_incr",
                            self.store.incr_by_float_ex(key, -reserved, *ttl),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Read-only window check (no reservation), used for provider quota
    /// pre-checks in the resolver.
    pub async fn windows_within_limits(
        &self,
        subject: &str,
        id: &str,
        limits: &QuotaLimits,
    ) -> bool {
        if !self.enabled || limits.is_unlimited() {
            return true;
        }
        let now_ms = Utc::now().timestamp_millis();

        if let Some(limit) = limits.five_hour_usd {
            let key = keys::rolling_cost(subject, id, "five_hour");
            let cutoff = (now_ms - FIVE_HOURS_MS) as f64;
            if let Some(current) = self
                .store_op("five_hour_sum", self.store.zsum_costs_after_trim(&key, cutoff))
                .await
            {
                if current >= limit {
                    return false;
                }
            }
        }
        if let Some(limit) = limits.daily_usd {
            let key = keys::fixed_cost(subject, id, "daily", "0000");
            if let Some(current) = self
                .store_op("daily_get", self.store.get_float(&key))
                .await
                .map(|v| v.unwrap_or(0.0))
            {
                if current >= limit {
                    return false;
                }
            }
        }
        for (scope, limit) in [("weekly", limits.weekly_usd), ("monthly", limits.monthly_usd)] {
            let Some(limit) = limit else { continue };
            let key = keys::fixed_cost(subject, id, scope, &calendar_suffix(scope));
            if let Some(current) = self
                .store_op("calendar_get", self.store.get_float(&key))
                .await
                .map(|v| v.unwrap_or(0.0))
            {
                if current >= limit {
                    return false;
                }
            }
        }
        true
    }

    /// Lifetime total spend from the outcome store, cached for 5 minutes.
    pub async fn check_total_cost(
        &self,
        subject: &str,
        subject_column: &'static str,
        id: &str,
        limit: Option<f64>,
        estimated_cost: f64,
    ) -> LimitDecision {
        if !self.enabled {
            return LimitDecision::allow();
        }
        let Some(limit) = limit else {
            return LimitDecision::allow();
        };

        let cache_key = (subject_column, id.to_string());
        let cached = {
            let cache = self.total_costs.read().await;
            cache.get(&cache_key).and_then(|c| {
                (c.fetched_at.elapsed() < TOTAL_COST_CACHE_TTL).then_some(c.value)
            })
        };
        let current = match cached {
            Some(v) => v,
            None => match self.db.sum_cost(subject_column, id).await {
                Ok(v) => {
                    let mut cache = self.total_costs.write().await;
                    cache.insert(
                        cache_key,
                        CachedTotal {
                            value: v,
                            fetched_at: Instant::now(),
                        },
                    );
                    v
                }
                Err(e) => {
                    // Same fail-open stance as the shared store.
                    self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Total-cost query failed, failing open");
                    return LimitDecision::allow();
                }
            },
        };

        if current + estimated_cost > limit {
            return LimitDecision::deny(LimitExceeded {
                scope: format!("{subject}_total"),
                current,
                limit,
                message: window_message(subject, "total", current, limit),
            });
        }
        LimitDecision::allow()
    }

    // ── RPM ──────────────────────────────────────────────────────────────

    /// Allowed when fewer than `limit` requests landed in the last 60 s;
    /// inserts the current timestamp on admission.
    pub async fn check_rpm(&self, subject: &str, id: &str, limit: Option<u32>) -> LimitDecision {
        if !self.enabled {
            return LimitDecision::allow();
        }
        let Some(limit) = limit else {
            return LimitDecision::allow();
        };
        let now_ms = Utc::now().timestamp_millis();
        let key = keys::rpm(subject, id);
        let member = format!("{}:{}", now_ms, uuid::Uuid::new_v4());
        let result = self
            .store_op(
                "rpm_check",
                self.store.zadd_if_below(
                    &key,
                    &member,
                    now_ms as f64,
                    (now_ms - RPM_WINDOW_MS) as f64,
                    limit as u64,
                    Duration::from_millis(2 * RPM_WINDOW_MS as u64),
                ),
            )
            .await;
        match result {
            None => LimitDecision::allow(),
            Some(CheckAndInsert { allowed: true, .. }) => LimitDecision::allow(),
            Some(CheckAndInsert { count, .. }) => LimitDecision::deny(LimitExceeded {
                scope: format!("{subject}_rpm"),
                current: count as f64,
                limit: limit as f64,
                message: format!(
                    "{} 请求频率上限已达到（{}/{}）",
                    subject_label(subject),
                    count,
                    limit
                ),
            }),
        }
    }

    // ── concurrency ──────────────────────────────────────────────────────

    /// Atomic compare-and-insert of a session into a subject's live set.
    /// `tracked = true` means this call inserted and the caller must
    /// eventually `untrack`.
    pub async fn check_and_track_session(
        &self,
        subject: &str,
        id: &str,
        session_id: &str,
        limit: Option<u32>,
    ) -> SessionTrack {
        let now_ms = Utc::now().timestamp_millis();
        let key = keys::sessions(subject, id);
        let cutoff = (now_ms - self.session_ttl.as_millis() as i64) as f64;
        // Unlimited subjects still track (for observability), with a cap no
        // deployment reaches.
        let effective_limit = limit.map(|l| l as u64).unwrap_or(u64::MAX / 2);
        let result = self
            .store_op(
                "session_track",
                self.store.zadd_if_below(
                    &key,
                    session_id,
                    now_ms as f64,
                    cutoff,
                    effective_limit,
                    self.session_ttl * 2,
                ),
            )
            .await;
        match result {
            None => SessionTrack {
                allowed: true,
                count: 0,
                tracked: false,
            },
            Some(r) => SessionTrack {
                allowed: r.allowed,
                count: r.count,
                tracked: r.inserted,
            },
        }
    }

    pub async fn untrack_session(&self, subject: &str, id: &str, session_id: &str) {
        let key = keys::sessions(subject, id);
        self.store_op("session_untrack", self.store.zrem(&key, session_id))
            .await;
    }

    /// Denial message for a concurrency rejection.
    pub fn concurrency_message(subject: &str, count: u64, limit: u32) -> String {
        format!(
            "{} 并发会话上限已达到（{}/{}）",
            subject_label(subject),
            count,
            limit
        )
    }

    // ── post-request tracking (providers) ────────────────────────────────

    /// Record a request's cost in every window for one subject. Used for
    /// providers, whose admission is a read-only pre-check rather than a
    /// reservation.
    pub async fn track_subject_cost(
        &self,
        subject: &str,
        id: &str,
        request_id: &str,
        cost: f64,
        reset_time: &str,
        reset_mode: DailyResetMode,
    ) {
        if cost <= 0.0 {
            return;
        }
        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{now_ms}:{request_id}:{cost}");

        let key = keys::rolling_cost(subject, id, "five_hour");
        self.store_op(
            "five_hour_track",
            self.store.zadd_ex(
                &key,
                &member,
                now_ms as f64,
                Duration::from_millis(FIVE_HOURS_MS as u64),
            ),
        )
        .await;

        match reset_mode {
            DailyResetMode::Rolling => {
                let key = keys::rolling_cost(subject, id, "daily");
                self.store_op(
                    "daily_rolling_track",
                    self.store
                        .zadd_ex(&key, &member, now_ms as f64, Duration::from_secs(24 * 3600)),
                )
                .await;
            }
            DailyResetMode::Fixed => {
                let key = keys::fixed_cost(subject, id, "daily", &reset_suffix(reset_time));
                let ttl = until_next_local_reset(reset_time);
                self.store_op(
                    "daily_fixed_track",
                    self.store.incr_by_float_ex(&key, cost, ttl),
                )
                .await;
            }
        }

        for scope in ["weekly", "monthly"] {
            let key = keys::fixed_cost(subject, id, scope, &calendar_suffix(scope));
            let ttl = if scope == "weekly" {
                Duration::from_secs(8 * 24 * 3600)
            } else {
                Duration::from_secs(32 * 24 * 3600)
            };
            self.store_op(
                "calendar_track",
                self.store.incr_by_float_ex(&key, cost, ttl),
            )
            .await;
        }

        // The lifetime total changed; next check re-reads the outcome store.
        self.invalidate_total(subject_column_for(subject), id).await;
    }

    async fn invalidate_total(&self, subject_column: &'static str, id: &str) {
        let mut cache = self.total_costs.write().await;
        cache.remove(&(subject_column, id.to_string()));
    }
}

fn subject_column_for(subject: &str) -> &'static str {
    match subject {
        "user" => "user_id",
        "provider" => "provider_id",
        _ => "key_id",
    }
}

/// `HH:MM` → `HHMM` key suffix; malformed values fall back to midnight.
fn reset_suffix(reset_time: &str) -> String {
    match NaiveTime::parse_from_str(reset_time, "%H:%M") {
        Ok(t) => format!("{:02}{:02}", t.hour(), t.minute()),
        Err(_) => "0000".to_string(),
    }
}

/// Duration until the next local occurrence of `HH:MM`.
///
/// Computed against the local calendar, so windows around DST transitions
/// are naturally 23 or 25 hours long. Ambiguous or skipped local times
/// resolve to the earliest valid instant.
fn until_next_local_reset(reset_time: &str) -> Duration {
    let reset = NaiveTime::parse_from_str(reset_time, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is valid"));
    let now = Local::now();
    let today = now.date_naive();
    let mut candidate = today.and_time(reset);
    if candidate <= now.naive_local() {
        candidate += chrono::Duration::days(1);
    }
    let target = match candidate.and_local_timezone(Local) {
        chrono::LocalResult::Single(t) => t,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        // Skipped by a DST jump; push past the gap.
        chrono::LocalResult::None => {
            match (candidate + chrono::Duration::hours(1)).and_local_timezone(Local) {
                chrono::LocalResult::Single(t) => t,
                chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                chrono::LocalResult::None => now + chrono::Duration::days(1),
            }
        }
    };
    (target - now)
        .to_std()
        .unwrap_or(Duration::from_secs(24 * 3600))
}

/// Calendar key suffix for weekly (`2026w31`) and monthly (`202608`) windows.
fn calendar_suffix(scope: &str) -> String {
    let today = Local::now().date_naive();
    match scope {
        "weekly" => {
            let week = today.iso_week();
            format!("{}w{:02}", week.year(), week.week())
        }
        _ => format!("{}{:02}", today.year(), today.month()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CostAdmit, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;

    fn service(store: Arc<dyn SharedStore>) -> RateLimitService {
        let db = ConfigDb::open_in_memory().unwrap();
        RateLimitService::new(store, db, true, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn first_exceeded_window_wins_in_order() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        let limits = QuotaLimits {
            five_hour_usd: Some(1.0),
            daily_usd: Some(0.5),
            ..Default::default()
        };
        // Spend 0.8: above daily, below 5h. 5h is checked first but passes;
        // daily trips.
        svc.track_subject_cost("key", "k1", "r0", 0.8, "00:00", DailyResetMode::Fixed)
            .await;
        let (decision, reservation) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.0, "r1")
            .await;
        assert!(!decision.allowed);
        assert!(reservation.is_empty());
        assert_eq!(decision.reason.unwrap().scope, "key_daily");
    }

    #[tokio::test]
    async fn five_hour_message_matches_wire_format() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        let limits = QuotaLimits {
            five_hour_usd: Some(1.0),
            ..Default::default()
        };
        svc.track_subject_cost("key", "k1", "r0", 0.99, "00:00", DailyResetMode::Fixed)
            .await;
        let (decision, _) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.05, "r1")
            .await;
        assert!(!decision.allowed);
        let reason = decision.reason.unwrap();
        assert_eq!(reason.message, "Key 5小时消费上限已达到（0.9900/1）");
    }

    #[tokio::test]
    async fn concurrent_requests_cannot_double_spend() {
        // Property: with limitDailyUsd = X and per-request cost c, at most
        // ceil(X / c) of N concurrent requests are admitted.
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = Arc::new(service(store));
        let limit = 1.0;
        let cost = 0.3; // ceil(1.0 / 0.3) = 4 admissions at most

        let mut handles = Vec::new();
        for i in 0..20 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let (decision, reservation) = svc
                    .check_cost_limits(
                        "key",
                        "k1",
                        &QuotaLimits {
                            daily_usd: Some(limit),
                            ..Default::default()
                        },
                        "00:00",
                        DailyResetMode::Rolling,
                        cost,
                        &format!("r{i}"),
                    )
                    .await;
                if decision.allowed {
                    svc.settle(reservation, cost).await;
                    1u32
                } else {
                    0u32
                }
            }));
        }
        let mut admitted = 0;
        for h in handles {
            admitted += h.await.unwrap();
        }
        assert!(admitted >= 1, "at least one request must land");
        assert!(admitted <= 4, "admitted {admitted}, double spend");
    }

    #[tokio::test]
    async fn released_reservation_costs_nothing() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        let limits = QuotaLimits {
            daily_usd: Some(1.0),
            ..Default::default()
        };
        let (decision, reservation) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.9, "r1")
            .await;
        assert!(decision.allowed);
        svc.release(reservation).await;

        // The full budget is available again.
        let (second, reservation) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.9, "r2")
            .await;
        assert!(second.allowed);
        svc.settle(reservation, 0.9).await;

        let (third, _) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.2, "r3")
            .await;
        assert!(!third.allowed);
    }

    #[tokio::test]
    async fn settle_replaces_estimate_with_actual() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        let limits = QuotaLimits {
            five_hour_usd: Some(1.0),
            ..Default::default()
        };
        let (decision, reservation) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.9, "r1")
            .await;
        assert!(decision.allowed);
        // Actual cost was far below the estimate.
        svc.settle(reservation, 0.1).await;

        let (second, _) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 0.8, "r2")
            .await;
        assert!(second.allowed);
    }

    #[tokio::test]
    async fn rpm_inserts_on_allow_and_denies_at_limit() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        for _ in 0..3 {
            assert!(svc.check_rpm("user", "u1", Some(3)).await.allowed);
        }
        let denied = svc.check_rpm("user", "u1", Some(3)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason.unwrap().scope, "user_rpm");
        // No limit, no bookkeeping failure.
        assert!(svc.check_rpm("user", "u1", None).await.allowed);
    }

    #[tokio::test]
    async fn session_tracking_is_idempotent_per_session() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let svc = service(store);
        let first = svc
            .check_and_track_session("provider", "p1", "s1", Some(2))
            .await;
        assert!(first.allowed && first.tracked);
        // Same session re-entering does not consume another slot.
        let again = svc
            .check_and_track_session("provider", "p1", "s1", Some(2))
            .await;
        assert!(again.allowed && !again.tracked);

        assert!(
            svc.check_and_track_session("provider", "p1", "s2", Some(2))
                .await
                .allowed
        );
        let third = svc
            .check_and_track_session("provider", "p1", "s3", Some(2))
            .await;
        assert!(!third.allowed);

        svc.untrack_session("provider", "p1", "s1").await;
        assert!(
            svc.check_and_track_session("provider", "p1", "s3", Some(2))
                .await
                .allowed
        );
    }

    struct FailingStore;

    macro_rules! fail {
        () => {
            Err(StoreError::Backend("down".into()))
        };
    }

    #[async_trait]
    impl SharedStore for FailingStore {
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            fail!()
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> StoreResult<()> {
            fail!()
        }
        async fn delete(&self, _: &str) -> StoreResult<()> {
            fail!()
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<()> {
            fail!()
        }
        async fn incr_by_float_ex(&self, _: &str, _: f64, _: Duration) -> StoreResult<f64> {
            fail!()
        }
        async fn incr_ex(&self, _: &str, _: Duration) -> StoreResult<i64> {
            fail!()
        }
        async fn get_float(&self, _: &str) -> StoreResult<Option<f64>> {
            fail!()
        }
        async fn zadd_ex(&self, _: &str, _: &str, _: f64, _: Duration) -> StoreResult<()> {
            fail!()
        }
        async fn zrem(&self, _: &str, _: &str) -> StoreResult<()> {
            fail!()
        }
        async fn zcount_after_trim(&self, _: &str, _: f64) -> StoreResult<u64> {
            fail!()
        }
        async fn zsum_costs_after_trim(&self, _: &str, _: f64) -> StoreResult<f64> {
            fail!()
        }
        async fn incr_if_sum_below(
            &self,
            _: &str,
            _: f64,
            _: f64,
            _: Duration,
        ) -> StoreResult<CostAdmit> {
            fail!()
        }
        async fn zadd_if_sum_below(
            &self,
            _: &str,
            _: &str,
            _: f64,
            _: f64,
            _: f64,
            _: f64,
            _: Duration,
        ) -> StoreResult<CostAdmit> {
            fail!()
        }
        async fn zadd_if_below(
            &self,
            _: &str,
            _: &str,
            _: f64,
            _: f64,
            _: u64,
            _: Duration,
        ) -> StoreResult<CheckAndInsert> {
            fail!()
        }
        async fn publish(&self, _: &str, _: &str) -> StoreResult<()> {
            fail!()
        }
        async fn subscribe(&self, _: &str) -> StoreResult<tokio::sync::mpsc::Receiver<String>> {
            fail!()
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_open_everywhere() {
        let svc = service(Arc::new(FailingStore));
        let limits = QuotaLimits {
            five_hour_usd: Some(0.01),
            daily_usd: Some(0.01),
            weekly_usd: Some(0.01),
            monthly_usd: Some(0.01),
            rpm: Some(1),
            concurrent_sessions: Some(1),
            ..Default::default()
        };
        let (decision, _) = svc
            .check_cost_limits("key", "k1", &limits, "00:00", DailyResetMode::Fixed, 100.0, "r1")
            .await;
        assert!(decision.allowed);
        assert!(svc.check_rpm("key", "k1", limits.rpm).await.allowed);
        assert!(
            svc.check_and_track_session("provider", "p1", "s1", Some(1))
                .await
                .allowed
        );
        assert!(svc.fail_open_count() >= 3);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows_but_still_tracks() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let db = ConfigDb::open_in_memory().unwrap();
        let svc = RateLimitService::new(store, db, false, Duration::from_secs(300));
        svc.track_subject_cost("key", "k1", "r1", 5.0, "00:00", DailyResetMode::Fixed)
            .await;
        let (decision, _) = svc
            .check_cost_limits(
                "key",
                "k1",
                &QuotaLimits {
                    daily_usd: Some(1.0),
                    ..Default::default()
                },
                "00:00",
                DailyResetMode::Fixed,
                0.0,
                "r2",
            )
            .await;
        assert!(decision.allowed);
    }

    #[test]
    fn reset_suffix_formats() {
        assert_eq!(reset_suffix("09:30"), "0930");
        assert_eq!(reset_suffix("00:00"), "0000");
        assert_eq!(reset_suffix("garbage"), "0000");
    }

    #[test]
    fn next_local_reset_is_within_a_day() {
        let d = until_next_local_reset("00:00");
        assert!(d <= Duration::from_secs(25 * 3600));
        assert!(d > Duration::ZERO);
    }
}
