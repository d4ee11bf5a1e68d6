//! In-process store backend.
//!
//! Every operation runs under a single mutex, which makes the multi-step
//! operations exactly as atomic as the Lua scripts in the Redis backend.
//! Used by tests and by single-process deployments without `REDIS_URL`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{CheckAndInsert, CostAdmit, SharedStore, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct ZSet {
    /// member → score
    members: BTreeMap<String, f64>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, ZSet>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// In-memory [`SharedStore`] backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}

fn live_entry<'a>(strings: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
    let expired = strings
        .get(key)
        .map(|e| e.expires_at.map(|t| t <= Instant::now()).unwrap_or(false))
        .unwrap_or(false);
    if expired {
        strings.remove(key);
    }
    strings.get(key)
}

fn live_zset<'a>(zsets: &'a mut HashMap<String, ZSet>, key: &str) -> Option<&'a mut ZSet> {
    let expired = zsets
        .get(key)
        .map(|z| z.expires_at.map(|t| t <= Instant::now()).unwrap_or(false))
        .unwrap_or(false);
    if expired {
        zsets.remove(key);
    }
    zsets.get_mut(key)
}

/// Like [`live_zset`] but creates an empty set when the key is absent.
fn live_zset_or_default<'a>(zsets: &'a mut HashMap<String, ZSet>, key: &str) -> &'a mut ZSet {
    let expired = zsets
        .get(key)
        .map(|z| z.expires_at.map(|t| t <= Instant::now()).unwrap_or(false))
        .unwrap_or(false);
    if expired {
        zsets.remove(key);
    }
    zsets.entry(key.to_string()).or_default()
}

fn trim_below(zset: &mut ZSet, cutoff: f64) {
    zset.members.retain(|_, score| *score >= cutoff);
}

/// Cost component of a rolling-window member (`ts:request_id:cost`).
fn member_cost(member: &str) -> f64 {
    member
        .rsplit(':')
        .next()
        .and_then(|c| c.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(live_entry(&mut inner.strings, key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.strings.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let expires_at = Self::expiry(ttl);
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = expires_at;
        }
        if let Some(zset) = inner.zsets.get_mut(key) {
            zset.expires_at = expires_at;
        }
        Ok(())
    }

    async fn incr_by_float_ex(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let current = live_entry(&mut inner.strings, key)
            .and_then(|e| e.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(next)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let current = live_entry(&mut inner.strings, key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(next)
    }

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(live_entry(&mut inner.strings, key).and_then(|e| e.value.parse::<f64>().ok()))
    }

    async fn zadd_ex(&self, key: &str, member: &str, score: f64, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let expires_at = Self::expiry(ttl);
        let zset = live_zset_or_default(&mut inner.zsets, key);
        zset.members.insert(member.to_string(), score);
        zset.expires_at = expires_at;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(zset) = live_zset(&mut inner.zsets, key) {
            zset.members.remove(member);
        }
        Ok(())
    }

    async fn zcount_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match live_zset(&mut inner.zsets, key) {
            Some(zset) => {
                trim_below(zset, cutoff);
                Ok(zset.members.len() as u64)
            }
            None => Ok(0),
        }
    }

    async fn zsum_costs_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<f64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match live_zset(&mut inner.zsets, key) {
            Some(zset) => {
                trim_below(zset, cutoff);
                Ok(zset.members.keys().map(|m| member_cost(m)).sum())
            }
            None => Ok(0.0),
        }
    }

    async fn incr_if_sum_below(
        &self,
        key: &str,
        delta: f64,
        limit: f64,
        ttl: Duration,
    ) -> StoreResult<CostAdmit> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let current = live_entry(&mut inner.strings, key)
            .and_then(|e| e.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        if current + delta > limit {
            return Ok(CostAdmit {
                allowed: false,
                current,
            });
        }
        let next = current + delta;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(CostAdmit {
            allowed: true,
            current: next,
        })
    }

    async fn zadd_if_sum_below(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cutoff: f64,
        cost: f64,
        limit: f64,
        ttl: Duration,
    ) -> StoreResult<CostAdmit> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let expires_at = Self::expiry(ttl);
        let zset = live_zset_or_default(&mut inner.zsets, key);
        trim_below(zset, cutoff);
        let sum: f64 = zset.members.keys().map(|m| member_cost(m)).sum();
        if sum + cost > limit {
            return Ok(CostAdmit {
                allowed: false,
                current: sum,
            });
        }
        zset.members.insert(member.to_string(), score);
        zset.expires_at = expires_at;
        Ok(CostAdmit {
            allowed: true,
            current: sum + cost,
        })
    }

    async fn zadd_if_below(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> StoreResult<CheckAndInsert> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let expires_at = Self::expiry(ttl);
        let zset = live_zset_or_default(&mut inner.zsets, key);
        trim_below(zset, cutoff);

        if zset.members.contains_key(member) {
            zset.members.insert(member.to_string(), score);
            zset.expires_at = expires_at;
            return Ok(CheckAndInsert {
                allowed: true,
                count: zset.members.len() as u64,
                inserted: false,
            });
        }

        let count = zset.members.len() as u64;
        if count >= limit {
            return Ok(CheckAndInsert {
                allowed: false,
                count,
                inserted: false,
            });
        }

        zset.members.insert(member.to_string(), score);
        zset.expires_at = expires_at;
        Ok(CheckAndInsert {
            allowed: true,
            count: count + 1,
            inserted: true,
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let sender = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .clone()
        };
        // No subscribers is fine.
        let _ = sender.send(message.to_string());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> StoreResult<tokio::sync::mpsc::Receiver<String>> {
        let mut rx = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let (tx, out) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_by_float_accumulates() {
        let store = MemoryStore::new();
        let v1 = store
            .incr_by_float_ex("k", 0.5, Duration::from_secs(60))
            .await
            .unwrap();
        let v2 = store
            .incr_by_float_ex("k", 0.25, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(v1, 0.5);
        assert_eq!(v2, 0.75);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zsum_trims_and_sums_cost_component() {
        let store = MemoryStore::new();
        store
            .zadd_ex("w", "1000:r1:0.10", 1000.0, Duration::ZERO)
            .await
            .unwrap();
        store
            .zadd_ex("w", "2000:r2:0.25", 2000.0, Duration::ZERO)
            .await
            .unwrap();
        store
            .zadd_ex("w", "3000:r3:0.05", 3000.0, Duration::ZERO)
            .await
            .unwrap();
        let sum = store.zsum_costs_after_trim("w", 1500.0).await.unwrap();
        assert!((sum - 0.30).abs() < 1e-9);
        // The trimmed member is gone for subsequent reads.
        assert_eq!(store.zcount_after_trim("w", 0.0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zadd_if_below_enforces_limit_and_idempotency() {
        let store = MemoryStore::new();
        let first = store
            .zadd_if_below("s", "a", 1.0, 0.0, 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(first.allowed && first.inserted);

        // Same member again: allowed, not re-inserted.
        let again = store
            .zadd_if_below("s", "a", 2.0, 0.0, 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.allowed && !again.inserted);
        assert_eq!(again.count, 1);

        let second = store
            .zadd_if_below("s", "b", 3.0, 0.0, 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(second.allowed && second.inserted);

        let third = store
            .zadd_if_below("s", "c", 4.0, 0.0, 2, Duration::ZERO)
            .await
            .unwrap();
        assert!(!third.allowed && !third.inserted);
        assert_eq!(third.count, 2);
    }

    #[tokio::test]
    async fn incr_ex_is_gap_free_under_concurrency() {
        use std::sync::Arc;
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.incr_ex("seq", Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        let expected: Vec<i64> = (1..=100).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("chan").await.unwrap();
        store.publish("chan", "provider:p1").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, "provider:p1");
    }
}
