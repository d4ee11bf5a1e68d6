//! Redis store backend.
//!
//! Multi-step operations run as Lua scripts so concurrent gateway processes
//! observe every counter update as a single operation. Connections are
//! multiplexed over one TCP stream; pub/sub uses a dedicated connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{CheckAndInsert, CostAdmit, SharedStore, StoreError, StoreResult};

const INCR_BY_FLOAT_EX: &str = r#"
local v = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[2]) end
return tostring(v)
"#;

const INCR_EX: &str = r#"
local v = redis.call('INCR', KEYS[1])
if tonumber(ARGV[1]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[1]) end
return v
"#;

const ZCOUNT_AFTER_TRIM: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
return redis.call('ZCARD', KEYS[1])
"#;

const ZSUM_COSTS_AFTER_TRIM: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
local sum = 0
for _, m in ipairs(members) do
  local cost = string.match(m, '([^:]+)$')
  sum = sum + (tonumber(cost) or 0)
end
return tostring(sum)
"#;

const INCR_IF_SUM_BELOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local delta = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
if current + delta > limit then
  return {0, tostring(current)}
end
local v = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
if tonumber(ARGV[3]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[3]) end
return {1, tostring(v)}
"#;

const ZADD_IF_SUM_BELOW: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[3])
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
local sum = 0
for _, m in ipairs(members) do
  local cost = string.match(m, '([^:]+)$')
  sum = sum + (tonumber(cost) or 0)
end
local cost = tonumber(ARGV[4])
local limit = tonumber(ARGV[5])
if sum + cost > limit then
  return {0, tostring(sum)}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
if tonumber(ARGV[6]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[6]) end
return {1, tostring(sum + cost)}
"#;

const ZADD_IF_BELOW: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[3])
local existing = redis.call('ZSCORE', KEYS[1], ARGV[1])
if existing then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  if tonumber(ARGV[5]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[5]) end
  return {1, redis.call('ZCARD', KEYS[1]), 0}
end
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[4]) then
  return {0, count, 0}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
if tonumber(ARGV[5]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[5]) end
return {1, count + 1, 1}
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

/// Redis-backed [`SharedStore`].
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the shared store.
    ///
    /// `rediss://` URLs get certificate validation by default; passing
    /// `reject_unauthorized = false` appends the `#insecure` fragment the
    /// redis crate uses to skip verification.
    pub async fn connect(url: &str, reject_unauthorized: bool) -> StoreResult<Self> {
        let url = if !reject_unauthorized
            && url.starts_with("rediss://")
            && !url.contains("#insecure")
        {
            format!("{url}#insecure")
        } else {
            url.to_string()
        };
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, conn })
    }

    fn ttl_ms(ttl: Duration) -> i64 {
        ttl.as_millis() as i64
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.pset_ex::<_, _, ()>(key, value, ttl.as_millis() as u64)
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.pexpire::<_, ()>(key, Self::ttl_ms(ttl)).await?;
        Ok(())
    }

    async fn incr_by_float_ex(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        let raw: String = redis::Script::new(INCR_BY_FLOAT_EX)
            .key(key)
            .arg(delta)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        raw.parse()
            .map_err(|e| StoreError::Backend(format!("bad INCRBYFLOAT reply {raw:?}: {e}")))
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(redis::Script::new(INCR_EX)
            .key(key)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?)
    }

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|r| r.parse().ok()))
    }

    async fn zadd_ex(&self, key: &str, member: &str, score: f64, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        if !ttl.is_zero() {
            conn.pexpire::<_, ()>(key, Self::ttl_ms(ttl)).await?;
        }
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn zcount_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(redis::Script::new(ZCOUNT_AFTER_TRIM)
            .key(key)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn zsum_costs_after_trim(&self, key: &str, cutoff: f64) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        let raw: String = redis::Script::new(ZSUM_COSTS_AFTER_TRIM)
            .key(key)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        raw.parse()
            .map_err(|e| StoreError::Backend(format!("bad ZSUM reply {raw:?}: {e}")))
    }

    async fn incr_if_sum_below(
        &self,
        key: &str,
        delta: f64,
        limit: f64,
        ttl: Duration,
    ) -> StoreResult<CostAdmit> {
        let mut conn = self.conn.clone();
        let reply: (i64, String) = redis::Script::new(INCR_IF_SUM_BELOW)
            .key(key)
            .arg(delta)
            .arg(limit)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(CostAdmit {
            allowed: reply.0 == 1,
            current: reply.1.parse().unwrap_or(0.0),
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
        let mut conn = self.conn.clone();
        let reply: (i64, String) = redis::Script::new(ZADD_IF_SUM_BELOW)
            .key(key)
            .arg(member)
            .arg(score)
            .arg(cutoff)
            .arg(cost)
            .arg(limit)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(CostAdmit {
            allowed: reply.0 == 1,
            current: reply.1.parse().unwrap_or(0.0),
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
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = redis::Script::new(ZADD_IF_BELOW)
            .key(key)
            .arg(member)
            .arg(score)
            .arg(cutoff)
            .arg(limit)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        if reply.len() != 3 {
            return Err(StoreError::Backend(format!(
                "bad ZADD_IF_BELOW reply: {reply:?}"
            )));
        }
        Ok(CheckAndInsert {
            allowed: reply[0] == 1,
            count: reply[1].max(0) as u64,
            inserted: reply[2] == 1,
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> StoreResult<tokio::sync::mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
