//! Sqlite-backed configuration and outcome store.
//!
//! Owns the read-mostly tables written by the admin surface (`users`, `keys`,
//! `providers`, `provider_vendors`, `model_prices`, `system_settings`,
//! `request_filters`, `sensitive_words`) and the append-only
//! `message_request` table the usage sink writes to. Nested provider
//! configuration (quotas, proxy, timeouts, breaker) is stored as JSON text
//! columns and deserialized into the typed structs from `models`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{
    ApiKey, DailyResetMode, ModelPrice, Provider, RequestOutcome, Role, SystemSettings, User,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt column {column}: {source}")]
    Corrupt {
        column: &'static str,
        source: serde_json::Error,
    },
}

pub type DbResult<T> = Result<T, DbError>;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    role TEXT NOT NULL DEFAULT 'user',
    quotas TEXT NOT NULL DEFAULT '{}',
    daily_reset_mode TEXT NOT NULL DEFAULT 'fixed',
    daily_reset_time TEXT NOT NULL DEFAULT '00:00',
    allowed_clients TEXT NOT NULL DEFAULT '[]',
    allowed_models TEXT NOT NULL DEFAULT '[]',
    provider_group TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS keys (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    hashed_secret TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    quotas TEXT NOT NULL DEFAULT '{}',
    can_login_web_ui INTEGER NOT NULL DEFAULT 0,
    provider_group TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_keys_hashed_secret ON keys(hashed_secret);
CREATE INDEX IF NOT EXISTS idx_keys_user ON keys(user_id);

CREATE TABLE IF NOT EXISTS provider_vendors (
    vendor_id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS providers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    url TEXT NOT NULL,
    api_key TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    weight INTEGER NOT NULL DEFAULT 50,
    priority INTEGER NOT NULL DEFAULT 0,
    cost_multiplier REAL NOT NULL DEFAULT 1.0,
    group_tag TEXT,
    model_redirects TEXT NOT NULL DEFAULT '{}',
    allowed_models TEXT NOT NULL DEFAULT '[]',
    join_claude_pool INTEGER NOT NULL DEFAULT 0,
    quotas TEXT NOT NULL DEFAULT '{}',
    proxy TEXT NOT NULL DEFAULT '{}',
    timeouts TEXT NOT NULL DEFAULT '{}',
    breaker TEXT NOT NULL DEFAULT '{}',
    vendor_id TEXT,
    codex_instructions TEXT NOT NULL DEFAULT 'auto',
    mcp_passthrough INTEGER NOT NULL DEFAULT 0,
    prefer_million_context INTEGER NOT NULL DEFAULT 0,
    cache_ttl_override TEXT
);

CREATE TABLE IF NOT EXISTS model_prices (
    model TEXT PRIMARY KEY NOT NULL,
    input_per_mtok REAL NOT NULL,
    output_per_mtok REAL NOT NULL,
    cache_creation_per_mtok REAL NOT NULL DEFAULT 0,
    cache_read_per_mtok REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS system_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    settings TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_filters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern TEXT NOT NULL,
    action TEXT NOT NULL DEFAULT 'block'
);

CREATE TABLE IF NOT EXISTS sensitive_words (
    word TEXT PRIMARY KEY NOT NULL
);

CREATE TABLE IF NOT EXISTS message_request (
    id TEXT PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL,
    user_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    provider_id TEXT,
    session_id TEXT NOT NULL,
    request_sequence INTEGER NOT NULL,
    endpoint TEXT NOT NULL,
    model TEXT NOT NULL,
    model_redirected TEXT,
    status_code INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    cost_multiplier REAL NOT NULL DEFAULT 1.0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    ttfb_ms INTEGER,
    error_message TEXT,
    provider_chain TEXT NOT NULL DEFAULT '[]',
    blocked_by TEXT,
    user_agent TEXT
);

CREATE INDEX IF NOT EXISTS idx_message_request_key ON message_request(key_id);
CREATE INDEX IF NOT EXISTS idx_message_request_user ON message_request(user_id);
CREATE INDEX IF NOT EXISTS idx_message_request_provider ON message_request(provider_id);
CREATE INDEX IF NOT EXISTS idx_message_request_created ON message_request(created_at DESC);
"#;

fn parse_json<T: serde::de::DeserializeOwned + Default>(
    raw: &str,
    column: &'static str,
) -> DbResult<T> {
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|source| DbError::Corrupt { column, source })
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                tracing::warn!(raw_value = %s, error = %e, "Corrupt timestamp in database");
                e
            })
            .ok()
    })
}

fn fmt_timestamp(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

/// Shared handle to the sqlite store.
#[derive(Clone)]
pub struct ConfigDb {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigDb {
    /// Open (and optionally migrate) the store at `path`.
    pub fn open(path: &Path, auto_migrate: bool, busy_timeout_ms: u64) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
        if auto_migrate {
            conn.execute_batch(SCHEMA)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store with the schema applied (tests).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── users / keys ─────────────────────────────────────────────────────

    pub async fn get_user(&self, id: &str) -> DbResult<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, enabled, expires_at, role, quotas, daily_reset_mode,
                    daily_reset_time, allowed_clients, allowed_models, provider_group, tags
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(Into::into)
        .and_then(|row| row.transpose())
        .map(Option::flatten)
    }

    pub async fn get_key_by_hash(&self, hashed_secret: &str) -> DbResult<Option<ApiKey>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, user_id, hashed_secret, enabled, expires_at, quotas,
                    can_login_web_ui, provider_group
             FROM keys WHERE hashed_secret = ?1",
            params![hashed_secret],
            row_to_key,
        )
        .optional()
        .map_err(Into::into)
        .and_then(|row| row.transpose())
        .map(Option::flatten)
    }

    // ── providers ────────────────────────────────────────────────────────

    pub async fn list_providers(&self) -> DbResult<Vec<Provider>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, provider_type, url, api_key, enabled, expires_at, weight,
                    priority, cost_multiplier, group_tag, model_redirects, allowed_models,
                    join_claude_pool, quotas, proxy, timeouts, breaker, vendor_id,
                    codex_instructions, mcp_passthrough, prefer_million_context,
                    cache_ttl_override
             FROM providers",
        )?;
        let rows = stmt.query_map([], row_to_provider)?;
        let mut providers = Vec::new();
        for row in rows {
            if let Some(provider) = row?? {
                providers.push(provider);
            }
        }
        Ok(providers)
    }

    // ── settings / prices ────────────────────────────────────────────────

    /// Read system settings, folding configured sensitive words into
    /// `blocked_words`. Returns `None` when the settings row was never
    /// written (caller falls back to the conservative default).
    pub async fn get_system_settings(&self) -> DbResult<Option<SystemSettings>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT settings FROM system_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else { return Ok(None) };
        let mut settings: SystemSettings = parse_json(&raw, "system_settings.settings")?;

        let mut stmt = conn.prepare("SELECT word FROM sensitive_words")?;
        let words = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for word in words {
            settings.blocked_words.push(word?);
        }

        let mut stmt =
            conn.prepare("SELECT pattern FROM request_filters WHERE action = 'block'")?;
        let patterns = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for pattern in patterns {
            settings.blocked_patterns.push(pattern?);
        }
        Ok(Some(settings))
    }

    pub async fn get_model_price(&self, model: &str) -> DbResult<Option<ModelPrice>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT model, input_per_mtok, output_per_mtok, cache_creation_per_mtok,
                    cache_read_per_mtok
             FROM model_prices WHERE model = ?1",
            params![model],
            |row| {
                Ok(ModelPrice {
                    model: row.get(0)?,
                    input_per_mtok: row.get(1)?,
                    output_per_mtok: row.get(2)?,
                    cache_creation_per_mtok: row.get(3)?,
                    cache_read_per_mtok: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ── outcomes ─────────────────────────────────────────────────────────

    /// Append a batch of outcome rows in one transaction.
    pub async fn insert_outcomes(&self, outcomes: &[RequestOutcome]) -> DbResult<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO message_request (
                    id, created_at, user_id, key_id, provider_id, session_id,
                    request_sequence, endpoint, model, model_redirected, status_code,
                    input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                    cost_usd, cost_multiplier, duration_ms, ttfb_ms, error_message,
                    provider_chain, blocked_by, user_agent
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                           ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            )?;
            for outcome in outcomes {
                let chain = serde_json::to_string(&outcome.provider_chain)
                    .unwrap_or_else(|_| "[]".to_string());
                let blocked_by = outcome.blocked_by.map(|b| b.to_string());
                stmt.execute(params![
                    outcome.id,
                    outcome.created_at.to_rfc3339(),
                    outcome.user_id,
                    outcome.key_id,
                    outcome.provider_id,
                    outcome.session_id,
                    outcome.request_sequence,
                    outcome.endpoint,
                    outcome.model,
                    outcome.model_redirected,
                    outcome.status_code,
                    outcome.input_tokens as i64,
                    outcome.output_tokens as i64,
                    outcome.cache_creation_tokens as i64,
                    outcome.cache_read_tokens as i64,
                    outcome.cost_usd,
                    outcome.cost_multiplier,
                    outcome.duration_ms as i64,
                    outcome.ttfb_ms.map(|v| v as i64),
                    outcome.error_message,
                    chain,
                    blocked_by,
                    outcome.user_agent,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read one outcome row back (admin surface, tests).
    pub async fn get_outcome(&self, id: &str) -> DbResult<Option<RequestOutcome>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, created_at, user_id, key_id, provider_id, session_id,
                    request_sequence, endpoint, model, model_redirected, status_code,
                    input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                    cost_usd, cost_multiplier, duration_ms, ttfb_ms, error_message,
                    provider_chain, blocked_by, user_agent
             FROM message_request WHERE id = ?1",
            params![id],
            |row| {
                let chain_raw: String = row.get(20)?;
                let blocked_raw: Option<String> = row.get(21)?;
                Ok(RequestOutcome {
                    id: row.get(0)?,
                    created_at: parse_timestamp(Some(row.get(1)?)).unwrap_or_else(Utc::now),
                    user_id: row.get(2)?,
                    key_id: row.get(3)?,
                    provider_id: row.get(4)?,
                    session_id: row.get(5)?,
                    request_sequence: row.get(6)?,
                    endpoint: row.get(7)?,
                    model: row.get(8)?,
                    model_redirected: row.get(9)?,
                    status_code: row.get::<_, i64>(10)? as u16,
                    input_tokens: row.get::<_, i64>(11)?.max(0) as u64,
                    output_tokens: row.get::<_, i64>(12)?.max(0) as u64,
                    cache_creation_tokens: row.get::<_, i64>(13)?.max(0) as u64,
                    cache_read_tokens: row.get::<_, i64>(14)?.max(0) as u64,
                    cost_usd: row.get(15)?,
                    cost_multiplier: row.get(16)?,
                    duration_ms: row.get::<_, i64>(17)?.max(0) as u64,
                    ttfb_ms: row.get::<_, Option<i64>>(18)?.map(|v| v.max(0) as u64),
                    error_message: row.get(19)?,
                    provider_chain: serde_json::from_str(&chain_raw).unwrap_or_default(),
                    blocked_by: blocked_raw.as_deref().and_then(|b| match b {
                        "warmup" => Some(crate::models::BlockedBy::Warmup),
                        "rate" => Some(crate::models::BlockedBy::Rate),
                        "client" => Some(crate::models::BlockedBy::Client),
                        "policy" => Some(crate::models::BlockedBy::Policy),
                        _ => None,
                    }),
                    user_agent: row.get(22)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Count of outcome rows (tests, admin stats).
    pub async fn count_outcomes(&self) -> DbResult<i64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM message_request", [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Outcome row ids in insertion order (tests, admin listing).
    pub async fn list_outcome_ids(&self) -> DbResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM message_request ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Lifetime spend for a subject, used by the total-cost limit.
    pub async fn sum_cost(&self, subject_column: &'static str, id: &str) -> DbResult<f64> {
        // subject_column is one of the static strings "key_id" | "user_id" |
        // "provider_id"; never interpolate caller input here.
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM message_request WHERE {subject_column} = ?1"
        );
        conn.query_row(&sql, params![id], |row| row.get(0))
            .map_err(Into::into)
    }

    // ── fixture writers (admin boundary / tests) ─────────────────────────

    pub async fn upsert_user(&self, user: &User) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO users (id, name, enabled, expires_at, role, quotas,
                daily_reset_mode, daily_reset_time, allowed_clients, allowed_models,
                provider_group, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user.id,
                user.name,
                user.enabled,
                fmt_timestamp(user.expires_at),
                match user.role {
                    Role::Admin => "admin",
                    Role::User => "user",
                },
                serde_json::to_string(&user.quotas).unwrap_or_else(|_| "{}".into()),
                match user.daily_reset_mode {
                    DailyResetMode::Fixed => "fixed",
                    DailyResetMode::Rolling => "rolling",
                },
                user.daily_reset_time,
                serde_json::to_string(&user.allowed_clients).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&user.allowed_models).unwrap_or_else(|_| "[]".into()),
                user.provider_groups.join(","),
                serde_json::to_string(&user.tags).unwrap_or_else(|_| "[]".into()),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_key(&self, key: &ApiKey) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO keys (id, user_id, hashed_secret, enabled, expires_at,
                quotas, can_login_web_ui, provider_group)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.id,
                key.user_id,
                key.hashed_secret,
                key.enabled,
                fmt_timestamp(key.expires_at),
                serde_json::to_string(&key.quotas).unwrap_or_else(|_| "{}".into()),
                key.can_login_web_ui,
                key.provider_groups.join(","),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_provider(&self, provider: &Provider) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO providers (id, name, provider_type, url, api_key,
                enabled, expires_at, weight, priority, cost_multiplier, group_tag,
                model_redirects, allowed_models, join_claude_pool, quotas, proxy,
                timeouts, breaker, vendor_id, codex_instructions, mcp_passthrough,
                prefer_million_context, cache_ttl_override)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                provider.id,
                provider.name,
                provider.provider_type.as_id(),
                provider.url,
                provider.api_key,
                provider.enabled,
                fmt_timestamp(provider.expires_at),
                provider.weight,
                provider.priority,
                provider.cost_multiplier,
                provider.group_tag,
                serde_json::to_string(&provider.model_redirects).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&provider.allowed_models).unwrap_or_else(|_| "[]".into()),
                provider.join_claude_pool,
                serde_json::to_string(&provider.quotas).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&provider.proxy).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&provider.timeouts).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&provider.breaker).unwrap_or_else(|_| "{}".into()),
                provider.vendor_id,
                serde_json::to_string(&provider.codex_instructions)
                    .unwrap_or_else(|_| "\"auto\"".into())
                    .trim_matches('"'),
                provider.mcp_passthrough,
                provider.prefer_million_context,
                provider.cache_ttl_override,
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_model_price(&self, price: &ModelPrice) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO model_prices (model, input_per_mtok, output_per_mtok,
                cache_creation_per_mtok, cache_read_per_mtok)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                price.model,
                price.input_per_mtok,
                price.output_per_mtok,
                price.cache_creation_per_mtok,
                price.cache_read_per_mtok,
            ],
        )?;
        Ok(())
    }

    pub async fn set_system_settings(&self, settings: &SystemSettings) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let raw = serde_json::to_string(settings).unwrap_or_else(|_| "{}".into());
        conn.execute(
            "INSERT OR REPLACE INTO system_settings (id, settings) VALUES (1, ?1)",
            params![raw],
        )?;
        Ok(())
    }
}

// Row mappers return `Ok(None)` for rows with unusable enum columns so one
// corrupt row cannot take the whole listing down.

type RowResult<T> = rusqlite::Result<DbResult<Option<T>>>;

fn row_to_user(row: &rusqlite::Row<'_>) -> RowResult<User> {
    let role_raw: String = row.get(4)?;
    let quotas_raw: String = row.get(5)?;
    let reset_mode_raw: String = row.get(6)?;
    let allowed_clients_raw: String = row.get(8)?;
    let allowed_models_raw: String = row.get(9)?;
    let group_raw: String = row.get(10)?;
    let tags_raw: String = row.get(11)?;

    let user = User {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        expires_at: parse_timestamp(row.get(3)?),
        role: if role_raw == "admin" {
            Role::Admin
        } else {
            Role::User
        },
        quotas: match parse_json(&quotas_raw, "users.quotas") {
            Ok(q) => q,
            Err(e) => return Ok(Err(e)),
        },
        daily_reset_mode: if reset_mode_raw == "rolling" {
            DailyResetMode::Rolling
        } else {
            DailyResetMode::Fixed
        },
        daily_reset_time: row.get(7)?,
        allowed_clients: match parse_json(&allowed_clients_raw, "users.allowed_clients") {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        },
        allowed_models: match parse_json(&allowed_models_raw, "users.allowed_models") {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        },
        provider_groups: crate::models::parse_group_list(&group_raw),
        tags: match parse_json(&tags_raw, "users.tags") {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        },
    };
    Ok(Ok(Some(user)))
}

fn row_to_key(row: &rusqlite::Row<'_>) -> RowResult<ApiKey> {
    let quotas_raw: String = row.get(5)?;
    let group_raw: String = row.get(7)?;
    let key = ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        hashed_secret: row.get(2)?,
        enabled: row.get(3)?,
        expires_at: parse_timestamp(row.get(4)?),
        quotas: match parse_json(&quotas_raw, "keys.quotas") {
            Ok(q) => q,
            Err(e) => return Ok(Err(e)),
        },
        can_login_web_ui: row.get(6)?,
        provider_groups: crate::models::parse_group_list(&group_raw),
    };
    Ok(Ok(Some(key)))
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> RowResult<Provider> {
    let type_raw: String = row.get(2)?;
    let Some(provider_type) = crate::models::ProviderType::from_id(&type_raw) else {
        tracing::warn!(provider_type = %type_raw, "Unknown provider type in database, skipping row");
        return Ok(Ok(None));
    };
    macro_rules! json_col {
        ($idx:expr, $name:literal) => {
            match parse_json(&row.get::<_, String>($idx)?, $name) {
                Ok(v) => v,
                Err(e) => return Ok(Err(e)),
            }
        };
    }
    let instructions_raw: String = row.get(19)?;
    let provider = Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type,
        url: row.get(3)?,
        api_key: row.get(4)?,
        enabled: row.get(5)?,
        expires_at: parse_timestamp(row.get(6)?),
        weight: row.get::<_, i64>(7)?.clamp(0, 100) as u32,
        priority: row.get(8)?,
        cost_multiplier: row.get(9)?,
        group_tag: row.get(10)?,
        model_redirects: json_col!(11, "providers.model_redirects"),
        allowed_models: json_col!(12, "providers.allowed_models"),
        join_claude_pool: row.get(13)?,
        quotas: json_col!(14, "providers.quotas"),
        proxy: json_col!(15, "providers.proxy"),
        timeouts: json_col!(16, "providers.timeouts"),
        breaker: json_col!(17, "providers.breaker"),
        vendor_id: row.get(18)?,
        codex_instructions: match instructions_raw.as_str() {
            "force_official" => crate::models::InstructionsStrategy::ForceOfficial,
            "keep_original" => crate::models::InstructionsStrategy::KeepOriginal,
            _ => crate::models::InstructionsStrategy::Auto,
        },
        mcp_passthrough: row.get(20)?,
        prefer_million_context: row.get(21)?,
        cache_ttl_override: row.get(22)?,
    };
    Ok(Ok(Some(provider)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaLimits;

    fn sample_user() -> User {
        User {
            id: "u1".into(),
            name: "Test".into(),
            enabled: true,
            expires_at: None,
            role: Role::User,
            quotas: QuotaLimits {
                daily_usd: Some(10.0),
                ..Default::default()
            },
            daily_reset_mode: DailyResetMode::Fixed,
            daily_reset_time: "00:00".into(),
            allowed_clients: vec!["claude-cli".into()],
            allowed_models: Vec::new(),
            provider_groups: vec!["default".into()],
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn user_round_trip() {
        let db = ConfigDb::open_in_memory().unwrap();
        let user = sample_user();
        db.upsert_user(&user).await.unwrap();
        let loaded = db.get_user("u1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Test");
        assert_eq!(loaded.quotas.daily_usd, Some(10.0));
        assert_eq!(loaded.provider_groups, vec!["default"]);
        assert_eq!(loaded.allowed_clients, vec!["claude-cli"]);
    }

    #[tokio::test]
    async fn key_lookup_by_hash() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.upsert_user(&sample_user()).await.unwrap();
        let key = ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            hashed_secret: "abc123".into(),
            enabled: true,
            expires_at: None,
            quotas: QuotaLimits::default(),
            can_login_web_ui: false,
            provider_groups: Vec::new(),
        };
        db.upsert_key(&key).await.unwrap();
        let loaded = db.get_key_by_hash("abc123").await.unwrap().unwrap();
        assert_eq!(loaded.id, "k1");
        assert_eq!(loaded.user_id, "u1");
        assert!(db.get_key_by_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_round_trip_preserves_nested_config() {
        let db = ConfigDb::open_in_memory().unwrap();
        let mut provider = crate::models::tests::test_provider("p1");
        provider
            .model_redirects
            .insert("claude-sonnet-4".into(), "claude-sonnet-4-5".into());
        provider.quotas.concurrent_sessions = Some(3);
        provider.breaker.failure_threshold = 7;
        db.upsert_provider(&provider).await.unwrap();

        let providers = db.list_providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        let loaded = &providers[0];
        assert_eq!(
            loaded.model_redirects.get("claude-sonnet-4").unwrap(),
            "claude-sonnet-4-5"
        );
        assert_eq!(loaded.quotas.concurrent_sessions, Some(3));
        assert_eq!(loaded.breaker.failure_threshold, 7);
    }

    #[tokio::test]
    async fn outcome_insert_and_total_cost() {
        let db = ConfigDb::open_in_memory().unwrap();
        let outcome = |id: &str, cost: f64| RequestOutcome {
            id: id.into(),
            created_at: Utc::now(),
            user_id: "u1".into(),
            key_id: "k1".into(),
            provider_id: Some("p1".into()),
            session_id: "s1".into(),
            request_sequence: 1,
            endpoint: "/v1/messages".into(),
            model: "claude-sonnet-4".into(),
            model_redirected: None,
            status_code: 200,
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: cost,
            cost_multiplier: 1.0,
            duration_ms: 800,
            ttfb_ms: Some(120),
            error_message: None,
            provider_chain: Vec::new(),
            blocked_by: None,
            user_agent: None,
        };
        db.insert_outcomes(&[outcome("r1", 0.5), outcome("r2", 0.25)])
            .await
            .unwrap();
        let total = db.sum_cost("key_id", "k1").await.unwrap();
        assert!((total - 0.75).abs() < 1e-9);
        assert_eq!(db.sum_cost("key_id", "other").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn settings_round_trip_includes_sensitive_words() {
        let db = ConfigDb::open_in_memory().unwrap();
        assert!(db.get_system_settings().await.unwrap().is_none());

        let mut settings = SystemSettings::default();
        settings.intercept_warmup_requests = true;
        db.set_system_settings(&settings).await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO sensitive_words (word) VALUES ('forbidden')",
                [],
            )
            .unwrap();
        }
        let loaded = db.get_system_settings().await.unwrap().unwrap();
        assert!(loaded.intercept_warmup_requests);
        assert_eq!(loaded.blocked_words, vec!["forbidden"]);
    }
}
