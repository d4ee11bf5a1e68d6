//! Entities consumed from the configuration store plus runtime record types.
//!
//! Users, keys and providers are read-mostly rows owned by the admin surface;
//! the gateway only ever reads them (through `cache::ConfigCache`) and appends
//! `RequestOutcome` rows through the usage sink.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Provider types and API families
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream provider flavor. Determines the wire format the provider speaks
/// and which inbound API family it can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Claude,
    ClaudeAuth,
    Codex,
    Gemini,
    GeminiCli,
    OpenaiCompatible,
}

impl ProviderType {
    /// Parse the configuration-store column value.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "claude" => Some(Self::Claude),
            "claude-auth" => Some(Self::ClaudeAuth),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "gemini-cli" => Some(Self::GeminiCli),
            "openai-compatible" => Some(Self::OpenaiCompatible),
            _ => None,
        }
    }

    pub fn as_id(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::ClaudeAuth => "claude-auth",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::GeminiCli => "gemini-cli",
            Self::OpenaiCompatible => "openai-compatible",
        }
    }

    /// The wire format this provider natively speaks.
    pub fn wire_family(&self) -> ApiFamily {
        match self {
            Self::Claude | Self::ClaudeAuth => ApiFamily::Claude,
            Self::Codex => ApiFamily::Responses,
            Self::Gemini | Self::GeminiCli => ApiFamily::Gemini,
            Self::OpenaiCompatible => ApiFamily::OpenAi,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_id())
    }
}

/// Inbound API family, derived from the route the client called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFamily {
    /// `/v1/messages` (Anthropic Messages API)
    Claude,
    /// `/v1/chat/completions`
    OpenAi,
    /// `/v1/responses` (OpenAI Responses / Codex)
    Responses,
    /// `/v1beta/models/{model}:generateContent`
    Gemini,
}

impl ApiFamily {
    /// Whether a provider of the given type can serve this family.
    ///
    /// Non-Anthropic providers with `join_claude_pool` set are additionally
    /// eligible for the claude family (the translator bridges the formats).
    pub fn accepts(&self, provider_type: ProviderType, join_claude_pool: bool) -> bool {
        match self {
            ApiFamily::Claude => matches!(
                provider_type,
                ProviderType::Claude | ProviderType::ClaudeAuth
            ) || join_claude_pool,
            ApiFamily::OpenAi => matches!(
                provider_type,
                ProviderType::Codex | ProviderType::OpenaiCompatible
            ),
            ApiFamily::Responses => matches!(provider_type, ProviderType::Codex),
            ApiFamily::Gemini => matches!(
                provider_type,
                ProviderType::Gemini | ProviderType::GeminiCli
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::Responses => "responses",
            Self::Gemini => "gemini",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Quotas
// ─────────────────────────────────────────────────────────────────────────────

/// Shared quota shape for users, keys and providers. `None` = unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub rpm: Option<u32>,
    pub five_hour_usd: Option<f64>,
    pub daily_usd: Option<f64>,
    pub weekly_usd: Option<f64>,
    pub monthly_usd: Option<f64>,
    pub total_usd: Option<f64>,
    pub concurrent_sessions: Option<u32>,
}

impl QuotaLimits {
    /// True when no dimension is limited.
    pub fn is_unlimited(&self) -> bool {
        self.rpm.is_none()
            && self.five_hour_usd.is_none()
            && self.daily_usd.is_none()
            && self.weekly_usd.is_none()
            && self.monthly_usd.is_none()
            && self.total_usd.is_none()
            && self.concurrent_sessions.is_none()
    }
}

/// How the daily cost window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyResetMode {
    /// Calendar-aligned at a configured local wall-clock time.
    Fixed,
    /// Sliding 24-hour window ending now.
    Rolling,
}

impl Default for DailyResetMode {
    fn default() -> Self {
        Self::Fixed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Users and keys
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

/// Identity with quotas. Rows come from the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub daily_reset_mode: DailyResetMode,
    /// Local wall-clock reset time for fixed daily windows, `HH:MM`.
    #[serde(default = "default_reset_time")]
    pub daily_reset_time: String,
    /// User-agent substring patterns; empty = any client allowed.
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    /// Model whitelist; empty = any model.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Provider group tags this user may route to; empty = ungrouped mode.
    #[serde(default)]
    pub provider_groups: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_reset_time() -> String {
    "00:00".to_string()
}

impl User {
    /// Whether requests on behalf of this user may proceed at all.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// Authentication material tied to one user. Rows come from the `keys` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    /// SHA-256 of the presented secret, hex-encoded.
    pub hashed_secret: String,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub can_login_web_ui: bool,
    /// Overrides the user's provider groups when non-empty.
    #[serde(default)]
    pub provider_groups: Vec<String>,
}

impl ApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// Parse the comma-separated `provider_group` column into tags.
pub fn parse_group_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound transport configuration for a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `http://`, `https://`, `socks4://` or `socks5://` URL.
    pub url: Option<String>,
    /// Retry once without the proxy when it fails to connect.
    #[serde(default)]
    pub fallback_to_direct: bool,
}

/// Per-provider timeout knobs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time allowed until the first response byte on streaming calls.
    #[serde(default = "default_first_byte")]
    pub first_byte_secs: u64,
    /// Maximum gap between SSE events.
    #[serde(default = "default_idle")]
    pub idle_secs: u64,
    /// Absolute deadline for non-streaming calls.
    #[serde(default = "default_non_stream")]
    pub non_stream_secs: u64,
}

fn default_first_byte() -> u64 {
    60
}
fn default_idle() -> u64 {
    60
}
fn default_non_stream() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_byte_secs: default_first_byte(),
            idle_secs: default_idle(),
            non_stream_secs: default_non_stream(),
        }
    }
}

/// Per-provider circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
    /// Caps the pipeline's forward-loop attempts for this provider's group.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration_ms() -> u64 {
    60_000
}
fn default_half_open_successes() -> u32 {
    3
}
fn default_max_retry_attempts() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_success_threshold: default_half_open_successes(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

/// Codex system-instructions handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionsStrategy {
    /// Replace only when the client sent the official CLI instructions.
    Auto,
    ForceOfficial,
    KeepOriginal,
}

impl Default for InstructionsStrategy {
    fn default() -> Self {
        Self::Auto
    }
}

/// Upstream destination. Rows come from the `providers` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub url: String,
    /// API key or refresh token, depending on `provider_type`.
    pub api_key: String,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Selection weight within a priority tier, 0–100.
    pub weight: u32,
    /// Lower = preferred. Providers are tried tier by tier.
    pub priority: i32,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    /// Group tag for provider-group routing; `None` = ungrouped.
    pub group_tag: Option<String>,
    /// Requested model → upstream model rewrites, applied after selection.
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    /// Whitelist for Anthropic types, declaration list elsewhere; empty = any.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Non-Anthropic providers opt into serving the claude family.
    #[serde(default)]
    pub join_claude_pool: bool,
    #[serde(default)]
    pub quotas: QuotaLimits,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Vendor scope for outage isolation; falls back to the URL host.
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub codex_instructions: InstructionsStrategy,
    #[serde(default)]
    pub mcp_passthrough: bool,
    /// Prefer the 1M-context beta header on Anthropic calls.
    #[serde(default)]
    pub prefer_million_context: bool,
    /// Overrides `cache_control.ttl` on injected Anthropic cache breakpoints.
    pub cache_ttl_override: Option<String>,
}

fn default_cost_multiplier() -> f64 {
    1.0
}

impl Provider {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map(|t| t > now).unwrap_or(true)
    }

    /// Scope key for the vendor-level circuit breaker.
    pub fn vendor_scope(&self) -> String {
        let vendor = self
            .vendor_id
            .clone()
            .or_else(|| {
                self.url
                    .split("//")
                    .nth(1)
                    .and_then(|rest| rest.split('/').next())
                    .map(|host| host.to_string())
            })
            .unwrap_or_else(|| self.id.clone());
        format!("{}:{}", vendor, self.provider_type.as_id())
    }

    /// Whether this provider declares/permits the requested model.
    pub fn supports_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    /// Upstream model after applying redirects.
    pub fn redirect_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_redirects
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// System settings and prices
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway-wide switches from the `system_settings` table.
///
/// The default is the conservative fallback used when the settings row has
/// never been readable: HTTP/2 off, warmup interception off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default)]
    pub enable_http2: bool,
    #[serde(default)]
    pub intercept_warmup_requests: bool,
    /// Substring fingerprints identifying client warmup heartbeats.
    #[serde(default = "default_warmup_patterns")]
    pub warmup_patterns: Vec<String>,
    #[serde(default)]
    pub store_session_messages: bool,
    #[serde(default)]
    pub circuit_breaker_on_network_errors: bool,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_hard_timeout")]
    pub request_hard_timeout_secs: u64,
    /// Sensitive words that reject a request outright; empty = filter off.
    #[serde(default)]
    pub blocked_words: Vec<String>,
    /// Regex patterns from `request_filters` with the block action.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

fn default_hard_timeout() -> u64 {
    600
}

fn default_warmup_patterns() -> Vec<String> {
    vec![
        "Please write a 5-10 word title".to_string(),
        "quota".to_string(),
    ]
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            enable_http2: false,
            intercept_warmup_requests: false,
            warmup_patterns: default_warmup_patterns(),
            store_session_messages: false,
            circuit_breaker_on_network_errors: false,
            max_retry_attempts: default_max_retry_attempts(),
            request_hard_timeout_secs: default_hard_timeout(),
            blocked_words: Vec::new(),
            blocked_patterns: Vec::new(),
        }
    }
}

/// Per-model USD prices per million tokens, from the `model_prices` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_creation_per_mtok: f64,
    #[serde(default)]
    pub cache_read_per_mtok: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Which guard blocked a request, when one did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedBy {
    Warmup,
    Rate,
    Client,
    Policy,
}

impl std::fmt::Display for BlockedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warmup => write!(f, "warmup"),
            Self::Rate => write!(f, "rate"),
            Self::Client => write!(f, "client"),
            Self::Policy => write!(f, "policy"),
        }
    }
}

/// Outcome of one forwarding attempt, recorded in the decision chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Upstream4xx,
    Upstream5xx,
    Timeout,
    ConnectionError,
    TranslationError,
    OverConcurrency,
}

/// One entry of the per-request decision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
}

/// Append-only record of one inbound request, written via the usage sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub key_id: String,
    pub provider_id: Option<String>,
    pub session_id: String,
    pub request_sequence: i64,
    pub endpoint: String,
    pub model: String,
    pub model_redirected: Option<String>,
    pub status_code: u16,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub cost_multiplier: f64,
    pub duration_ms: u64,
    pub ttfb_ms: Option<u64>,
    pub error_message: Option<String>,
    pub provider_chain: Vec<ProviderAttempt>,
    pub blocked_by: Option<BlockedBy>,
    pub user_agent: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn provider_type_round_trips_ids() {
        for id in [
            "claude",
            "claude-auth",
            "codex",
            "gemini",
            "gemini-cli",
            "openai-compatible",
        ] {
            let pt = ProviderType::from_id(id).unwrap();
            assert_eq!(pt.as_id(), id);
        }
        assert!(ProviderType::from_id("bedrock").is_none());
    }

    #[test]
    fn claude_family_accepts_pool_joiners() {
        assert!(ApiFamily::Claude.accepts(ProviderType::Claude, false));
        assert!(ApiFamily::Claude.accepts(ProviderType::ClaudeAuth, false));
        assert!(!ApiFamily::Claude.accepts(ProviderType::OpenaiCompatible, false));
        assert!(ApiFamily::Claude.accepts(ProviderType::OpenaiCompatible, true));
        assert!(ApiFamily::Claude.accepts(ProviderType::Gemini, true));
    }

    #[test]
    fn responses_family_is_codex_only() {
        assert!(ApiFamily::Responses.accepts(ProviderType::Codex, false));
        assert!(!ApiFamily::Responses.accepts(ProviderType::OpenaiCompatible, false));
        assert!(!ApiFamily::Responses.accepts(ProviderType::Claude, true));
    }

    #[test]
    fn group_list_parsing_trims_and_drops_empties() {
        assert_eq!(parse_group_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(parse_group_list("").is_empty());
        assert!(parse_group_list(" , ").is_empty());
    }

    #[test]
    fn vendor_scope_falls_back_to_url_host() {
        let mut provider = test_provider("p1");
        provider.vendor_id = None;
        provider.url = "https://api.anthropic.com/v1".to_string();
        assert_eq!(provider.vendor_scope(), "api.anthropic.com:claude");

        provider.vendor_id = Some("anthropic".to_string());
        assert_eq!(provider.vendor_scope(), "anthropic:claude");
    }

    #[test]
    fn disabled_or_expired_entities_are_unusable() {
        let now = Utc::now();
        let mut provider = test_provider("p1");
        assert!(provider.is_usable(now));
        provider.enabled = false;
        assert!(!provider.is_usable(now));
        provider.enabled = true;
        provider.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!provider.is_usable(now));
    }

    pub(crate) fn test_provider(id: &str) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            provider_type: ProviderType::Claude,
            url: "https://api.anthropic.com".to_string(),
            api_key: "sk-test".to_string(),
            enabled: true,
            expires_at: None,
            weight: 50,
            priority: 0,
            cost_multiplier: 1.0,
            group_tag: None,
            model_redirects: HashMap::new(),
            allowed_models: Vec::new(),
            join_claude_pool: false,
            quotas: QuotaLimits::default(),
            proxy: ProxyConfig::default(),
            timeouts: TimeoutConfig::default(),
            breaker: BreakerConfig::default(),
            vendor_id: None,
            codex_instructions: InstructionsStrategy::Auto,
            mcp_passthrough: false,
            prefer_million_context: false,
            cache_ttl_override: None,
        }
    }
}
