//! The request-proxy pipeline: guards, forward loop, accounting.
//!
//! Every inbound `/v1/*` call runs the same sequence: client guard →
//! authentication → warmup guard → session allocation → rate-limit guards
//! → forward loop (resolver → translator → forwarder, retrying on
//! retryable failures) → accounting. Exactly one `RequestOutcome` is
//! emitted per inbound request on every path, including cancellation;
//! provider concurrency and cost reservations are released on every exit
//! through a scope guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::cache::ConfigCache;
use crate::config::Config;
use crate::error::{outcome_status, ProxyError};
use crate::forward::{ForwardRequest, ForwardResponse, Upstream};
use crate::models::{
    ApiFamily, ApiKey, AttemptOutcome, BlockedBy, ModelPrice, Provider, ProviderAttempt,
    RequestOutcome, SystemSettings, User,
};
use crate::pricing;
use crate::ratelimit::{CostReservation, RateLimitService};
use crate::resolver::{ProviderResolver, ResolveRequest};
use crate::session::SessionManager;
use crate::sink::UsageSink;
use crate::translate::{
    self, sse::StreamTranslator, NormalizedRequest, NormalizedUsage,
};
use crate::warmup;

/// Hard ceiling on attempts regardless of breaker configuration.
const MAX_FORWARD_ATTEMPTS: u32 = 3;

/// Assumed output size for pre-admission cost estimates.
const ESTIMATED_OUTPUT_TOKENS: u64 = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Inbound / outbound shapes
// ─────────────────────────────────────────────────────────────────────────────

/// One inbound API call, already routed to a family.
pub struct InboundRequest {
    pub family: ApiFamily,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Gemini carries the model and stream verb in the URL.
    pub model_from_path: Option<String>,
    pub stream_from_path: bool,
}

/// Headers added to every successful proxy response.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub session_id: String,
    pub request_sequence: i64,
    pub provider_id: Option<String>,
    pub intercepted: Option<&'static str>,
}

pub enum PipelineResponse {
    Json {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
        meta: ResponseMeta,
    },
    Stream {
        status: u16,
        stream: BoxStream<'static, Result<Bytes, std::io::Error>>,
        meta: ResponseMeta,
    },
}

pub struct Pipeline {
    pub config: Config,
    pub cache: Arc<ConfigCache>,
    pub limits: Arc<RateLimitService>,
    pub sessions: Arc<SessionManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub resolver: Arc<ProviderResolver>,
    pub upstream: Arc<dyn Upstream>,
    pub sink: Arc<UsageSink>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoped teardown
// ─────────────────────────────────────────────────────────────────────────────

/// Everything that must be released exactly once per request, on every
/// exit path including panics and mid-stream client disconnects.
struct RequestScope {
    limits: Arc<RateLimitService>,
    sink: Arc<UsageSink>,
    sessions: Arc<SessionManager>,
    breaker: Arc<CircuitBreaker>,
    cancel: CancellationToken,
    /// Consumed by the finalizer; a Drop with this still present means the
    /// request died without accounting and gets a cancellation outcome.
    state: StdMutex<Option<ScopeState>>,
}

struct ScopeState {
    outcome: RequestOutcome,
    user_reservation: CostReservation,
    key_reservation: CostReservation,
    /// Provider whose concurrency this request reserved.
    provider_tracked: Option<Provider>,
    price: Option<ModelPrice>,
    user: User,
    started: Instant,
}

impl RequestScope {
    fn take(&self) -> Option<ScopeState> {
        self.state.lock().expect("scope mutex poisoned").take()
    }

    /// Record the terminal outcome and release every reservation.
    async fn finalize(
        &self,
        mut state: ScopeState,
        status: u16,
        usage: NormalizedUsage,
        error_message: Option<String>,
        record_breaker_success: bool,
    ) {
        let cost = match (&state.price, state.outcome.blocked_by) {
            // Blocked and warmup requests never cost anything.
            (_, Some(_)) => 0.0,
            (Some(price), None) => {
                pricing::request_cost(price, &usage, state.outcome.cost_multiplier)
            }
            (None, None) => 0.0,
        };

        state.outcome.status_code = status;
        state.outcome.input_tokens = usage.input_tokens;
        state.outcome.output_tokens = usage.output_tokens;
        state.outcome.cache_creation_tokens = usage.cache_creation_tokens;
        state.outcome.cache_read_tokens = usage.cache_read_tokens;
        state.outcome.cost_usd = cost;
        state.outcome.duration_ms = state.started.elapsed().as_millis() as u64;
        state.outcome.error_message = error_message;

        // Settle reserved windows to the actual cost.
        self.limits.settle(state.user_reservation, cost).await;
        self.limits.settle(state.key_reservation, cost).await;

        if let Some(provider) = &state.provider_tracked {
            if cost > 0.0 {
                self.limits
                    .track_subject_cost(
                        "provider",
                        &provider.id,
                        &state.outcome.id,
                        cost,
                        "00:00",
                        crate::models::DailyResetMode::Fixed,
                    )
                    .await;
            }
            if record_breaker_success {
                self.breaker.record_success(provider).await;
            }
            self.limits
                .untrack_session("provider", &provider.id, &state.outcome.session_id)
                .await;
        }

        if state.outcome.blocked_by.is_none() {
            let session_id = state.outcome.session_id.clone();
            self.sessions
                .record_usage(
                    &session_id,
                    usage.input_tokens,
                    usage.output_tokens,
                    cost,
                    state.outcome.duration_ms,
                )
                .await;
            let total_input =
                usage.input_tokens + usage.cache_creation_tokens + usage.cache_read_tokens;
            if total_input > 0 {
                self.sessions
                    .set_last_input_tokens(&session_id, total_input)
                    .await;
            }
            if let Some(provider_id) = &state.outcome.provider_id {
                self.sessions
                    .set_last_provider_id(&session_id, provider_id)
                    .await;
            }
            self.sessions.touch(&session_id).await;
        }

        tracing::info!(
            request = %state.outcome.id,
            session = %state.outcome.session_id,
            provider = state.outcome.provider_id.as_deref().unwrap_or("-"),
            status,
            cost_usd = cost,
            duration_ms = state.outcome.duration_ms,
            "Request finished"
        );
        self.sink.record(state.outcome).await;
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(state) = self.state.lock().ok().and_then(|mut s| s.take()) else {
            return;
        };
        // The request died before finalizing (client disconnect, panic).
        let limits = self.limits.clone();
        let sink = self.sink.clone();
        let sessions = self.sessions.clone();
        let breaker = self.breaker.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let scope = RequestScope {
                limits,
                sink,
                sessions,
                breaker,
                cancel,
                state: StdMutex::new(None),
            };
            scope
                .finalize(
                    state,
                    crate::error::STATUS_CLIENT_CLOSED_REQUEST,
                    NormalizedUsage::default(),
                    Some("client closed request".to_string()),
                    false,
                )
                .await;
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

impl Pipeline {
    /// Handle one inbound request end to end.
    pub async fn handle(&self, inbound: InboundRequest) -> Result<PipelineResponse, ProxyError> {
        let settings = self.cache.get_settings().await;
        let hard_timeout = Duration::from_secs(settings.request_hard_timeout_secs.max(1));
        match tokio::time::timeout(hard_timeout, self.handle_inner(inbound, settings)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::UpstreamTimeout {
                message: "request exceeded the gateway hard timeout".to_string(),
            }),
        }
    }

    async fn handle_inner(
        &self,
        inbound: InboundRequest,
        settings: SystemSettings,
    ) -> Result<PipelineResponse, ProxyError> {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let user_agent = inbound
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        // 1. Authentication.
        let (user, key) = self.authenticate(&inbound.headers).await?;

        // 2. Client guard.
        if !client_allowed(&user.allowed_clients, user_agent.as_deref()) {
            let ua = user_agent.clone().unwrap_or_default();
            self.record_blocked(
                &request_id,
                &user,
                &key,
                &inbound,
                BlockedBy::Client,
                400,
                user_agent.clone(),
                started,
            )
            .await;
            return Err(ProxyError::ClientNotAllowed { user_agent: ua });
        }

        // 3. Parse and normalize the request body.
        let mut request = translate::parse_client_request(inbound.family, &inbound.body)?;
        if let Some(model) = &inbound.model_from_path {
            request.model = model.clone();
        }
        if inbound.stream_from_path {
            request.stream = true;
        }
        let model = request.model.clone();

        // 4. Policy guards: model whitelist and sensitive words.
        if !user.allowed_models.is_empty() && !user.allowed_models.iter().any(|m| m == &model) {
            self.record_blocked(
                &request_id,
                &user,
                &key,
                &inbound,
                BlockedBy::Policy,
                400,
                user_agent.clone(),
                started,
            )
            .await;
            return Err(ProxyError::PolicyBlocked);
        }
        if !settings.blocked_words.is_empty() || !settings.blocked_patterns.is_empty() {
            let text = request.all_text();
            if content_blocked(&text, &settings.blocked_words, &settings.blocked_patterns) {
                self.record_blocked(
                    &request_id,
                    &user,
                    &key,
                    &inbound,
                    BlockedBy::Policy,
                    400,
                    user_agent.clone(),
                    started,
                )
                .await;
                return Err(ProxyError::PolicyBlocked);
            }
        }

        // 5. Warmup guard: answered locally, no session, no concurrency.
        if inbound.family == ApiFamily::Claude
            && settings.intercept_warmup_requests
            && warmup::is_warmup_request(&request, &settings.warmup_patterns)
        {
            self.record_blocked(
                &request_id,
                &user,
                &key,
                &inbound,
                BlockedBy::Warmup,
                200,
                user_agent.clone(),
                started,
            )
            .await;
            let (body, content_type) = warmup::canned_response(inbound.family, &model, request.stream);
            tracing::debug!(request = %request_id, "Warmup request intercepted");
            let meta = ResponseMeta {
                intercepted: Some("warmup"),
                ..Default::default()
            };
            return Ok(if request.stream {
                PipelineResponse::Stream {
                    status: 200,
                    stream: futures::stream::once(async move { Ok(Bytes::from(body)) }).boxed(),
                    meta,
                }
            } else {
                PipelineResponse::Json {
                    status: 200,
                    content_type,
                    body,
                    meta,
                }
            });
        }

        // 6. Session allocation.
        let body_value: serde_json::Value =
            serde_json::from_slice(&inbound.body).unwrap_or(serde_json::Value::Null);
        let client_session = SessionManager::extract_client_session_id(&inbound.headers, &body_value);
        let session_id = SessionManager::get_or_create_session_id(
            &user.id,
            &key.id,
            client_session.as_deref(),
            &SessionManager::first_message_hash(&body_value),
        );
        let request_sequence = self.sessions.next_request_sequence(&session_id).await;
        self.sessions
            .store_payload(&session_id, "request", String::from_utf8_lossy(&inbound.body).into_owned());

        // 7. Rate-limit guards.
        let price = match self.cache.get_model_price(&model).await {
            Some(price) => Some(price),
            None => pricing::default_price(&model),
        };
        let estimated_cost = price
            .as_ref()
            .map(|p| {
                pricing::base_cost(
                    p,
                    &NormalizedUsage {
                        input_tokens: translate::estimate_tokens(inbound.body.len()),
                        output_tokens: request.max_tokens.unwrap_or(ESTIMATED_OUTPUT_TOKENS),
                        cache_creation_tokens: 0,
                        cache_read_tokens: 0,
                    },
                )
            })
            .unwrap_or(0.0);

        let (user_reservation, key_reservation) = match self
            .run_rate_guards(&user, &key, &session_id, estimated_cost, &request_id)
            .await
        {
            Ok(reservations) => reservations,
            Err(reason) => {
                self.record_blocked(
                    &request_id,
                    &user,
                    &key,
                    &inbound,
                    BlockedBy::Rate,
                    429,
                    user_agent.clone(),
                    started,
                )
                .await;
                return Err(reason);
            }
        };

        // The scope owns everything that must be torn down from here on.
        let scope = Arc::new(RequestScope {
            limits: self.limits.clone(),
            sink: self.sink.clone(),
            sessions: self.sessions.clone(),
            breaker: self.breaker.clone(),
            cancel: CancellationToken::new(),
            state: StdMutex::new(Some(ScopeState {
                outcome: RequestOutcome {
                    id: request_id.clone(),
                    created_at: Utc::now(),
                    user_id: user.id.clone(),
                    key_id: key.id.clone(),
                    provider_id: None,
                    session_id: session_id.clone(),
                    request_sequence,
                    endpoint: inbound.endpoint.clone(),
                    model: model.clone(),
                    model_redirected: None,
                    status_code: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    cache_creation_tokens: 0,
                    cache_read_tokens: 0,
                    cost_usd: 0.0,
                    cost_multiplier: 1.0,
                    duration_ms: 0,
                    ttfb_ms: None,
                    error_message: None,
                    provider_chain: Vec::new(),
                    blocked_by: None,
                    user_agent: user_agent.clone(),
                },
                user_reservation,
                key_reservation,
                provider_tracked: None,
                price,
                user: user.clone(),
                started,
            })),
        });

        // 8. Forward loop.
        self.forward_loop(
            inbound,
            request,
            settings,
            scope,
            user,
            key,
            session_id,
            request_sequence,
        )
        .await
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<(User, ApiKey), ProxyError> {
        let secret = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
            .filter(|s| !s.is_empty())
            .ok_or(ProxyError::Unauthenticated)?;

        let hashed = hex::encode(Sha256::digest(secret.as_bytes()));
        let key = self
            .cache
            .get_key_by_hash(&hashed)
            .await
            .ok_or(ProxyError::Unauthenticated)?;
        let now = Utc::now();
        if !key.is_usable(now) {
            return Err(ProxyError::KeyExpired);
        }
        let user = self
            .cache
            .get_user(&key.user_id)
            .await
            .ok_or(ProxyError::Unauthenticated)?;
        if !user.is_usable(now) {
            return Err(ProxyError::UserDisabled);
        }
        Ok((user, key))
    }

    /// Guard order: user-total → user-RPM → user cost windows → key-total →
    /// key cost windows → user concurrency → key concurrency. First failure
    /// rejects; reservations taken so far are rolled back.
    async fn run_rate_guards(
        &self,
        user: &User,
        key: &ApiKey,
        session_id: &str,
        estimated_cost: f64,
        request_id: &str,
    ) -> Result<(CostReservation, CostReservation), ProxyError> {
        let deny = |reason: crate::ratelimit::LimitExceeded| ProxyError::RateLimited {
            message: reason.message,
            scope: reason.scope,
            current: reason.current,
            limit: reason.limit,
        };

        let total = self
            .limits
            .check_total_cost("user", "user_id", &user.id, user.quotas.total_usd, estimated_cost)
            .await;
        if let Some(reason) = total.reason {
            return Err(deny(reason));
        }

        let rpm = self.limits.check_rpm("user", &user.id, user.quotas.rpm).await;
        if let Some(reason) = rpm.reason {
            return Err(deny(reason));
        }

        let (user_decision, user_reservation) = self
            .limits
            .check_cost_limits(
                "user",
                &user.id,
                &user.quotas,
                &user.daily_reset_time,
                user.daily_reset_mode,
                estimated_cost,
                request_id,
            )
            .await;
        if let Some(reason) = user_decision.reason {
            return Err(deny(reason));
        }

        let key_total = self
            .limits
            .check_total_cost("key", "key_id", &key.id, key.quotas.total_usd, estimated_cost)
            .await;
        if let Some(reason) = key_total.reason {
            self.limits.release(user_reservation).await;
            return Err(deny(reason));
        }

        let (key_decision, key_reservation) = self
            .limits
            .check_cost_limits(
                "key",
                &key.id,
                &key.quotas,
                &user.daily_reset_time,
                user.daily_reset_mode,
                estimated_cost,
                request_id,
            )
            .await;
        if let Some(reason) = key_decision.reason {
            self.limits.release(user_reservation).await;
            return Err(deny(reason));
        }

        let mut tracked: Vec<(&'static str, String)> = Vec::new();
        let mut concurrency_failure: Option<ProxyError> = None;
        for (subject, id, limit) in [
            ("user", user.id.as_str(), user.quotas.concurrent_sessions),
            ("key", key.id.as_str(), key.quotas.concurrent_sessions),
        ] {
            let Some(limit) = limit else { continue };
            let track = self
                .limits
                .check_and_track_session(subject, id, session_id, Some(limit))
                .await;
            if track.tracked {
                tracked.push((subject, id.to_string()));
            }
            if !track.allowed {
                concurrency_failure = Some(ProxyError::RateLimited {
                    message: RateLimitService::concurrency_message(subject, track.count, limit),
                    scope: format!("{subject}_concurrent"),
                    current: track.count as f64,
                    limit: limit as f64,
                });
                break;
            }
        }
        if let Some(error) = concurrency_failure {
            for (subject, id) in tracked {
                self.limits.untrack_session(subject, &id, session_id).await;
            }
            self.limits.release(user_reservation).await;
            self.limits.release(key_reservation).await;
            return Err(error);
        }

        Ok((user_reservation, key_reservation))
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_loop(
        &self,
        inbound: InboundRequest,
        request: NormalizedRequest,
        settings: SystemSettings,
        scope: Arc<RequestScope>,
        user: User,
        key: ApiKey,
        session_id: String,
        request_sequence: i64,
    ) -> Result<PipelineResponse, ProxyError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<ProxyError> = None;
        let max_attempts = MAX_FORWARD_ATTEMPTS.min(settings.max_retry_attempts.max(1));

        let last_provider = self.sessions.last_provider_id(&session_id).await;

        for attempt in 1..=max_attempts {
            let resolution = match self
                .resolver
                .resolve(ResolveRequest {
                    user: &user,
                    key: &key,
                    model: &request.model,
                    family: inbound.family,
                    already_tried: &tried,
                    session_id: &session_id,
                    last_provider_id: last_provider.as_deref(),
                })
                .await
            {
                Ok(resolution) => resolution,
                Err(e) => {
                    // Candidate set exhausted: surface the last upstream
                    // error when one exists.
                    let terminal = last_error.take().unwrap_or(e);
                    return self.fail_terminal(scope, terminal).await;
                }
            };
            let provider = resolution.provider;
            tried.insert(provider.id.clone());

            {
                let mut state = scope.state.lock().expect("scope mutex poisoned");
                if let Some(state) = state.as_mut() {
                    state.outcome.provider_id = Some(provider.id.clone());
                    state.outcome.cost_multiplier = provider.cost_multiplier;
                    let redirected = provider.redirect_model(&request.model);
                    state.outcome.model_redirected =
                        (redirected != request.model).then(|| redirected.to_string());
                    if resolution.session_tracked {
                        state.provider_tracked = Some(provider.clone());
                    } else {
                        state.provider_tracked = None;
                    }
                }
            }

            let body = match translate::build_provider_request(&request, &provider) {
                Ok(body) => body,
                Err(e) => {
                    self.release_attempt(&scope, &provider, resolution.session_tracked)
                        .await;
                    return self.fail_terminal(scope, e).await;
                }
            };

            let mut extra_headers = Vec::new();
            if provider.mcp_passthrough {
                for (name, value) in inbound.headers.iter() {
                    if name.as_str().starts_with("x-mcp-") {
                        if let Ok(value) = value.to_str() {
                            extra_headers.push((name.as_str().to_string(), value.to_string()));
                        }
                    }
                }
            }

            let path = translate::provider_request_path(
                provider.provider_type,
                provider.redirect_model(&request.model),
                request.stream,
            );
            tracing::debug!(
                provider = %provider.id,
                attempt,
                path = %path,
                stream = request.stream,
                "Forwarding to upstream"
            );

            let sent = self
                .upstream
                .send(
                    ForwardRequest {
                        provider: &provider,
                        path,
                        body,
                        stream: request.stream,
                        enable_http2: settings.enable_http2,
                        extra_headers,
                    },
                    &scope.cancel,
                )
                .await;

            match sent {
                Ok(ForwardResponse::Json { body, ttfb_ms, .. }) => {
                    self.push_chain(&scope, &provider, AttemptOutcome::Success, Some(200));
                    return self
                        .complete_json(
                            scope,
                            &inbound,
                            &provider,
                            body,
                            ttfb_ms,
                            session_id,
                            request_sequence,
                        )
                        .await;
                }
                Ok(ForwardResponse::Stream { stream, ttfb_ms, .. }) => {
                    self.push_chain(&scope, &provider, AttemptOutcome::Success, Some(200));
                    return self
                        .complete_stream(
                            scope,
                            &inbound,
                            &provider,
                            stream,
                            ttfb_ms,
                            session_id,
                            request_sequence,
                        )
                        .await;
                }
                Err(e) => {
                    let outcome_kind = match &e {
                        ProxyError::Upstream4xx { status, .. } => {
                            self.push_chain(&scope, &provider, AttemptOutcome::Upstream4xx, Some(*status));
                            None
                        }
                        ProxyError::Upstream5xx { status, .. } => {
                            Some((AttemptOutcome::Upstream5xx, Some(*status)))
                        }
                        ProxyError::UpstreamTimeout { .. } => {
                            Some((AttemptOutcome::Timeout, None))
                        }
                        ProxyError::ConnectionError { .. } => {
                            Some((AttemptOutcome::ConnectionError, None))
                        }
                        ProxyError::Cancelled => {
                            self.release_attempt(&scope, &provider, resolution.session_tracked)
                                .await;
                            return self.fail_terminal(scope, ProxyError::Cancelled).await;
                        }
                        _ => None,
                    };

                    if let Some((kind, status)) = outcome_kind {
                        // Retryable failure: report, release, loop.
                        self.push_chain(&scope, &provider, kind, status);
                        if e.is_breaker_failure(
                            self.config.breaker_on_network_errors
                                || settings.circuit_breaker_on_network_errors,
                        ) {
                            self.breaker.record_failure(&provider, &e.to_string()).await;
                        }
                        self.release_attempt(&scope, &provider, resolution.session_tracked)
                            .await;
                        tracing::warn!(
                            provider = %provider.id,
                            attempt,
                            error = %e,
                            "Attempt failed, trying next provider"
                        );
                        last_error = Some(e);
                        continue;
                    }

                    // Non-retryable: 4xx and translation errors short-circuit.
                    self.release_attempt(&scope, &provider, resolution.session_tracked)
                        .await;
                    return self.fail_terminal(scope, e).await;
                }
            }
        }

        let terminal = last_error.unwrap_or(ProxyError::NoProviderAvailable {
            model: request.model.clone(),
        });
        self.fail_terminal(scope, terminal).await
    }

    fn push_chain(
        &self,
        scope: &RequestScope,
        provider: &Provider,
        outcome: AttemptOutcome,
        status: Option<u16>,
    ) {
        let mut state = scope.state.lock().expect("scope mutex poisoned");
        if let Some(state) = state.as_mut() {
            state.outcome.provider_chain.push(ProviderAttempt {
                provider_id: provider.id.clone(),
                outcome,
                status_code: status,
            });
        }
    }

    /// Undo the per-attempt provider reservation after a failed attempt.
    async fn release_attempt(&self, scope: &RequestScope, provider: &Provider, tracked: bool) {
        if tracked {
            let session_id = {
                let state = scope.state.lock().expect("scope mutex poisoned");
                state.as_ref().map(|s| s.outcome.session_id.clone())
            };
            if let Some(session_id) = session_id {
                self.limits
                    .untrack_session("provider", &provider.id, &session_id)
                    .await;
            }
        }
        let mut state = scope.state.lock().expect("scope mutex poisoned");
        if let Some(state) = state.as_mut() {
            state.provider_tracked = None;
        }
    }

    async fn fail_terminal(
        &self,
        scope: Arc<RequestScope>,
        error: ProxyError,
    ) -> Result<PipelineResponse, ProxyError> {
        if let Some(state) = scope.take() {
            scope
                .finalize(
                    state,
                    outcome_status(&error),
                    NormalizedUsage::default(),
                    Some(error.to_string()),
                    false,
                )
                .await;
        }
        Err(error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_json(
        &self,
        scope: Arc<RequestScope>,
        inbound: &InboundRequest,
        provider: &Provider,
        body: Bytes,
        ttfb_ms: u64,
        session_id: String,
        request_sequence: i64,
    ) -> Result<PipelineResponse, ProxyError> {
        let requested_model = {
            let state = scope.state.lock().expect("scope mutex poisoned");
            state.as_ref().map(|s| s.outcome.model.clone())
        };
        let wire = provider.provider_type.wire_family();
        let response = match translate::parse_provider_response(wire, &body) {
            Ok(response) => response,
            Err(e) => {
                return self.fail_terminal(scope, e).await;
            }
        };

        let usage = if response.usage.is_empty() {
            let previous = self.sessions.last_input_tokens(&session_id).await;
            let text_len: usize = response
                .blocks
                .iter()
                .map(|b| match b {
                    translate::ContentBlock::Text { text } => text.len(),
                    _ => 0,
                })
                .sum();
            translate::estimate_usage(inbound.body.len(), text_len, previous)
        } else {
            response.usage
        };

        if let Some(mut state) = scope.take() {
            state.outcome.ttfb_ms = Some(ttfb_ms);
            scope.finalize(state, 200, usage, None, true).await;
        }

        let mut rendered = translate::render_client_response(inbound.family, &response);
        // Clients see the model they asked for, not the redirect target.
        if let Some(model) = requested_model {
            if inbound.family != ApiFamily::Gemini && rendered.get("model").is_some() {
                rendered["model"] = serde_json::Value::String(model);
            }
        }
        self.sessions.store_payload(
            &session_id,
            "response",
            rendered.to_string(),
        );

        Ok(PipelineResponse::Json {
            status: 200,
            content_type: "application/json",
            body: serde_json::to_vec(&rendered)
                .map_err(|e| ProxyError::Internal(e.to_string()))?,
            meta: ResponseMeta {
                session_id,
                request_sequence,
                provider_id: Some(provider.id.clone()),
                intercepted: None,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_stream(
        &self,
        scope: Arc<RequestScope>,
        inbound: &InboundRequest,
        provider: &Provider,
        mut upstream: BoxStream<'static, Result<Bytes, ProxyError>>,
        ttfb_ms: u64,
        session_id: String,
        request_sequence: i64,
    ) -> Result<PipelineResponse, ProxyError> {
        {
            let mut state = scope.state.lock().expect("scope mutex poisoned");
            if let Some(state) = state.as_mut() {
                state.outcome.ttfb_ms = Some(ttfb_ms);
            }
        }

        let wire = provider.provider_type.wire_family();
        let mut translator = StreamTranslator::new(wire, inbound.family);
        let outcome_handle = translator.outcome();
        let sessions = self.sessions.clone();
        let request_bytes = inbound.body.len();
        let stream_session = session_id.clone();

        let stream = async_stream::stream! {
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        let translated = translator.process(&chunk);
                        if !translated.is_empty() {
                            yield Ok(Bytes::from(translated));
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Upstream stream error mid-response");
                        let tail = translator.finalize();
                        if !tail.is_empty() {
                            yield Ok(Bytes::from(tail));
                        }
                        finish_stream(
                            &scope,
                            &sessions,
                            &outcome_handle,
                            request_bytes,
                            &stream_session,
                            outcome_status(&e),
                            Some(e.to_string()),
                        )
                        .await;
                        yield Err(std::io::Error::other(e.to_string()));
                        return;
                    }
                    None => {
                        let tail = translator.finalize();
                        if !tail.is_empty() {
                            yield Ok(Bytes::from(tail));
                        }
                        finish_stream(
                            &scope,
                            &sessions,
                            &outcome_handle,
                            request_bytes,
                            &stream_session,
                            200,
                            None,
                        )
                        .await;
                        return;
                    }
                }
            }
        };

        Ok(PipelineResponse::Stream {
            status: 200,
            stream: stream.boxed(),
            meta: ResponseMeta {
                session_id,
                request_sequence,
                provider_id: Some(provider.id.clone()),
                intercepted: None,
            },
        })
    }

    async fn record_blocked(
        &self,
        request_id: &str,
        user: &User,
        key: &ApiKey,
        inbound: &InboundRequest,
        blocked_by: BlockedBy,
        status: u16,
        user_agent: Option<String>,
        started: Instant,
    ) {
        let model = serde_json::from_slice::<serde_json::Value>(&inbound.body)
            .ok()
            .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from))
            .or_else(|| inbound.model_from_path.clone())
            .unwrap_or_default();
        let outcome = RequestOutcome {
            id: request_id.to_string(),
            created_at: Utc::now(),
            user_id: user.id.clone(),
            key_id: key.id.clone(),
            provider_id: None,
            session_id: String::new(),
            request_sequence: 0,
            endpoint: inbound.endpoint.clone(),
            model,
            model_redirected: None,
            status_code: status,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: 0.0,
            cost_multiplier: 1.0,
            duration_ms: started.elapsed().as_millis() as u64,
            ttfb_ms: None,
            error_message: None,
            provider_chain: Vec::new(),
            blocked_by: Some(blocked_by),
            user_agent,
        };
        self.sink.record(outcome).await;
    }
}

/// Account for a finished (or broken) stream: pick observed usage when the
/// upstream reported it, estimate otherwise, then finalize the scope.
#[allow(clippy::too_many_arguments)]
async fn finish_stream(
    scope: &Arc<RequestScope>,
    sessions: &Arc<SessionManager>,
    outcome_handle: &Arc<StdMutex<translate::sse::StreamOutcome>>,
    request_bytes: usize,
    session_id: &str,
    status: u16,
    error_message: Option<String>,
) {
    let observed = outcome_handle
        .lock()
        .expect("outcome mutex poisoned")
        .clone();
    let usage = if observed.saw_usage {
        observed.usage
    } else {
        let previous = sessions.last_input_tokens(session_id).await;
        translate::estimate_usage(request_bytes, observed.output_text_bytes, previous)
    };
    if let Some(state) = scope.take() {
        scope
            .finalize(state, status, usage, error_message, status < 400)
            .await;
    }
}

/// Content policy: case-insensitive word match plus configured regex
/// filters. Unparsable filter patterns are skipped with a warning rather
/// than failing the request.
fn content_blocked(text: &str, words: &[String], patterns: &[String]) -> bool {
    let lower = text.to_ascii_lowercase();
    if words
        .iter()
        .any(|word| !word.is_empty() && lower.contains(&word.to_ascii_lowercase()))
    {
        return true;
    }
    patterns.iter().any(|pattern| match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Invalid request filter pattern");
            false
        }
    })
}

/// Lowercase and strip `-`/`_` before substring matching; an empty pattern
/// list allows every client.
fn client_allowed(patterns: &[String], user_agent: Option<&str>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let Some(user_agent) = user_agent else {
        return false;
    };
    let normalized = normalize_client(user_agent);
    patterns.iter().any(|pattern| {
        let pattern = normalize_client(pattern);
        !pattern.is_empty() && normalized.contains(&pattern)
    })
}

fn normalize_client(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConfigDb;
    use crate::models::tests::test_provider;
    use crate::models::{DailyResetMode, QuotaLimits, Role};
    use crate::store::{keys as store_keys, MemoryStore, SharedStore};
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};

    #[test]
    fn client_guard_normalizes_separators() {
        let patterns = vec!["claude-cli".to_string()];
        assert!(client_allowed(&patterns, Some("Claude_CLI/1.2.3")));
        assert!(client_allowed(&patterns, Some("claudecli")));
        assert!(!client_allowed(&patterns, Some("curl/8.0")));
        assert!(!client_allowed(&patterns, None));
        assert!(client_allowed(&[], None));
    }

    #[test]
    fn content_filter_matches_words_and_patterns() {
        let words = vec!["forbidden".to_string()];
        let patterns = vec![r"\bsecret-\d+\b".to_string()];
        assert!(content_blocked("this is FORBIDDEN text", &words, &[]));
        assert!(content_blocked("leak secret-42 now", &[], &patterns));
        assert!(!content_blocked("harmless", &words, &patterns));
        // A broken pattern never blocks.
        assert!(!content_blocked("anything", &[], &["(unclosed".to_string()]));
    }

    // ── scripted upstream ────────────────────────────────────────────────

    #[derive(Clone)]
    enum Script {
        Json(serde_json::Value),
        Fail5xx(u16),
        Fail4xx(u16),
        Timeout,
    }

    struct ScriptedUpstream {
        scripts: StdMutex<HashMap<String, VecDeque<Script>>>,
    }

    impl ScriptedUpstream {
        fn new(scripts: Vec<(&str, Vec<Script>)>) -> Self {
            Self {
                scripts: StdMutex::new(
                    scripts
                        .into_iter()
                        .map(|(id, s)| (id.to_string(), s.into_iter().collect()))
                        .collect(),
                ),
            }
        }

        fn next_for(&self, provider_id: &str) -> Script {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(provider_id)
                .unwrap_or_else(|| panic!("no script for provider {provider_id}"));
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().expect("script exhausted")
            }
        }
    }

    #[async_trait::async_trait]
    impl Upstream for ScriptedUpstream {
        async fn send(
            &self,
            request: ForwardRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ForwardResponse, ProxyError> {
            match self.next_for(&request.provider.id) {
                Script::Json(value) => Ok(ForwardResponse::Json {
                    status: 200,
                    body: Bytes::from(serde_json::to_vec(&value).unwrap()),
                    ttfb_ms: 5,
                }),
                Script::Fail5xx(status) => Err(ProxyError::Upstream5xx {
                    status,
                    message: "scripted upstream failure".into(),
                }),
                Script::Fail4xx(status) => Err(ProxyError::Upstream4xx {
                    status,
                    message: "scripted client failure".into(),
                }),
                Script::Timeout => Err(ProxyError::UpstreamTimeout {
                    message: "scripted timeout".into(),
                }),
            }
        }
    }

    // ── harness ──────────────────────────────────────────────────────────

    struct Harness {
        pipeline: Arc<Pipeline>,
        db: ConfigDb,
        store: Arc<dyn SharedStore>,
        sink: Arc<UsageSink>,
    }

    async fn harness(
        providers: Vec<Provider>,
        upstream: ScriptedUpstream,
        settings: Option<SystemSettings>,
        key_quotas: QuotaLimits,
    ) -> Harness {
        let db = ConfigDb::open_in_memory().unwrap();
        let user = User {
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
            allowed_clients: Vec::new(),
            allowed_models: Vec::new(),
            provider_groups: Vec::new(),
            tags: Vec::new(),
        };
        db.upsert_user(&user).await.unwrap();
        let key = ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            hashed_secret: hex::encode(Sha256::digest(b"test-key")),
            enabled: true,
            expires_at: None,
            quotas: key_quotas,
            can_login_web_ui: false,
            provider_groups: Vec::new(),
        };
        db.upsert_key(&key).await.unwrap();
        for provider in &providers {
            db.upsert_provider(provider).await.unwrap();
        }
        if let Some(settings) = settings {
            db.set_system_settings(&settings).await.unwrap();
        }

        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(ConfigCache::new(db.clone()));
        let limits = Arc::new(RateLimitService::new(
            store.clone(),
            db.clone(),
            true,
            Duration::from_secs(300),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            Duration::from_secs(300),
            false,
        ));
        let breaker = Arc::new(CircuitBreaker::new(store.clone()));
        let resolver = Arc::new(ProviderResolver::new(
            cache.clone(),
            breaker.clone(),
            limits.clone(),
        ));
        let sink = Arc::new(UsageSink::queue_only(
            db.clone(),
            crate::config::SinkConfig::default(),
        ));
        let pipeline = Arc::new(Pipeline {
            config: Config::default(),
            cache,
            limits,
            sessions,
            breaker,
            resolver,
            upstream: Arc::new(upstream),
            sink: sink.clone(),
        });
        Harness {
            pipeline,
            db,
            store,
            sink,
        }
    }

    fn claude_inbound(body: serde_json::Value) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer test-key".parse().unwrap());
        headers.insert("user-agent", "claude-cli/1.0".parse().unwrap());
        InboundRequest {
            family: ApiFamily::Claude,
            endpoint: "/v1/messages".into(),
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            model_from_path: None,
            stream_from_path: false,
        }
    }

    fn claude_success_body() -> serde_json::Value {
        json!({
            "id": "msg_ok",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "Hello! How can I help you today?"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 198}
        })
    }

    fn simple_request() -> serde_json::Value {
        json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        })
    }

    async fn first_outcome(harness: &Harness) -> RequestOutcome {
        harness.sink.flush().await;
        let ids = harness.db.list_outcome_ids().await.unwrap();
        assert!(!ids.is_empty(), "no outcome rows recorded");
        harness.db.get_outcome(&ids[0]).await.unwrap().unwrap()
    }

    // ── scenarios ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_records_single_attempt() {
        let mut a = test_provider("pa");
        a.weight = 50;
        let mut b = test_provider("pb");
        b.weight = 50;
        let upstream = ScriptedUpstream::new(vec![
            ("pa", vec![Script::Json(claude_success_body())]),
            ("pb", vec![Script::Json(claude_success_body())]),
        ]);
        let harness = harness(vec![a, b], upstream, None, QuotaLimits::default()).await;

        let response = harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .unwrap();
        let meta = match response {
            PipelineResponse::Json { status, meta, body, .. } => {
                assert_eq!(status, 200);
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["content"][0]["text"], "Hello! How can I help you today?");
                meta
            }
            _ => panic!("expected json response"),
        };
        assert_eq!(meta.request_sequence, 1);
        assert!(meta.provider_id.is_some());

        let outcome = first_outcome(&harness).await;
        assert_eq!(outcome.provider_chain.len(), 1);
        assert_eq!(outcome.provider_chain[0].outcome, AttemptOutcome::Success);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.request_sequence, 1);
        assert!((outcome.cost_usd - 0.003).abs() < 0.0005, "cost {}", outcome.cost_usd);
    }

    #[tokio::test]
    async fn retry_moves_to_next_provider_and_returns_its_body() {
        let mut a = test_provider("pa");
        a.priority = 0;
        let mut b = test_provider("pb");
        b.priority = 1;
        let upstream = ScriptedUpstream::new(vec![
            ("pa", vec![Script::Fail5xx(503)]),
            ("pb", vec![Script::Json(claude_success_body())]),
        ]);
        let harness = harness(vec![a.clone(), b], upstream, None, QuotaLimits::default()).await;

        let response = harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .unwrap();
        match response {
            PipelineResponse::Json { meta, .. } => {
                assert_eq!(meta.provider_id.as_deref(), Some("pb"));
            }
            _ => panic!("expected json response"),
        }

        let outcome = first_outcome(&harness).await;
        assert_eq!(outcome.provider_chain.len(), 2);
        assert_eq!(outcome.provider_chain[0].provider_id, "pa");
        assert_eq!(outcome.provider_chain[0].outcome, AttemptOutcome::Upstream5xx);
        assert_eq!(outcome.provider_chain[1].provider_id, "pb");
        assert_eq!(outcome.provider_chain[1].outcome, AttemptOutcome::Success);

        // Circuit A counted exactly one failure.
        let state = harness
            .pipeline
            .breaker
            .state_of(&store_keys::breaker_provider("pa"))
            .await
            .unwrap();
        assert_eq!(state, crate::breaker::BreakerState::Closed { failures: 1 });
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_routes_around() {
        let mut a = test_provider("pa");
        a.priority = 0;
        a.breaker.failure_threshold = 5;
        a.vendor_id = Some("vendor-a".into());
        let mut b = test_provider("pb");
        b.priority = 1;
        b.vendor_id = Some("vendor-b".into());
        let upstream = ScriptedUpstream::new(vec![
            ("pa", vec![Script::Fail5xx(502)]),
            ("pb", vec![Script::Json(claude_success_body())]),
        ]);
        let harness = harness(vec![a, b], upstream, None, QuotaLimits::default()).await;

        for _ in 0..5 {
            harness
                .pipeline
                .handle(claude_inbound(simple_request()))
                .await
                .unwrap();
        }
        let state = harness
            .pipeline
            .breaker
            .state_of(&store_keys::breaker_provider("pa"))
            .await
            .unwrap();
        assert!(matches!(state, crate::breaker::BreakerState::Open { .. }));

        // Next request never touches A.
        harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .unwrap();
        harness.sink.flush().await;
        let ids = harness.db.list_outcome_ids().await.unwrap();
        let last = harness.db.get_outcome(ids.last().unwrap()).await.unwrap().unwrap();
        assert_eq!(last.provider_chain.len(), 1);
        assert_eq!(last.provider_chain[0].provider_id, "pb");
    }

    #[tokio::test]
    async fn key_five_hour_limit_blocks_before_forwarding() {
        let provider = test_provider("pa");
        let upstream = ScriptedUpstream::new(vec![(
            "pa",
            vec![Script::Json(claude_success_body())],
        )]);
        let harness = harness(
            vec![provider],
            upstream,
            None,
            QuotaLimits {
                five_hour_usd: Some(1.0),
                ..Default::default()
            },
        )
        .await;
        // Key already spent 0.99 of its 1 USD window.
        harness
            .pipeline
            .limits
            .track_subject_cost("key", "k1", "r0", 0.99, "00:00", DailyResetMode::Fixed)
            .await;

        // max_tokens large enough that the estimate exceeds the remainder.
        let body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let err = harness
            .pipeline
            .handle(claude_inbound(body))
            .await
            .err()
            .unwrap();
        match &err {
            ProxyError::RateLimited { message, scope, .. } => {
                assert_eq!(message, "Key 5小时消费上限已达到（0.9900/1）");
                assert_eq!(scope, "key_five_hour");
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(err.status_code().as_u16(), 429);

        let outcome = first_outcome(&harness).await;
        assert_eq!(outcome.blocked_by, Some(BlockedBy::Rate));
        assert_eq!(outcome.status_code, 429);
        assert_eq!(outcome.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn warmup_intercepts_without_touching_counters() {
        let provider = test_provider("pa");
        let upstream = ScriptedUpstream::new(vec![(
            "pa",
            vec![Script::Json(claude_success_body())],
        )]);
        let mut settings = SystemSettings::default();
        settings.intercept_warmup_requests = true;
        let harness = harness(vec![provider], upstream, Some(settings), QuotaLimits::default()).await;

        let body = json!({
            "model": "claude-haiku-3-5",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "quota"}]
        });
        let response = harness
            .pipeline
            .handle(claude_inbound(body))
            .await
            .unwrap();
        match response {
            PipelineResponse::Json { status, body, meta, .. } => {
                assert_eq!(status, 200);
                assert_eq!(meta.intercepted, Some("warmup"));
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["content"][0]["text"], warmup::WARMUP_REPLY);
            }
            _ => panic!("expected json response"),
        }

        // Exactly one outcome, blocked_by=warmup, zero cost.
        let outcome = first_outcome(&harness).await;
        assert_eq!(harness.db.count_outcomes().await.unwrap(), 1);
        assert_eq!(outcome.blocked_by, Some(BlockedBy::Warmup));
        assert_eq!(outcome.cost_usd, 0.0);
        // No provider concurrency was consumed.
        let count = harness
            .store
            .zcount_after_trim(&store_keys::sessions("provider", "pa"), 0.0)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn provider_concurrency_restored_after_success_and_failure() {
        let mut a = test_provider("pa");
        a.quotas.concurrent_sessions = Some(5);
        let upstream = ScriptedUpstream::new(vec![(
            "pa",
            vec![
                Script::Json(claude_success_body()),
                Script::Fail4xx(400),
                Script::Json(claude_success_body()),
            ],
        )]);
        let harness = harness(vec![a], upstream, None, QuotaLimits::default()).await;
        let sessions_key = store_keys::sessions("provider", "pa");

        // Success path releases.
        harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .unwrap();
        assert_eq!(
            harness.store.zcount_after_trim(&sessions_key, 0.0).await.unwrap(),
            0
        );

        // Terminal upstream 4xx releases too.
        let err = harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Upstream4xx { status: 400, .. }));
        assert_eq!(
            harness.store.zcount_after_trim(&sessions_key, 0.0).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_upstream_error() {
        let mut a = test_provider("pa");
        a.priority = 0;
        let mut b = test_provider("pb");
        b.priority = 1;
        let upstream = ScriptedUpstream::new(vec![
            ("pa", vec![Script::Fail5xx(503)]),
            ("pb", vec![Script::Timeout]),
        ]);
        let harness = harness(vec![a, b], upstream, None, QuotaLimits::default()).await;

        let err = harness
            .pipeline
            .handle(claude_inbound(simple_request()))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable(), "terminal error should be the last upstream error");
        assert_eq!(err.status_code().as_u16(), 502);

        let outcome = first_outcome(&harness).await;
        assert_eq!(outcome.provider_chain.len(), 2);
        assert!(outcome.error_message.is_some());
        assert_eq!(outcome.status_code, 502);
    }

    #[tokio::test]
    async fn sequences_increase_within_session() {
        let provider = test_provider("pa");
        let upstream = ScriptedUpstream::new(vec![(
            "pa",
            vec![Script::Json(claude_success_body())],
        )]);
        let harness = harness(vec![provider], upstream, None, QuotaLimits::default()).await;

        let mut sequences = Vec::new();
        for _ in 0..3 {
            // Same body → same derived session id.
            let response = harness
                .pipeline
                .handle(claude_inbound(simple_request()))
                .await
                .unwrap();
            if let PipelineResponse::Json { meta, .. } = response {
                sequences.push(meta.request_sequence);
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
