//! Router assembly and application state.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::breaker::CircuitBreaker;
use crate::cache::{run_invalidation_listener, ConfigCache};
use crate::config::Config;
use crate::db::ConfigDb;
use crate::forward::Forwarder;
use crate::pipeline::Pipeline;
use crate::ratelimit::RateLimitService;
use crate::resolver::ProviderResolver;
use crate::session::SessionManager;
use crate::sink::UsageSink;
use crate::store::{MemoryStore, RedisStore, SharedStore};

use super::{catalog, ingress};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<ConfigCache>,
    pub pipeline: Arc<Pipeline>,
    pub sink: Arc<UsageSink>,
}

/// Wire every component together from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let db = ConfigDb::open(&config.dsn, config.auto_migrate, config.db_busy_timeout_ms)?;

    let store: Arc<dyn SharedStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.redis_tls_reject_unauthorized)
                .await
                .map_err(|e| anyhow::anyhow!("shared store connect failed: {e}"))?;
            tracing::info!("Connected to shared store");
            Arc::new(store)
        }
        None => {
            tracing::info!("REDIS_URL not set, using in-process shared store");
            Arc::new(MemoryStore::new())
        }
    };

    let cache = Arc::new(ConfigCache::new(db.clone()));
    tokio::spawn(run_invalidation_listener(cache.clone(), store.clone()));

    let session_ttl = Duration::from_secs(config.session_ttl_secs.max(1));
    let limits = Arc::new(RateLimitService::new(
        store.clone(),
        db.clone(),
        config.enable_rate_limit,
        session_ttl,
    ));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        session_ttl,
        config.store_session_messages,
    ));
    let breaker = Arc::new(CircuitBreaker::new(store.clone()));
    let resolver = Arc::new(ProviderResolver::new(
        cache.clone(),
        breaker.clone(),
        limits.clone(),
    ));
    let sink = UsageSink::spawn(db.clone(), config.sink.clone());

    let pipeline = Arc::new(Pipeline {
        config: config.clone(),
        cache: cache.clone(),
        limits,
        sessions,
        breaker,
        resolver,
        upstream: Arc::new(Forwarder::new()),
        sink: sink.clone(),
    });

    Ok(Arc::new(AppState {
        config,
        cache,
        pipeline,
        sink,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Anthropic Messages
        .route("/v1/messages", post(ingress::messages))
        // OpenAI Chat Completions and Responses
        .route("/v1/chat/completions", post(ingress::chat_completions))
        .route("/v1/responses", post(ingress::responses))
        // Gemini generateContent / streamGenerateContent
        .route("/v1beta/models/:model_action", post(ingress::gemini_generate))
        // Aggregated model catalog
        .route("/v1/models", get(catalog::list_models))
        .route("/v1beta/models", get(catalog::list_models))
        // Liveness
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let port = config.port;
    let state = build_state(config).await?;
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
