//! In-process cache over the configuration store.
//!
//! Single writer (the refreshing reader), many readers. Entries live for
//! 60 s; admin writes broadcast invalidations on the shared store's
//! `provider_cache_invalidate` channel so every gateway process evicts
//! promptly instead of waiting out the TTL. On refresh failure the last
//! known value is served (fail-open); settings fall back to the
//! conservative default when nothing was ever loaded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::db::ConfigDb;
use crate::models::{ApiKey, ModelPrice, Provider, SystemSettings, User};
use crate::store::{SharedStore, INVALIDATION_CHANNEL};

pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

impl<V> Cached<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Cached read access to users, keys, providers, prices and settings.
pub struct ConfigCache {
    db: ConfigDb,
    ttl: Duration,
    keys_by_hash: RwLock<HashMap<String, Cached<Option<ApiKey>>>>,
    users: RwLock<HashMap<String, Cached<Option<User>>>>,
    providers: RwLock<Option<Cached<Vec<Provider>>>>,
    settings: RwLock<Option<Cached<SystemSettings>>>,
    prices: RwLock<HashMap<String, Cached<Option<ModelPrice>>>>,
}

impl ConfigCache {
    pub fn new(db: ConfigDb) -> Self {
        Self::with_ttl(db, CONFIG_CACHE_TTL)
    }

    pub fn with_ttl(db: ConfigDb, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            keys_by_hash: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            providers: RwLock::new(None),
            settings: RwLock::new(None),
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &ConfigDb {
        &self.db
    }

    pub async fn get_key_by_hash(&self, hashed_secret: &str) -> Option<ApiKey> {
        {
            let cache = self.keys_by_hash.read().await;
            if let Some(entry) = cache.get(hashed_secret) {
                if entry.is_fresh(self.ttl) {
                    return entry.value.clone();
                }
            }
        }
        match self.db.get_key_by_hash(hashed_secret).await {
            Ok(key) => {
                let mut cache = self.keys_by_hash.write().await;
                cache.insert(hashed_secret.to_string(), Cached::new(key.clone()));
                key
            }
            Err(e) => {
                tracing::warn!(error = %e, "Key refresh failed, serving stale value");
                let cache = self.keys_by_hash.read().await;
                cache.get(hashed_secret).and_then(|c| c.value.clone())
            }
        }
    }

    pub async fn get_user(&self, id: &str) -> Option<User> {
        {
            let cache = self.users.read().await;
            if let Some(entry) = cache.get(id) {
                if entry.is_fresh(self.ttl) {
                    return entry.value.clone();
                }
            }
        }
        match self.db.get_user(id).await {
            Ok(user) => {
                let mut cache = self.users.write().await;
                cache.insert(id.to_string(), Cached::new(user.clone()));
                user
            }
            Err(e) => {
                tracing::warn!(user = %id, error = %e, "User refresh failed, serving stale value");
                let cache = self.users.read().await;
                cache.get(id).and_then(|c| c.value.clone())
            }
        }
    }

    /// Full provider list; cached as one unit since the resolver always
    /// filters the whole set.
    pub async fn list_providers(&self) -> Vec<Provider> {
        {
            let cache = self.providers.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.is_fresh(self.ttl) {
                    return entry.value.clone();
                }
            }
        }
        match self.db.list_providers().await {
            Ok(providers) => {
                let mut cache = self.providers.write().await;
                *cache = Some(Cached::new(providers.clone()));
                providers
            }
            Err(e) => {
                tracing::warn!(error = %e, "Provider refresh failed, serving stale list");
                let cache = self.providers.read().await;
                cache.as_ref().map(|c| c.value.clone()).unwrap_or_default()
            }
        }
    }

    pub async fn get_provider(&self, id: &str) -> Option<Provider> {
        self.list_providers().await.into_iter().find(|p| p.id == id)
    }

    /// System settings, falling back to the conservative default when the
    /// row is missing or has never been readable.
    pub async fn get_settings(&self) -> SystemSettings {
        {
            let cache = self.settings.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.is_fresh(self.ttl) {
                    return entry.value.clone();
                }
            }
        }
        match self.db.get_system_settings().await {
            Ok(loaded) => {
                let settings = loaded.unwrap_or_default();
                let mut cache = self.settings.write().await;
                *cache = Some(Cached::new(settings.clone()));
                settings
            }
            Err(e) => {
                tracing::warn!(error = %e, "Settings refresh failed, serving stale value");
                let cache = self.settings.read().await;
                cache
                    .as_ref()
                    .map(|c| c.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub async fn get_model_price(&self, model: &str) -> Option<ModelPrice> {
        {
            let cache = self.prices.read().await;
            if let Some(entry) = cache.get(model) {
                if entry.is_fresh(self.ttl) {
                    return entry.value.clone();
                }
            }
        }
        match self.db.get_model_price(model).await {
            Ok(price) => {
                let mut cache = self.prices.write().await;
                cache.insert(model.to_string(), Cached::new(price.clone()));
                price
            }
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Price refresh failed, serving stale value");
                let cache = self.prices.read().await;
                cache.get(model).and_then(|c| c.value.clone())
            }
        }
    }

    /// Evict entries named by an invalidation notice.
    ///
    /// Message grammar: `provider[:id]`, `user:{id}`, `key:{hash}`,
    /// `price:{model}`, `settings`, or `*` for everything.
    pub async fn invalidate(&self, message: &str) {
        let (kind, id) = match message.split_once(':') {
            Some((kind, id)) => (kind, Some(id)),
            None => (message, None),
        };
        match kind {
            "provider" => {
                *self.providers.write().await = None;
            }
            "user" => match id {
                Some(id) => {
                    self.users.write().await.remove(id);
                }
                None => self.users.write().await.clear(),
            },
            "key" => match id {
                Some(id) => {
                    self.keys_by_hash.write().await.remove(id);
                }
                None => self.keys_by_hash.write().await.clear(),
            },
            "price" => match id {
                Some(id) => {
                    self.prices.write().await.remove(id);
                }
                None => self.prices.write().await.clear(),
            },
            "settings" => {
                *self.settings.write().await = None;
            }
            "*" => {
                *self.providers.write().await = None;
                *self.settings.write().await = None;
                self.users.write().await.clear();
                self.keys_by_hash.write().await.clear();
                self.prices.write().await.clear();
            }
            other => {
                tracing::debug!(message = %other, "Ignoring unknown invalidation notice");
            }
        }
    }
}

/// Subscribe to the invalidation channel and evict on every notice.
///
/// Runs until the store subscription ends (e.g. shutdown).
pub async fn run_invalidation_listener(cache: Arc<ConfigCache>, store: Arc<dyn SharedStore>) {
    let mut rx = match store.subscribe(INVALIDATION_CHANNEL).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(error = %e, "Cache invalidation subscription unavailable; relying on TTL only");
            return;
        }
    };
    while let Some(message) = rx.recv().await {
        tracing::debug!(notice = %message, "Config cache invalidation");
        cache.invalidate(&message).await;
    }
}
