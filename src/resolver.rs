//! Provider selection: filter → score → pick → reserve.
//!
//! Candidates are filtered by enablement, API family, model support,
//! provider groups, retry exclusions, circuit state and quota snapshots;
//! the survivors are grouped into priority tiers and picked by weighted
//! random within the best tier, with a session-affinity bonus for the
//! provider that served the session last. The chosen provider's
//! concurrency slot is reserved atomically; losing that race puts the
//! provider on the excluded list and the pick repeats.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

use crate::breaker::CircuitBreaker;
use crate::cache::ConfigCache;
use crate::error::ProxyError;
use crate::models::{ApiFamily, ApiKey, Provider, User};
use crate::ratelimit::RateLimitService;

/// Fraction of the tier's weight sum granted as affinity bonus.
const AFFINITY_BONUS_FACTOR: f64 = 0.25;

/// Inputs for one resolution round.
pub struct ResolveRequest<'a> {
    pub user: &'a User,
    pub key: &'a ApiKey,
    pub model: &'a str,
    pub family: ApiFamily,
    /// Providers already attempted in this request (never reselected).
    pub already_tried: &'a HashSet<String>,
    pub session_id: &'a str,
    /// Session affinity hint.
    pub last_provider_id: Option<&'a str>,
}

/// A selected provider with its concurrency reservation state.
pub struct Resolution {
    pub provider: Provider,
    /// True when this resolution inserted the session into the provider's
    /// live set; the caller owns the matching untrack.
    pub session_tracked: bool,
}

pub struct ProviderResolver {
    cache: Arc<ConfigCache>,
    breaker: Arc<CircuitBreaker>,
    limits: Arc<RateLimitService>,
}

impl ProviderResolver {
    pub fn new(
        cache: Arc<ConfigCache>,
        breaker: Arc<CircuitBreaker>,
        limits: Arc<RateLimitService>,
    ) -> Self {
        Self {
            cache,
            breaker,
            limits,
        }
    }

    /// Pick an eligible provider and reserve its concurrency slot.
    pub async fn resolve(&self, req: ResolveRequest<'_>) -> Result<Resolution, ProxyError> {
        let now = Utc::now();
        let effective_groups: &[String] = if !req.key.provider_groups.is_empty() {
            &req.key.provider_groups
        } else {
            &req.user.provider_groups
        };

        let mut candidates = Vec::new();
        for provider in self.cache.list_providers().await {
            if !provider.is_usable(now) {
                continue;
            }
            if !req
                .family
                .accepts(provider.provider_type, provider.join_claude_pool)
            {
                continue;
            }
            if !provider.supports_model(req.model) {
                continue;
            }
            if !effective_groups.is_empty() {
                let in_group = provider
                    .group_tag
                    .as_ref()
                    .map(|tag| effective_groups.iter().any(|g| g == tag))
                    .unwrap_or(false);
                if !in_group {
                    continue;
                }
            }
            if req.already_tried.contains(&provider.id) {
                continue;
            }
            self.breaker.hydrate(&provider).await;
            if self.breaker.is_blocked(&provider).await {
                continue;
            }
            if !self
                .limits
                .windows_within_limits("provider", &provider.id, &provider.quotas)
                .await
            {
                tracing::debug!(provider = %provider.id, "Provider over cost quota, excluded");
                continue;
            }
            if !self
                .limits
                .check_total_cost(
                    "provider",
                    "provider_id",
                    &provider.id,
                    provider.quotas.total_usd,
                    0.0,
                )
                .await
                .allowed
            {
                tracing::debug!(provider = %provider.id, "Provider over total quota, excluded");
                continue;
            }
            candidates.push(provider);
        }

        // Re-picking after a lost concurrency race only needs local state.
        let mut excluded: HashSet<String> = HashSet::new();
        loop {
            let pool: Vec<&Provider> = candidates
                .iter()
                .filter(|p| !excluded.contains(&p.id))
                .collect();
            let Some(chosen) = pick(&pool, req.last_provider_id, &mut rand::thread_rng()) else {
                return Err(ProxyError::NoProviderAvailable {
                    model: req.model.to_string(),
                });
            };
            let chosen = chosen.clone();

            // The breaker may have tripped between filtering and picking.
            if !self.breaker.acquire(&chosen).await {
                excluded.insert(chosen.id.clone());
                continue;
            }

            let track = self
                .limits
                .check_and_track_session(
                    "provider",
                    &chosen.id,
                    req.session_id,
                    chosen.quotas.concurrent_sessions,
                )
                .await;
            if !track.allowed {
                tracing::debug!(
                    provider = %chosen.id,
                    count = track.count,
                    "Provider at concurrency cap, re-picking"
                );
                excluded.insert(chosen.id.clone());
                continue;
            }

            tracing::debug!(
                provider = %chosen.id,
                model = %req.model,
                family = %req.family.as_str(),
                session = %req.session_id,
                "Provider selected"
            );
            return Ok(Resolution {
                provider: chosen,
                session_tracked: track.tracked,
            });
        }
    }
}

/// Weighted pick within the best (lowest) priority tier.
///
/// Zero-weight providers are last-resort: they participate only when the
/// tier has no positive-weight candidate. The session's last provider gets
/// an affinity bonus of `0.25 × Σ tier weights` when it sits in the tier.
fn pick<'a, R: Rng>(
    pool: &[&'a Provider],
    last_provider_id: Option<&str>,
    rng: &mut R,
) -> Option<&'a Provider> {
    let top_priority = pool.iter().map(|p| p.priority).min()?;
    let tier: Vec<&Provider> = pool
        .iter()
        .copied()
        .filter(|p| p.priority == top_priority)
        .collect();

    let weight_sum: u64 = tier.iter().map(|p| p.weight as u64).sum();
    if weight_sum == 0 {
        // All-zero tier: uniform random.
        return Some(tier[rng.gen_range(0..tier.len())]);
    }

    let positive: Vec<&Provider> = tier.iter().copied().filter(|p| p.weight > 0).collect();
    let affinity_bonus = AFFINITY_BONUS_FACTOR * weight_sum as f64;
    let effective = |p: &Provider| -> f64 {
        let base = p.weight as f64;
        if Some(p.id.as_str()) == last_provider_id {
            base + affinity_bonus
        } else {
            base
        }
    };

    let total: f64 = positive.iter().map(|p| effective(p)).sum();
    let mut roll = rng.gen_range(0.0..total);
    for provider in &positive {
        roll -= effective(provider);
        if roll <= 0.0 {
            return Some(provider);
        }
    }
    positive.last().copied()
}
