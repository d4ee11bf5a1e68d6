//! Aggregated model catalog.
//!
//! `/v1/models` returns the union of all enabled providers' declared
//! models, de-duplicated, with an `owned_by` inferred from the model id
//! prefix. Redirect targets are not advertised separately.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use super::routes::AppState;

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

#[derive(Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

/// Vendor attribution by model-id prefix.
pub fn owned_by(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("claude") {
        "anthropic"
    } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        "openai"
    } else if lower.starts_with("gemini") {
        "google"
    } else if lower.starts_with("deepseek") {
        "deepseek"
    } else if lower.starts_with("qwen") {
        "alibaba"
    } else {
        "unknown"
    }
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let mut models: BTreeSet<String> = BTreeSet::new();
    let redirect_targets: BTreeSet<String> = state
        .cache
        .list_providers()
        .await
        .iter()
        .flat_map(|p| p.model_redirects.values().cloned())
        .collect();
    for provider in state.cache.list_providers().await {
        if !provider.is_usable(now) {
            continue;
        }
        for model in &provider.allowed_models {
            models.insert(model.clone());
        }
        for source in provider.model_redirects.keys() {
            models.insert(source.clone());
        }
    }
    // Advertise redirect sources, not their targets.
    let data = models
        .into_iter()
        .filter(|m| !redirect_targets.contains(m))
        .map(|id| ModelObject {
            owned_by: owned_by(&id),
            id,
            object: "model",
            created: now.timestamp(),
        })
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_inference_by_prefix() {
        assert_eq!(owned_by("claude-sonnet-4"), "anthropic");
        assert_eq!(owned_by("gpt-5"), "openai");
        assert_eq!(owned_by("o3-mini"), "openai");
        assert_eq!(owned_by("gemini-2.5-pro"), "google");
        assert_eq!(owned_by("deepseek-chat"), "deepseek");
        assert_eq!(owned_by("qwen-max"), "alibaba");
        assert_eq!(owned_by("mystery"), "unknown");
    }
}
