//! Bidirectional translation between the three supported API families.
//!
//! Requests and responses are lifted into one normalized representation at
//! the edge, so the forwarder and pipeline stay protocol-agnostic. Each
//! family module owns its wire schema and the conversions to and from the
//! normalized form; streaming translation re-parses SSE events into typed
//! [`StreamEvent`]s and re-emits them in the client's native shape.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;
use crate::models::{ApiFamily, Provider, ProviderType};

// ─────────────────────────────────────────────────────────────────────────────
// Normalized request/response
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgRole {
    User,
    Assistant,
}

/// One content block of a normalized message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// Opaque media block, forwarded untranslated where the target supports it.
    Image {
        source: Value,
    },
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: MsgRole,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the tool parameters.
    pub parameters: Value,
}

/// The protocol-agnostic request the pipeline routes.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<NormalizedMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    /// Client metadata forwarded opaquely (e.g. Anthropic `metadata`).
    pub metadata: Option<Value>,
    /// Codex Responses API extras (reasoning effort, verbosity, ...).
    pub responses_options: Option<Value>,
}

impl Default for NormalizedMessage {
    fn default() -> Self {
        Self {
            role: MsgRole::User,
            blocks: Vec::new(),
        }
    }
}

impl NormalizedRequest {
    /// Concatenated text of the last user message (warmup fingerprinting,
    /// content policy checks).
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MsgRole::User)
            .map(|m| {
                m.blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    /// All text the client sent (system + messages), for policy filtering.
    pub fn all_text(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(system);
            out.push('\n');
        }
        for message in &self.messages {
            for block in &message.blocks {
                match block {
                    ContentBlock::Text { text } => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        out.push_str(content);
                        out.push('\n');
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

/// Why generation stopped, normalized across families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ToolCalls,
    Other(String),
}

/// Token usage normalized across provider schemas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl NormalizedUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// The protocol-agnostic response rendered back to the client.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub id: String,
    pub model: String,
    pub blocks: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    pub usage: NormalizedUsage,
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming events
// ─────────────────────────────────────────────────────────────────────────────

/// Typed mid-stream event, the hub representation for SSE translation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        id: String,
        model: String,
    },
    TextDelta {
        index: u32,
        text: String,
    },
    ToolCallStart {
        index: u32,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: u32,
        args_fragment: String,
    },
    /// Usage observed mid-stream (Anthropic sends input usage at start).
    Usage(NormalizedUsage),
    Finish {
        reason: FinishReason,
        usage: Option<NormalizedUsage>,
    },
    Done,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

fn translation_error(context: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::TranslationError {
        message: format!("{context}: {e}"),
    }
}

/// Parse an inbound client body into the normalized request.
pub fn parse_client_request(
    family: ApiFamily,
    body: &[u8],
) -> Result<NormalizedRequest, ProxyError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| translation_error("invalid request body", e))?;
    match family {
        ApiFamily::Claude => claude::parse_request(&value),
        ApiFamily::OpenAi => openai::parse_chat_request(&value),
        ApiFamily::Responses => openai::parse_responses_request(&value),
        ApiFamily::Gemini => gemini::parse_request(&value),
    }
}

/// Render the normalized request in a provider's wire format, applying the
/// provider-level transforms (model redirect, cache TTL, codex
/// instructions strategy, 1M-context preference is a header concern).
pub fn build_provider_request(
    request: &NormalizedRequest,
    provider: &Provider,
) -> Result<Value, ProxyError> {
    let mut request = request.clone();
    request.model = provider.redirect_model(&request.model).to_string();

    let wire = provider.provider_type.wire_family();
    let mut body = match wire {
        ApiFamily::Claude => {
            let mut body = claude::render_request(&request);
            if let Some(ttl) = &provider.cache_ttl_override {
                claude::apply_cache_ttl(&mut body, ttl);
            }
            body
        }
        ApiFamily::OpenAi => openai::render_chat_request(&request),
        ApiFamily::Responses => {
            openai::render_responses_request(&request, provider.codex_instructions)
        }
        ApiFamily::Gemini => gemini::render_request(&request),
    };

    // The Gemini wire carries the model in the URL, not the body.
    if wire != ApiFamily::Gemini {
        body["model"] = Value::String(request.model.clone());
    }
    Ok(body)
}

/// Upstream URL path for a provider call.
pub fn provider_request_path(provider_type: ProviderType, model: &str, stream: bool) -> String {
    match provider_type.wire_family() {
        ApiFamily::Claude => "/v1/messages".to_string(),
        ApiFamily::OpenAi => "/v1/chat/completions".to_string(),
        ApiFamily::Responses => "/v1/responses".to_string(),
        ApiFamily::Gemini => {
            let verb = if stream {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            format!("/v1beta/models/{model}:{verb}")
        }
    }
}

/// Parse a provider's non-streaming response body.
pub fn parse_provider_response(
    wire: ApiFamily,
    body: &[u8],
) -> Result<NormalizedResponse, ProxyError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| translation_error("invalid upstream response", e))?;
    match wire {
        ApiFamily::Claude => claude::parse_response(&value),
        ApiFamily::OpenAi => openai::parse_chat_response(&value),
        ApiFamily::Responses => openai::parse_responses_response(&value),
        ApiFamily::Gemini => gemini::parse_response(&value),
    }
}

/// Render a normalized response in the client's family.
pub fn render_client_response(family: ApiFamily, response: &NormalizedResponse) -> Value {
    match family {
        ApiFamily::Claude => claude::render_response(response),
        ApiFamily::OpenAi => openai::render_chat_response(response),
        ApiFamily::Responses => openai::render_responses_response(response),
        ApiFamily::Gemini => gemini::render_response(response),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Usage estimation
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes-per-token heuristic used when an upstream omits usage.
const BYTES_PER_TOKEN: usize = 4;

/// Below this input-size delta, the whole delta is attributed to cache
/// creation rather than split.
pub const MIN_CACHE_SPLIT_DELTA: u64 = 50;

pub fn estimate_tokens(byte_len: usize) -> u64 {
    (byte_len / BYTES_PER_TOKEN).max(1) as u64
}

/// Estimate usage for a response whose upstream omitted it.
///
/// The previous request's input size for the same session drives the
/// cache-creation/read split: a growing conversation re-reads its prefix
/// from cache and creates entries only for the delta. Heuristic, accurate
/// to roughly ±10 %.
pub fn estimate_usage(
    request_bytes: usize,
    response_text_bytes: usize,
    previous_input_tokens: Option<u64>,
) -> NormalizedUsage {
    let input = estimate_tokens(request_bytes);
    let output = estimate_tokens(response_text_bytes);
    match previous_input_tokens {
        Some(previous) if previous > 0 && input > previous => {
            let delta = input - previous;
            if delta < MIN_CACHE_SPLIT_DELTA {
                NormalizedUsage {
                    input_tokens: 0,
                    output_tokens: output,
                    cache_creation_tokens: delta,
                    cache_read_tokens: previous,
                }
            } else {
                NormalizedUsage {
                    input_tokens: delta,
                    output_tokens: output,
                    cache_creation_tokens: 0,
                    cache_read_tokens: previous,
                }
            }
        }
        _ => NormalizedUsage {
            input_tokens: input,
            output_tokens: output,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_per_wire_family() {
        assert_eq!(
            provider_request_path(ProviderType::Claude, "claude-sonnet-4", true),
            "/v1/messages"
        );
        assert_eq!(
            provider_request_path(ProviderType::OpenaiCompatible, "gpt-5", false),
            "/v1/chat/completions"
        );
        assert_eq!(
            provider_request_path(ProviderType::Codex, "gpt-5", false),
            "/v1/responses"
        );
        assert_eq!(
            provider_request_path(ProviderType::Gemini, "gemini-2.5-pro", false),
            "/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            provider_request_path(ProviderType::GeminiCli, "gemini-2.5-pro", true),
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent"
        );
    }

    #[test]
    fn estimation_splits_cache_by_previous_input() {
        // 4000 bytes → 1000 tokens; previous input 800 → delta 200 ≥ 50.
        let usage = estimate_usage(4000, 400, Some(800));
        assert_eq!(usage.cache_read_tokens, 800);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.cache_creation_tokens, 0);
        assert_eq!(usage.output_tokens, 100);
    }

    #[test]
    fn small_delta_goes_to_cache_creation() {
        // 3400 bytes → 850 tokens; previous 820 → delta 30 < 50.
        let usage = estimate_usage(3400, 40, Some(820));
        assert_eq!(usage.cache_creation_tokens, 30);
        assert_eq!(usage.cache_read_tokens, 820);
        assert_eq!(usage.input_tokens, 0);
    }

    #[test]
    fn no_history_means_plain_input() {
        let usage = estimate_usage(400, 40, None);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cache_read_tokens, 0);
    }

    #[test]
    fn model_redirect_applies_in_provider_request() {
        let mut provider = crate::models::tests::test_provider("p1");
        provider
            .model_redirects
            .insert("claude-sonnet-4".into(), "claude-sonnet-4-5".into());
        let request = NormalizedRequest {
            model: "claude-sonnet-4".into(),
            messages: vec![NormalizedMessage {
                role: MsgRole::User,
                blocks: vec![ContentBlock::Text { text: "hi".into() }],
            }],
            ..Default::default()
        };
        let body = build_provider_request(&request, &provider).unwrap();
        assert_eq!(body["model"], "claude-sonnet-4-5");
    }
}
