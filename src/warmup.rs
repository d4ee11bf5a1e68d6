//! Anthropic client warmup interception.
//!
//! CLI clients fire small heartbeat requests (title generation, quota
//! probes) on startup. When interception is enabled the gateway answers
//! them locally with a canned response instead of spending provider quota.
//! The fingerprint is a configurable pattern set because clients drift
//! across versions.

use crate::models::ApiFamily;
use crate::translate::{
    render_client_response, ContentBlock, FinishReason, NormalizedRequest, NormalizedResponse,
    NormalizedUsage,
};

/// Canned warmup reply text.
pub const WARMUP_REPLY: &str = "I'm ready to help you.";

/// Requests larger than this are never warmups; real conversations carry
/// history.
const MAX_WARMUP_TEXT_LEN: usize = 4096;

/// Whether a request matches the warmup fingerprint.
///
/// A warmup is a short conversation whose last user message (or system
/// prompt) contains one of the configured patterns.
pub fn is_warmup_request(request: &NormalizedRequest, patterns: &[String]) -> bool {
    if patterns.is_empty() || request.messages.len() > 2 {
        return false;
    }
    let last_user = request.last_user_text();
    if last_user.len() > MAX_WARMUP_TEXT_LEN {
        return false;
    }
    let haystacks = [
        last_user.to_ascii_lowercase(),
        request
            .system
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase(),
    ];
    patterns.iter().any(|pattern| {
        let needle = pattern.to_ascii_lowercase();
        !needle.is_empty() && haystacks.iter().any(|h| h.contains(&needle))
    })
}

/// Build the canned reply in the client's wire shape.
///
/// Returns `(body, content_type)`; streaming clients get a minimal SSE
/// rendition ending in their family's terminator.
pub fn canned_response(family: ApiFamily, model: &str, stream: bool) -> (Vec<u8>, &'static str) {
    let response = NormalizedResponse {
        id: format!("warmup_{}", uuid::Uuid::new_v4().simple()),
        model: model.to_string(),
        blocks: vec![ContentBlock::Text {
            text: WARMUP_REPLY.to_string(),
        }],
        finish_reason: FinishReason::Stop,
        usage: NormalizedUsage::default(),
    };
    if !stream {
        let body = render_client_response(family, &response);
        return (
            serde_json::to_vec(&body).unwrap_or_default(),
            "application/json",
        );
    }

    use crate::translate::StreamEvent;
    let events = [
        StreamEvent::Start {
            id: response.id.clone(),
            model: model.to_string(),
        },
        StreamEvent::TextDelta {
            index: 0,
            text: WARMUP_REPLY.to_string(),
        },
        StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: Some(NormalizedUsage::default()),
        },
        StreamEvent::Done,
    ];
    let mut out = String::new();
    match family {
        ApiFamily::Claude => {
            let mut emitter = crate::translate::claude::StreamEmitter::default();
            for event in &events {
                out.extend(emitter.emit(event));
            }
        }
        ApiFamily::OpenAi => {
            let mut emitter = crate::translate::openai::ChatStreamEmitter::default();
            for event in &events {
                out.extend(emitter.emit(event));
            }
        }
        ApiFamily::Responses => {
            let mut emitter = crate::translate::openai::ResponsesStreamEmitter::default();
            for event in &events {
                out.extend(emitter.emit(event));
            }
        }
        ApiFamily::Gemini => {
            let mut emitter = crate::translate::gemini::StreamEmitter::default();
            for event in &events {
                out.extend(emitter.emit(event));
            }
        }
    }
    (out.into_bytes(), "text/event-stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemSettings;
    use crate::translate::{MsgRole, NormalizedMessage};

    fn request_with_text(text: &str) -> NormalizedRequest {
        NormalizedRequest {
            model: "claude-haiku-3-5".into(),
            messages: vec![NormalizedMessage {
                role: MsgRole::User,
                blocks: vec![ContentBlock::Text { text: text.into() }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn default_patterns_catch_known_heartbeats() {
        let patterns = SystemSettings::default().warmup_patterns;
        assert!(is_warmup_request(&request_with_text("quota"), &patterns));
        assert!(is_warmup_request(
            &request_with_text(
                "Please write a 5-10 word title for the following conversation: hi"
            ),
            &patterns
        ));
        assert!(!is_warmup_request(
            &request_with_text("explain the borrow checker"),
            &patterns
        ));
    }

    #[test]
    fn long_conversations_are_never_warmups() {
        let patterns = SystemSettings::default().warmup_patterns;
        let mut request = request_with_text("quota");
        for _ in 0..3 {
            request.messages.push(NormalizedMessage {
                role: MsgRole::Assistant,
                blocks: vec![ContentBlock::Text { text: "ok".into() }],
            });
        }
        assert!(!is_warmup_request(&request, &patterns));
    }

    #[test]
    fn empty_pattern_set_disables_detection() {
        assert!(!is_warmup_request(&request_with_text("quota"), &[]));
    }

    #[test]
    fn canned_json_body_carries_reply() {
        let (body, content_type) = canned_response(ApiFamily::Claude, "claude-haiku-3-5", false);
        assert_eq!(content_type, "application/json");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["content"][0]["text"], WARMUP_REPLY);
        assert_eq!(value["usage"]["input_tokens"], 0);
    }

    #[test]
    fn canned_stream_terminates_per_family() {
        let (body, content_type) = canned_response(ApiFamily::OpenAi, "gpt-5", true);
        assert_eq!(content_type, "text/event-stream");
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(WARMUP_REPLY));
        assert!(text.ends_with("data: [DONE]\n\n"));

        let (body, _) = canned_response(ApiFamily::Claude, "claude-haiku-3-5", true);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("event: message_stop"));
    }
}
