//! SSE parsing and streaming translation.
//!
//! Upstream bytes are fed incrementally into [`SseParser`], which yields
//! complete events regardless of how the network fragmented them. Each
//! event is lifted into hub [`StreamEvent`]s for the source wire format and
//! re-emitted through the client family's emitter. A translator also runs
//! in passthrough mode when source and client speak the same wire, where it
//! only sniffs usage and forwards bytes untouched.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::{claude, gemini, openai, NormalizedUsage, StreamEvent};
use crate::models::ApiFamily;

// ─────────────────────────────────────────────────────────────────────────────
// Incremental parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE event parser. Feed byte chunks, get complete events.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        loop {
            // An event ends at a blank line; tolerate CRLF framing.
            let lf = self.buf.find("\n\n");
            let crlf = self.buf.find("\r\n\r\n");
            let (index, width) = match (lf, crlf) {
                (Some(l), Some(c)) => {
                    if c < l {
                        (c, 4)
                    } else {
                        (l, 2)
                    }
                }
                (Some(l), None) => (l, 2),
                (None, Some(c)) => (c, 4),
                (None, None) => break,
            };
            let raw: String = self.buf.drain(..index + width).collect();
            if let Some(event) = parse_event_block(&raw) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buf);
        if raw.trim().is_empty() {
            return None;
        }
        parse_event_block(&raw)
    }
}

fn parse_event_block(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comments (`:`) and other fields (id, retry) are dropped.
    }
    if data_lines.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Source-event lifting
// ─────────────────────────────────────────────────────────────────────────────

/// Lift one wire SSE event into hub stream events.
pub fn lift_source_event(wire: ApiFamily, event: &SseEvent) -> Vec<StreamEvent> {
    if event.data.trim() == "[DONE]" {
        return vec![StreamEvent::Done];
    }
    if event.data.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(_) => match repair_truncated_json(&event.data) {
            Some(v) => {
                tracing::debug!("Repaired truncated SSE payload");
                v
            }
            None => {
                tracing::debug!(payload_len = event.data.len(), "Undecodable SSE payload dropped");
                return Vec::new();
            }
        },
    };
    match wire {
        ApiFamily::Claude => claude::parse_stream_event(event.event.as_deref(), &value),
        ApiFamily::OpenAi => openai::parse_chat_stream_event(&value),
        ApiFamily::Responses => openai::parse_responses_stream_event(&value),
        ApiFamily::Gemini => gemini::parse_stream_event(&value),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client emitters
// ─────────────────────────────────────────────────────────────────────────────

enum ClientEmitter {
    Claude(claude::StreamEmitter),
    Chat(openai::ChatStreamEmitter),
    Responses(openai::ResponsesStreamEmitter),
    Gemini(gemini::StreamEmitter),
}

impl ClientEmitter {
    fn new(family: ApiFamily) -> Self {
        match family {
            ApiFamily::Claude => Self::Claude(claude::StreamEmitter::default()),
            ApiFamily::OpenAi => Self::Chat(openai::ChatStreamEmitter::default()),
            ApiFamily::Responses => Self::Responses(openai::ResponsesStreamEmitter::default()),
            ApiFamily::Gemini => Self::Gemini(gemini::StreamEmitter::default()),
        }
    }

    fn emit(&mut self, event: &StreamEvent) -> Vec<String> {
        match self {
            Self::Claude(e) => e.emit(event),
            Self::Chat(e) => e.emit(event),
            Self::Responses(e) => e.emit(event),
            Self::Gemini(e) => e.emit(event),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream translator
// ─────────────────────────────────────────────────────────────────────────────

/// What the stream produced, for accounting after it ends.
#[derive(Debug, Default, Clone)]
pub struct StreamOutcome {
    pub usage: NormalizedUsage,
    pub saw_usage: bool,
    pub saw_finish: bool,
    /// Bytes of emitted text, for usage estimation when upstream lies.
    pub output_text_bytes: usize,
}

impl StreamOutcome {
    fn merge_usage(&mut self, usage: &NormalizedUsage) {
        self.saw_usage = true;
        self.usage.input_tokens = self.usage.input_tokens.max(usage.input_tokens);
        self.usage.output_tokens = self.usage.output_tokens.max(usage.output_tokens);
        self.usage.cache_creation_tokens = self
            .usage
            .cache_creation_tokens
            .max(usage.cache_creation_tokens);
        self.usage.cache_read_tokens = self.usage.cache_read_tokens.max(usage.cache_read_tokens);
    }
}

/// Streaming state machine translating one upstream SSE body to the
/// client's wire format, accumulating usage on the side.
pub struct StreamTranslator {
    parser: SseParser,
    source: ApiFamily,
    emitter: ClientEmitter,
    passthrough: bool,
    outcome: Arc<Mutex<StreamOutcome>>,
}

impl StreamTranslator {
    pub fn new(source: ApiFamily, client: ApiFamily) -> Self {
        Self {
            parser: SseParser::new(),
            source,
            emitter: ClientEmitter::new(client),
            passthrough: source == client,
            outcome: Arc::new(Mutex::new(StreamOutcome::default())),
        }
    }

    /// Shared handle to the accumulated outcome, read after the stream ends.
    pub fn outcome(&self) -> Arc<Mutex<StreamOutcome>> {
        self.outcome.clone()
    }

    fn observe(&self, events: &[StreamEvent]) {
        let mut outcome = self.outcome.lock().expect("outcome mutex poisoned");
        for event in events {
            match event {
                StreamEvent::Usage(usage) => outcome.merge_usage(usage),
                StreamEvent::Finish { usage, .. } => {
                    outcome.saw_finish = true;
                    if let Some(usage) = usage {
                        outcome.merge_usage(usage);
                    }
                }
                StreamEvent::TextDelta { text, .. } => {
                    outcome.output_text_bytes += text.len();
                }
                _ => {}
            }
        }
    }

    /// Translate one upstream chunk into client-ready bytes.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        let events = self.parser.push(chunk);
        let mut lifted = Vec::new();
        for event in &events {
            lifted.extend(lift_source_event(self.source, event));
        }
        self.observe(&lifted);
        if self.passthrough {
            return chunk.to_vec();
        }
        let mut out = String::new();
        for event in &lifted {
            for frame in self.emitter.emit(event) {
                out.push_str(&frame);
            }
        }
        out.into_bytes()
    }

    /// Flush trailing state when the upstream closes; guarantees the client
    /// stream terminates in its native shape even on a truncated upstream.
    pub fn finalize(&mut self) -> Vec<u8> {
        let mut lifted = Vec::new();
        if let Some(event) = self.parser.finish() {
            lifted.extend(lift_source_event(self.source, &event));
        }
        self.observe(&lifted);

        let (saw_finish, usage) = {
            let outcome = self.outcome.lock().expect("outcome mutex poisoned");
            (outcome.saw_finish, outcome.usage)
        };
        if self.passthrough {
            return Vec::new();
        }
        let mut out = String::new();
        for event in &lifted {
            for frame in self.emitter.emit(event) {
                out.push_str(&frame);
            }
        }
        if !saw_finish {
            for frame in self.emitter.emit(&StreamEvent::Finish {
                reason: super::FinishReason::Stop,
                usage: Some(usage),
            }) {
                out.push_str(&frame);
            }
        }
        for frame in self.emitter.emit(&StreamEvent::Done) {
            out.push_str(&frame);
        }
        out.into_bytes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bounded JSON repair
// ─────────────────────────────────────────────────────────────────────────────

const REPAIR_MAX_INPUT: usize = 256 * 1024;
const REPAIR_MAX_CLOSES: usize = 32;

/// Close dangling strings/brackets of a truncated JSON document. Bounded in
/// input size and repair depth; returns None when the result still does not
/// parse.
pub fn repair_truncated_json(raw: &str) -> Option<Value> {
    if raw.len() > REPAIR_MAX_INPUT {
        return None;
    }
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if !in_string && stack.is_empty() {
        return None; // Balanced already; the payload is broken differently.
    }
    if stack.len() + usize::from(in_string) > REPAIR_MAX_CLOSES {
        return None;
    }
    let mut repaired = raw.trim_end().trim_end_matches(',').to_string();
    if in_string {
        repaired.push('"');
    }
    while let Some(close) = stack.pop() {
        repaired.push(close);
    }
    serde_json::from_str(&repaired).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parser_reassembles_fragmented_events() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: message_start\nda").is_empty());
        let events = parser.push(b"ta: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn parser_handles_crlf_and_multiple_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].data, "[DONE]");
    }

    #[test]
    fn parser_joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn done_marker_lifts_to_done() {
        let event = SseEvent {
            event: None,
            data: "[DONE]".into(),
        };
        assert_eq!(
            lift_source_event(ApiFamily::OpenAi, &event),
            vec![StreamEvent::Done]
        );
    }

    fn claude_sse(event: &str, data: Value) -> Vec<u8> {
        format!("event: {event}\ndata: {data}\n\n").into_bytes()
    }

    #[test]
    fn claude_stream_translates_to_openai_chunks() {
        // S6 shape: Claude SSE re-emitted as OpenAI deltas with tool calls.
        let mut translator = StreamTranslator::new(ApiFamily::Claude, ApiFamily::OpenAi);
        let mut out = Vec::new();
        out.extend(translator.process(&claude_sse(
            "message_start",
            json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude-sonnet-4", "usage": {"input_tokens": 30}}}),
        )));
        out.extend(translator.process(&claude_sse(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "tu_1", "name": "get_weather"}}),
        )));
        out.extend(translator.process(&claude_sse(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"city\":\"sf\"}"}}),
        )));
        out.extend(translator.process(&claude_sse(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 12}}),
        )));
        out.extend(translator.process(&claude_sse("message_stop", json!({"type": "message_stop"}))));
        out.extend(translator.finalize());

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("\"tool_calls\""));
        assert!(text.contains("get_weather"));
        assert!(text.contains("\"finish_reason\":\"tool_calls\""));
        assert!(text.contains("data: [DONE]"));

        let outcome = translator.outcome();
        let outcome = outcome.lock().unwrap();
        assert_eq!(outcome.usage.input_tokens, 30);
        assert_eq!(outcome.usage.output_tokens, 12);
        assert!(outcome.saw_finish);
    }

    #[test]
    fn passthrough_forwards_bytes_and_still_sniffs_usage() {
        let mut translator = StreamTranslator::new(ApiFamily::Claude, ApiFamily::Claude);
        let chunk = claude_sse(
            "message_start",
            json!({"type": "message_start", "message": {"id": "m", "model": "x", "usage": {"input_tokens": 9}}}),
        );
        let out = translator.process(&chunk);
        assert_eq!(out, chunk);
        let outcome = translator.outcome();
        assert_eq!(outcome.lock().unwrap().usage.input_tokens, 9);
    }

    #[test]
    fn truncated_upstream_still_terminates_client_stream() {
        let mut translator = StreamTranslator::new(ApiFamily::Claude, ApiFamily::OpenAi);
        let mut out = Vec::new();
        out.extend(translator.process(&claude_sse(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
        )));
        // Upstream dies mid-stream without message_delta/message_stop.
        out.extend(translator.finalize());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn repair_closes_truncated_document() {
        let repaired =
            repair_truncated_json("{\"a\": {\"b\": [1, 2, {\"c\": \"unterminated").unwrap();
        assert_eq!(repaired["a"]["b"][2]["c"], "unterminated");
        // Balanced input is not "repaired".
        assert!(repair_truncated_json("{\"a\": 1}").is_none());
        // Garbage stays garbage.
        assert!(repair_truncated_json("not json at all").is_none());
    }

    #[test]
    fn repair_is_bounded() {
        let deep = "[".repeat(REPAIR_MAX_CLOSES + 1);
        assert!(repair_truncated_json(&deep).is_none());
    }
}
