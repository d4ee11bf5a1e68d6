//! Anthropic Messages API schema and conversions.

use serde_json::{json, Value};

use super::{
    ContentBlock, FinishReason, MsgRole, NormalizedMessage, NormalizedRequest, NormalizedResponse,
    NormalizedUsage, StreamEvent, ToolSpec,
};
use crate::error::ProxyError;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_request(value: &Value) -> Result<NormalizedRequest, ProxyError> {
    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProxyError::TranslationError {
            message: "missing model".into(),
        })?
        .to_string();

    // `system` arrives as a plain string or a list of text blocks.
    let system = match value.get("system") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    };

    let mut messages = Vec::new();
    if let Some(raw_messages) = value.get("messages").and_then(|m| m.as_array()) {
        for raw in raw_messages {
            let role = match raw.get("role").and_then(|r| r.as_str()) {
                Some("assistant") => MsgRole::Assistant,
                _ => MsgRole::User,
            };
            let blocks = parse_content(raw.get("content"));
            messages.push(NormalizedMessage { role, blocks });
        }
    }

    let tools = value
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(ToolSpec {
                        name: t.get("name")?.as_str()?.to_string(),
                        description: t
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(String::from),
                        parameters: t.get("input_schema").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(NormalizedRequest {
        model,
        system,
        messages,
        tools,
        max_tokens: value.get("max_tokens").and_then(|v| v.as_u64()),
        temperature: value.get("temperature").and_then(|v| v.as_f64()),
        top_p: value.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: value
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        stream: value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        metadata: value.get("metadata").cloned(),
        responses_options: None,
    })
}

fn parse_content(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => Some(ContentBlock::Text {
                    text: block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }),
                Some("tool_use") => Some(ContentBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(json!({})),
                }),
                Some("tool_result") => Some(ContentBlock::ToolResult {
                    tool_use_id: block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    content: tool_result_text(block.get("content")),
                    is_error: block
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                }),
                Some("image") => Some(ContentBlock::Image {
                    source: block.get("source").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Tool results carry a string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

pub fn render_request(request: &NormalizedRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": match message.role {
                    MsgRole::User => "user",
                    MsgRole::Assistant => "assistant",
                },
                "content": message.blocks.iter().map(render_block).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        // Anthropic requires max_tokens; use a generous ceiling when the
        // client family has no equivalent field.
        "max_tokens": request.max_tokens.unwrap_or(8192),
        "stream": request.stream,
    });
    if let Some(system) = &request.system {
        body["system"] = Value::String(system.clone());
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.stop_sequences);
    }
    if let Some(metadata) = &request.metadata {
        body["metadata"] = metadata.clone();
    }
    body
}

fn render_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::Image { source } => json!({"type": "image", "source": source}),
    }
}

/// Attach a cache breakpoint with the provider's TTL override to the last
/// content block of the last message.
pub fn apply_cache_ttl(body: &mut Value, ttl: &str) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    let Some(last_message) = messages.last_mut() else {
        return;
    };
    if let Some(blocks) = last_message.get_mut("content").and_then(|c| c.as_array_mut()) {
        if let Some(last_block) = blocks.last_mut() {
            last_block["cache_control"] = json!({"type": "ephemeral", "ttl": ttl});
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_usage(value: &Value) -> NormalizedUsage {
    NormalizedUsage {
        input_tokens: value
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: value
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: value
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_tokens: value
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

fn stop_reason_to_finish(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::MaxTokens,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}

pub fn finish_to_stop_reason(reason: &FinishReason) -> &str {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::MaxTokens => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::Other(other) => other,
    }
}

pub fn parse_response(value: &Value) -> Result<NormalizedResponse, ProxyError> {
    let blocks = parse_content(value.get("content"));
    Ok(NormalizedResponse {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        model: value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        blocks,
        finish_reason: stop_reason_to_finish(value.get("stop_reason").and_then(|v| v.as_str())),
        usage: value.get("usage").map(parse_usage).unwrap_or_default(),
    })
}

pub fn render_response(response: &NormalizedResponse) -> Value {
    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": response.blocks.iter().map(render_block).collect::<Vec<_>>(),
        "stop_reason": finish_to_stop_reason(&response.finish_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
            "cache_creation_input_tokens": response.usage.cache_creation_tokens,
            "cache_read_input_tokens": response.usage.cache_read_tokens,
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Translate one Anthropic SSE event into hub stream events.
pub fn parse_stream_event(event_name: Option<&str>, data: &Value) -> Vec<StreamEvent> {
    let event_type = event_name
        .map(String::from)
        .or_else(|| data.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_default();
    match event_type.as_str() {
        "message_start" => {
            let message = data.get("message").cloned().unwrap_or(Value::Null);
            let mut events = vec![StreamEvent::Start {
                id: message
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                model: message
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }];
            if let Some(usage) = message.get("usage") {
                events.push(StreamEvent::Usage(parse_usage(usage)));
            }
            events
        }
        "content_block_start" => {
            let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            match data
                .get("content_block")
                .and_then(|b| b.get("type"))
                .and_then(|t| t.as_str())
            {
                Some("tool_use") => {
                    let block = data.get("content_block");
                    vec![StreamEvent::ToolCallStart {
                        index,
                        id: block
                            .and_then(|b| b.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .and_then(|b| b.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }]
                }
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let delta = data.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                Some("text_delta") => vec![StreamEvent::TextDelta {
                    index,
                    text: delta
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }],
                Some("input_json_delta") => vec![StreamEvent::ToolCallDelta {
                    index,
                    args_fragment: delta
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }],
                _ => Vec::new(),
            }
        }
        "message_delta" => {
            let reason = data
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str());
            let usage = data.get("usage").map(parse_usage);
            vec![StreamEvent::Finish {
                reason: stop_reason_to_finish(reason),
                usage,
            }]
        }
        "message_stop" => vec![StreamEvent::Done],
        // ping, content_block_stop: nothing to translate.
        _ => Vec::new(),
    }
}

/// Streaming emitter state for Claude-family clients.
#[derive(Debug, Default)]
pub struct StreamEmitter {
    message_id: String,
    model: String,
    started: bool,
    /// Hub index → (claude block index, is_tool) for open blocks.
    open_blocks: std::collections::HashMap<u32, (u32, bool)>,
    next_block_index: u32,
    input_usage: NormalizedUsage,
}

impl StreamEmitter {
    fn frame(event: &str, data: &Value) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        let data = json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": Value::Null,
                "usage": {
                    "input_tokens": self.input_usage.input_tokens,
                    "output_tokens": 0,
                    "cache_creation_input_tokens": self.input_usage.cache_creation_tokens,
                    "cache_read_input_tokens": self.input_usage.cache_read_tokens,
                },
            },
        });
        out.push(Self::frame("message_start", &data));
    }

    fn close_open_blocks(&mut self, out: &mut Vec<String>) {
        let mut indices: Vec<u32> = self.open_blocks.values().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        for index in indices {
            out.push(Self::frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
        self.open_blocks.clear();
    }

    /// Emit the SSE frames for one hub event.
    pub fn emit(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { id, model } => {
                self.message_id = if id.is_empty() {
                    format!("msg_{}", uuid::Uuid::new_v4().simple())
                } else {
                    id.clone()
                };
                self.model = model.clone();
            }
            StreamEvent::Usage(usage) => {
                self.input_usage = *usage;
            }
            StreamEvent::TextDelta { index, text } => {
                self.ensure_started(&mut out);
                let block_index = match self.open_blocks.get(index) {
                    Some((i, _)) => *i,
                    None => {
                        let i = self.next_block_index;
                        self.next_block_index += 1;
                        self.open_blocks.insert(*index, (i, false));
                        out.push(Self::frame(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": i,
                                "content_block": {"type": "text", "text": ""},
                            }),
                        ));
                        i
                    }
                };
                out.push(Self::frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_started(&mut out);
                let i = self.next_block_index;
                self.next_block_index += 1;
                self.open_blocks.insert(*index, (i, true));
                out.push(Self::frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": i,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
            }
            StreamEvent::ToolCallDelta {
                index,
                args_fragment,
            } => {
                self.ensure_started(&mut out);
                if let Some((i, _)) = self.open_blocks.get(index) {
                    out.push(Self::frame(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": i,
                            "delta": {"type": "input_json_delta", "partial_json": args_fragment},
                        }),
                    ));
                }
            }
            StreamEvent::Finish { reason, usage } => {
                self.ensure_started(&mut out);
                self.close_open_blocks(&mut out);
                let output_tokens = usage.map(|u| u.output_tokens).unwrap_or(0);
                out.push(Self::frame(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": finish_to_stop_reason(reason), "stop_sequence": Value::Null},
                        "usage": {"output_tokens": output_tokens},
                    }),
                ));
            }
            StreamEvent::Done => {
                self.ensure_started(&mut out);
                out.push(Self::frame(
                    "message_stop",
                    &json!({"type": "message_stop"}),
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_tool_blocks() {
        let body = json!({
            "model": "claude-sonnet-4",
            "system": "be terse",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "read the file"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.txt"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "file body"}
                ]}
            ],
            "tools": [{"name": "read_file", "description": "Read a file", "input_schema": {"type": "object"}}]
        });
        let request = parse_request(&body).unwrap();
        assert_eq!(request.model, "claude-sonnet-4");
        assert_eq!(request.system.as_deref(), Some("be terse"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.tools.len(), 1);
        assert!(matches!(
            request.messages[1].blocks[0],
            ContentBlock::ToolUse { .. }
        ));
        assert!(matches!(
            request.messages[2].blocks[0],
            ContentBlock::ToolResult { .. }
        ));
    }

    #[test]
    fn request_render_round_trips() {
        let body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let request = parse_request(&body).unwrap();
        let rendered = render_request(&request);
        let reparsed = parse_request(&rendered).unwrap();
        assert_eq!(reparsed.model, request.model);
        assert_eq!(reparsed.messages.len(), 1);
        assert_eq!(
            reparsed.messages[0].blocks,
            vec![ContentBlock::Text { text: "hi".into() }]
        );
    }

    #[test]
    fn response_round_trips_with_usage() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 20,
                "cache_creation_input_tokens": 3,
                "cache_read_input_tokens": 7
            }
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.cache_read_tokens, 7);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        let rendered = render_response(&response);
        assert_eq!(rendered["stop_reason"], "end_turn");
        assert_eq!(rendered["usage"]["cache_read_input_tokens"], 7);
    }

    #[test]
    fn stream_events_parse_text_and_tools() {
        let start = json!({
            "type": "message_start",
            "message": {"id": "msg_1", "model": "claude-sonnet-4", "usage": {"input_tokens": 12}}
        });
        let events = parse_stream_event(Some("message_start"), &start);
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert!(matches!(events[1], StreamEvent::Usage(u) if u.input_tokens == 12));

        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "hi"}
        });
        let events = parse_stream_event(None, &delta);
        assert_eq!(
            events,
            vec![StreamEvent::TextDelta {
                index: 0,
                text: "hi".into()
            }]
        );

        let tool = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "tu_1", "name": "search"}
        });
        let events = parse_stream_event(None, &tool);
        assert!(matches!(events[0], StreamEvent::ToolCallStart { .. }));
    }

    #[test]
    fn emitter_produces_well_formed_stream() {
        let mut emitter = StreamEmitter::default();
        let mut frames = Vec::new();
        for event in [
            StreamEvent::Start {
                id: "msg_1".into(),
                model: "claude-sonnet-4".into(),
            },
            StreamEvent::TextDelta {
                index: 0,
                text: "hel".into(),
            },
            StreamEvent::TextDelta {
                index: 0,
                text: "lo".into(),
            },
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: Some(NormalizedUsage {
                    output_tokens: 2,
                    ..Default::default()
                }),
            },
            StreamEvent::Done,
        ] {
            frames.extend(emitter.emit(&event));
        }
        let all = frames.concat();
        assert!(all.contains("event: message_start"));
        assert!(all.contains("content_block_start"));
        assert!(all.contains("\"text\":\"hel\""));
        assert!(all.contains("content_block_stop"));
        assert!(all.contains("\"stop_reason\":\"end_turn\""));
        assert!(all.contains("event: message_stop"));
        // message_start precedes the first delta.
        assert!(all.find("message_start").unwrap() < all.find("text_delta").unwrap());
    }

    #[test]
    fn cache_ttl_attaches_to_last_block() {
        let mut body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            ]
        });
        apply_cache_ttl(&mut body, "1h");
        assert_eq!(
            body["messages"][0]["content"][0]["cache_control"],
            json!({"type": "ephemeral", "ttl": "1h"})
        );
    }
}
