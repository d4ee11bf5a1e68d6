//! OpenAI Chat Completions and Responses (Codex) schemas and conversions.

use chrono::Utc;
use serde_json::{json, Value};

use super::{
    ContentBlock, FinishReason, MsgRole, NormalizedMessage, NormalizedRequest, NormalizedResponse,
    NormalizedUsage, StreamEvent, ToolSpec,
};
use crate::error::ProxyError;
use crate::models::InstructionsStrategy;

/// Instructions the official Codex CLI sends; the `auto` strategy replaces
/// a client value only when it matches this prefix.
pub const OFFICIAL_CODEX_INSTRUCTIONS: &str =
    "You are Codex, based on GPT-5. You are running as a coding agent in the Codex CLI";

// ─────────────────────────────────────────────────────────────────────────────
// Chat Completions: requests
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_chat_request(value: &Value) -> Result<NormalizedRequest, ProxyError> {
    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProxyError::TranslationError {
            message: "missing model".into(),
        })?
        .to_string();

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<NormalizedMessage> = Vec::new();

    for raw in value
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        let role = raw.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match role {
            "system" | "developer" => {
                if let Some(text) = raw.get("content").and_then(|c| c.as_str()) {
                    system_parts.push(text.to_string());
                }
            }
            "tool" => {
                messages.push(NormalizedMessage {
                    role: MsgRole::User,
                    blocks: vec![ContentBlock::ToolResult {
                        tool_use_id: raw
                            .get("tool_call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        content: raw
                            .get("content")
                            .and_then(|c| c.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        is_error: false,
                    }],
                });
            }
            "assistant" => {
                let mut blocks = parse_chat_content(raw.get("content"));
                if let Some(tool_calls) = raw.get("tool_calls").and_then(|t| t.as_array()) {
                    for call in tool_calls {
                        blocks.push(parse_tool_call(call));
                    }
                }
                messages.push(NormalizedMessage {
                    role: MsgRole::Assistant,
                    blocks,
                });
            }
            _ => {
                messages.push(NormalizedMessage {
                    role: MsgRole::User,
                    blocks: parse_chat_content(raw.get("content")),
                });
            }
        }
    }

    let tools = value
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let function = t.get("function")?;
                    Some(ToolSpec {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(String::from),
                        parameters: function.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(NormalizedRequest {
        model,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        messages,
        tools,
        max_tokens: value
            .get("max_completion_tokens")
            .or_else(|| value.get("max_tokens"))
            .and_then(|v| v.as_u64()),
        temperature: value.get("temperature").and_then(|v| v.as_f64()),
        top_p: value.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: match value.get("stop") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(a)) => a
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        },
        stream: value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        metadata: None,
        responses_options: None,
    })
}

fn parse_chat_content(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) if !text.is_empty() => {
            vec![ContentBlock::Text { text: text.clone() }]
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(|t| t.as_str()) {
                Some("text") => Some(ContentBlock::Text {
                    text: part
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }),
                Some("image_url") => Some(ContentBlock::Image {
                    source: part.get("image_url").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_tool_call(call: &Value) -> ContentBlock {
    let function = call.get("function").cloned().unwrap_or(Value::Null);
    let arguments = function
        .get("arguments")
        .and_then(|a| a.as_str())
        .unwrap_or("{}");
    ContentBlock::ToolUse {
        id: call
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        name: function
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        input: serde_json::from_str(arguments).unwrap_or(json!({})),
    }
}

pub fn render_chat_request(request: &NormalizedRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &request.messages {
        render_chat_message(message, &mut messages);
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": request.stream,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        );
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if request.stream {
        // Ask for a final usage chunk so accounting does not need estimates.
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

/// One normalized message may expand into several chat messages (tool
/// results become `role: tool` entries).
fn render_chat_message(message: &NormalizedMessage, out: &mut Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut tool_results: Vec<Value> = Vec::new();
    let mut images: Vec<Value> = Vec::new();

    for block in &message.blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                    },
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                tool_results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
            ContentBlock::Image { source } => {
                images.push(json!({"type": "image_url", "image_url": source}));
            }
        }
    }

    // Tool results stand alone regardless of the carrying role.
    out.extend(tool_results);

    let role = match message.role {
        MsgRole::User => "user",
        MsgRole::Assistant => "assistant",
    };
    let content = if images.is_empty() {
        (!text_parts.is_empty()).then(|| Value::String(text_parts.join("\n")))
    } else {
        let mut parts: Vec<Value> = text_parts
            .iter()
            .map(|t| json!({"type": "text", "text": t}))
            .collect();
        parts.extend(images);
        Some(Value::Array(parts))
    };

    if content.is_none() && tool_calls.is_empty() {
        return;
    }
    let mut entry = json!({"role": role});
    entry["content"] = content.unwrap_or(Value::Null);
    if !tool_calls.is_empty() {
        entry["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(entry);
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Completions: responses
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_chat_usage(value: &Value) -> NormalizedUsage {
    let cached = value
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let prompt = value
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    NormalizedUsage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: value
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: cached,
    }
}

fn chat_finish_to_reason(finish: Option<&str>) -> FinishReason {
    match finish {
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}

pub fn reason_to_chat_finish(reason: &FinishReason) -> &str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::MaxTokens => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::Other(other) => other,
    }
}

pub fn parse_chat_response(value: &Value) -> Result<NormalizedResponse, ProxyError> {
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::TranslationError {
            message: "response has no choices".into(),
        })?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut blocks = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            blocks.push(parse_tool_call(call));
        }
    }

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
        finish_reason: chat_finish_to_reason(
            choice.get("finish_reason").and_then(|v| v.as_str()),
        ),
        usage: value.get("usage").map(parse_chat_usage).unwrap_or_default(),
    })
}

pub fn render_chat_response(response: &NormalizedResponse) -> Value {
    let mut content: Option<String> = None;
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in &response.blocks {
        match block {
            ContentBlock::Text { text } => {
                content
                    .get_or_insert_with(String::new)
                    .push_str(text);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                    },
                }));
            }
            _ => {}
        }
    }

    let mut message = json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    let prompt_tokens = response.usage.input_tokens + response.usage.cache_read_tokens;
    json!({
        "id": if response.id.is_empty() {
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
        } else {
            response.id.clone()
        },
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": reason_to_chat_finish(&response.finish_reason),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": prompt_tokens + response.usage.output_tokens,
            "prompt_tokens_details": {"cached_tokens": response.usage.cache_read_tokens},
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Completions: streaming
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_chat_stream_event(data: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(id) = data.get("id").and_then(|v| v.as_str()) {
        // The first chunk doubles as the start signal; downstream emitters
        // ignore duplicate starts.
        events.push(StreamEvent::Start {
            id: id.to_string(),
            model: data
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }
    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
        events.push(StreamEvent::Usage(parse_chat_usage(usage)));
    }
    let Some(choice) = data
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return events;
    };
    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta {
                    index: 0,
                    text: text.to_string(),
                });
            }
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32 + 1;
                let function = call.get("function").cloned().unwrap_or(Value::Null);
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    events.push(StreamEvent::ToolCallStart {
                        index,
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(arguments) = function.get("arguments").and_then(|a| a.as_str()) {
                    if !arguments.is_empty() {
                        events.push(StreamEvent::ToolCallDelta {
                            index,
                            args_fragment: arguments.to_string(),
                        });
                    }
                }
            }
        }
    }
    if let Some(finish) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        events.push(StreamEvent::Finish {
            reason: chat_finish_to_reason(Some(finish)),
            usage: data.get("usage").filter(|u| !u.is_null()).map(parse_chat_usage),
        });
    }
    events
}

/// Streaming emitter for Chat Completions clients.
#[derive(Debug)]
pub struct ChatStreamEmitter {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
    done: bool,
    usage: Option<NormalizedUsage>,
    /// Hub tool index → chat tool_calls index.
    tool_indices: std::collections::HashMap<u32, u32>,
}

impl Default for ChatStreamEmitter {
    fn default() -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            created: Utc::now().timestamp(),
            sent_role: false,
            finished: false,
            done: false,
            usage: None,
            tool_indices: std::collections::HashMap::new(),
        }
    }
}

impl ChatStreamEmitter {
    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format!("data: {chunk}\n\n")
    }

    fn role_preamble(&mut self, out: &mut Vec<String>) {
        if !self.sent_role {
            self.sent_role = true;
            out.push(self.chunk(json!({"role": "assistant"}), None));
        }
    }

    pub fn emit(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { id, model } => {
                if !id.is_empty() && !self.sent_role {
                    self.id = id.clone();
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
            }
            StreamEvent::TextDelta { text, .. } => {
                self.role_preamble(&mut out);
                out.push(self.chunk(json!({"content": text}), None));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.role_preamble(&mut out);
                let next = self.tool_indices.len() as u32;
                let chat_index = *self.tool_indices.entry(*index).or_insert(next);
                out.push(self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": chat_index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""},
                        }],
                    }),
                    None,
                ));
            }
            StreamEvent::ToolCallDelta {
                index,
                args_fragment,
            } => {
                self.role_preamble(&mut out);
                let next = self.tool_indices.len() as u32;
                let chat_index = *self.tool_indices.entry(*index).or_insert(next);
                out.push(self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": chat_index,
                            "function": {"arguments": args_fragment},
                        }],
                    }),
                    None,
                ));
            }
            StreamEvent::Finish { reason, usage } => {
                if self.finished {
                    return out;
                }
                self.finished = true;
                self.role_preamble(&mut out);
                if let Some(usage) = usage {
                    self.usage = Some(*usage);
                }
                out.push(self.chunk(json!({}), Some(reason_to_chat_finish(reason))));
                if let Some(usage) = self.usage {
                    let prompt = usage.input_tokens + usage.cache_read_tokens;
                    let final_usage = json!({
                        "id": self.id,
                        "object": "chat.completion.chunk",
                        "created": self.created,
                        "model": self.model,
                        "choices": [],
                        "usage": {
                            "prompt_tokens": prompt,
                            "completion_tokens": usage.output_tokens,
                            "total_tokens": prompt + usage.output_tokens,
                            "prompt_tokens_details": {"cached_tokens": usage.cache_read_tokens},
                        },
                    });
                    out.push(format!("data: {final_usage}\n\n"));
                }
            }
            StreamEvent::Done => {
                if !self.done {
                    self.done = true;
                    out.push("data: [DONE]\n\n".to_string());
                }
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses API (Codex)
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_responses_request(value: &Value) -> Result<NormalizedRequest, ProxyError> {
    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProxyError::TranslationError {
            message: "missing model".into(),
        })?
        .to_string();

    let mut messages = Vec::new();
    match value.get("input") {
        Some(Value::String(text)) => messages.push(NormalizedMessage {
            role: MsgRole::User,
            blocks: vec![ContentBlock::Text { text: text.clone() }],
        }),
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("function_call") => messages.push(NormalizedMessage {
                        role: MsgRole::Assistant,
                        blocks: vec![ContentBlock::ToolUse {
                            id: item
                                .get("call_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: item
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            input: item
                                .get("arguments")
                                .and_then(|a| a.as_str())
                                .and_then(|a| serde_json::from_str(a).ok())
                                .unwrap_or(json!({})),
                        }],
                    }),
                    Some("function_call_output") => messages.push(NormalizedMessage {
                        role: MsgRole::User,
                        blocks: vec![ContentBlock::ToolResult {
                            tool_use_id: item
                                .get("call_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            content: item
                                .get("output")
                                .and_then(|o| o.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            is_error: false,
                        }],
                    }),
                    // "message" items and untyped entries.
                    _ => {
                        let role = match item.get("role").and_then(|r| r.as_str()) {
                            Some("assistant") => MsgRole::Assistant,
                            _ => MsgRole::User,
                        };
                        let blocks: Vec<ContentBlock> = match item.get("content") {
                            Some(Value::String(text)) => {
                                vec![ContentBlock::Text { text: text.clone() }]
                            }
                            Some(Value::Array(parts)) => parts
                                .iter()
                                .filter_map(|part| {
                                    part.get("text").and_then(|t| t.as_str()).map(|text| {
                                        ContentBlock::Text {
                                            text: text.to_string(),
                                        }
                                    })
                                })
                                .collect(),
                            _ => Vec::new(),
                        };
                        if !blocks.is_empty() {
                            messages.push(NormalizedMessage { role, blocks });
                        }
                    }
                }
            }
        }
        _ => {}
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
                        parameters: t.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    // Codex extras forwarded opaquely (reasoning, verbosity, ...).
    let mut responses_options = serde_json::Map::new();
    for field in ["reasoning", "text", "parallel_tool_calls", "include"] {
        if let Some(v) = value.get(field) {
            responses_options.insert(field.to_string(), v.clone());
        }
    }

    Ok(NormalizedRequest {
        model,
        system: value
            .get("instructions")
            .and_then(|v| v.as_str())
            .map(String::from),
        messages,
        tools,
        max_tokens: value.get("max_output_tokens").and_then(|v| v.as_u64()),
        temperature: value.get("temperature").and_then(|v| v.as_f64()),
        top_p: value.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: Vec::new(),
        stream: value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        metadata: None,
        responses_options: (!responses_options.is_empty())
            .then(|| Value::Object(responses_options)),
    })
}

pub fn render_responses_request(
    request: &NormalizedRequest,
    strategy: InstructionsStrategy,
) -> Value {
    let instructions = match strategy {
        InstructionsStrategy::ForceOfficial => Some(OFFICIAL_CODEX_INSTRUCTIONS.to_string()),
        InstructionsStrategy::KeepOriginal => request.system.clone(),
        InstructionsStrategy::Auto => match &request.system {
            Some(system) if system.starts_with("You are Codex") => {
                Some(OFFICIAL_CODEX_INSTRUCTIONS.to_string())
            }
            Some(system) => Some(system.clone()),
            None => Some(OFFICIAL_CODEX_INSTRUCTIONS.to_string()),
        },
    };

    let mut input: Vec<Value> = Vec::new();
    for message in &request.messages {
        for block in &message.blocks {
            match block {
                ContentBlock::Text { text } => {
                    let (role, part_type) = match message.role {
                        MsgRole::User => ("user", "input_text"),
                        MsgRole::Assistant => ("assistant", "output_text"),
                    };
                    input.push(json!({
                        "type": "message",
                        "role": role,
                        "content": [{"type": part_type, "text": text}],
                    }));
                }
                ContentBlock::ToolUse { id, name, input: args } => {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": serde_json::to_string(args).unwrap_or_else(|_| "{}".into()),
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": content,
                    }));
                }
                ContentBlock::Image { .. } => {}
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "input": input,
        "stream": request.stream,
    });
    if let Some(instructions) = instructions {
        body["instructions"] = Value::String(instructions);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }
    if let Some(Value::Object(options)) = &request.responses_options {
        for (key, value) in options {
            body[key] = value.clone();
        }
    }
    body
}

pub fn parse_responses_usage(value: &Value) -> NormalizedUsage {
    let cached = value
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let input = value
        .get("input_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    NormalizedUsage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: value
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: cached,
    }
}

pub fn parse_responses_response(value: &Value) -> Result<NormalizedResponse, ProxyError> {
    let mut blocks = Vec::new();
    let mut saw_tool_call = false;
    for item in value
        .get("output")
        .and_then(|o| o.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        match item.get("type").and_then(|t| t.as_str()) {
            Some("message") => {
                for part in item
                    .get("content")
                    .and_then(|c| c.as_array())
                    .map(|a| a.as_slice())
                    .unwrap_or_default()
                {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        blocks.push(ContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                }
            }
            Some("function_call") => {
                saw_tool_call = true;
                blocks.push(ContentBlock::ToolUse {
                    id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input: item
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or(json!({})),
                });
            }
            _ => {}
        }
    }

    let finish_reason = if saw_tool_call {
        FinishReason::ToolCalls
    } else {
        match value.get("status").and_then(|s| s.as_str()) {
            Some("incomplete") => {
                let why = value
                    .get("incomplete_details")
                    .and_then(|d| d.get("reason"))
                    .and_then(|r| r.as_str());
                if why == Some("max_output_tokens") {
                    FinishReason::MaxTokens
                } else {
                    FinishReason::Other(why.unwrap_or("incomplete").to_string())
                }
            }
            _ => FinishReason::Stop,
        }
    };

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
        finish_reason,
        usage: value
            .get("usage")
            .map(parse_responses_usage)
            .unwrap_or_default(),
    })
}

pub fn render_responses_response(response: &NormalizedResponse) -> Value {
    let mut output: Vec<Value> = Vec::new();
    let mut text_parts: Vec<Value> = Vec::new();
    for block in &response.blocks {
        match block {
            ContentBlock::Text { text } => {
                text_parts.push(json!({"type": "output_text", "text": text, "annotations": []}));
            }
            ContentBlock::ToolUse { id, name, input } => {
                output.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                }));
            }
            _ => {}
        }
    }
    if !text_parts.is_empty() {
        output.insert(
            0,
            json!({
                "type": "message",
                "role": "assistant",
                "content": text_parts,
            }),
        );
    }

    let input_total = response.usage.input_tokens + response.usage.cache_read_tokens;
    json!({
        "id": if response.id.is_empty() {
            format!("resp_{}", uuid::Uuid::new_v4().simple())
        } else {
            response.id.clone()
        },
        "object": "response",
        "created_at": Utc::now().timestamp(),
        "model": response.model,
        "status": match response.finish_reason {
            FinishReason::MaxTokens => "incomplete",
            _ => "completed",
        },
        "output": output,
        "usage": {
            "input_tokens": input_total,
            "output_tokens": response.usage.output_tokens,
            "total_tokens": input_total + response.usage.output_tokens,
            "input_tokens_details": {"cached_tokens": response.usage.cache_read_tokens},
        },
    })
}

/// Translate one Responses-API SSE event into hub stream events.
pub fn parse_responses_stream_event(data: &Value) -> Vec<StreamEvent> {
    match data.get("type").and_then(|t| t.as_str()) {
        Some("response.created") => {
            let response = data.get("response").cloned().unwrap_or(Value::Null);
            vec![StreamEvent::Start {
                id: response
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                model: response
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }]
        }
        Some("response.output_text.delta") => vec![StreamEvent::TextDelta {
            index: data
                .get("output_index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            text: data
                .get("delta")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
        }],
        Some("response.output_item.added") => {
            let item = data.get("item").cloned().unwrap_or(Value::Null);
            if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                vec![StreamEvent::ToolCallStart {
                    index: data
                        .get("output_index")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }]
            } else {
                Vec::new()
            }
        }
        Some("response.function_call_arguments.delta") => vec![StreamEvent::ToolCallDelta {
            index: data
                .get("output_index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            args_fragment: data
                .get("delta")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
        }],
        Some("response.completed") => {
            let response = data.get("response").cloned().unwrap_or(Value::Null);
            let usage = response.get("usage").map(parse_responses_usage);
            vec![
                StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    usage,
                },
                StreamEvent::Done,
            ]
        }
        _ => Vec::new(),
    }
}

/// Streaming emitter for Responses-API clients.
#[derive(Debug)]
pub struct ResponsesStreamEmitter {
    id: String,
    model: String,
    started: bool,
    done: bool,
}

impl Default for ResponsesStreamEmitter {
    fn default() -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            started: false,
            done: false,
        }
    }
}

impl ResponsesStreamEmitter {
    fn frame(event: &str, data: &Value) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(Self::frame(
            "response.created",
            &json!({
                "type": "response.created",
                "response": {"id": self.id, "model": self.model, "status": "in_progress"},
            }),
        ));
    }

    pub fn emit(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { id, model } => {
                if !id.is_empty() {
                    self.id = id.clone();
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
            }
            StreamEvent::Usage(_) => {}
            StreamEvent::TextDelta { index, text } => {
                self.ensure_started(&mut out);
                out.push(Self::frame(
                    "response.output_text.delta",
                    &json!({
                        "type": "response.output_text.delta",
                        "output_index": index,
                        "delta": text,
                    }),
                ));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_started(&mut out);
                out.push(Self::frame(
                    "response.output_item.added",
                    &json!({
                        "type": "response.output_item.added",
                        "output_index": index,
                        "item": {"type": "function_call", "call_id": id, "name": name, "arguments": ""},
                    }),
                ));
            }
            StreamEvent::ToolCallDelta {
                index,
                args_fragment,
            } => {
                self.ensure_started(&mut out);
                out.push(Self::frame(
                    "response.function_call_arguments.delta",
                    &json!({
                        "type": "response.function_call_arguments.delta",
                        "output_index": index,
                        "delta": args_fragment,
                    }),
                ));
            }
            StreamEvent::Finish { usage, .. } => {
                self.ensure_started(&mut out);
                let usage = usage.map(|u| {
                    let input = u.input_tokens + u.cache_read_tokens;
                    json!({
                        "input_tokens": input,
                        "output_tokens": u.output_tokens,
                        "total_tokens": input + u.output_tokens,
                        "input_tokens_details": {"cached_tokens": u.cache_read_tokens},
                    })
                });
                out.push(Self::frame(
                    "response.completed",
                    &json!({
                        "type": "response.completed",
                        "response": {
                            "id": self.id,
                            "model": self.model,
                            "status": "completed",
                            "usage": usage,
                        },
                    }),
                ));
            }
            StreamEvent::Done => {
                if !self.done {
                    self.done = true;
                    out.push("data: [DONE]\n\n".to_string());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_with_tool_turns_normalizes() {
        let body = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "list files"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "ls", "arguments": "{\"path\":\".\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "a.txt"}
            ],
            "tools": [{"type": "function", "function": {"name": "ls", "parameters": {"type": "object"}}}]
        });
        let request = parse_chat_request(&body).unwrap();
        assert_eq!(request.system.as_deref(), Some("be terse"));
        assert_eq!(request.messages.len(), 3);
        assert!(matches!(
            &request.messages[1].blocks[0],
            ContentBlock::ToolUse { name, input, .. }
                if name == "ls" && input["path"] == "."
        ));
        assert!(matches!(
            &request.messages[2].blocks[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "call_1"
        ));
        assert_eq!(request.tools.len(), 1);
    }

    #[test]
    fn chat_to_claude_semantics_survive_round_trip() {
        // OpenAI request with tool turns → normalized → Claude wire →
        // normalized again; tool-call structure must be equivalent.
        let body = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "user", "content": "search"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_9", "content": "results"}
            ]
        });
        let normalized = parse_chat_request(&body).unwrap();
        let claude_wire = super::super::claude::render_request(&normalized);
        let reparsed = super::super::claude::parse_request(&claude_wire).unwrap();

        let tool_use: Vec<_> = reparsed
            .messages
            .iter()
            .flat_map(|m| &m.blocks)
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect();
        assert_eq!(tool_use.len(), 1);
        assert!(matches!(
            tool_use[0],
            ContentBlock::ToolUse { id, name, input }
                if id == "call_9" && name == "search" && input["q"] == "rust"
        ));
        let tool_result: Vec<_> = reparsed
            .messages
            .iter()
            .flat_map(|m| &m.blocks)
            .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
            .collect();
        assert_eq!(tool_result.len(), 1);
    }

    #[test]
    fn chat_response_renders_tool_calls_and_usage() {
        let response = NormalizedResponse {
            id: "msg_1".into(),
            model: "claude-sonnet-4".into(),
            blocks: vec![ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "search".into(),
                input: json!({"q": "x"}),
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: NormalizedUsage {
                input_tokens: 80,
                output_tokens: 20,
                cache_creation_tokens: 0,
                cache_read_tokens: 20,
            },
        };
        let rendered = render_chat_response(&response);
        assert_eq!(rendered["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            rendered["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "search"
        );
        assert_eq!(rendered["usage"]["prompt_tokens"], 100);
        assert_eq!(
            rendered["usage"]["prompt_tokens_details"]["cached_tokens"],
            20
        );
    }

    #[test]
    fn chat_stream_event_parses_tool_call_deltas() {
        let chunk = json!({
            "id": "chatcmpl-1",
            "model": "gpt-5",
            "choices": [{
                "index": 0,
                "delta": {"tool_calls": [{
                    "index": 0,
                    "id": "call_1",
                    "function": {"name": "ls", "arguments": "{\"p"}
                }]},
                "finish_reason": null
            }]
        });
        let events = parse_chat_stream_event(&chunk);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallStart { name, .. } if name == "ls")));
        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::ToolCallDelta { args_fragment, .. } if args_fragment == "{\"p")
        ));
    }

    #[test]
    fn chat_emitter_ends_with_done_marker() {
        let mut emitter = ChatStreamEmitter::default();
        let mut frames = Vec::new();
        for event in [
            StreamEvent::Start {
                id: "x".into(),
                model: "claude-sonnet-4".into(),
            },
            StreamEvent::TextDelta {
                index: 0,
                text: "hi".into(),
            },
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: Some(NormalizedUsage {
                    input_tokens: 5,
                    output_tokens: 1,
                    ..Default::default()
                }),
            },
            StreamEvent::Done,
        ] {
            frames.extend(emitter.emit(&event));
        }
        let all = frames.concat();
        assert!(all.contains("\"role\":\"assistant\""));
        assert!(all.contains("\"content\":\"hi\""));
        assert!(all.contains("\"finish_reason\":\"stop\""));
        assert!(all.contains("\"completion_tokens\":1"));
        assert!(all.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn responses_request_round_trips_tool_calls() {
        let body = json!({
            "model": "gpt-5-codex",
            "instructions": "You are Codex, based on GPT-5. You are running as a coding agent in the Codex CLI on a user's machine.",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "run ls"}]},
                {"type": "function_call", "call_id": "call_1", "name": "shell", "arguments": "{\"cmd\":\"ls\"}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "a.txt"}
            ],
            "reasoning": {"effort": "medium"},
            "stream": false
        });
        let request = parse_responses_request(&body).unwrap();
        assert_eq!(request.messages.len(), 3);
        assert!(request.responses_options.is_some());

        let rendered = render_responses_request(&request, InstructionsStrategy::Auto);
        // Auto replaces the official-CLI instructions with the canonical text.
        assert_eq!(
            rendered["instructions"].as_str().unwrap(),
            OFFICIAL_CODEX_INSTRUCTIONS
        );
        assert_eq!(rendered["reasoning"]["effort"], "medium");
        let input = rendered["input"].as_array().unwrap();
        assert!(input.iter().any(|i| i["type"] == "function_call"));
        assert!(input.iter().any(|i| i["type"] == "function_call_output"));
    }

    #[test]
    fn keep_original_strategy_preserves_client_instructions() {
        let request = NormalizedRequest {
            model: "gpt-5-codex".into(),
            system: Some("my custom prompt".into()),
            ..Default::default()
        };
        let rendered = render_responses_request(&request, InstructionsStrategy::KeepOriginal);
        assert_eq!(rendered["instructions"], "my custom prompt");
        let forced = render_responses_request(&request, InstructionsStrategy::ForceOfficial);
        assert_eq!(forced["instructions"].as_str().unwrap(), OFFICIAL_CODEX_INSTRUCTIONS);
    }

    #[test]
    fn responses_response_maps_function_calls() {
        let body = json!({
            "id": "resp_1",
            "model": "gpt-5-codex",
            "status": "completed",
            "output": [
                {"type": "function_call", "call_id": "call_1", "name": "shell", "arguments": "{\"cmd\":\"ls\"}"}
            ],
            "usage": {"input_tokens": 100, "output_tokens": 10, "input_tokens_details": {"cached_tokens": 40}}
        });
        let response = parse_responses_response(&body).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.cache_read_tokens, 40);
        assert_eq!(response.usage.input_tokens, 60);
    }
}
