//! Gemini generateContent schema and conversions.

use serde_json::{json, Value};

use super::{
    ContentBlock, FinishReason, MsgRole, NormalizedMessage, NormalizedRequest, NormalizedResponse,
    NormalizedUsage, StreamEvent, ToolSpec,
};
use crate::error::ProxyError;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a `generateContent` body. The model is carried in the URL, so the
/// caller injects it into the normalized request afterwards when present.
pub fn parse_request(value: &Value) -> Result<NormalizedRequest, ProxyError> {
    let system = value
        .get("systemInstruction")
        .or_else(|| value.get("system_instruction"))
        .and_then(|s| s.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty());

    let mut messages = Vec::new();
    for content in value
        .get("contents")
        .and_then(|c| c.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        let role = match content.get("role").and_then(|r| r.as_str()) {
            Some("model") => MsgRole::Assistant,
            _ => MsgRole::User,
        };
        let mut blocks = Vec::new();
        for part in content
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default()
        {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                blocks.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            } else if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                blocks.push(ContentBlock::ToolUse {
                    id: name.clone(),
                    name,
                    input: call.get("args").cloned().unwrap_or(json!({})),
                });
            } else if let Some(response) = part.get("functionResponse") {
                let name = response
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let content = response
                    .get("response")
                    .map(|r| {
                        r.get("content")
                            .or_else(|| r.get("result"))
                            .and_then(|c| c.as_str())
                            .map(String::from)
                            .unwrap_or_else(|| r.to_string())
                    })
                    .unwrap_or_default();
                blocks.push(ContentBlock::ToolResult {
                    tool_use_id: name,
                    content,
                    is_error: false,
                });
            } else if part.get("inlineData").is_some() || part.get("inline_data").is_some() {
                blocks.push(ContentBlock::Image {
                    source: part.clone(),
                });
            }
        }
        if !blocks.is_empty() {
            messages.push(NormalizedMessage { role, blocks });
        }
    }

    let tools = value
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .flat_map(|t| {
                    t.get("functionDeclarations")
                        .or_else(|| t.get("function_declarations"))
                        .and_then(|d| d.as_array())
                        .cloned()
                        .unwrap_or_default()
                })
                .filter_map(|decl| {
                    Some(ToolSpec {
                        name: decl.get("name")?.as_str()?.to_string(),
                        description: decl
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(String::from),
                        parameters: decl.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let generation = value.get("generationConfig").cloned().unwrap_or(Value::Null);

    Ok(NormalizedRequest {
        model: String::new(),
        system,
        messages,
        tools,
        max_tokens: generation.get("maxOutputTokens").and_then(|v| v.as_u64()),
        temperature: generation.get("temperature").and_then(|v| v.as_f64()),
        top_p: generation.get("topP").and_then(|v| v.as_f64()),
        stop_sequences: generation
            .get("stopSequences")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        stream: false,
        metadata: None,
        responses_options: None,
    })
}

pub fn render_request(request: &NormalizedRequest) -> Value {
    // functionResponse needs the function name; recover it from the
    // matching tool_use earlier in the conversation.
    let name_for = |tool_use_id: &str| -> String {
        for message in &request.messages {
            for block in &message.blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    if id == tool_use_id {
                        return name.clone();
                    }
                }
            }
        }
        tool_use_id.to_string()
    };

    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter_map(|message| {
            let parts: Vec<Value> = message
                .blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({"text": text})),
                    ContentBlock::ToolUse { name, input, .. } => Some(json!({
                        "functionCall": {"name": name, "args": input},
                    })),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some(json!({
                        "functionResponse": {
                            "name": name_for(tool_use_id),
                            "response": {"content": content},
                        },
                    })),
                    ContentBlock::Image { source } => {
                        source.get("inlineData").map(|d| json!({"inlineData": d}))
                    }
                })
                .collect();
            if parts.is_empty() {
                return None;
            }
            Some(json!({
                "role": match message.role {
                    MsgRole::User => "user",
                    MsgRole::Assistant => "model",
                },
                "parts": parts,
            }))
        })
        .collect();

    let mut body = json!({"contents": contents});
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect::<Vec<_>>(),
        }]);
    }
    let mut generation = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".into(), json!(top_p));
    }
    if !request.stop_sequences.is_empty() {
        generation.insert("stopSequences".into(), json!(request.stop_sequences));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_usage(value: &Value) -> NormalizedUsage {
    let cached = value
        .get("cachedContentTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let prompt = value
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    NormalizedUsage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: value
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: cached,
    }
}

fn finish_from_gemini(reason: Option<&str>, saw_tool_call: bool) -> FinishReason {
    match reason {
        Some("STOP") | None => {
            if saw_tool_call {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }
        }
        Some("MAX_TOKENS") => FinishReason::MaxTokens,
        Some(other) => FinishReason::Other(other.to_ascii_lowercase()),
    }
}

pub fn finish_to_gemini(reason: &FinishReason) -> &str {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP",
        FinishReason::MaxTokens => "MAX_TOKENS",
        FinishReason::Other(_) => "OTHER",
    }
}

fn parse_candidate_blocks(candidate: &Value) -> (Vec<ContentBlock>, bool) {
    let mut blocks = Vec::new();
    let mut saw_tool_call = false;
    for part in candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        } else if let Some(call) = part.get("functionCall") {
            saw_tool_call = true;
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            blocks.push(ContentBlock::ToolUse {
                id: format!("call_{name}"),
                name,
                input: call.get("args").cloned().unwrap_or(json!({})),
            });
        }
    }
    (blocks, saw_tool_call)
}

pub fn parse_response(value: &Value) -> Result<NormalizedResponse, ProxyError> {
    let candidate = value
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::TranslationError {
            message: "response has no candidates".into(),
        })?;
    let (blocks, saw_tool_call) = parse_candidate_blocks(candidate);
    Ok(NormalizedResponse {
        id: value
            .get("responseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        model: value
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        blocks,
        finish_reason: finish_from_gemini(
            candidate.get("finishReason").and_then(|v| v.as_str()),
            saw_tool_call,
        ),
        usage: value
            .get("usageMetadata")
            .map(parse_usage)
            .unwrap_or_default(),
    })
}

pub fn render_response(response: &NormalizedResponse) -> Value {
    let parts: Vec<Value> = response
        .blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(json!({"text": text})),
            ContentBlock::ToolUse { name, input, .. } => Some(json!({
                "functionCall": {"name": name, "args": input},
            })),
            _ => None,
        })
        .collect();
    let prompt = response.usage.input_tokens + response.usage.cache_read_tokens;
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_to_gemini(&response.finish_reason),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": prompt,
            "candidatesTokenCount": response.usage.output_tokens,
            "totalTokenCount": prompt + response.usage.output_tokens,
            "cachedContentTokenCount": response.usage.cache_read_tokens,
        },
        "modelVersion": response.model,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Translate one Gemini stream chunk into hub events.
pub fn parse_stream_event(data: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(usage) = data.get("usageMetadata") {
        events.push(StreamEvent::Usage(parse_usage(usage)));
    }
    let Some(candidate) = data
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return events;
    };
    let mut saw_tool_call = false;
    let mut tool_index = 1u32;
    for part in candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            events.push(StreamEvent::TextDelta {
                index: 0,
                text: text.to_string(),
            });
        } else if let Some(call) = part.get("functionCall") {
            saw_tool_call = true;
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            events.push(StreamEvent::ToolCallStart {
                index: tool_index,
                id: format!("call_{name}"),
                name,
            });
            let args = call.get("args").cloned().unwrap_or(json!({}));
            events.push(StreamEvent::ToolCallDelta {
                index: tool_index,
                args_fragment: serde_json::to_string(&args).unwrap_or_else(|_| "{}".into()),
            });
            tool_index += 1;
        }
    }
    if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        events.push(StreamEvent::Finish {
            reason: finish_from_gemini(Some(reason), saw_tool_call),
            usage: data.get("usageMetadata").map(parse_usage),
        });
        events.push(StreamEvent::Done);
    }
    events
}

/// Streaming emitter for Gemini clients. Tool-call arguments are buffered
/// until complete because the Gemini wire carries them as one object.
#[derive(Debug, Default)]
pub struct StreamEmitter {
    model: String,
    /// index → (name, accumulated args fragments)
    pending_tools: std::collections::HashMap<u32, (String, String)>,
    usage: Option<NormalizedUsage>,
    finished: bool,
}

impl StreamEmitter {
    fn chunk(&self, parts: Vec<Value>, finish: Option<&FinishReason>) -> String {
        let mut candidate = json!({
            "content": {"role": "model", "parts": parts},
            "index": 0,
        });
        if let Some(finish) = finish {
            candidate["finishReason"] = json!(finish_to_gemini(finish));
        }
        let mut body = json!({"candidates": [candidate]});
        if finish.is_some() {
            if let Some(usage) = self.usage {
                let prompt = usage.input_tokens + usage.cache_read_tokens;
                body["usageMetadata"] = json!({
                    "promptTokenCount": prompt,
                    "candidatesTokenCount": usage.output_tokens,
                    "totalTokenCount": prompt + usage.output_tokens,
                    "cachedContentTokenCount": usage.cache_read_tokens,
                });
            }
            if !self.model.is_empty() {
                body["modelVersion"] = json!(self.model);
            }
        }
        format!("data: {body}\n\n")
    }

    fn flush_tools(&mut self) -> Vec<Value> {
        let mut indices: Vec<u32> = self.pending_tools.keys().copied().collect();
        indices.sort_unstable();
        let mut parts = Vec::new();
        for index in indices {
            if let Some((name, args)) = self.pending_tools.remove(&index) {
                let args: Value = serde_json::from_str(&args).unwrap_or(json!({}));
                parts.push(json!({"functionCall": {"name": name, "args": args}}));
            }
        }
        parts
    }

    pub fn emit(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Start { model, .. } => {
                self.model = model.clone();
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
            }
            StreamEvent::TextDelta { text, .. } => {
                out.push(self.chunk(vec![json!({"text": text})], None));
            }
            StreamEvent::ToolCallStart { index, name, .. } => {
                self.pending_tools
                    .insert(*index, (name.clone(), String::new()));
            }
            StreamEvent::ToolCallDelta {
                index,
                args_fragment,
            } => {
                if let Some((_, args)) = self.pending_tools.get_mut(index) {
                    args.push_str(args_fragment);
                }
            }
            StreamEvent::Finish { reason, usage } => {
                if self.finished {
                    return out;
                }
                self.finished = true;
                if let Some(usage) = usage {
                    self.usage = Some(*usage);
                }
                let parts = self.flush_tools();
                out.push(self.chunk(parts, Some(reason)));
            }
            // The Gemini stream terminates by closing; no marker event.
            StreamEvent::Done => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_tools_and_system() {
        let body = json!({
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "search rust"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "search", "args": {"q": "rust"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "search", "response": {"content": "results"}}}]}
            ],
            "tools": [{"functionDeclarations": [{"name": "search", "parameters": {"type": "object"}}]}],
            "generationConfig": {"temperature": 0.5, "maxOutputTokens": 2048}
        });
        let request = parse_request(&body).unwrap();
        assert_eq!(request.system.as_deref(), Some("be terse"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.max_tokens, Some(2048));

        let rendered = render_request(&request);
        let reparsed = parse_request(&rendered).unwrap();
        assert_eq!(reparsed.messages.len(), 3);
        assert!(matches!(
            &reparsed.messages[1].blocks[0],
            ContentBlock::ToolUse { name, .. } if name == "search"
        ));
    }

    #[test]
    fn claude_to_gemini_keeps_tool_semantics() {
        let claude_body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "messages": [
                {"role": "user", "content": "look it up"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"k": "v"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "found"}
                ]}
            ]
        });
        let normalized = super::super::claude::parse_request(&claude_body).unwrap();
        let gemini_wire = render_request(&normalized);
        // The functionResponse resolves the function name from the call.
        assert_eq!(
            gemini_wire["contents"][2]["parts"][0]["functionResponse"]["name"],
            "lookup"
        );
    }

    #[test]
    fn response_usage_separates_cached_tokens() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 100,
                "candidatesTokenCount": 20,
                "cachedContentTokenCount": 30
            }
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.usage.input_tokens, 70);
        assert_eq!(response.usage.cache_read_tokens, 30);
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn stream_function_call_maps_finish_to_tool_calls() {
        let chunk = json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "search", "args": {"q": "x"}}}]},
                "finishReason": "STOP"
            }]
        });
        let events = parse_stream_event(&chunk);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallStart { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Finish { reason, .. } if *reason == FinishReason::ToolCalls)));
    }

    #[test]
    fn emitter_buffers_tool_args_until_finish() {
        let mut emitter = StreamEmitter::default();
        let mut frames = Vec::new();
        for event in [
            StreamEvent::ToolCallStart {
                index: 1,
                id: "call_1".into(),
                name: "search".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                args_fragment: "{\"q\":".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                args_fragment: "\"rust\"}".into(),
            },
            StreamEvent::Finish {
                reason: FinishReason::ToolCalls,
                usage: None,
            },
        ] {
            frames.extend(emitter.emit(&event));
        }
        assert_eq!(frames.len(), 1, "args buffered until finish");
        assert!(frames[0].contains("\"functionCall\""));
        assert!(frames[0].contains("\"q\":\"rust\""));
        assert!(frames[0].contains("\"finishReason\":\"STOP\""));
    }
}
