//! `/v1/*` ingress handlers.
//!
//! Each handler routes its family into the shared pipeline and maps the
//! pipeline response onto axum, adding the gateway's `x-cch-*` headers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::error::ProxyError;
use crate::models::ApiFamily;
use crate::pipeline::{InboundRequest, PipelineResponse, ResponseMeta};

use super::routes::AppState;

const TEXT_EVENT_STREAM: &str = "text/event-stream";
const NO_CACHE: &str = "no-cache";

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, ApiFamily::Claude, "/v1/messages", headers, body, None, false).await
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        state,
        ApiFamily::OpenAi,
        "/v1/chat/completions",
        headers,
        body,
        None,
        false,
    )
    .await
}

pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, ApiFamily::Responses, "/v1/responses", headers, body, None, false).await
}

/// Gemini routes carry `{model}:{verb}` as one path segment.
pub async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, verb)) = model_action.split_once(':') else {
        return ProxyError::TranslationError {
            message: format!("malformed Gemini path segment {model_action:?}"),
        }
        .into_response();
    };
    let stream = match verb {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return ProxyError::TranslationError {
                message: format!("unsupported Gemini action {other:?}"),
            }
            .into_response()
        }
    };
    let endpoint = format!("/v1beta/models/{model}:{verb}");
    dispatch(
        state,
        ApiFamily::Gemini,
        &endpoint,
        headers,
        body,
        Some(model.to_string()),
        stream,
    )
    .await
}

async fn dispatch(
    state: Arc<AppState>,
    family: ApiFamily,
    endpoint: &str,
    headers: HeaderMap,
    body: Bytes,
    model_from_path: Option<String>,
    stream_from_path: bool,
) -> Response {
    let inbound = InboundRequest {
        family,
        endpoint: endpoint.to_string(),
        headers,
        body,
        model_from_path,
        stream_from_path,
    };
    match state.pipeline.handle(inbound).await {
        Ok(response) => render(response),
        Err(error) => error.into_response(),
    }
}

fn meta_headers(headers: &mut axum::http::HeaderMap, meta: &ResponseMeta) {
    if !meta.session_id.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&meta.session_id) {
            headers.insert("x-cch-session-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&meta.request_sequence.to_string()) {
            headers.insert("x-cch-request-sequence", value);
        }
    }
    if let Some(provider) = &meta.provider_id {
        if let Ok(value) = HeaderValue::from_str(provider) {
            headers.insert("x-cch-provider", value);
        }
    }
    if let Some(intercepted) = meta.intercepted {
        headers.insert("x-cch-intercepted", HeaderValue::from_static(intercepted));
    }
}

fn render(response: PipelineResponse) -> Response {
    match response {
        PipelineResponse::Json {
            status,
            content_type,
            body,
            meta,
        } => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            meta_headers(response.headers_mut(), &meta);
            response
        }
        PipelineResponse::Stream { status, stream, meta } => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .header(header::CONTENT_TYPE, TEXT_EVENT_STREAM)
                .header(header::CACHE_CONTROL, NO_CACHE)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            meta_headers(response.headers_mut(), &meta);
            response
        }
    }
}
