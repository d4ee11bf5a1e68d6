//! Outbound HTTP to upstream providers.
//!
//! One shared reqwest client per (proxy, http2) configuration, credential
//! headers per wire family, streaming pass-through with first-byte and
//! idle timeouts, and cancellation wired through to the upstream
//! connection. Errors come back already classified for the retry loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::models::{ApiFamily, Provider, ProviderType};

/// Cap on how much of an upstream error body lands in messages and logs.
const ERROR_BODY_LIMIT: usize = 2048;

/// Outcome of one upstream call.
pub enum ForwardResponse {
    Json {
        status: u16,
        body: Bytes,
        ttfb_ms: u64,
    },
    Stream {
        status: u16,
        stream: BoxStream<'static, Result<Bytes, ProxyError>>,
        ttfb_ms: u64,
    },
}

/// Everything the forwarder needs for one attempt.
pub struct ForwardRequest<'a> {
    pub provider: &'a Provider,
    pub path: String,
    pub body: serde_json::Value,
    pub stream: bool,
    pub enable_http2: bool,
    /// Extra headers (MCP passthrough, beta flags) set by the pipeline.
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy_url: Option<String>,
    http2: bool,
}

/// Seam between the pipeline and the network; the production impl is
/// [`Forwarder`], tests script outcomes per provider.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        request: ForwardRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ForwardResponse, ProxyError>;
}

pub struct Forwarder {
    clients: RwLock<HashMap<ClientKey, reqwest::Client>>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Upstream for Forwarder {
    async fn send(
        &self,
        request: ForwardRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ForwardResponse, ProxyError> {
        Forwarder::send(self, request, cancel).await
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy_url: Option<&str>, http2: bool) -> Result<reqwest::Client, ProxyError> {
        let key = ClientKey {
            proxy_url: proxy_url.map(String::from),
            http2,
        };
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(90));
        if !http2 {
            builder = builder.http1_only();
        }
        if let Some(url) = proxy_url {
            let proxy = reqwest::Proxy::all(url).map_err(|e| ProxyError::ConnectionError {
                message: format!("invalid proxy url: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| ProxyError::Internal(e.to_string()))?;
        let mut clients = self.clients.write().await;
        Ok(clients.entry(key).or_insert(client).clone())
    }

    /// Perform the upstream call described by `request`.
    pub async fn send(
        &self,
        request: ForwardRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ForwardResponse, ProxyError> {
        let proxy_url = request.provider.proxy.url.as_deref();
        match self.send_via(&request, proxy_url, cancel).await {
            Err(ProxyError::ConnectionError { message })
                if proxy_url.is_some() && request.provider.proxy.fallback_to_direct =>
            {
                tracing::warn!(
                    provider = %request.provider.id,
                    error = %message,
                    "Proxy connect failed, retrying direct"
                );
                self.send_via(&request, None, cancel).await
            }
            other => other,
        }
    }

    async fn send_via(
        &self,
        request: &ForwardRequest<'_>,
        proxy_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ForwardResponse, ProxyError> {
        let client = self.client(proxy_url, request.enable_http2).await?;
        let url = join_url(&request.provider.url, &request.path);
        let timeouts = &request.provider.timeouts;

        let mut builder = client
            .post(&url)
            .header("content-type", "application/json")
            .json(&request.body);
        for (name, value) in auth_headers(request.provider) {
            builder = builder.header(name, value);
        }
        for (name, value) in &request.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.stream {
            builder = builder.header("accept", "text/event-stream");
        } else {
            builder = builder.timeout(Duration::from_secs(timeouts.non_stream_secs));
        }

        let started = Instant::now();
        // First-byte deadline applies to the header exchange on streaming
        // calls; non-streaming calls get their absolute timeout plus a small
        // grace so reqwest's own timeout fires first with a better error.
        let send_deadline = if request.stream {
            Duration::from_secs(timeouts.first_byte_secs.max(1))
        } else {
            Duration::from_secs(timeouts.non_stream_secs.max(1) + 5)
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = tokio::time::timeout(send_deadline, builder.send()) => match result {
                Err(_) if request.stream => {
                    return Err(ProxyError::UpstreamTimeout {
                        message: format!("no response within {}s", timeouts.first_byte_secs),
                    })
                }
                Err(_) => {
                    return Err(ProxyError::UpstreamTimeout {
                        message: format!("no response within {}s", timeouts.non_stream_secs),
                    })
                }
                Ok(Err(e)) => return Err(classify_reqwest_error(&e)),
                Ok(Ok(response)) => response,
            },
        };
        let ttfb_ms = started.elapsed().as_millis() as u64;
        let status = response.status().as_u16();

        if status >= 400 {
            let body = read_error_body(response, cancel).await;
            tracing::warn!(
                provider = %request.provider.id,
                status,
                ttfb_ms,
                "Upstream error response"
            );
            return Err(if status >= 500 {
                ProxyError::Upstream5xx {
                    status,
                    message: body,
                }
            } else {
                ProxyError::Upstream4xx {
                    status,
                    message: body,
                }
            });
        }

        if !request.stream {
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                body = response.bytes() => body.map_err(|e| classify_reqwest_error(&e))?,
            };
            return Ok(ForwardResponse::Json {
                status,
                body,
                ttfb_ms,
            });
        }

        let idle = Duration::from_secs(timeouts.idle_secs.max(1));
        let cancel = cancel.clone();
        let mut upstream = response.bytes_stream();
        let stream = async_stream::try_stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => Err(ProxyError::Cancelled),
                    chunk = tokio::time::timeout(idle, upstream.next()) => match chunk {
                        Err(_) => Err(ProxyError::UpstreamTimeout {
                            message: format!("idle for more than {}s mid-stream", idle.as_secs()),
                        }),
                        Ok(None) => Ok(None),
                        Ok(Some(Err(e))) => Err(classify_reqwest_error(&e)),
                        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
                    },
                };
                match next? {
                    Some(chunk) => yield chunk,
                    None => break,
                }
            }
        };
        Ok(ForwardResponse::Stream {
            status,
            stream: stream.boxed(),
            ttfb_ms,
        })
    }
}

/// Credential and version headers per wire family.
fn auth_headers(provider: &Provider) -> Vec<(&'static str, String)> {
    let mut headers = Vec::new();
    match provider.provider_type {
        ProviderType::Claude => {
            headers.push(("x-api-key", provider.api_key.clone()));
            headers.push(("anthropic-version", "2023-06-01".to_string()));
        }
        ProviderType::ClaudeAuth => {
            headers.push(("authorization", format!("Bearer {}", provider.api_key)));
            headers.push(("anthropic-version", "2023-06-01".to_string()));
        }
        ProviderType::Codex | ProviderType::OpenaiCompatible => {
            headers.push(("authorization", format!("Bearer {}", provider.api_key)));
        }
        ProviderType::Gemini | ProviderType::GeminiCli => {
            headers.push(("x-goog-api-key", provider.api_key.clone()));
        }
    }
    if provider.provider_type.wire_family() == ApiFamily::Claude && provider.prefer_million_context
    {
        headers.push(("anthropic-beta", "context-1m-2025-08-07".to_string()));
    }
    headers
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn classify_reqwest_error(e: &reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout {
            message: e.to_string(),
        }
    } else if e.is_connect() {
        ProxyError::ConnectionError {
            message: e.to_string(),
        }
    } else if e.is_decode() || e.is_body() {
        ProxyError::ConnectionError {
            message: format!("body read failed: {e}"),
        }
    } else {
        ProxyError::ConnectionError {
            message: e.to_string(),
        }
    }
}

async fn read_error_body(response: reqwest::Response, cancel: &CancellationToken) -> String {
    let body = tokio::select! {
        _ = cancel.cancelled() => return "request cancelled".to_string(),
        body = tokio::time::timeout(Duration::from_secs(10), response.bytes()) => match body {
            Ok(Ok(bytes)) => bytes,
            _ => return "unreadable upstream error body".to_string(),
        },
    };
    let text = String::from_utf8_lossy(&body);
    let trimmed: String = text.chars().take(ERROR_BODY_LIMIT).collect();
    trimmed
}
