//! Shared upstream streaming executor
//!
//! All four dialects share the same control flow: build the wire request,
//! open the connection, then either consume frames (SSE or NDJSON) or fall
//! back to a single JSON body, classifying the outcome identically. Only
//! request building and per-frame extraction vary, behind [`ProviderDialect`]
//! and [`FrameConverter`].

use crate::error::GatewayError;
use crate::sse::{ndjson_frames, sse_frames};
use crate::types::{ChatRequest, Route, Usage};
use eventsource_stream::Event;
use futures_util::StreamExt;
use secrecy::SecretString;
use std::time::Duration;

/// Maximum raw frames echoed per call when raw-echo is requested.
pub const MAX_ECHO_FRAMES: usize = 64;
/// Maximum characters echoed per call when raw-echo is requested.
pub const MAX_ECHO_CHARS: usize = 16 * 1024;

/// Dialect-specific request, ready to send.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// What one upstream frame contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Nothing extractable (metadata frame, keep-alive, etc.).
    Skip,
    /// Incremental text.
    Delta(String),
    /// Explicit upstream terminal sentinel; stop reading.
    Done,
}

/// Stateful per-call frame interpreter for one dialect.
pub trait FrameConverter: Send {
    /// Interpret one frame. An in-band upstream error object comes back as
    /// `Err` and fails the call.
    fn on_frame(&mut self, event: &Event) -> Result<FrameDisposition, GatewayError>;

    /// Extract the full reply text from a non-streamed JSON body.
    fn text_from_body(&self, body: &serde_json::Value) -> Option<String>;

    /// Usage metadata accumulated so far, if the dialect reports any.
    fn usage(&self) -> Option<Usage> {
        None
    }

    /// Names of tool/function calls the upstream asked for. Recorded, never
    /// executed.
    fn tool_calls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Upstream-side correlation id, when the dialect carries one in-band.
    fn upstream_request_id(&self) -> Option<String> {
        None
    }
}

/// One upstream streaming dialect: request building plus frame extraction.
pub trait ProviderDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build URL/headers/body for the normalized request. Implementations
    /// must force streaming on in the body regardless of caller input.
    fn wire_request(&self, route: &Route, request: &ChatRequest)
        -> Result<WireRequest, GatewayError>;

    /// Credential header presentation for the given strategy index, most
    /// preferred first. `None` once strategies are exhausted.
    fn auth_headers(
        &self,
        credential: &SecretString,
        strategy: usize,
    ) -> Option<Vec<(String, String)>>;

    fn converter(&self) -> Box<dyn FrameConverter>;
}

/// Events an adapter reports back while streaming.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    ContentDelta(String),
    UpstreamRaw { upstream_event: String, raw: String },
}

/// Sink for adapter events; the orchestrator wires this to the broker.
pub type EmitFn<'a> = &'a (dyn Fn(AdapterEvent) + Send + Sync);

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Echo raw frames (bounded) for diagnostics / auto-mode evidence. Also
    /// degrades empty-content and tool-call failures to raw-only successes.
    pub raw_echo: bool,
    pub max_echo_frames: usize,
    pub max_echo_chars: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            raw_echo: false,
            max_echo_frames: MAX_ECHO_FRAMES,
            max_echo_chars: MAX_ECHO_CHARS,
        }
    }
}

impl StreamOptions {
    pub fn raw_echo() -> Self {
        Self {
            raw_echo: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct StreamOutcome {
    /// Assembled reply text (empty for raw-only outcomes).
    pub text: String,
    /// Serialized response summary for logging/accounting.
    pub summary: serde_json::Value,
    pub upstream_request_id: Option<String>,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<String>,
    /// True when the call produced no parseable text but raw echo was
    /// active, so the caller may still surface something.
    pub raw_only: bool,
}

/// Substrings of a 401 body that indicate an API-key-specific rejection and
/// justify retrying with the alternate credential-header presentation.
const API_KEY_HINTS: &[&str] = &["api key", "api_key", "api-key", "apikey"];

fn is_api_key_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    API_KEY_HINTS.iter().any(|h| lower.contains(h))
}

/// Private-network targets are the only ones eligible for the alternate
/// credential-header retry.
pub fn is_private_host(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    host == "localhost"
        || host == "::1"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || is_172_private(host)
}

fn is_172_private(host: &str) -> bool {
    let Some(rest) = host.strip_prefix("172.") else {
        return false;
    };
    let Some(second) = rest.split('.').next() else {
        return false;
    };
    matches!(second.parse::<u8>(), Ok(n) if (16..=31).contains(&n))
}

/// Drive one upstream call end to end. See the module docs for the shared
/// control flow; returns the assembled outcome or the classified failure.
pub async fn run_stream(
    client: &reqwest::Client,
    dialect: &dyn ProviderDialect,
    route: &Route,
    request: &ChatRequest,
    opts: &StreamOptions,
    emit: EmitFn<'_>,
) -> Result<StreamOutcome, GatewayError> {
    let wire = dialect.wire_request(route, request)?;
    let timeout = Duration::from_secs(route.endpoint.timeout_secs);
    let credential = route.credential.clone().unwrap_or_else(|| SecretString::from(""));

    let mut strategy = 0;
    let response = loop {
        let Some(auth) = dialect.auth_headers(&credential, strategy) else {
            return Err(GatewayError::Api {
                status: 401,
                message: "credential header strategies exhausted".into(),
            });
        };

        let mut builder = client.post(&wire.url).timeout(timeout).json(&wire.body);
        for (name, value) in wire.headers.iter().chain(auth.iter()) {
            builder = builder.header(name, value);
        }
        let response = builder.send().await.map_err(|e| map_transport(e, timeout))?;

        let status = response.status();
        if status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            let more = dialect.auth_headers(&credential, strategy + 1).is_some();
            if more && is_private_host(&wire.url) && is_api_key_rejection(&body) {
                tracing::debug!(
                    provider = dialect.name(),
                    strategy,
                    "401 mentions API key; retrying with alternate credential header"
                );
                strategy += 1;
                continue;
            }
            return Err(GatewayError::Api {
                status: 401,
                message: truncate(&body, 512),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: truncate(&body, 512),
            });
        }
        break response;
    };

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let converter = dialect.converter();
    if content_type.contains("event-stream") {
        consume_frames(dialect, sse_frames(response.bytes_stream()), converter, opts, emit).await
    } else if content_type.contains("ndjson") {
        consume_frames(dialect, ndjson_frames(response.bytes_stream()), converter, opts, emit)
            .await
    } else {
        consume_json_body(dialect, response, converter, opts, emit).await
    }
}

fn map_transport(e: reqwest::Error, timeout: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout {
            seconds: timeout.as_secs(),
        }
    } else {
        GatewayError::Http(e)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

struct EchoBudget {
    frames: usize,
    chars: usize,
}

impl EchoBudget {
    fn admit(&mut self, opts: &StreamOptions, len: usize) -> bool {
        if !opts.raw_echo
            || self.frames >= opts.max_echo_frames
            || self.chars >= opts.max_echo_chars
        {
            return false;
        }
        self.frames += 1;
        self.chars += len;
        true
    }
}

async fn consume_frames(
    dialect: &dyn ProviderDialect,
    mut frames: crate::sse::FrameStream,
    mut converter: Box<dyn FrameConverter>,
    opts: &StreamOptions,
    emit: EmitFn<'_>,
) -> Result<StreamOutcome, GatewayError> {
    let mut text = String::new();
    let mut echo = EchoBudget { frames: 0, chars: 0 };
    let mut frame_count = 0usize;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        frame_count += 1;
        if echo.admit(opts, frame.data.chars().count()) {
            let name = if frame.event.is_empty() {
                "message".to_string()
            } else {
                frame.event.clone()
            };
            emit(AdapterEvent::UpstreamRaw {
                upstream_event: name,
                raw: frame.data.clone(),
            });
        }
        match converter.on_frame(&frame)? {
            FrameDisposition::Skip => {}
            FrameDisposition::Delta(delta) => {
                text.push_str(&delta);
                emit(AdapterEvent::ContentDelta(delta));
            }
            FrameDisposition::Done => break,
        }
    }

    classify_outcome(dialect, text, frame_count, converter, opts)
}

async fn consume_json_body(
    dialect: &dyn ProviderDialect,
    response: reqwest::Response,
    converter: Box<dyn FrameConverter>,
    opts: &StreamOptions,
    emit: EmitFn<'_>,
) -> Result<StreamOutcome, GatewayError> {
    // The upstream declared a non-event-stream content type: one-shot JSON.
    // Raw byte chunks are still echoed as they arrive so an Auto session has
    // evidence to resolve on even when the body never parses.
    let mut body = Vec::new();
    let mut echo = EchoBudget { frames: 0, chars: 0 };
    let mut chunks = 0usize;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::Stream(format!("body read error: {e}")))?;
        let raw = String::from_utf8_lossy(&chunk).to_string();
        if echo.admit(opts, raw.chars().count()) {
            emit(AdapterEvent::UpstreamRaw {
                upstream_event: "chunk".into(),
                raw,
            });
        }
        chunks += 1;
        body.extend_from_slice(&chunk);
    }

    let parsed: Result<serde_json::Value, _> = serde_json::from_slice(&body);
    match parsed {
        Ok(value) => {
            if let Some(content) = converter.text_from_body(&value) {
                emit(AdapterEvent::ContentDelta(content.clone()));
                let summary = summarize(dialect, &content, chunks, converter.as_ref());
                Ok(StreamOutcome {
                    text: content,
                    summary,
                    upstream_request_id: converter.upstream_request_id(),
                    usage: converter.usage(),
                    tool_calls: converter.tool_calls(),
                    raw_only: false,
                })
            } else {
                classify_outcome(dialect, String::new(), chunks, converter, opts)
            }
        }
        Err(e) if opts.raw_echo => {
            tracing::debug!(provider = dialect.name(), error = %e, "unparseable body, raw-only");
            let summary = serde_json::json!({
                "provider": dialect.name(),
                "raw_only": true,
                "chunks": chunks,
            });
            Ok(StreamOutcome {
                text: String::new(),
                summary,
                upstream_request_id: None,
                usage: None,
                tool_calls: Vec::new(),
                raw_only: true,
            })
        }
        Err(e) => Err(GatewayError::Parse(format!(
            "non-stream body is not JSON ({}): {e}",
            dialect.name()
        ))),
    }
}

fn classify_outcome(
    dialect: &dyn ProviderDialect,
    text: String,
    frame_count: usize,
    converter: Box<dyn FrameConverter>,
    opts: &StreamOptions,
) -> Result<StreamOutcome, GatewayError> {
    let tool_calls = converter.tool_calls();
    if text.is_empty() {
        if !opts.raw_echo {
            if !tool_calls.is_empty() {
                return Err(GatewayError::UnsupportedToolCall { names: tool_calls });
            }
            return Err(GatewayError::EmptyContent {
                provider: dialect.name().to_string(),
            });
        }
        let summary = serde_json::json!({
            "provider": dialect.name(),
            "raw_only": true,
            "frames": frame_count,
            "tool_calls": tool_calls,
        });
        return Ok(StreamOutcome {
            text,
            summary,
            upstream_request_id: converter.upstream_request_id(),
            usage: converter.usage(),
            tool_calls,
            raw_only: true,
        });
    }

    let summary = summarize(dialect, &text, frame_count, converter.as_ref());
    Ok(StreamOutcome {
        text,
        summary,
        upstream_request_id: converter.upstream_request_id(),
        usage: converter.usage(),
        tool_calls,
        raw_only: false,
    })
}

fn summarize(
    dialect: &dyn ProviderDialect,
    text: &str,
    frames: usize,
    converter: &dyn FrameConverter,
) -> serde_json::Value {
    serde_json::json!({
        "provider": dialect.name(),
        "text_len": text.chars().count(),
        "frames": frames,
        "usage": converter.usage(),
        "tool_calls": converter.tool_calls(),
    })
}
