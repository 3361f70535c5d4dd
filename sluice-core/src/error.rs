//! Gateway error types
//!
//! One error enum crosses every boundary in the workspace. Variants carry a
//! stable machine-readable `code()` which is what clients see in the
//! terminal `error` frame; the `Display` text is the human half.

use thiserror::Error;

/// Unified error type for the gateway core, adapters and router.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Upstream replied with a non-2xx status.
    #[error("upstream returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure talking to the upstream.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream call exceeded the endpoint's configured deadline.
    #[error("upstream call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The event stream broke or carried an in-band error object.
    #[error("stream error: {0}")]
    Stream(String),

    /// A frame or body could not be parsed as the dialect promised.
    #[error("parse error: {0}")]
    Parse(String),

    /// The upstream finished without producing any text.
    #[error("upstream produced no content ({provider})")]
    EmptyContent { provider: String },

    /// The upstream asked for tool calls the gateway does not execute.
    #[error("upstream requested unsupported tool call(s): {}", names.join(", "))]
    UnsupportedToolCall { names: Vec<String> },

    // Routing failures, always terminal and never retried.
    #[error("no active endpoint is available")]
    NoActiveEndpoint,

    #[error("endpoint '{0}' not found among eligible endpoints")]
    EndpointNotFound(String),

    #[error("endpoint '{endpoint}' does not support model '{model}'")]
    ModelNotSupportedByEndpoint { endpoint: String, model: String },

    #[error("no endpoint supports mapped model '{0}'")]
    NoEndpointForMappedModel(String),

    // Broker API-boundary errors. These are local call failures and are
    // never serialized into the outbound stream.
    #[error("session '{0}' already exists")]
    DuplicateSession(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The client went away while a conversation task was still running.
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire code carried by the outbound `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Api { .. } => "upstream_error",
            Self::Http(_) | Self::Timeout { .. } | Self::Stream(_) => "transport_error",
            Self::Parse(_) => "parse_error",
            Self::EmptyContent { .. } => "empty_content",
            Self::UnsupportedToolCall { .. } => "unsupported_tool_call",
            Self::NoActiveEndpoint => "no_active_endpoint",
            Self::EndpointNotFound(_) => "endpoint_not_found",
            Self::ModelNotSupportedByEndpoint { .. } => "model_not_supported",
            Self::NoEndpointForMappedModel(_) => "no_endpoint_for_model",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ClientDisconnected => "client_disconnected",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True for errors produced by the router; these are never retried.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::NoActiveEndpoint
                | Self::EndpointNotFound(_)
                | Self::ModelNotSupportedByEndpoint { .. }
                | Self::NoEndpointForMappedModel(_)
        )
    }
}
