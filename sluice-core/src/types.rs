//! Shared request/route types
//!
//! These are the dialect-agnostic shapes every crate in the workspace talks
//! in: the normalized inbound chat request, the resolved route produced by
//! the router, and the usage metadata adapters accumulate.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// How the session's output should be delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The structured tag grammar (`thinking`/`phase`/`title`/`final`).
    #[default]
    StructuredText,
    /// Upstream frames forwarded largely unmodified.
    RawPassthrough,
    /// Undetermined at session creation; resolved from early stream evidence.
    Auto,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StructuredText => "StructuredText",
            Self::RawPassthrough => "RawPassthrough",
            Self::Auto => "Auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One normalized chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized chat request, already prompt-assembled by the orchestrator.
///
/// Adapters translate this into their dialect's wire body; they must force
/// streaming on regardless of what the caller set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Abstract model key, e.g. `"fast-chat"` or `"mapping:research"`.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tool schema forwarded verbatim; the gateway never executes tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Explicit endpoint override, validated by the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// One configured upstream endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    /// Dialect label: `openai`, `anthropic`, `gemini` or `ollama`.
    pub provider: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Explicit supported-model allowlist; `None` means undeclared.
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Last-resort endpoint when nothing else matches.
    #[serde(default)]
    pub is_default: bool,
    /// Access tier label matched against mapping `required_tier` metadata.
    #[serde(default)]
    pub tier: Option<String>,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    /// Whether this endpoint declares support for `model`, via its explicit
    /// allowlist or by advertising it as its own default.
    pub fn supports_model(&self, model: &str) -> bool {
        match &self.models {
            Some(list) => list.iter().any(|m| m == model),
            None => self.default_model.as_deref() == Some(model),
        }
    }
}

/// A fully resolved upstream target: where to call, which vendor model to
/// name, and which credential to present.
#[derive(Debug, Clone)]
pub struct Route {
    pub endpoint: EndpointConfig,
    pub resolved_model: String,
    /// Dialect label copied from the endpoint for convenience.
    pub provider: String,
    /// True when the key matched an explicit `scope:key` mapping entry.
    pub mapping_hit: bool,
    pub credential: Option<SecretString>,
}

/// Token usage reported by the upstream, when it reports any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn merge(&mut self, other: &Usage) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
        self.total_tokens = if other.total_tokens > 0 {
            other.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        };
    }
}
