//! Anthropic Messages streaming dialect
//!
//! Maps the normalized chat request onto `POST {base}/messages` with the
//! `anthropic-version` header, and interprets the typed SSE event stream:
//! `message_start` carries the upstream message id, `content_block_delta`
//! with a `text_delta` carries text, `message_delta` updates usage, and
//! `message_stop` terminates. `ping` frames are ignored.

mod stream;

pub use stream::AnthropicConverter;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, ProviderDialect, WireRequest};
use sluice_core::types::{ChatRequest, MessageRole, Route};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicDialect;

impl ProviderDialect for AnthropicDialect {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn wire_request(
        &self,
        route: &Route,
        request: &ChatRequest,
    ) -> Result<WireRequest, GatewayError> {
        // System content travels in the top-level `system` field, not as a
        // message; inline system messages are folded into it.
        let mut system_parts = Vec::new();
        if let Some(sp) = &request.system_prompt {
            system_parts.push(sp.clone());
        }
        let mut messages = Vec::new();
        for msg in &request.messages {
            match msg.role {
                MessageRole::System => system_parts.push(msg.content.clone()),
                MessageRole::User | MessageRole::Tool => {
                    messages.push(json!({"role": "user", "content": msg.content}));
                }
                MessageRole::Assistant => {
                    messages.push(json!({"role": "assistant", "content": msg.content}));
                }
            }
        }

        let mut body = json!({
            "model": route.resolved_model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request body is not an object".into()))?;
        if !system_parts.is_empty() {
            obj.insert("system".into(), json!(system_parts.join("\n\n")));
        }
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".into(), tools.clone());
        }
        if let Some(choice) = &request.tool_choice {
            obj.insert("tool_choice".into(), choice.clone());
        }

        Ok(WireRequest {
            url: format!("{}/messages", route.endpoint.base_url.trim_end_matches('/')),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ],
            body,
        })
    }

    fn auth_headers(
        &self,
        credential: &SecretString,
        strategy: usize,
    ) -> Option<Vec<(String, String)>> {
        match strategy {
            0 => Some(vec![(
                "x-api-key".into(),
                credential.expose_secret().to_string(),
            )]),
            // Anthropic-compatible proxies sometimes only accept bearer auth.
            1 => Some(vec![(
                "authorization".into(),
                format!("Bearer {}", credential.expose_secret()),
            )]),
            _ => None,
        }
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(AnthropicConverter::default())
    }
}
