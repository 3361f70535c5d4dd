//! OpenAI Chat Completions streaming dialect
//!
//! Maps the normalized chat request onto `POST {base}/chat/completions` and
//! interprets the chunked SSE reply: `choices[0].delta.content` carries the
//! text, `[DONE]` terminates the stream, and a top-level `error` object is an
//! in-band failure. Also covers the OpenAI-compatible local servers that
//! speak the same wire shape.

mod stream;

pub use stream::OpenAiConverter;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, ProviderDialect, WireRequest};
use sluice_core::types::{ChatRequest, MessageRole, Route};

pub struct OpenAiDialect;

impl ProviderDialect for OpenAiDialect {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn wire_request(
        &self,
        route: &Route,
        request: &ChatRequest,
    ) -> Result<WireRequest, GatewayError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            messages.push(json!({"role": role_str(msg.role), "content": msg.content}));
        }

        let mut body = json!({
            "model": route.resolved_model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request body is not an object".into()))?;
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(m));
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".into(), tools.clone());
        }
        if let Some(choice) = &request.tool_choice {
            obj.insert("tool_choice".into(), choice.clone());
        }

        Ok(WireRequest {
            url: format!("{}/chat/completions", route.endpoint.base_url.trim_end_matches('/')),
            headers: vec![("content-type".into(), "application/json".into())],
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
                "authorization".into(),
                format!("Bearer {}", credential.expose_secret()),
            )]),
            // Some OpenAI-compatible gateways on private networks want the
            // key bare in `x-api-key` instead of a bearer token.
            1 => Some(vec![(
                "x-api-key".into(),
                credential.expose_secret().to_string(),
            )]),
            _ => None,
        }
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(OpenAiConverter::default())
    }
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}
