//! Ollama NDJSON streaming dialect
//!
//! Maps the normalized chat request onto `POST {base}/api/chat`. The reply
//! is newline-delimited JSON rather than SSE; the shared executor frames it
//! line by line and each line lands here as one synthetic event. A line with
//! `"done": true` terminates the stream and carries the token counts.

mod stream;

pub use stream::OllamaConverter;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, ProviderDialect, WireRequest};
use sluice_core::types::{ChatRequest, MessageRole, Route};

pub struct OllamaDialect;

impl ProviderDialect for OllamaDialect {
    fn name(&self) -> &'static str {
        "ollama"
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
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User | MessageRole::Tool => "user",
                MessageRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": msg.content}));
        }

        let mut body = json!({
            "model": route.resolved_model,
            "messages": messages,
            "stream": true,
        });
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request body is not an object".into()))?;
        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            options.insert("num_predict".into(), json!(m));
        }
        if !options.is_empty() {
            obj.insert("options".into(), options.into());
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".into(), tools.clone());
        }

        Ok(WireRequest {
            url: format!("{}/api/chat", route.endpoint.base_url.trim_end_matches('/')),
            headers: vec![("content-type".into(), "application/json".into())],
            body,
        })
    }

    fn auth_headers(
        &self,
        credential: &SecretString,
        strategy: usize,
    ) -> Option<Vec<(String, String)>> {
        // Local daemons are usually unauthenticated; only present a header
        // when a credential was actually configured.
        let key = credential.expose_secret();
        match strategy {
            0 if key.is_empty() => Some(Vec::new()),
            0 => Some(vec![("authorization".into(), format!("Bearer {key}"))]),
            1 if !key.is_empty() => Some(vec![("x-api-key".into(), key.to_string())]),
            _ => None,
        }
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(OllamaConverter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::{ChatMessage, EndpointConfig, OutputMode};

    #[test]
    fn builds_chat_request_with_options() {
        let route = Route {
            endpoint: EndpointConfig {
                id: "local".into(),
                provider: "ollama".into(),
                base_url: "http://localhost:11434".into(),
                api_key: None,
                timeout_secs: 300,
                models: None,
                default_model: Some("llama3.2".into()),
                active: true,
                is_default: true,
                tier: None,
            },
            resolved_model: "llama3.2".into(),
            provider: "ollama".into(),
            mapping_hit: false,
            credential: None,
        };
        let request = ChatRequest {
            model: "fast-chat".into(),
            messages: vec![ChatMessage::user("hi")],
            output_mode: OutputMode::StructuredText,
            system_prompt: None,
            tools: None,
            tool_choice: None,
            temperature: Some(0.8),
            top_p: None,
            max_tokens: Some(64),
            endpoint: None,
        };
        let wire = OllamaDialect.wire_request(&route, &request).unwrap();
        assert_eq!(wire.url, "http://localhost:11434/api/chat");
        assert_eq!(wire.body["options"]["num_predict"], 64);
        assert_eq!(wire.body["stream"], true);
    }

    #[test]
    fn no_auth_header_without_credential() {
        let empty = SecretString::from("");
        assert!(OllamaDialect.auth_headers(&empty, 0).unwrap().is_empty());
        assert!(OllamaDialect.auth_headers(&empty, 1).is_none());

        let keyed = SecretString::from("tok");
        assert_eq!(
            OllamaDialect.auth_headers(&keyed, 0).unwrap()[0].1,
            "Bearer tok"
        );
    }
}
