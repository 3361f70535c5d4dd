//! Google Gemini streaming dialect
//!
//! Maps the normalized chat request onto
//! `POST {base}/models/{model}:streamGenerateContent?alt=sse` and pulls text
//! out of `candidates[0].content.parts[].text`. Gemini has no explicit done
//! sentinel; the stream simply ends.

mod stream;

pub use stream::GeminiConverter;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, ProviderDialect, WireRequest};
use sluice_core::types::{ChatRequest, MessageRole, Route};

pub struct GeminiDialect;

impl ProviderDialect for GeminiDialect {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn wire_request(
        &self,
        route: &Route,
        request: &ChatRequest,
    ) -> Result<WireRequest, GatewayError> {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();
        if let Some(sp) = &request.system_prompt {
            system_parts.push(json!({"text": sp}));
        }
        for msg in &request.messages {
            match msg.role {
                MessageRole::System => system_parts.push(json!({"text": msg.content})),
                MessageRole::User | MessageRole::Tool => {
                    contents.push(json!({"role": "user", "parts": [{"text": msg.content}]}));
                }
                MessageRole::Assistant => {
                    contents.push(json!({"role": "model", "parts": [{"text": msg.content}]}));
                }
            }
        }

        let mut body = json!({"contents": contents});
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request body is not an object".into()))?;
        if !system_parts.is_empty() {
            obj.insert(
                "systemInstruction".into(),
                json!({"parts": system_parts}),
            );
        }
        let mut generation = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(m));
        }
        if !generation.is_empty() {
            obj.insert("generationConfig".into(), generation.into());
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".into(), tools.clone());
        }

        Ok(WireRequest {
            url: format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                route.endpoint.base_url.trim_end_matches('/'),
                route.resolved_model
            ),
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
                "x-goog-api-key".into(),
                credential.expose_secret().to_string(),
            )]),
            // Gemini-compatible private proxies often expect bearer auth.
            1 => Some(vec![(
                "authorization".into(),
                format!("Bearer {}", credential.expose_secret()),
            )]),
            _ => None,
        }
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(GeminiConverter::default())
    }
}
