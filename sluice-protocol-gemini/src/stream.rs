//! Chunk interpretation for the Gemini SSE stream.

use eventsource_stream::Event;
use serde::Deserialize;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, FrameDisposition};
use sluice_core::types::Usage;

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default, rename = "responseId")]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u64,
}

#[derive(Default)]
pub struct GeminiConverter {
    response_id: Option<String>,
    usage: Option<Usage>,
    tool_calls: Vec<String>,
}

impl GeminiConverter {
    fn collect_parts(&mut self, chunk: GenerateChunk) -> String {
        if self.response_id.is_none() {
            self.response_id = chunk.response_id;
        }
        if let Some(meta) = chunk.usage_metadata {
            self.usage = Some(Usage {
                prompt_tokens: meta.prompt_token_count,
                completion_tokens: meta.candidates_token_count,
                total_tokens: meta.total_token_count,
            });
        }
        let mut text = String::new();
        for candidate in chunk.candidates {
            let Some(content) = candidate.content else { continue };
            for part in content.parts {
                if let Some(call) = part.function_call {
                    self.tool_calls.push(call.name);
                }
                if let Some(t) = part.text {
                    text.push_str(&t);
                }
            }
        }
        text
    }
}

impl FrameConverter for GeminiConverter {
    fn on_frame(&mut self, event: &Event) -> Result<FrameDisposition, GatewayError> {
        let chunk: GenerateChunk = serde_json::from_str(&event.data)
            .map_err(|e| GatewayError::Parse(format!("gemini chunk: {e}")))?;
        if let Some(err) = chunk.error {
            return Err(GatewayError::Stream(format!("upstream error object: {err}")));
        }
        let text = self.collect_parts(chunk);
        if text.is_empty() {
            Ok(FrameDisposition::Skip)
        } else {
            Ok(FrameDisposition::Delta(text))
        }
    }

    fn text_from_body(&self, body: &serde_json::Value) -> Option<String> {
        // A non-stream body is one response object; the non-SSE stream
        // endpoint returns an array of them.
        let objects: Vec<&serde_json::Value> = match body {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let mut text = String::new();
        for obj in objects {
            if let Some(parts) = obj
                .pointer("/candidates/0/content/parts")
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
            }
        }
        (!text.is_empty()).then_some(text)
    }

    fn usage(&self) -> Option<Usage> {
        self.usage.clone()
    }

    fn tool_calls(&self) -> Vec<String> {
        self.tool_calls.clone()
    }

    fn upstream_request_id(&self) -> Option<String> {
        self.response_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> Event {
        Event {
            event: String::new(),
            data: data.to_string(),
            id: String::new(),
            retry: None,
        }
    }

    #[test]
    fn extracts_text_parts() {
        let mut c = GeminiConverter::default();
        let d = c
            .on_frame(&event(
                r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}],"role":"model"}}],"responseId":"r1"}"#,
            ))
            .unwrap();
        assert_eq!(d, FrameDisposition::Delta("Hello".into()));
        assert_eq!(c.upstream_request_id().as_deref(), Some("r1"));
    }

    #[test]
    fn usage_metadata_is_captured() {
        let mut c = GeminiConverter::default();
        c.on_frame(&event(
            r#"{"candidates":[],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":11,"totalTokenCount":16}}"#,
        ))
        .unwrap();
        assert_eq!(
            c.usage(),
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 11,
                total_tokens: 16
            })
        );
    }

    #[test]
    fn function_call_parts_record_names() {
        let mut c = GeminiConverter::default();
        let d = c
            .on_frame(&event(
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"lookup","args":{}}}]}}]}"#,
            ))
            .unwrap();
        assert_eq!(d, FrameDisposition::Skip);
        assert_eq!(c.tool_calls(), vec!["lookup"]);
    }

    #[test]
    fn error_object_fails_the_stream() {
        let mut c = GeminiConverter::default();
        let err = c
            .on_frame(&event(r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Stream(_)));
    }

    #[test]
    fn full_body_handles_object_and_array_shapes() {
        let c = GeminiConverter::default();
        let obj = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}}]
        });
        assert_eq!(c.text_from_body(&obj).as_deref(), Some("hi"));
        let arr = serde_json::json!([
            {"candidates": [{"content": {"parts": [{"text": "a"}]}}]},
            {"candidates": [{"content": {"parts": [{"text": "b"}]}}]}
        ]);
        assert_eq!(c.text_from_body(&arr).as_deref(), Some("ab"));
    }
}
