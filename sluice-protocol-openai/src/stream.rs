//! Chunk interpretation for the Chat Completions SSE stream.

use eventsource_stream::Event;
use serde::Deserialize;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, FrameDisposition};
use sluice_core::types::Usage;

/// Explicit end-of-stream sentinel in the `data:` payload.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            prompt_tokens: w.prompt_tokens,
            completion_tokens: w.completion_tokens,
            total_tokens: w.total_tokens,
        }
    }
}

#[derive(Default)]
pub struct OpenAiConverter {
    request_id: Option<String>,
    usage: Option<Usage>,
    tool_calls: Vec<String>,
}

impl FrameConverter for OpenAiConverter {
    fn on_frame(&mut self, event: &Event) -> Result<FrameDisposition, GatewayError> {
        if event.data.trim() == DONE_SENTINEL {
            return Ok(FrameDisposition::Done);
        }
        let chunk: ChatChunk = serde_json::from_str(&event.data)
            .map_err(|e| GatewayError::Parse(format!("chat completion chunk: {e}")))?;

        if let Some(err) = chunk.error {
            return Err(GatewayError::Stream(format!("upstream error object: {err}")));
        }
        if self.request_id.is_none() {
            self.request_id = chunk.id;
        }
        if let Some(usage) = chunk.usage {
            let mut merged = self.usage.take().unwrap_or_default();
            merged.merge(&usage.into());
            self.usage = Some(merged);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(FrameDisposition::Skip); // usage-only trailer chunk
        };
        if let Some(delta) = choice.delta {
            for call in delta.tool_calls {
                if let Some(name) = call.function.and_then(|f| f.name) {
                    self.tool_calls.push(name);
                }
            }
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    return Ok(FrameDisposition::Delta(content));
                }
            }
        }
        if choice.finish_reason.is_some() {
            // The `[DONE]` sentinel still follows; nothing to emit here.
            return Ok(FrameDisposition::Skip);
        }
        Ok(FrameDisposition::Skip)
    }

    fn text_from_body(&self, body: &serde_json::Value) -> Option<String> {
        body.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn usage(&self) -> Option<Usage> {
        self.usage.clone()
    }

    fn tool_calls(&self) -> Vec<String> {
        self.tool_calls.clone()
    }

    fn upstream_request_id(&self) -> Option<String> {
        self.request_id.clone()
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
    fn extracts_content_deltas_and_done() {
        let mut c = OpenAiConverter::default();
        let d1 = c
            .on_frame(&event(
                r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"Hel"}}]}"#,
            ))
            .unwrap();
        assert_eq!(d1, FrameDisposition::Delta("Hel".into()));
        let d2 = c
            .on_frame(&event(r#"{"choices":[{"delta":{"content":"lo"}}]}"#))
            .unwrap();
        assert_eq!(d2, FrameDisposition::Delta("lo".into()));
        assert_eq!(c.on_frame(&event("[DONE]")).unwrap(), FrameDisposition::Done);
        assert_eq!(c.upstream_request_id().as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn empty_delta_and_role_chunks_are_skipped() {
        let mut c = OpenAiConverter::default();
        let d = c
            .on_frame(&event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#))
            .unwrap();
        assert_eq!(d, FrameDisposition::Skip);
        let d = c
            .on_frame(&event(r#"{"choices":[{"delta":{"content":""}}]}"#))
            .unwrap();
        assert_eq!(d, FrameDisposition::Skip);
    }

    #[test]
    fn usage_trailer_is_captured() {
        let mut c = OpenAiConverter::default();
        c.on_frame(&event(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"total_tokens":46}}"#,
        ))
        .unwrap();
        assert_eq!(
            c.usage(),
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 34,
                total_tokens: 46
            })
        );
    }

    #[test]
    fn tool_call_names_are_recorded() {
        let mut c = OpenAiConverter::default();
        let d = c
            .on_frame(&event(
                r#"{"choices":[{"delta":{"tool_calls":[{"function":{"name":"get_weather"}}]}}]}"#,
            ))
            .unwrap();
        assert_eq!(d, FrameDisposition::Skip);
        assert_eq!(c.tool_calls(), vec!["get_weather"]);
    }

    #[test]
    fn error_object_fails_the_stream() {
        let mut c = OpenAiConverter::default();
        let err = c
            .on_frame(&event(r#"{"error":{"message":"rate limited","code":429}}"#))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Stream(_)));
    }

    #[test]
    fn full_body_content_extraction() {
        let c = OpenAiConverter::default();
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(c.text_from_body(&body).as_deref(), Some("hello"));
        assert!(c.text_from_body(&serde_json::json!({"choices": []})).is_none());
    }
}
