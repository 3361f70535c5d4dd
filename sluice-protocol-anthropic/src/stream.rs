//! Typed interpretation of the Messages SSE event stream.

use eventsource_stream::Event;
use serde::Deserialize;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, FrameDisposition};
use sluice_core::types::Usage;

#[derive(Debug, Deserialize)]
struct StreamEvent {
    r#type: String,
    #[serde(default)]
    message: Option<MessageStart>,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    content_block: Option<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Default)]
pub struct AnthropicConverter {
    message_id: Option<String>,
    usage: Usage,
    saw_usage: bool,
    tool_calls: Vec<String>,
}

impl AnthropicConverter {
    fn record_usage(&mut self, wire: WireUsage) {
        self.saw_usage = true;
        self.usage.merge(&Usage {
            prompt_tokens: wire.input_tokens,
            completion_tokens: wire.output_tokens,
            total_tokens: 0,
        });
    }
}

impl FrameConverter for AnthropicConverter {
    fn on_frame(&mut self, event: &Event) -> Result<FrameDisposition, GatewayError> {
        let ev: StreamEvent = serde_json::from_str(&event.data)
            .map_err(|e| GatewayError::Parse(format!("anthropic stream event: {e}")))?;

        match ev.r#type.as_str() {
            "message_start" => {
                if let Some(message) = ev.message {
                    self.message_id = message.id;
                    if let Some(usage) = message.usage {
                        self.record_usage(usage);
                    }
                }
                Ok(FrameDisposition::Skip)
            }
            "content_block_start" => {
                if let Some(block) = ev.content_block {
                    if block.r#type == "tool_use" {
                        if let Some(name) = block.name {
                            self.tool_calls.push(name);
                        }
                    }
                }
                Ok(FrameDisposition::Skip)
            }
            "content_block_delta" => match ev.delta {
                Some(EventDelta {
                    r#type: Some(ref t),
                    text: Some(text),
                }) if t == "text_delta" && !text.is_empty() => {
                    Ok(FrameDisposition::Delta(text))
                }
                // thinking_delta / input_json_delta / signature_delta
                _ => Ok(FrameDisposition::Skip),
            },
            "message_delta" => {
                if let Some(usage) = ev.usage {
                    self.record_usage(usage);
                }
                Ok(FrameDisposition::Skip)
            }
            "message_stop" => Ok(FrameDisposition::Done),
            "error" => {
                let detail = ev
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".into());
                Err(GatewayError::Stream(format!("upstream error event: {detail}")))
            }
            // ping, content_block_stop and anything future-shaped
            _ => Ok(FrameDisposition::Skip),
        }
    }

    fn text_from_body(&self, body: &serde_json::Value) -> Option<String> {
        let blocks = body.get("content")?.as_array()?;
        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        (!text.is_empty()).then_some(text)
    }

    fn usage(&self) -> Option<Usage> {
        self.saw_usage.then(|| self.usage.clone())
    }

    fn tool_calls(&self) -> Vec<String> {
        self.tool_calls.clone()
    }

    fn upstream_request_id(&self) -> Option<String> {
        self.message_id.clone()
    }
}
