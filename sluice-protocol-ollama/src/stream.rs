//! Line interpretation for the Ollama NDJSON stream.

use eventsource_stream::Event;
use serde::Deserialize;
use sluice_core::error::GatewayError;
use sluice_core::execute::{FrameConverter, FrameDisposition};
use sluice_core::types::Usage;

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    #[serde(default)]
    function: Option<ToolFunction>,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
}

#[derive(Default)]
pub struct OllamaConverter {
    usage: Option<Usage>,
    tool_calls: Vec<String>,
}

impl FrameConverter for OllamaConverter {
    fn on_frame(&mut self, event: &Event) -> Result<FrameDisposition, GatewayError> {
        let line: ChatLine = serde_json::from_str(&event.data)
            .map_err(|e| GatewayError::Parse(format!("ollama chat line: {e}")))?;
        if let Some(error) = line.error {
            return Err(GatewayError::Stream(format!("upstream error: {error}")));
        }

        let mut text = String::new();
        if let Some(message) = line.message {
            for call in message.tool_calls {
                if let Some(f) = call.function {
                    self.tool_calls.push(f.name);
                }
            }
            text = message.content;
        }

        if line.done {
            let prompt = line.prompt_eval_count.unwrap_or(0);
            let completion = line.eval_count.unwrap_or(0);
            if prompt > 0 || completion > 0 {
                self.usage = Some(Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                });
            }
            // The final line can still carry trailing content.
            if text.is_empty() {
                return Ok(FrameDisposition::Done);
            }
        }
        if text.is_empty() {
            Ok(FrameDisposition::Skip)
        } else {
            Ok(FrameDisposition::Delta(text))
        }
    }

    fn text_from_body(&self, body: &serde_json::Value) -> Option<String> {
        body.pointer("/message/content")
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
}
