//! Normalized session event model
//!
//! Every adapter, collaborator and the orchestrator reports progress as
//! [`SessionEvent`]s published through the broker. The enum serializes
//! payload-only (untagged); the outbound frame name comes from
//! [`SessionEvent::name`] so the SSE layer can write `event: <name>`.

use serde::Serialize;

/// Fixed terminal-close literal; the end-of-stream sentinel is this literal
/// followed by `completed` or `error`.
pub const STREAM_CLOSE: &str = "[DONE]";

/// Event name used for synthetic liveness frames. Heartbeats never consume a
/// sequence number.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Event name of the end-of-stream sentinel frame.
pub const CLOSE_EVENT: &str = "close";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionEvent {
    /// Session state transition (`accepted`, `routed`, `generating`, ...).
    Status {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
    /// Incremental structured text. `seq` is assigned by the broker at
    /// enqueue time; publishers pass 0.
    ContentDelta { delta: String, seq: u64 },
    /// Raw upstream frame echo, only seen by RawPassthrough / undecided Auto
    /// sessions. `seq` is assigned by the broker.
    UpstreamRaw {
        dialect: String,
        upstream_event: String,
        raw: String,
        seq: u64,
    },
    /// Auxiliary tool activity, produced by collaborators outside the core
    /// and passed through unmodified.
    ToolStart {
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: serde_json::Value,
    },
    /// Terminal success.
    Completed {
        reply: String,
        reply_len: usize,
        result_mode_effective: String,
        provider: String,
        resolved_model: String,
        endpoint_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        upstream_request_id: Option<String>,
    },
    /// Terminal failure.
    Error { code: String, message: String },
}

impl SessionEvent {
    /// Outbound frame name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::ContentDelta { .. } => "content_delta",
            Self::UpstreamRaw { .. } => "upstream_raw",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolResult { .. } => "tool_result",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    /// A session records at most one terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    pub fn status(state: impl Into<String>) -> Self {
        Self::Status {
            state: state.into(),
            detail: None,
        }
    }

    /// The `routed` status transition carrying the resolved target.
    pub fn routed(
        provider: &str,
        resolved_model: &str,
        endpoint_id: &str,
        upstream_request_id: Option<&str>,
    ) -> Self {
        Self::Status {
            state: "routed".into(),
            detail: Some(serde_json::json!({
                "provider": provider,
                "resolved_model": resolved_model,
                "endpoint_id": endpoint_id,
                "upstream_request_id": upstream_request_id,
            })),
        }
    }

    pub fn content_delta(delta: impl Into<String>) -> Self {
        Self::ContentDelta {
            delta: delta.into(),
            seq: 0,
        }
    }

    pub fn upstream_raw(
        dialect: impl Into<String>,
        upstream_event: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self::UpstreamRaw {
            dialect: dialect.into(),
            upstream_event: upstream_event.into(),
            raw: raw.into(),
            seq: 0,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One frame ready for the delivery layer: the SSE event name plus the JSON
/// `data` object (already enveloped with `message_id` / `request_id`).
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub name: String,
    pub data: serde_json::Value,
}

impl OutboundFrame {
    /// End-of-stream sentinel. `kind` is `"completed"` or `"error"`.
    pub fn close(kind: &str, message_id: &str, request_id: Option<&str>) -> Self {
        Self {
            name: CLOSE_EVENT.into(),
            data: serde_json::json!({
                "sentinel": format!("{STREAM_CLOSE}{kind}"),
                "message_id": message_id,
                "request_id": request_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_only_serialization() {
        let ev = SessionEvent::ContentDelta {
            delta: "hi".into(),
            seq: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v, serde_json::json!({"delta": "hi", "seq": 3}));
        assert_eq!(ev.name(), "content_delta");
    }

    #[test]
    fn terminal_detection() {
        assert!(SessionEvent::error("empty_content", "nothing").is_terminal());
        assert!(!SessionEvent::status("accepted").is_terminal());
    }

    #[test]
    fn close_sentinel_literal() {
        let f = OutboundFrame::close("completed", "m1", None);
        assert_eq!(f.name, "close");
        assert_eq!(f.data["sentinel"], "[DONE]completed");
    }
}
