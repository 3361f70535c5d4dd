//! Protocol frame reading
//!
//! Both upstream streaming shapes are normalized into one frame type,
//! [`eventsource_stream::Event`]: proper SSE bodies go through
//! `eventsource-stream` (blank-line flushes, `event:`/`data:` prefixes,
//! folded `data:` lines), while NDJSON bodies (Ollama) are framed line by
//! line into synthetic events with an empty event name.

use crate::error::GatewayError;
use eventsource_stream::{Event, Eventsource};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;

/// Unified frame stream consumed by the shared executor.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Event, GatewayError>> + Send>>;

/// Parse a byte stream as server-sent events.
pub fn sse_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let out = bytes
        .eventsource()
        .map(|item| item.map_err(|e| GatewayError::Stream(format!("SSE stream error: {e}"))));
    Box::pin(out)
}

/// Frame a newline-delimited JSON byte stream into synthetic events.
///
/// Each non-empty line becomes one frame with the line as `data`. A trailing
/// line without a final newline is still flushed when the stream ends.
pub fn ndjson_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let out = async_stream::stream! {
        futures_util::pin_mut!(bytes);
        let mut buf = String::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(GatewayError::Stream(format!("NDJSON stream error: {e}")));
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim();
                if !line.is_empty() {
                    yield Ok(line_event(line));
                }
            }
        }
        let rest = buf.trim();
        if !rest.is_empty() {
            yield Ok(line_event(rest));
        }
    };
    Box::pin(out)
}

fn line_event(line: &str) -> Event {
    Event {
        event: String::new(),
        data: line.to_string(),
        id: String::new(),
        retry: None,
    }
}
