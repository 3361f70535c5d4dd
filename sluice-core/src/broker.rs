//! Per-session event broker
//!
//! The single choke point every event passes through on its way to the
//! client. `publish` runs the content pipeline (fence strip → sanitize →
//! re-split → enqueue) for structured text, the auto-mode gate for raw
//! frames, and guarantees exactly one terminal event plus one end-of-stream
//! sentinel per session.
//!
//! Locking: the registry map takes a short single-writer lock for
//! create/lookup/remove; all other session state is behind a per-session
//! mutex touched by the one logical task driving that session.

use crate::chunk::{split_chunk, DEFAULT_CHUNK_MAX_CHARS};
use crate::error::GatewayError;
use crate::events::{OutboundFrame, SessionEvent};
use crate::sanitize::{sanitize_chunk, sanitize_flush, SanitizeState};
use crate::types::OutputMode;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

/// An undecided Auto session commits to RawPassthrough once this many raw
/// frames are buffered...
pub const AUTO_MAX_BUFFERED_FRAMES: usize = 8;
/// ...or once the buffered frames total this many characters.
pub const AUTO_MAX_BUFFERED_CHARS: usize = 2048;

/// Metadata required to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session identity, also the outbound `message_id`.
    pub id: String,
    pub owner_id: String,
    pub conversation_id: String,
    /// Correlation id, echoed as `request_id` on every frame when known.
    pub request_id: Option<String>,
    pub output_mode: OutputMode,
    /// Per-fragment character budget for outbound re-splitting.
    pub chunk_max_chars: usize,
}

impl SessionConfig {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            conversation_id: String::new(),
            request_id: None,
            output_mode: OutputMode::default(),
            chunk_max_chars: DEFAULT_CHUNK_MAX_CHARS,
        }
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = id.into();
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }
}

/// Lightweight handle returned by [`ChannelBroker::open`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
}

#[derive(Debug)]
struct BufferedRaw {
    dialect: String,
    upstream_event: String,
    raw: String,
}

struct Session {
    cfg: SessionConfig,
    created_at: DateTime<Utc>,
    resolved_mode: Option<OutputMode>,
    closed: bool,
    sentinel_sent: bool,
    terminal: Option<&'static str>,
    content_seq: u64,
    raw_seq: u64,
    saw_content: bool,
    sanitizer: SanitizeState,
    auto_buf: Vec<BufferedRaw>,
    auto_chars: usize,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    rx: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
}

impl Session {
    fn new(cfg: SessionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolved_mode = match cfg.output_mode {
            OutputMode::Auto => None,
            fixed => Some(fixed),
        };
        Self {
            cfg,
            created_at: Utc::now(),
            resolved_mode,
            closed: false,
            sentinel_sent: false,
            terminal: None,
            content_seq: 0,
            raw_seq: 0,
            saw_content: false,
            sanitizer: SanitizeState::new(),
            auto_buf: Vec::new(),
            auto_chars: 0,
            tx,
            rx: Some(rx),
        }
    }

    fn enqueue(&mut self, event: &SessionEvent) {
        let mut data = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("message_id".into(), self.cfg.id.clone().into());
            if let Some(rid) = &self.cfg.request_id {
                map.insert("request_id".into(), rid.clone().into());
            }
        }
        // A dropped receiver means the client went away; frames are simply
        // discarded, the producing task is not cancelled.
        let _ = self.tx.send(OutboundFrame {
            name: event.name().into(),
            data,
        });
    }

    fn enqueue_content(&mut self, text: &str, max: usize) {
        for part in split_chunk(text, max) {
            self.content_seq += 1;
            let seq = self.content_seq;
            self.enqueue(&SessionEvent::ContentDelta { delta: part, seq });
        }
    }

    fn enqueue_raw(&mut self, dialect: String, upstream_event: String, raw: String, max: usize) {
        for part in split_chunk(&raw, max) {
            self.raw_seq += 1;
            let seq = self.raw_seq;
            self.enqueue(&SessionEvent::UpstreamRaw {
                dialect: dialect.clone(),
                upstream_event: upstream_event.clone(),
                raw: part,
                seq,
            });
        }
    }

    fn flush_auto_buffer(&mut self) {
        let max = self.cfg.chunk_max_chars;
        for buffered in std::mem::take(&mut self.auto_buf) {
            self.enqueue_raw(buffered.dialect, buffered.upstream_event, buffered.raw, max);
        }
        self.auto_chars = 0;
    }

    fn commit_mode(&mut self, mode: OutputMode) {
        if self.resolved_mode.is_some() {
            return;
        }
        tracing::debug!(session = %self.cfg.id, mode = mode.as_str(), "auto-mode resolved");
        self.resolved_mode = Some(mode);
        match mode {
            OutputMode::RawPassthrough => self.flush_auto_buffer(),
            _ => {
                self.auto_buf.clear();
                self.auto_chars = 0;
            }
        }
    }

    /// Resolved mode when decided, else the requested mode.
    fn effective_mode(&self) -> OutputMode {
        self.resolved_mode.unwrap_or(self.cfg.output_mode)
    }
}

/// Session registry plus the publish pipeline.
#[derive(Default)]
pub struct ChannelBroker {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &str) -> Result<Arc<Mutex<Session>>, GatewayError> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))
    }

    fn lock(session: &Arc<Mutex<Session>>) -> MutexGuard<'_, Session> {
        session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a session. Fails with `DuplicateSession` if the id is live.
    pub fn open(&self, cfg: SessionConfig) -> Result<SessionHandle, GatewayError> {
        let id = cfg.id.clone();
        let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&id) {
            return Err(GatewayError::DuplicateSession(id));
        }
        map.insert(id.clone(), Arc::new(Mutex::new(Session::new(cfg))));
        Ok(SessionHandle { id })
    }

    /// The single entry point for every event produced anywhere.
    pub fn publish(&self, id: &str, event: SessionEvent) -> Result<(), GatewayError> {
        let session = self.get(id)?;
        let mut s = Self::lock(&session);
        if s.terminal.is_some() {
            tracing::warn!(session = id, event = event.name(), "event after terminal, dropped");
            return Ok(());
        }
        match event {
            SessionEvent::ContentDelta { delta, .. } => Self::publish_content(&mut s, &delta),
            SessionEvent::UpstreamRaw {
                dialect,
                upstream_event,
                raw,
                ..
            } => Self::publish_raw(&mut s, dialect, upstream_event, raw),
            ev if ev.is_terminal() => Self::publish_terminal(&mut s, ev),
            ev => s.enqueue(&ev),
        }
        Ok(())
    }

    fn publish_content(s: &mut Session, delta: &str) {
        s.saw_content = true;
        if s.cfg.output_mode == OutputMode::Auto {
            // A content increment immediately and irrevocably commits the
            // session to structured text; buffered raw frames are discarded.
            s.commit_mode(OutputMode::StructuredText);
        }
        if s.effective_mode() == OutputMode::RawPassthrough {
            return;
        }
        let cleaned = sanitize_chunk(&mut s.sanitizer, delta);
        if cleaned.is_empty() {
            return;
        }
        let max = s.cfg.chunk_max_chars;
        s.enqueue_content(&cleaned, max);
    }

    fn publish_raw(s: &mut Session, dialect: String, upstream_event: String, raw: String) {
        match s.effective_mode() {
            OutputMode::StructuredText => {}
            OutputMode::RawPassthrough => {
                let max = s.cfg.chunk_max_chars;
                s.enqueue_raw(dialect, upstream_event, raw, max);
            }
            OutputMode::Auto => {
                s.auto_chars += raw.chars().count();
                s.auto_buf.push(BufferedRaw {
                    dialect,
                    upstream_event,
                    raw,
                });
                if s.auto_buf.len() >= AUTO_MAX_BUFFERED_FRAMES
                    || s.auto_chars >= AUTO_MAX_BUFFERED_CHARS
                {
                    s.commit_mode(OutputMode::RawPassthrough);
                }
            }
        }
    }

    fn publish_terminal(s: &mut Session, event: SessionEvent) {
        Self::resolve_at_terminal(s);
        if s.effective_mode() == OutputMode::StructuredText {
            let flushed = sanitize_flush(&mut s.sanitizer);
            if !flushed.is_empty() {
                let max = s.cfg.chunk_max_chars;
                s.enqueue_content(&flushed, max);
            }
        }
        let kind = if matches!(event, SessionEvent::Error { .. }) {
            "error"
        } else {
            "completed"
        };
        s.terminal = Some(kind);
        s.enqueue(&event);
        if !s.sentinel_sent {
            s.sentinel_sent = true;
            let frame =
                OutboundFrame::close(kind, &s.cfg.id, s.cfg.request_id.as_deref());
            let _ = s.tx.send(frame);
        }
        s.closed = true;
    }

    fn resolve_at_terminal(s: &mut Session) {
        if s.resolved_mode.is_some() {
            return;
        }
        if s.saw_content {
            s.commit_mode(OutputMode::StructuredText);
        } else {
            s.commit_mode(OutputMode::RawPassthrough);
        }
    }

    /// Commit an undecided Auto session using the terminal-arrival rule and
    /// return the effective mode. The orchestrator calls this right before
    /// building the terminal event so `result_mode_effective` is accurate.
    pub fn finalize_mode(&self, id: &str) -> Result<OutputMode, GatewayError> {
        let session = self.get(id)?;
        let mut s = Self::lock(&session);
        Self::resolve_at_terminal(&mut s);
        Ok(s.effective_mode())
    }

    pub fn resolved_mode(&self, id: &str) -> Result<Option<OutputMode>, GatewayError> {
        let session = self.get(id)?;
        let s = Self::lock(&session);
        Ok(s.resolved_mode)
    }

    /// Take the outbound queue. Each session has exactly one reader.
    pub fn subscribe(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<OutboundFrame>, GatewayError> {
        let session = self.get(id)?;
        let mut s = Self::lock(&session);
        s.rx.take()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("session '{id}' already subscribed")))
    }

    /// Idempotent: marks the session closed, sends the end-of-stream
    /// sentinel exactly once, and reaps the registry entry. A subscriber
    /// still drains whatever was queued before the close.
    pub fn close(&self, id: &str) {
        let session = {
            let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            map.remove(id)
        };
        let Some(session) = session else { return };
        let mut s = Self::lock(&session);
        s.closed = true;
        if !s.sentinel_sent {
            s.sentinel_sent = true;
            let kind = s.terminal.unwrap_or("completed");
            let frame = OutboundFrame::close(kind, &s.cfg.id, s.cfg.request_id.as_deref());
            let _ = s.tx.send(frame);
        }
    }

    /// Reap sessions that were opened but never subscribed within `max_age`.
    /// Subscribed sessions are reaped by their delivery stream; this covers
    /// clients that accept a `message_id` and never come back for it.
    /// Returns how many sessions were closed.
    pub fn sweep(&self, max_age: std::time::Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let stale: Vec<String> = {
            let map = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .filter(|(_, session)| {
                    let s = Self::lock(session);
                    s.rx.is_some() && s.created_at < cutoff
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            tracing::info!(session = %id, "reaping unclaimed session");
            self.close(id);
        }
        stale.len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn structured(id: &str) -> SessionConfig {
        SessionConfig::new(id, "owner").output_mode(OutputMode::StructuredText)
    }

    #[tokio::test]
    async fn duplicate_session_rejected() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        match broker.open(structured("s1")) {
            Err(GatewayError::DuplicateSession(id)) => assert_eq!(id, "s1"),
            other => panic!("expected DuplicateSession, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn content_sequence_is_contiguous() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        for text in ["hello ", "world", "!"] {
            broker
                .publish("s1", SessionEvent::content_delta(text))
                .unwrap();
        }
        let frames = drain(&mut rx);
        let seqs: Vec<u64> = frames
            .iter()
            .filter(|f| f.name == "content_delta")
            .map(|f| f.data["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        for f in &frames {
            assert_eq!(f.data["message_id"], "s1");
        }
    }

    #[tokio::test]
    async fn auto_commits_to_structured_on_first_delta() {
        let broker = ChannelBroker::new();
        broker
            .open(SessionConfig::new("s1", "owner").output_mode(OutputMode::Auto))
            .unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        for _ in 0..3 {
            broker
                .publish("s1", SessionEvent::upstream_raw("openai", "message", "{}"))
                .unwrap();
        }
        broker
            .publish("s1", SessionEvent::content_delta("text"))
            .unwrap();

        assert_eq!(
            broker.resolved_mode("s1").unwrap(),
            Some(OutputMode::StructuredText)
        );
        let frames = drain(&mut rx);
        assert!(frames.iter().all(|f| f.name != "upstream_raw"));
        assert!(frames.iter().any(|f| f.name == "content_delta"));
    }

    #[tokio::test]
    async fn auto_commits_to_raw_at_frame_threshold_and_flushes_in_order() {
        let broker = ChannelBroker::new();
        broker
            .open(SessionConfig::new("s1", "owner").output_mode(OutputMode::Auto))
            .unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        for i in 0..10 {
            broker
                .publish(
                    "s1",
                    SessionEvent::upstream_raw("openai", "message", format!("frame-{i}")),
                )
                .unwrap();
        }
        assert_eq!(
            broker.resolved_mode("s1").unwrap(),
            Some(OutputMode::RawPassthrough)
        );
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 10);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.name, "upstream_raw");
            assert_eq!(f.data["raw"], format!("frame-{i}"));
            assert_eq!(f.data["seq"], (i + 1) as u64);
        }
    }

    #[tokio::test]
    async fn auto_commits_to_raw_at_char_threshold() {
        let broker = ChannelBroker::new();
        broker
            .open(SessionConfig::new("s1", "owner").output_mode(OutputMode::Auto))
            .unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        let big = "x".repeat(AUTO_MAX_BUFFERED_CHARS);
        broker
            .publish("s1", SessionEvent::upstream_raw("openai", "message", big))
            .unwrap();
        assert_eq!(
            broker.resolved_mode("s1").unwrap(),
            Some(OutputMode::RawPassthrough)
        );
        // Oversized raw frames get re-split like content.
        let frames = drain(&mut rx);
        assert!(frames.len() >= 2);
        let total: usize = frames
            .iter()
            .map(|f| f.data["raw"].as_str().unwrap().len())
            .sum();
        assert_eq!(total, AUTO_MAX_BUFFERED_CHARS);
    }

    #[tokio::test]
    async fn undecided_auto_resolves_to_raw_at_terminal() {
        let broker = ChannelBroker::new();
        broker
            .open(SessionConfig::new("s1", "owner").output_mode(OutputMode::Auto))
            .unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        for i in 0..3 {
            broker
                .publish(
                    "s1",
                    SessionEvent::upstream_raw("gemini", "chunk", format!("r{i}")),
                )
                .unwrap();
        }
        let mode = broker.finalize_mode("s1").unwrap();
        assert_eq!(mode, OutputMode::RawPassthrough);

        broker
            .publish(
                "s1",
                SessionEvent::Completed {
                    reply: String::new(),
                    reply_len: 0,
                    result_mode_effective: mode.as_str().into(),
                    provider: "gemini".into(),
                    resolved_model: "m".into(),
                    endpoint_id: "e".into(),
                    upstream_request_id: None,
                },
            )
            .unwrap();

        let frames = drain(&mut rx);
        let raws: Vec<_> = frames.iter().filter(|f| f.name == "upstream_raw").collect();
        assert_eq!(raws.len(), 3);
        assert_eq!(frames.last().unwrap().name, "close");
        assert_eq!(frames.last().unwrap().data["sentinel"], "[DONE]completed");
    }

    #[tokio::test]
    async fn terminal_flushes_pending_sanitizer_buffers() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        // Held back entirely as a possible marker prefix.
        broker
            .publish("s1", SessionEvent::content_delta("<thin"))
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        broker
            .publish("s1", SessionEvent::error("transport_error", "boom"))
            .unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames[0].name, "content_delta");
        assert_eq!(frames[0].data["delta"], "<thin");
        assert_eq!(frames[1].name, "error");
        assert_eq!(frames[2].name, "close");
        assert_eq!(frames[2].data["sentinel"], "[DONE]error");
    }

    #[tokio::test]
    async fn events_after_terminal_are_dropped() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        broker
            .publish("s1", SessionEvent::error("transport_error", "boom"))
            .unwrap();
        broker
            .publish("s1", SessionEvent::content_delta("late"))
            .unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2); // error + close, no late delta
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reaps() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        let mut rx = broker.subscribe("s1").unwrap();

        broker.close("s1");
        broker.close("s1");
        assert!(!broker.is_live("s1"));
        assert!(broker.subscribe("s1").is_err());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name, "close");
    }

    #[tokio::test]
    async fn sweep_reaps_only_stale_unclaimed_sessions() {
        let broker = ChannelBroker::new();
        broker.open(structured("unclaimed")).unwrap();
        broker.open(structured("claimed")).unwrap();
        let _rx = broker.subscribe("claimed").unwrap();

        // A generous age spares everything.
        assert_eq!(broker.sweep(std::time::Duration::from_secs(60)), 0);
        assert!(broker.is_live("unclaimed"));

        // Zero age: every never-subscribed session counts as stale.
        assert_eq!(broker.sweep(std::time::Duration::ZERO), 1);
        assert!(!broker.is_live("unclaimed"));
        assert!(broker.is_live("claimed"));
    }

    #[tokio::test]
    async fn raw_frames_dropped_on_structured_sessions() {
        let broker = ChannelBroker::new();
        broker.open(structured("s1")).unwrap();
        let mut rx = broker.subscribe("s1").unwrap();
        broker
            .publish("s1", SessionEvent::upstream_raw("openai", "message", "{}"))
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
