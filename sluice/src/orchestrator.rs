//! Conversation orchestrator
//!
//! Drives one conversation turn end to end: prompt assembly → route
//! resolution → adapter streaming → reply finalization → exactly one
//! terminal event. All progress flows through the broker; this module never
//! touches the outbound queue directly.

use crate::registry::dialect_for;
use sluice_core::broker::ChannelBroker;
use sluice_core::error::GatewayError;
use sluice_core::events::SessionEvent;
use sluice_core::execute::{run_stream, AdapterEvent, StreamOptions, StreamOutcome};
use sluice_core::grammar::finalize_document;
use sluice_core::sanitize::{sanitize_chunk, sanitize_flush, SanitizeState};
use sluice_core::types::{ChatMessage, ChatRequest, OutputMode, Route};
use sluice_router::{Router, StaticMappingStore};
use std::sync::Arc;

/// Supplies leading messages (active system prompt, tool-schema notes)
/// injected before the client's history. Content is owned by the external
/// prompt collaborator; the orchestrator only transports it.
pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, request: &ChatRequest) -> Vec<ChatMessage>;
}

/// Default assembler: injects nothing.
pub struct NoopAssembler;

impl PromptAssembler for NoopAssembler {
    fn assemble(&self, _request: &ChatRequest) -> Vec<ChatMessage> {
        Vec::new()
    }
}

pub struct Orchestrator {
    broker: Arc<ChannelBroker>,
    router: Router<StaticMappingStore>,
    endpoints: Vec<sluice_core::types::EndpointConfig>,
    assembler: Box<dyn PromptAssembler>,
    client: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<ChannelBroker>,
        router: Router<StaticMappingStore>,
        endpoints: Vec<sluice_core::types::EndpointConfig>,
        assembler: Box<dyn PromptAssembler>,
    ) -> Self {
        Self {
            broker,
            router,
            endpoints,
            assembler,
            client: reqwest::Client::new(),
        }
    }

    /// Run one conversation turn against an already-open session. Always
    /// leaves the session with exactly one terminal event.
    pub async fn run(&self, session_id: &str, mut request: ChatRequest) {
        if let Err(error) = self.drive(session_id, &mut request).await {
            tracing::warn!(session = session_id, code = error.code(), %error, "conversation failed");
            let _ = self.broker.publish(
                session_id,
                SessionEvent::error(error.code(), error.to_string()),
            );
        }
    }

    async fn drive(
        &self,
        session_id: &str,
        request: &mut ChatRequest,
    ) -> Result<(), GatewayError> {
        let leading = self.assembler.assemble(request);
        if !leading.is_empty() {
            let mut messages = leading;
            messages.append(&mut request.messages);
            request.messages = messages;
        }

        let route =
            self.router
                .resolve(&self.endpoints, &request.model, request.endpoint.as_deref())?;
        self.broker.publish(
            session_id,
            SessionEvent::routed(&route.provider, &route.resolved_model, &route.endpoint.id, None),
        )?;

        let dialect = dialect_for(&route.provider).ok_or_else(|| {
            GatewayError::Config(format!("unknown provider dialect '{}'", route.provider))
        })?;
        self.broker
            .publish(session_id, SessionEvent::status("generating"))?;

        // Raw echo only matters when the client may end up consuming raw
        // frames; pure structured sessions drop them at the broker anyway.
        let opts = match request.output_mode {
            OutputMode::StructuredText => StreamOptions::default(),
            OutputMode::RawPassthrough | OutputMode::Auto => StreamOptions::raw_echo(),
        };

        let broker = Arc::clone(&self.broker);
        let sid = session_id.to_string();
        let dialect_name = dialect.name();
        let emit = move |event: AdapterEvent| {
            let result = match event {
                AdapterEvent::ContentDelta(delta) => {
                    broker.publish(&sid, SessionEvent::content_delta(delta))
                }
                AdapterEvent::UpstreamRaw { upstream_event, raw } => broker.publish(
                    &sid,
                    SessionEvent::upstream_raw(dialect_name, upstream_event, raw),
                ),
            };
            if let Err(error) = result {
                tracing::warn!(code = error.code(), %error, "emit failed");
            }
        };

        let outcome = run_stream(
            &self.client,
            dialect.as_ref(),
            &route,
            request,
            &opts,
            &emit,
        )
        .await?;

        self.complete(session_id, &route, outcome)
    }

    fn complete(
        &self,
        session_id: &str,
        route: &Route,
        outcome: StreamOutcome,
    ) -> Result<(), GatewayError> {
        let mode = self.broker.finalize_mode(session_id)?;
        let reply = match mode {
            OutputMode::StructuredText => finalize_reply(&outcome.text),
            _ => outcome.text.clone(),
        };

        if let Some(usage) = &outcome.usage {
            tracing::info!(
                session = session_id,
                provider = %route.provider,
                model = %route.resolved_model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "usage"
            );
        }
        if !outcome.tool_calls.is_empty() {
            tracing::debug!(
                session = session_id,
                tools = ?outcome.tool_calls,
                "upstream requested tool calls (not executed)"
            );
        }

        self.broker.publish(
            session_id,
            SessionEvent::Completed {
                reply_len: reply.chars().count(),
                reply,
                result_mode_effective: mode.as_str().into(),
                provider: route.provider.clone(),
                resolved_model: route.resolved_model.clone(),
                endpoint_id: route.endpoint.id.clone(),
                upstream_request_id: outcome.upstream_request_id,
            },
        )
    }
}

/// Assemble the canonical structured reply: the same sanitizer pass the
/// streamed deltas went through (chunk-boundary insensitive, so one whole
/// pass is equivalent), plus trailer normalization.
fn finalize_reply(text: &str) -> String {
    let mut state = SanitizeState::new();
    let mut doc = sanitize_chunk(&mut state, text);
    doc.push_str(&sanitize_flush(&mut state));
    finalize_document(&doc)
}
