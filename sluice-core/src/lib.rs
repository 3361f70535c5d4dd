//! Core types and machinery for the sluice streaming gateway.
//!
//! This crate carries everything the dialect crates, the router and the
//! daemon share:
//!
//! - [`error`]: the unified [`GatewayError`](error::GatewayError) with stable
//!   wire codes
//! - [`types`]: normalized requests, endpoints, routes and usage
//! - [`events`]: the outbound session event model and close sentinel
//! - [`broker`]: per-session event queues with sequencing, auto-mode
//!   resolution and sanitizer integration
//! - [`sanitize`]: the incremental structured-output sanitizer
//! - [`grammar`]: the structured output grammar checker and document
//!   finalizer
//! - [`chunk`]: outbound fragment re-splitting
//! - [`sse`] and [`execute`]: upstream frame decoding and the shared
//!   streaming executor the dialect crates plug into

pub mod broker;
pub mod chunk;
pub mod error;
pub mod events;
pub mod execute;
pub mod grammar;
pub mod sanitize;
pub mod sse;
pub mod types;

pub use broker::{ChannelBroker, SessionConfig, AUTO_MAX_BUFFERED_CHARS, AUTO_MAX_BUFFERED_FRAMES};
pub use chunk::{split_chunk, DEFAULT_CHUNK_MAX_CHARS};
pub use error::GatewayError;
pub use events::{OutboundFrame, SessionEvent, CLOSE_EVENT, HEARTBEAT_EVENT, STREAM_CLOSE};
pub use execute::{
    run_stream, AdapterEvent, FrameConverter, FrameDisposition, ProviderDialect, StreamOptions,
    StreamOutcome, WireRequest,
};
pub use sanitize::{sanitize_chunk, sanitize_flush, SanitizeState};
pub use types::{
    ChatMessage, ChatRequest, EndpointConfig, MessageRole, OutputMode, Route, Usage,
};
