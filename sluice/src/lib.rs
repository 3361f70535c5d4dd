//! sluice — a streaming LLM gateway.
//!
//! Accepts one normalized chat request, routes it to a concrete
//! provider/model/credential, translates the provider's native streaming
//! dialect into a normalized event stream, repairs the structured output
//! while it is in flight, and delivers it as SSE frames with strict ordering
//! and exactly-once termination.

pub mod config;
pub mod http;
pub mod orchestrator;
pub mod registry;

pub use config::{GatewayConfig, ServerConfig};
pub use orchestrator::{NoopAssembler, Orchestrator, PromptAssembler};
