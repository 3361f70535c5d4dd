//! Dialect registry: provider label → adapter implementation.

use sluice_core::execute::ProviderDialect;
use sluice_protocol_anthropic::AnthropicDialect;
use sluice_protocol_gemini::GeminiDialect;
use sluice_protocol_ollama::OllamaDialect;
use sluice_protocol_openai::OpenAiDialect;

/// Labels accepted in endpoint configuration.
pub const PROVIDERS: &[&str] = &["openai", "anthropic", "gemini", "ollama"];

pub fn dialect_for(provider: &str) -> Option<Box<dyn ProviderDialect>> {
    match provider {
        "openai" => Some(Box::new(OpenAiDialect)),
        "anthropic" => Some(Box::new(AnthropicDialect)),
        "gemini" => Some(Box::new(GeminiDialect)),
        "ollama" => Some(Box::new(OllamaDialect)),
        _ => None,
    }
}
