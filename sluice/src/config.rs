//! Gateway configuration file (TOML).
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8787"
//! heartbeat_secs = 15
//!
//! [[endpoints]]
//! id = "openai-main"
//! provider = "openai"
//! base_url = "https://api.openai.com/v1"
//! api_key = "sk-..."
//! models = ["gpt-4o", "gpt-4o-mini"]
//!
//! [[mappings]]
//! scope = "global"
//! key = "fast-chat"
//! default_model = "gpt-4o-mini"
//! candidates = ["gpt-4o-mini", "gpt-4o"]
//!
//! [routing]
//! blocklist = []
//! strict = false
//! ```

use serde::Deserialize;
use sluice_core::chunk::DEFAULT_CHUNK_MAX_CHARS;
use sluice_core::error::GatewayError;
use sluice_core::types::EndpointConfig;
use sluice_router::{ModelMapping, RoutingPolicy};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub mappings: Vec<ModelMapping>,
    #[serde(default)]
    pub routing: RoutingPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub heartbeat_secs: u64,
    pub max_concurrent_streams: usize,
    pub chunk_max_chars: usize,
    /// Sessions never claimed by a stream reader are reaped after this age.
    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
            heartbeat_secs: 15,
            max_concurrent_streams: 256,
            chunk_max_chars: DEFAULT_CHUNK_MAX_CHARS,
            session_ttl_secs: 600,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| GatewayError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(&endpoint.id) {
                return Err(GatewayError::Config(format!(
                    "duplicate endpoint id '{}'",
                    endpoint.id
                )));
            }
            if endpoint.base_url.is_empty() {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' has an empty base_url",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }
}
