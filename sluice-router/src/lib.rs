//! Model and endpoint resolution
//!
//! Turns an abstract model key into a concrete [`Route`]: which endpoint to
//! call, which vendor model to name, and which credential to present. Model
//! mappings come from an external [`MappingStore`] collaborator and are
//! consumed read-only.
//!
//! A key can be composite (`scope:key`, resolved directly against that
//! scope; a "mapping hit") or plain (scanned through the scopes from most to
//! least specific, falling back to the key itself as a literal vendor model
//! name).

use serde::Deserialize;
use sluice_core::error::GatewayError;
use sluice_core::types::{EndpointConfig, Route};

/// Mapping scopes, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingScope {
    User,
    Workspace,
    Global,
}

/// Scan order for plain (non-composite) keys.
pub const SCOPE_PRIORITY: &[MappingScope] =
    &[MappingScope::User, MappingScope::Workspace, MappingScope::Global];

impl MappingScope {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "workspace" => Some(Self::Workspace),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// One model mapping entry from the external configuration collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMapping {
    pub scope: MappingScope,
    pub key: String,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Ordered candidate vendor model names.
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Soft endpoint hint; ignored when that endpoint cannot serve the
    /// resolved model.
    #[serde(default)]
    pub preferred_endpoint: Option<String>,
    /// When set, endpoints carrying this tier label are preferred.
    #[serde(default)]
    pub required_tier: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Read-only mapping lookup, implemented by the configuration collaborator.
pub trait MappingStore: Send + Sync {
    fn lookup(&self, scope: MappingScope, key: &str) -> Option<ModelMapping>;
}

/// In-memory store, used by the daemon's static config and by tests.
#[derive(Default)]
pub struct StaticMappingStore {
    mappings: Vec<ModelMapping>,
}

impl StaticMappingStore {
    pub fn new(mappings: Vec<ModelMapping>) -> Self {
        Self { mappings }
    }
}

impl MappingStore for StaticMappingStore {
    fn lookup(&self, scope: MappingScope, key: &str) -> Option<ModelMapping> {
        self.mappings
            .iter()
            .find(|m| m.scope == scope && m.key == key)
            .cloned()
    }
}

/// Routing behavior knobs from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingPolicy {
    /// Vendor model names never selected from mapping candidate lists.
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Fail with `NoEndpointForMappedModel` instead of falling back to the
    /// default endpoint when a mapped model has no supporting endpoint.
    #[serde(default)]
    pub strict: bool,
}

pub struct Router<S> {
    store: S,
    policy: RoutingPolicy,
}

struct ResolvedModel {
    model: String,
    mapping_hit: bool,
    preferred_endpoint: Option<String>,
    required_tier: Option<String>,
    from_mapping: bool,
    routable: bool,
}

impl<S: MappingStore> Router<S> {
    pub fn new(store: S, policy: RoutingPolicy) -> Self {
        Self { store, policy }
    }

    /// Resolve `model_key` against `endpoints`, optionally pinning
    /// `override_endpoint`.
    pub fn resolve(
        &self,
        endpoints: &[EndpointConfig],
        model_key: &str,
        override_endpoint: Option<&str>,
    ) -> Result<Route, GatewayError> {
        let eligible: Vec<&EndpointConfig> = endpoints.iter().filter(|e| e.active).collect();
        if eligible.is_empty() {
            return Err(GatewayError::NoActiveEndpoint);
        }

        let resolved = self.resolve_model(model_key, &eligible);
        if self.policy.strict && resolved.from_mapping && !resolved.routable {
            return Err(GatewayError::NoEndpointForMappedModel(resolved.model));
        }

        let endpoint = self.pick_endpoint(&eligible, &resolved, override_endpoint)?;
        tracing::debug!(
            model_key,
            resolved_model = %resolved.model,
            endpoint = %endpoint.id,
            mapping_hit = resolved.mapping_hit,
            "route resolved"
        );
        Ok(Route {
            credential: endpoint.api_key.clone(),
            provider: endpoint.provider.clone(),
            resolved_model: resolved.model,
            mapping_hit: resolved.mapping_hit,
            endpoint: endpoint.clone(),
        })
    }

    fn resolve_model(&self, model_key: &str, eligible: &[&EndpointConfig]) -> ResolvedModel {
        // Composite `scope:key` resolves directly.
        if let Some((scope_str, key)) = model_key.split_once(':') {
            if let Some(scope) = MappingScope::parse(scope_str) {
                if let Some(mapping) = self.store.lookup(scope, key).filter(|m| m.active) {
                    return self.from_mapping(&mapping, eligible, true);
                }
            }
        }

        // Plain key: scope-priority scan.
        for &scope in SCOPE_PRIORITY {
            if let Some(mapping) = self.store.lookup(scope, model_key).filter(|m| m.active) {
                return self.from_mapping(&mapping, eligible, false);
            }
        }

        // No mapping anywhere: the key is taken as a literal vendor model.
        let routable = eligible.iter().any(|e| e.supports_model(model_key));
        ResolvedModel {
            model: model_key.to_string(),
            mapping_hit: false,
            preferred_endpoint: None,
            required_tier: None,
            from_mapping: false,
            routable,
        }
    }

    fn from_mapping(
        &self,
        mapping: &ModelMapping,
        eligible: &[&EndpointConfig],
        mapping_hit: bool,
    ) -> ResolvedModel {
        let usable = |name: &str| !self.blocked(name) && !is_embedding_model(name);
        let routable_on = |name: &str| {
            eligible.iter().any(|e| {
                e.supports_model(name)
                    && mapping
                        .required_tier
                        .as_ref()
                        .map(|t| e.tier.as_ref() == Some(t))
                        .unwrap_or(true)
            })
        };

        // The mapping's own default wins when it survives filtering and some
        // endpoint can serve it; otherwise the first routable candidate.
        let default = mapping
            .default_model
            .as_deref()
            .filter(|m| usable(m) && routable_on(m));
        let chosen = default.or_else(|| {
            mapping
                .candidates
                .iter()
                .map(String::as_str)
                .find(|m| usable(m) && routable_on(m))
        });

        match chosen {
            Some(model) => ResolvedModel {
                model: model.to_string(),
                mapping_hit,
                preferred_endpoint: mapping.preferred_endpoint.clone(),
                required_tier: mapping.required_tier.clone(),
                from_mapping: true,
                routable: true,
            },
            None => {
                // Nothing routable: keep the mapping's nominal choice so the
                // caller can still fall back to the default endpoint (or fail
                // under strict routing).
                let nominal = mapping
                    .default_model
                    .clone()
                    .or_else(|| mapping.candidates.iter().find(|m| usable(m)).cloned())
                    .or_else(|| mapping.candidates.first().cloned())
                    .unwrap_or_else(|| mapping.key.clone());
                ResolvedModel {
                    model: nominal,
                    mapping_hit,
                    preferred_endpoint: mapping.preferred_endpoint.clone(),
                    required_tier: mapping.required_tier.clone(),
                    from_mapping: true,
                    routable: false,
                }
            }
        }
    }

    fn pick_endpoint<'a>(
        &self,
        eligible: &[&'a EndpointConfig],
        resolved: &ResolvedModel,
        override_endpoint: Option<&str>,
    ) -> Result<&'a EndpointConfig, GatewayError> {
        // An explicit override is authoritative; it only fails when it does
        // not exist, or when its own allowlist excludes a model that was not
        // softly mapped.
        if let Some(id) = override_endpoint {
            let Some(endpoint) = eligible.iter().find(|e| e.id == id) else {
                return Err(GatewayError::EndpointNotFound(id.to_string()));
            };
            if let Some(models) = &endpoint.models {
                if !models.iter().any(|m| m == &resolved.model) && !resolved.from_mapping {
                    return Err(GatewayError::ModelNotSupportedByEndpoint {
                        endpoint: id.to_string(),
                        model: resolved.model.clone(),
                    });
                }
            }
            return Ok(endpoint);
        }

        let tier_ok = |e: &EndpointConfig| {
            resolved
                .required_tier
                .as_ref()
                .map(|t| e.tier.as_ref() == Some(t))
                .unwrap_or(true)
        };

        // Soft mapping hint, honored only when that endpoint can serve the
        // resolved model.
        if let Some(hint) = &resolved.preferred_endpoint {
            if let Some(endpoint) = eligible
                .iter()
                .find(|e| &e.id == hint && e.supports_model(&resolved.model))
            {
                return Ok(endpoint);
            }
        }

        if let Some(endpoint) = eligible
            .iter()
            .find(|e| e.supports_model(&resolved.model) && tier_ok(e))
        {
            return Ok(endpoint);
        }
        // Tier preference is soft: retry the support scan without it.
        if let Some(endpoint) = eligible.iter().find(|e| e.supports_model(&resolved.model)) {
            return Ok(endpoint);
        }

        // Last resort: the default-flagged endpoint, which may end up
        // serving its own advertised model instead of the requested one.
        eligible
            .iter()
            .find(|e| e.is_default)
            .copied()
            .ok_or(GatewayError::NoActiveEndpoint)
    }

    fn blocked(&self, model: &str) -> bool {
        self.policy.blocklist.iter().any(|b| b == model)
    }
}

/// Embedding-only models never satisfy a chat mapping.
fn is_embedding_model(name: &str) -> bool {
    name.to_ascii_lowercase().contains("embed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn endpoint(id: &str, provider: &str, models: Option<Vec<&str>>) -> EndpointConfig {
        EndpointConfig {
            id: id.into(),
            provider: provider.into(),
            base_url: format!("https://{id}.example.com/v1"),
            api_key: Some(SecretString::from("k")),
            timeout_secs: 120,
            models: models.map(|m| m.into_iter().map(String::from).collect()),
            default_model: None,
            active: true,
            is_default: false,
            tier: None,
        }
    }

    fn mapping(scope: MappingScope, key: &str, default: &str, candidates: &[&str]) -> ModelMapping {
        ModelMapping {
            scope,
            key: key.into(),
            default_model: Some(default.into()),
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
            active: true,
            preferred_endpoint: None,
            required_tier: None,
        }
    }

    fn router(mappings: Vec<ModelMapping>, policy: RoutingPolicy) -> Router<StaticMappingStore> {
        Router::new(StaticMappingStore::new(mappings), policy)
    }

    #[test]
    fn no_active_endpoint() {
        let r = router(vec![], RoutingPolicy::default());
        let mut ep = endpoint("e1", "openai", None);
        ep.active = false;
        let err = r.resolve(&[ep], "gpt-4o", None).unwrap_err();
        assert!(matches!(err, GatewayError::NoActiveEndpoint));
    }

    #[test]
    fn plain_key_without_mapping_is_literal_model() {
        let r = router(vec![], RoutingPolicy::default());
        let eps = [
            endpoint("e1", "anthropic", Some(vec!["claude-sonnet-4"])),
            endpoint("e2", "openai", Some(vec!["gpt-4o"])),
        ];
        let route = r.resolve(&eps, "gpt-4o", None).unwrap();
        assert_eq!(route.endpoint.id, "e2");
        assert_eq!(route.resolved_model, "gpt-4o");
        assert!(!route.mapping_hit);
    }

    #[test]
    fn composite_key_is_mapping_hit() {
        let r = router(
            vec![mapping(MappingScope::Workspace, "research", "gpt-4o", &["gpt-4o"])],
            RoutingPolicy::default(),
        );
        let eps = [endpoint("e1", "openai", Some(vec!["gpt-4o"]))];
        let route = r.resolve(&eps, "workspace:research", None).unwrap();
        assert!(route.mapping_hit);
        assert_eq!(route.resolved_model, "gpt-4o");
    }

    #[test]
    fn scope_scan_prefers_most_specific() {
        let r = router(
            vec![
                mapping(MappingScope::Global, "chat", "gpt-4o", &["gpt-4o"]),
                mapping(MappingScope::User, "chat", "claude-sonnet-4", &["claude-sonnet-4"]),
            ],
            RoutingPolicy::default(),
        );
        let eps = [
            endpoint("e1", "openai", Some(vec!["gpt-4o"])),
            endpoint("e2", "anthropic", Some(vec!["claude-sonnet-4"])),
        ];
        let route = r.resolve(&eps, "chat", None).unwrap();
        assert_eq!(route.resolved_model, "claude-sonnet-4");
        assert!(!route.mapping_hit); // scanned, not composite
    }

    #[test]
    fn blocklisted_default_falls_to_later_candidate() {
        // The mapping's default is blocklisted; the embedding candidate is
        // heuristically excluded; the router lands on the later chat model.
        let r = router(
            vec![mapping(
                MappingScope::Global,
                "research",
                "banned-model",
                &["banned-model", "text-embedding-3-small", "gpt-4o-mini"],
            )],
            RoutingPolicy {
                blocklist: vec!["banned-model".into()],
                strict: false,
            },
        );
        let eps = [endpoint(
            "e1",
            "openai",
            Some(vec!["banned-model", "text-embedding-3-small", "gpt-4o-mini"]),
        )];
        let route = r.resolve(&eps, "global:research", None).unwrap();
        assert_eq!(route.resolved_model, "gpt-4o-mini");
        assert!(route.mapping_hit);
    }

    #[test]
    fn override_endpoint_must_exist() {
        let r = router(vec![], RoutingPolicy::default());
        let eps = [endpoint("e1", "openai", Some(vec!["gpt-4o"]))];
        let err = r.resolve(&eps, "gpt-4o", Some("nope")).unwrap_err();
        assert!(matches!(err, GatewayError::EndpointNotFound(id) if id == "nope"));
    }

    #[test]
    fn override_allowlist_rejects_unmapped_model() {
        let r = router(vec![], RoutingPolicy::default());
        let eps = [
            endpoint("e1", "openai", Some(vec!["gpt-4o"])),
            endpoint("e2", "anthropic", Some(vec!["claude-sonnet-4"])),
        ];
        let err = r.resolve(&eps, "gpt-4o", Some("e2")).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ModelNotSupportedByEndpoint { endpoint, .. } if endpoint == "e2"
        ));
    }

    #[test]
    fn override_allowlist_tolerated_for_mapped_model() {
        let r = router(
            vec![mapping(MappingScope::Global, "chat", "gpt-4o", &["gpt-4o"])],
            RoutingPolicy::default(),
        );
        let eps = [
            endpoint("e1", "openai", Some(vec!["gpt-4o"])),
            endpoint("e2", "anthropic", Some(vec!["claude-sonnet-4"])),
        ];
        // Softly mapped: the pinned endpoint is honored even though its
        // allowlist excludes the resolved model.
        let route = r.resolve(&eps, "global:chat", Some("e2")).unwrap();
        assert_eq!(route.endpoint.id, "e2");
    }

    #[test]
    fn preferred_endpoint_hint_is_soft() {
        let mut m = mapping(MappingScope::Global, "chat", "gpt-4o", &["gpt-4o"]);
        m.preferred_endpoint = Some("e2".into());
        let r = router(vec![m], RoutingPolicy::default());
        let eps = [
            endpoint("e1", "openai", Some(vec!["gpt-4o"])),
            endpoint("e2", "anthropic", Some(vec!["claude-sonnet-4"])),
        ];
        // e2 cannot serve gpt-4o, so the hint is ignored.
        let route = r.resolve(&eps, "global:chat", None).unwrap();
        assert_eq!(route.endpoint.id, "e1");
    }

    #[test]
    fn default_endpoint_is_last_resort() {
        let r = router(vec![], RoutingPolicy::default());
        let mut fallback = endpoint("e1", "ollama", Some(vec!["llama3.2"]));
        fallback.is_default = true;
        let route = r.resolve(&[fallback], "unknown-model", None).unwrap();
        assert_eq!(route.endpoint.id, "e1");
        assert_eq!(route.resolved_model, "unknown-model");
    }

    #[test]
    fn strict_routing_fails_unroutable_mapping() {
        let r = router(
            vec![mapping(MappingScope::Global, "chat", "gpt-4o", &["gpt-4o"])],
            RoutingPolicy {
                blocklist: vec![],
                strict: true,
            },
        );
        let mut fallback = endpoint("e1", "ollama", Some(vec!["llama3.2"]));
        fallback.is_default = true;
        let err = r.resolve(&[fallback], "global:chat", None).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::NoEndpointForMappedModel(m) if m == "gpt-4o"
        ));
    }

    #[test]
    fn required_tier_prefers_matching_endpoint() {
        let mut m = mapping(MappingScope::Global, "chat", "gpt-4o", &["gpt-4o"]);
        m.required_tier = Some("premium".into());
        let r = router(vec![m], RoutingPolicy::default());
        let mut e1 = endpoint("e1", "openai", Some(vec!["gpt-4o"]));
        e1.tier = Some("basic".into());
        let mut e2 = endpoint("e2", "openai", Some(vec!["gpt-4o"]));
        e2.tier = Some("premium".into());
        let route = r.resolve(&[e1, e2], "global:chat", None).unwrap();
        assert_eq!(route.endpoint.id, "e2");
    }
}
