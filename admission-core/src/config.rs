//! Immutable configuration for a single managed service. This is the
//! shape the (out-of-scope) service-config loader is expected to produce;
//! the core only consumes it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpVerb {
    pub fn parse(verb: &str) -> Option<Self> {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }
}

/// An authentication provider accepted by the service: an issuer, the
/// provider id used in method-level auth policies, and an optional
/// pre-configured JWKS URI (absent means OpenID discovery is used instead,
/// if `discovery_enabled`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProvider {
    pub issuer: String,
    pub provider_id: String,
    pub jwks_uri: Option<String>,
    pub discovery_enabled: bool,
}

impl AuthProvider {
    pub fn new(issuer: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            provider_id: provider_id.into(),
            jwks_uri: None,
            discovery_enabled: true,
        }
    }

    pub fn with_jwks_uri(mut self, jwks_uri: impl Into<String>) -> Self {
        self.jwks_uri = Some(jwks_uri.into());
        self
    }

    pub fn with_discovery_enabled(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }
}

/// An HTTP routing rule: binds a (verb, URL template) pair to a method
/// selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRule {
    pub selector: String,
    pub verb: HttpVerb,
    pub url_template: String,
}

/// Per-method auth policy: which providers are accepted and which
/// audiences each provider's tokens must carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// provider_id -> accepted audiences
    accepted: HashMap<String, HashSet<String>>,
}

impl AuthPolicy {
    pub fn new(accepted: HashMap<String, HashSet<String>>) -> Self {
        Self { accepted }
    }

    pub fn allows_provider(&self, provider_id: &str) -> bool {
        self.accepted.contains_key(provider_id)
    }

    pub fn audiences_for(&self, provider_id: &str) -> HashSet<String> {
        self.accepted.get(provider_id).cloned().unwrap_or_default()
    }
}

/// Per-method quota policy: cost in units per metric name.
pub type QuotaPolicy = HashMap<String, i64>;

/// A method descriptor (`Info`), derived once from the `ServiceDescriptor`
/// on load and immutable thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodInfo {
    pub selector: String,
    pub auth_policy: Option<AuthPolicy>,
    pub quota_policy: QuotaPolicy,
}

/// Reporting rule: which logs/metrics/labels a method contributes to a
/// Report request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingRule {
    pub logs: Vec<String>,
    pub metrics: Vec<String>,
    pub labels: Vec<String>,
}

/// Immutable configuration for a single managed service, as produced by the
/// (external) service-config loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub auth_providers: Vec<AuthProvider>,
    pub http_rules: Vec<HttpRule>,
    /// selector -> reporting rule
    pub reporting_rules: HashMap<String, ReportingRule>,
    /// selector -> auth policy
    pub auth_policies: HashMap<String, AuthPolicy>,
    /// selector -> quota policy
    pub quota_policies: HashMap<String, QuotaPolicy>,
}

impl ServiceDescriptor {
    /// Maps issuer -> provider id, failing if two providers share an
    /// issuer.
    pub fn issuer_to_provider_id(&self) -> Result<HashMap<String, String>, crate::error::CoreError> {
        let mut map = HashMap::new();
        for provider in &self.auth_providers {
            if map.insert(provider.issuer.clone(), provider.provider_id.clone()).is_some() {
                return Err(crate::error::CoreError::configuration(format!(
                    "duplicate issuer in auth provider config: {}",
                    provider.issuer
                )));
            }
        }
        Ok(map)
    }
}
