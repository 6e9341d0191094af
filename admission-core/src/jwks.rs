//! JWKS/OpenID key supply and caching.
//!
//! `HttpJwksSupplier` resolves an issuer to a key document (a pre-configured
//! JWKS URL, or OpenID Connect discovery) and normalizes it, whether it is
//! shaped as a JWKS `{ "keys": [...] }` document or a map of key id ->
//! PEM-encoded X.509 certificate. `CachingJwksSupplier` decorates any
//! `JwksSupplier` with a per-issuer 5 minute memoization and a per-issuer
//! fetch lock, generalizing `common-auth::jwks::JwksFetcher`'s single-issuer
//! fetch to a multi-issuer, discovery-capable shape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Duration;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use x509_parser::prelude::*;

use crate::cache::AggregatingCache;
use crate::clock::Clock;
use crate::config::AuthProvider;
use crate::error::{CoreError, CoreResult};

/// Public key material for one JWK, normalized to the two key types this
/// core needs to verify: RSA and EC. Components are base64url (no padding)
/// strings, matching the JWKS wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Rsa { n: String, e: String },
    Ec { crv: String, x: String, y: String },
}

#[derive(Debug, Clone)]
pub struct Jwk {
    pub key_id: Option<String>,
    pub algorithm: Option<String>,
    pub material: KeyMaterial,
}

#[derive(Debug, Clone, Default)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Candidate keys for a JWS header: matches on key id when the header
    /// carries one, and (when present) on algorithm. A JWKS with a single
    /// untagged key is always offered as a candidate.
    pub fn candidates(&self, kid: Option<&str>, alg: &str) -> Vec<&Jwk> {
        let by_kid: Vec<&Jwk> = match kid {
            Some(kid) => self
                .keys
                .iter()
                .filter(|k| k.key_id.as_deref() == Some(kid))
                .collect(),
            None => self.keys.iter().collect(),
        };
        let matching_alg: Vec<&Jwk> = by_kid
            .iter()
            .copied()
            .filter(|k| k.algorithm.as_deref().map(|a| a == alg).unwrap_or(true))
            .collect();
        if matching_alg.is_empty() {
            by_kid
        } else {
            matching_alg
        }
    }
}

/// Resolves an issuer to its current `Jwks`. Implementors perform the
/// (blocking) network fetch; callers are expected to layer caching
/// on top via `CachingJwksSupplier`.
#[async_trait]
pub trait JwksSupplier: Send + Sync {
    async fn fetch(&self, provider: &AuthProvider) -> CoreResult<Jwks>;
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<RawJwk>,
}

#[derive(Debug, Deserialize)]
struct RawJwk {
    kid: Option<String>,
    kty: String,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

impl TryFrom<RawJwk> for Jwk {
    type Error = CoreError;

    fn try_from(raw: RawJwk) -> CoreResult<Self> {
        let material = match raw.kty.as_str() {
            "RSA" => KeyMaterial::Rsa {
                n: raw
                    .n
                    .ok_or_else(|| CoreError::unauthenticated("JWKS RSA key missing modulus"))?,
                e: raw
                    .e
                    .ok_or_else(|| CoreError::unauthenticated("JWKS RSA key missing exponent"))?,
            },
            "EC" => KeyMaterial::Ec {
                crv: raw
                    .crv
                    .ok_or_else(|| CoreError::unauthenticated("JWKS EC key missing curve"))?,
                x: raw
                    .x
                    .ok_or_else(|| CoreError::unauthenticated("JWKS EC key missing x"))?,
                y: raw
                    .y
                    .ok_or_else(|| CoreError::unauthenticated("JWKS EC key missing y"))?,
            },
            other => {
                return Err(CoreError::unauthenticated(format!(
                    "unsupported JWKS key type: {other}"
                )))
            }
        };
        Ok(Jwk {
            key_id: raw.kid,
            algorithm: raw.alg,
            material,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

/// HTTP-backed supplier: pre-configured JWKS URL, OpenID discovery fallback,
/// and normalization of either a JWKS document or a raw cert map into a
/// uniform set of verification keys.
pub struct HttpJwksSupplier {
    client: reqwest::Client,
    discovered: StdMutex<HashMap<String, DiscoveryState>>,
}

#[derive(Clone)]
enum DiscoveryState {
    Discovered(String),
    Failed,
}

impl HttpJwksSupplier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            discovered: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            discovered: StdMutex::new(HashMap::new()),
        }
    }

    /// Drops any cached discovery outcome for `issuer`, so the next fetch
    /// re-runs OpenID discovery. Callers invoke this when the service
    /// configuration is reloaded.
    pub fn invalidate_discovery(&self, issuer: &str) {
        self.discovered
            .lock()
            .expect("discovery mutex poisoned")
            .remove(issuer);
    }

    async fn resolve_url(&self, provider: &AuthProvider) -> CoreResult<String> {
        if let Some(uri) = &provider.jwks_uri {
            return Ok(uri.clone());
        }

        if !provider.discovery_enabled {
            return Err(CoreError::configuration(format!(
                "issuer '{}' has no jwks_uri and discovery is disabled",
                provider.issuer
            )));
        }

        if let Some(state) = self
            .discovered
            .lock()
            .expect("discovery mutex poisoned")
            .get(&provider.issuer)
            .cloned()
        {
            return match state {
                DiscoveryState::Discovered(url) => Ok(url),
                DiscoveryState::Failed => Err(CoreError::unauthenticated(format!(
                    "OpenID discovery previously failed for issuer '{}'",
                    provider.issuer
                ))),
            };
        }

        let discovery_url = discovery_endpoint(&provider.issuer);
        let result = self.discover(&discovery_url).await;
        let mut guard = self.discovered.lock().expect("discovery mutex poisoned");
        match &result {
            Ok(url) => {
                guard.insert(provider.issuer.clone(), DiscoveryState::Discovered(url.clone()));
            }
            Err(_) => {
                guard.insert(provider.issuer.clone(), DiscoveryState::Failed);
            }
        }
        result
    }

    async fn discover(&self, discovery_url: &str) -> CoreResult<String> {
        let response = self
            .client
            .get(discovery_url)
            .send()
            .await
            .map_err(|err| CoreError::unauthenticated(format!("OpenID discovery request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(CoreError::unauthenticated(format!(
                "OpenID discovery returned HTTP {} from {}",
                response.status(),
                discovery_url
            )));
        }
        let doc: OpenIdConfiguration = response
            .json()
            .await
            .map_err(|err| CoreError::unauthenticated(format!("OpenID discovery document invalid: {err}")))?;
        Ok(doc.jwks_uri)
    }
}

impl Default for HttpJwksSupplier {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the OpenID discovery document URL for an issuer: prefix
/// `https://` if missing, ensure exactly one trailing slash before
/// `.well-known/openid-configuration`.
fn discovery_endpoint(issuer: &str) -> String {
    let with_scheme = if issuer.starts_with("http://") || issuer.starts_with("https://") {
        issuer.to_string()
    } else {
        format!("https://{issuer}")
    };
    let base = with_scheme.trim_end_matches('/');
    format!("{base}/.well-known/openid-configuration")
}

#[async_trait]
impl JwksSupplier for HttpJwksSupplier {
    async fn fetch(&self, provider: &AuthProvider) -> CoreResult<Jwks> {
        let url = self.resolve_url(provider).await?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| CoreError::unauthenticated(format!("JWKS fetch failed: {err}")))?;
        if !response.status().is_success() {
            return Err(CoreError::unauthenticated(format!(
                "JWKS endpoint returned HTTP {} from {}",
                response.status(),
                url
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| CoreError::unauthenticated(format!("JWKS response invalid JSON: {err}")))?;

        if body.get("keys").is_some() {
            let doc: JwksDocument = serde_json::from_value(body)
                .map_err(|err| CoreError::unauthenticated(format!("malformed JWKS document: {err}")))?;
            let keys = doc
                .keys
                .into_iter()
                .map(Jwk::try_from)
                .collect::<CoreResult<Vec<_>>>()?;
            Ok(Jwks { keys })
        } else {
            let cert_map: HashMap<String, String> = serde_json::from_value(body).map_err(|err| {
                CoreError::unauthenticated(format!("JWKS response is neither a keyset nor a cert map: {err}"))
            })?;
            let mut keys = Vec::with_capacity(cert_map.len());
            for (kid, pem) in cert_map {
                keys.push(jwk_from_pem_certificate(kid, &pem)?);
            }
            Ok(Jwks { keys })
        }
    }
}

/// Parses a PEM-encoded X.509 certificate (strips the BEGIN/END guards,
/// decodes the base64 DER, extracts the public key) into a JWK carrying
/// the given key id.
fn jwk_from_pem_certificate(kid: String, pem: &str) -> CoreResult<Jwk> {
    let der_b64: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    let der = STANDARD
        .decode(der_b64)
        .map_err(|err| CoreError::unauthenticated(format!("invalid base64 in certificate '{kid}': {err}")))?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|err| CoreError::unauthenticated(format!("invalid X.509 certificate '{kid}': {err}")))?;
    let spki = cert.public_key();
    let material = match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => KeyMaterial::Rsa {
            n: URL_SAFE_NO_PAD.encode(rsa.modulus),
            e: URL_SAFE_NO_PAD.encode(rsa.exponent),
        },
        Ok(PublicKey::EC(point)) => {
            let data = point.data();
            // Uncompressed SEC1 point: 0x04 || X || Y, two equal-length halves.
            if data.first() != Some(&0x04) || data.len() % 2 == 0 {
                return Err(CoreError::unauthenticated(format!(
                    "unsupported EC point encoding for certificate '{kid}'"
                )));
            }
            let half = (data.len() - 1) / 2;
            let x = &data[1..1 + half];
            let y = &data[1 + half..];
            KeyMaterial::Ec {
                crv: "P-256".to_string(),
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            }
        }
        _ => {
            return Err(CoreError::unauthenticated(format!(
                "certificate '{kid}' uses an unsupported public key algorithm"
            )))
        }
    };
    Ok(Jwk {
        key_id: Some(kid),
        algorithm: None,
        material,
    })
}

/// Decorates any `JwksSupplier` with a per-issuer cache (5 minute TTL) and
/// a per-issuer fetch lock, so concurrent callers for the same issuer make
/// at most one upstream call on a cache miss.
pub struct CachingJwksSupplier<S> {
    inner: S,
    cache: AggregatingCache<String, Arc<Jwks>>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub const JWKS_CACHE_TTL_MILLIS: i64 = 5 * 60 * 1000;

impl<S: JwksSupplier> CachingJwksSupplier<S> {
    pub fn new(inner: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: AggregatingCache::new(10_000, Duration::milliseconds(JWKS_CACHE_TTL_MILLIS), clock),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, issuer: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock().expect("locks mutex poisoned");
        guard
            .entry(issuer.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl<S: JwksSupplier> JwksSupplier for CachingJwksSupplier<S> {
    async fn fetch(&self, provider: &AuthProvider) -> CoreResult<Jwks> {
        if let Some((jwks, _)) = self.cache.get(&provider.issuer) {
            return Ok((*jwks).clone());
        }

        let per_issuer_lock = self.lock_for(&provider.issuer);
        let _guard = per_issuer_lock.lock().await;

        // Re-check: another caller may have populated the cache while we
        // waited for the lock.
        if let Some((jwks, _)) = self.cache.get(&provider.issuer) {
            return Ok((*jwks).clone());
        }

        let jwks = self.inner.fetch(provider).await?;
        let jwks = Arc::new(jwks);
        self.cache.upsert(provider.issuer.clone(), jwks.clone());
        tracing::debug!(issuer = %provider.issuer, "fetched and cached JWKS");
        Ok((*jwks).clone())
    }
}
