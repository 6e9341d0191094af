//! JWT decoder / verifier: parses a compact JWS, selects a candidate
//! key from the issuer's JWKS, verifies the signature, and caches decoded
//! claims. Generalizes `common-auth::verifier::JwtVerifier` from "one
//! configured issuer/audience" to "issuer resolved per-token, verifier
//! selected by the authenticator".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::cache::AggregatingCache;
use crate::clock::Clock;
use crate::config::{AuthProvider, ServiceDescriptor};
use crate::error::{CoreError, CoreResult};
use crate::jwks::{JwksSupplier, KeyMaterial};

pub const CLAIMS_CACHE_CAPACITY: i64 = 200;
pub const CLAIMS_CACHE_TTL_MILLIS: i64 = 5 * 60 * 1000;

/// Application-facing view of a decoded JWT's claims. Every field is a real
/// `Option`/empty-`Vec`, never a sentinel -- presence checks belong to the
/// authenticator, not to this decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClaims {
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub audience: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub email: Option<String>,
}

impl DecodedClaims {
    fn from_value(value: &Value) -> Self {
        let issuer = value.get("iss").and_then(Value::as_str).map(str::to_string);
        let subject = value.get("sub").and_then(Value::as_str).map(str::to_string);
        let audience = match value.get("aud") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let expires_at = value
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let not_before = value
            .get("nbf")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let email = value.get("email").and_then(Value::as_str).map(str::to_string);

        Self {
            issuer,
            subject,
            audience,
            expires_at,
            not_before,
            email,
        }
    }
}

fn decoding_key_for(jwk: &crate::jwks::Jwk) -> CoreResult<DecodingKey> {
    match &jwk.material {
        KeyMaterial::Rsa { n, e } => DecodingKey::from_rsa_components(n, e)
            .map_err(|err| CoreError::unauthenticated(format!("invalid RSA JWK: {err}"))),
        KeyMaterial::Ec { x, y, .. } => DecodingKey::from_ec_components(x, y)
            .map_err(|err| CoreError::unauthenticated(format!("invalid EC JWK: {err}"))),
    }
}

fn algorithm_for_key(jwk: &crate::jwks::Jwk, header_alg: Algorithm) -> Algorithm {
    match &jwk.material {
        KeyMaterial::Rsa { .. } => header_alg,
        KeyMaterial::Ec { .. } => Algorithm::ES256,
    }
}

/// A validation with every check the decoder doesn't own disabled: exp/nbf
/// are checked by the authenticator against an injectable clock, not
/// against wall-clock time inside `jsonwebtoken`.
fn permissive_validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims.clear();
    validation.validate_aud = false;
    validation
}

/// Decodes the token's claims without verifying its signature, used only
/// to read the `iss` claim so the right issuer's JWKS can be fetched before
/// the signature is actually checked.
fn peek_claims(token: &str) -> CoreResult<Value> {
    let header = decode_header(token).map_err(|err| CoreError::unauthenticated(format!("malformed JWT header: {err}")))?;
    let mut validation = permissive_validation(header.alg);
    validation.insecure_disable_signature_validation();
    let dummy_key = DecodingKey::from_secret(&[]);
    let token_data = decode::<Value>(token, &dummy_key, &validation)
        .map_err(|err| CoreError::unauthenticated(format!("malformed JWT claims: {err}")))?;
    Ok(token_data.claims)
}

/// Wraps a `JwksSupplier` with per-issuer provider lookup and a decoded-
/// claims cache keyed by raw token (capacity 200, TTL 5 minutes, amortizing
/// signature verification for clients with sticky tokens).
pub struct JwtDecoder<S> {
    jwks: S,
    providers_by_issuer: HashMap<String, AuthProvider>,
    claims_cache: AggregatingCache<String, DecodedClaims>,
}

impl<S: JwksSupplier> JwtDecoder<S> {
    /// Builds the issuer -> provider map from a `ServiceDescriptor`.
    /// Duplicate issuers are a configuration error.
    pub fn from_service(service: &ServiceDescriptor, jwks: S, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let mut providers_by_issuer = HashMap::new();
        for provider in &service.auth_providers {
            if providers_by_issuer
                .insert(provider.issuer.clone(), provider.clone())
                .is_some()
            {
                return Err(CoreError::configuration(format!(
                    "duplicate issuer in auth provider config: {}",
                    provider.issuer
                )));
            }
        }
        Ok(Self {
            jwks,
            providers_by_issuer,
            claims_cache: AggregatingCache::new(
                CLAIMS_CACHE_CAPACITY,
                chrono::Duration::milliseconds(CLAIMS_CACHE_TTL_MILLIS),
                clock,
            ),
        })
    }

    /// Parses the compact JWS, fetches the issuer's JWKS, selects a
    /// candidate key by algorithm and (if present) key id, and succeeds on
    /// the first key whose signature verifies.
    #[tracing::instrument(skip(self, token))]
    pub async fn decode(&self, token: &str) -> CoreResult<DecodedClaims> {
        if let Some((claims, _)) = self.claims_cache.get(&token.to_string()) {
            tracing::debug!("JWT claims cache hit");
            return Ok(claims);
        }

        let header = decode_header(token).map_err(|err| CoreError::unauthenticated(format!("malformed JWT header: {err}")))?;
        let unverified = peek_claims(token)?;
        let issuer = unverified
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::unauthenticated("missing issuer claim"))?;

        let provider = self
            .providers_by_issuer
            .get(issuer)
            .ok_or_else(|| CoreError::unauthenticated(format!("unknown issuer: {issuer}")))?;

        let jwks = self.jwks.fetch(provider).await?;
        let alg_name = format!("{:?}", header.alg);
        let candidates = jwks.candidates(header.kid.as_deref(), &alg_name);
        if candidates.is_empty() {
            return Err(CoreError::unauthenticated(format!(
                "no matching JWKS key for issuer '{issuer}'"
            )));
        }

        for jwk in candidates {
            let key = match decoding_key_for(jwk) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let alg = algorithm_for_key(jwk, header.alg);
            let validation = permissive_validation(alg);
            if let Ok(token_data) = decode::<Value>(token, &key, &validation) {
                let claims = DecodedClaims::from_value(&token_data.claims);
                self.claims_cache.upsert(token.to_string(), claims.clone());
                tracing::debug!(%issuer, "verified JWT successfully");
                return Ok(claims);
            }
        }

        Err(CoreError::unauthenticated("JWT signature verification failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_claims_parses_single_and_multi_audience() {
        let single = serde_json::json!({"iss": "i", "sub": "u", "aud": "svc", "exp": 10});
        let parsed = DecodedClaims::from_value(&single);
        assert_eq!(parsed.audience, vec!["svc".to_string()]);

        let many = serde_json::json!({"iss": "i", "sub": "u", "aud": ["svc", "other"]});
        let parsed = DecodedClaims::from_value(&many);
        assert_eq!(parsed.audience, vec!["svc".to_string(), "other".to_string()]);
    }

    #[test]
    fn decoded_claims_leaves_absent_fields_as_none() {
        let value = serde_json::json!({});
        let parsed = DecodedClaims::from_value(&value);
        assert!(parsed.issuer.is_none());
        assert!(parsed.subject.is_none());
        assert!(parsed.audience.is_empty());
        assert!(parsed.expires_at.is_none());
    }
}
