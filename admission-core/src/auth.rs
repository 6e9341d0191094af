//! Authenticator: orchestrates token extraction, decoding, claim
//! checks, issuer -> provider resolution, and audience acceptance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use crate::clock::Clock;
use crate::config::{AuthPolicy, ServiceDescriptor};
use crate::error::{CoreError, CoreResult};
use crate::jwks::JwksSupplier;
use crate::jwt::JwtDecoder;

/// The subset of an incoming HTTP request the authenticator needs: the
/// `Authorization` header and the `access_token` query parameter. The HTTP
/// servlet-filter glue that populates this from a live request is out of
/// scope for this crate.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub authorization_header: Option<String>,
    pub access_token_param: Option<String>,
}

impl AuthRequest {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            authorization_header: Some(format!("Bearer {}", token.into())),
            access_token_param: None,
        }
    }

    pub fn query_param(token: impl Into<String>) -> Self {
        Self {
            authorization_header: None,
            access_token_param: Some(token.into()),
        }
    }
}

/// `{audiences, email, subject id, issuer}` produced by a successful
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub audiences: HashSet<String>,
    pub email: Option<String>,
    pub id: String,
    pub issuer: String,
}

fn bearer_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Bearer ([^ ]+)$").expect("bearer pattern compiles"))
}

/// Extracts the bearer token: `Authorization: Bearer <token>` with
/// exactly one space takes precedence over the `access_token` query
/// parameter.
fn extract_token(request: &AuthRequest) -> Option<String> {
    if let Some(header) = &request.authorization_header {
        if let Some(captures) = bearer_pattern().captures(header) {
            return Some(captures[1].to_string());
        }
    }
    request
        .access_token_param
        .as_ref()
        .filter(|token| !token.is_empty())
        .cloned()
}

/// Orchestrates the authentication steps. Built once per `Service` from
/// its descriptor; holds no per-request mutable state.
pub struct Authenticator<S> {
    service_name: String,
    issuer_to_provider_id: HashMap<String, String>,
    jwt_decoder: JwtDecoder<S>,
    clock: Arc<dyn Clock>,
}

impl<S: JwksSupplier> Authenticator<S> {
    /// Fails with a configuration error if the service's auth providers
    /// contain two entries sharing an issuer.
    pub fn from_service(
        service: &ServiceDescriptor,
        jwks: S,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let issuer_to_provider_id = service.issuer_to_provider_id()?;
        let jwt_decoder = JwtDecoder::from_service(service, jwks, clock.clone())?;
        Ok(Self {
            service_name: service.service_name.clone(),
            issuer_to_provider_id,
            jwt_decoder,
            clock,
        })
    }

    /// Runs the authentication checks in order, short-circuiting with
    /// `Unauthenticated` at the first failed check.
    pub async fn authenticate(
        &self,
        request: &AuthRequest,
        auth_policy: &AuthPolicy,
    ) -> CoreResult<UserInfo> {
        let token = extract_token(request).ok_or_else(|| CoreError::unauthenticated("no auth token"))?;

        let claims = self.jwt_decoder.decode(&token).await?;

        if claims.audience.is_empty() {
            return Err(CoreError::unauthenticated("missing audience claim"));
        }
        let subject = claims
            .subject
            .ok_or_else(|| CoreError::unauthenticated("missing subject claim"))?;
        let issuer = claims
            .issuer
            .ok_or_else(|| CoreError::unauthenticated("missing issuer claim"))?;

        let provider_id = self
            .issuer_to_provider_id
            .get(&issuer)
            .ok_or_else(|| CoreError::unauthenticated("unknown issuer"))?;

        if !auth_policy.allows_provider(provider_id) {
            return Err(CoreError::unauthenticated("provider not allowed for this method"));
        }

        let now = self.clock.now();
        let exp = claims
            .expires_at
            .ok_or_else(|| CoreError::unauthenticated("missing exp claim"))?;
        if exp <= now {
            return Err(CoreError::unauthenticated("token expired"));
        }
        if let Some(nbf) = claims.not_before {
            if nbf > now {
                return Err(CoreError::unauthenticated("token not yet valid"));
            }
        }

        let allowed_audiences = auth_policy.audiences_for(provider_id);
        let accepted = claims.audience.iter().any(|a| a == &self.service_name)
            || claims.audience.iter().any(|a| allowed_audiences.contains(a));
        if !accepted {
            return Err(CoreError::unauthenticated("Audiences not allowed"));
        }

        Ok(UserInfo {
            audiences: claims.audience.into_iter().collect(),
            email: claims.email,
            id: subject,
            issuer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_token_prefers_bearer_header() {
        let request = AuthRequest {
            authorization_header: Some("Bearer abc.def.ghi".to_string()),
            access_token_param: Some("other".to_string()),
        };
        assert_eq!(extract_token(&request), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn extract_token_rejects_multiple_spaces() {
        let request = AuthRequest {
            authorization_header: Some("Bearer  abc".to_string()),
            access_token_param: None,
        };
        assert_eq!(extract_token(&request), None);
    }

    #[test]
    fn extract_token_falls_back_to_query_param() {
        let request = AuthRequest {
            authorization_header: None,
            access_token_param: Some("qp-token".to_string()),
        };
        assert_eq!(extract_token(&request), Some("qp-token".to_string()));
    }

    #[test]
    fn extract_token_absent_when_neither_present() {
        let request = AuthRequest::default();
        assert_eq!(extract_token(&request), None);
    }
}
