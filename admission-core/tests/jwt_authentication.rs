//! End-to-end coverage of token extraction through audience acceptance:
//! a real RSA-signed JWT, a JWKS endpoint served by `httpmock`, and the
//! full `Authenticator` stack wired on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use admission_core::auth::{AuthRequest, Authenticator};
use admission_core::clock::TestClock;
use admission_core::config::{AuthPolicy, AuthProvider, ServiceDescriptor};
use admission_core::jwks::HttpJwksSupplier;
use chrono::{Duration, Utc};
use httpmock::MockServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;

fn base64url(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}

struct TestKey {
    private_pem: String,
    n: String,
    e: String,
}

fn generate_rsa_key() -> TestKey {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("rsa keygen");
    let public_key = private_key.to_public_key();
    let private_pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .expect("pkcs1 pem")
        .to_string();
    TestKey {
        private_pem,
        n: base64url(&public_key.n().to_bytes_be()),
        e: base64url(&public_key.e().to_bytes_be()),
    }
}

fn sign_jwt(key: &TestKey, kid: &str, claims: &serde_json::Value) -> String {
    let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let encoding_key = EncodingKey::from_rsa_pem(key.private_pem.as_bytes()).expect("encoding key");
    encode(&header, claims, &encoding_key).expect("sign jwt")
}

fn service_descriptor(issuer: String, provider_id: &str, jwks_uri: String) -> ServiceDescriptor {
    let provider = AuthProvider::new(issuer, provider_id).with_jwks_uri(jwks_uri);
    ServiceDescriptor {
        service_name: "orders.example.com".to_string(),
        auth_providers: vec![provider],
        ..Default::default()
    }
}

fn allow_all_policy(provider_id: &str, audiences: &[&str]) -> AuthPolicy {
    let mut accepted = HashMap::new();
    accepted.insert(
        provider_id.to_string(),
        audiences.iter().map(|a| a.to_string()).collect::<HashSet<_>>(),
    );
    AuthPolicy::new(accepted)
}

#[tokio::test]
async fn valid_token_against_preconfigured_jwks_uri_authenticates() {
    let server = MockServer::start();
    let key = generate_rsa_key();

    let jwks_mock = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{
                "kty": "RSA",
                "kid": "key-1",
                "alg": "RS256",
                "n": key.n,
                "e": key.e,
            }]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let jwks_uri = server.url("/jwks");
    let service = service_descriptor(issuer.clone(), "primary", jwks_uri);

    let now = Utc::now();
    let claims = json!({
        "iss": issuer,
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now + Duration::hours(1)).timestamp(),
        "email": "user@example.com",
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");

    let policy = allow_all_policy("primary", &["orders.example.com"]);
    let request = AuthRequest::bearer(token);
    let user_info = authenticator
        .authenticate(&request, &policy)
        .await
        .expect("authentication succeeds");

    assert_eq!(user_info.id, "user-42");
    assert_eq!(user_info.issuer, issuer);
    assert_eq!(user_info.email.as_deref(), Some("user@example.com"));
    assert!(user_info.audiences.contains("orders.example.com"));
    jwks_mock.assert_hits(1);
}

#[tokio::test]
async fn second_request_reuses_cached_jwks_without_a_second_fetch() {
    let server = MockServer::start();
    let key = generate_rsa_key();

    let jwks_mock = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(issuer.clone(), "primary", server.url("/jwks"));
    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));

    let jwks = admission_core::jwks::CachingJwksSupplier::new(HttpJwksSupplier::new(), clock.clone());
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");
    let policy = allow_all_policy("primary", &["orders.example.com"]);

    for _ in 0..3 {
        let claims = json!({
            "iss": issuer,
            "sub": "user-42",
            "aud": "orders.example.com",
            "exp": (now + Duration::hours(1)).timestamp(),
        });
        let token = sign_jwt(&key, "key-1", &claims);
        authenticator
            .authenticate(&AuthRequest::bearer(token), &policy)
            .await
            .expect("authentication succeeds");
    }

    jwks_mock.assert_hits(1);
}

#[tokio::test]
async fn token_with_disallowed_audience_is_rejected() {
    let server = MockServer::start();
    let key = generate_rsa_key();
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(issuer.clone(), "primary", server.url("/jwks"));
    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");

    let policy = allow_all_policy("primary", &["billing.example.com"]);
    let claims = json!({
        "iss": issuer,
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let result = authenticator
        .authenticate(&AuthRequest::bearer(token), &policy)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let server = MockServer::start();
    let key = generate_rsa_key();
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(issuer.clone(), "primary", server.url("/jwks"));
    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");

    let policy = allow_all_policy("primary", &["orders.example.com"]);
    let claims = json!({
        "iss": issuer,
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now - Duration::hours(1)).timestamp(),
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let result = authenticator
        .authenticate(&AuthRequest::bearer(token), &policy)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_issuer_is_rejected_before_any_jwks_fetch() {
    let server = MockServer::start();
    let key = generate_rsa_key();
    let jwks_mock = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let configured_issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(configured_issuer, "primary", server.url("/jwks"));
    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");

    let policy = allow_all_policy("primary", &["orders.example.com"]);
    let claims = json!({
        "iss": "https://attacker.example.com",
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let result = authenticator
        .authenticate(&AuthRequest::bearer(token), &policy)
        .await;
    assert!(result.is_err());
    jwks_mock.assert_hits(0);
}

#[tokio::test]
async fn token_with_no_provider_allowed_by_method_policy_is_rejected() {
    let server = MockServer::start();
    let key = generate_rsa_key();
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(issuer.clone(), "primary", server.url("/jwks"));
    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");

    // Method policy accepts a different provider entirely.
    let policy = allow_all_policy("some-other-provider", &["orders.example.com"]);
    let claims = json!({
        "iss": issuer,
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let result = authenticator
        .authenticate(&AuthRequest::bearer(token), &policy)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn openid_discovery_is_used_when_no_jwks_uri_is_configured() {
    let server = MockServer::start();
    let key = generate_rsa_key();

    let jwks_path = "/jwks.json";
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/.well-known/openid-configuration");
        then.status(200)
            .json_body(json!({ "jwks_uri": format!("{}{}", server.base_url(), jwks_path) }));
    });
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path(jwks_path);
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    // The issuer itself doubles as the discovery host: strip the scheme so
    // `discovery_endpoint` re-adds it exactly as it would for a real issuer.
    let issuer = server.base_url();
    let provider = AuthProvider::new(issuer.clone(), "primary");
    let service = ServiceDescriptor {
        service_name: "orders.example.com".to_string(),
        auth_providers: vec![provider],
        ..Default::default()
    };

    let now = Utc::now();
    let clock = Arc::new(TestClock::new(now));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");
    let policy = allow_all_policy("primary", &["orders.example.com"]);

    let claims = json!({
        "iss": issuer,
        "sub": "user-42",
        "aud": "orders.example.com",
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    let token = sign_jwt(&key, "key-1", &claims);

    let user_info = authenticator
        .authenticate(&AuthRequest::bearer(token), &policy)
        .await
        .expect("authentication via discovery succeeds");
    assert_eq!(user_info.id, "user-42");
}

#[tokio::test]
async fn missing_token_is_rejected_without_any_network_call() {
    let server = MockServer::start();
    let key = generate_rsa_key();
    let jwks_mock = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/jwks");
        then.status(200).json_body(json!({
            "keys": [{"kty": "RSA", "kid": "key-1", "alg": "RS256", "n": key.n, "e": key.e}]
        }));
    });

    let issuer = "https://issuer.example.com".to_string();
    let service = service_descriptor(issuer, "primary", server.url("/jwks"));
    let clock = Arc::new(TestClock::new(Utc::now()));
    let jwks = HttpJwksSupplier::new();
    let authenticator = Authenticator::from_service(&service, jwks, clock).expect("authenticator");
    let policy = allow_all_policy("primary", &["orders.example.com"]);

    let result = authenticator
        .authenticate(&AuthRequest::default(), &policy)
        .await;
    assert!(result.is_err());
    jwks_mock.assert_hits(0);
}
