//! Core of a request-admission and usage-reporting sidecar: a JWT
//! authenticator (JWKS/OpenID key supply and caching) plus three
//! aggregation engines -- Check, Quota, Report -- that coalesce traffic to
//! the remote Service Control API while tolerating transient failures,
//! stale cached responses, and expiring tokens.
//!
//! This crate is the core only: the HTTP filter glue that populates
//! per-request context, the Service Control transport client, the OAuth
//! bearer plumbing for calling it, and the service-config loader are all
//! external collaborators the host wires in. There are no static
//! singletons here -- every component is an explicitly constructed value,
//! composed by the caller (or by `Engine`, for convenience) rather than
//! reached for through a global.

pub mod auth;
pub mod cache;
pub mod check;
pub mod clock;
pub mod config;
pub mod distribution;
pub mod error;
pub mod jwks;
pub mod jwt;
pub mod labels;
pub mod metrics;
pub mod money;
pub mod operation;
pub mod operation_aggregator;
pub mod quota;
pub mod registry;
pub mod report;
pub mod requests;
pub mod signing;

use std::sync::Arc;

use auth::Authenticator;
use check::CheckAggregator;
use clock::{Clock, SystemClock};
use config::ServiceDescriptor;
use error::CoreResult;
use jwks::{CachingJwksSupplier, HttpJwksSupplier, JwksSupplier};
use metrics::CoreMetrics;
use quota::QuotaAggregator;
use registry::MethodRegistry;
use report::ReportAggregator;

/// Default tuning constants for the aggregation engines, expressed as
/// `Duration` defaults on builder-style constructors rather than
/// environment reads -- this is a library; the process environment
/// belongs to the host.
pub mod defaults {
    pub const CHECK_NUM_ENTRIES: i64 = 10_000;
    pub const CHECK_FLUSH_INTERVAL_MILLIS: i64 = 500;
    pub const CHECK_RESPONSE_EXPIRATION_MILLIS: i64 = 1_000;

    pub const QUOTA_NUM_ENTRIES: i64 = 10_000;
    pub const QUOTA_REFRESH_INTERVAL_MILLIS: i64 = 500;
    pub const QUOTA_EXPIRATION_INTERVAL_MILLIS: i64 = 1_000;

    pub const REPORT_NUM_ENTRIES: i64 = 10_000;
    pub const REPORT_FLUSH_INTERVAL_MILLIS: i64 = 1_000;
}

/// A caller-owned collection of every component this core provides for one
/// `Service`, wired together from a `ServiceDescriptor`. No static
/// singletons: every component is an explicitly-constructed value owned by
/// this engine and passed to request handlers by the caller.
pub struct Engine<S = CachingJwksSupplier<HttpJwksSupplier>> {
    pub service_name: String,
    pub registry: MethodRegistry,
    pub authenticator: Authenticator<S>,
    pub check: CheckAggregator,
    pub quota: QuotaAggregator,
    pub report: ReportAggregator,
    pub metrics: Option<Arc<CoreMetrics>>,
    clock: Arc<dyn Clock>,
}

impl Engine<CachingJwksSupplier<HttpJwksSupplier>> {
    /// Builds an `Engine` for `service` using the production HTTP JWKS
    /// supplier (with its 5-minute cache) and the system clock.
    pub fn from_service(service: &ServiceDescriptor) -> CoreResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jwks = CachingJwksSupplier::new(HttpJwksSupplier::new(), clock.clone());
        Self::from_service_with(service, jwks, clock, None)
    }
}

impl<S: JwksSupplier> Engine<S> {
    /// Builds an `Engine` from an arbitrary `JwksSupplier` and `Clock`,
    /// primarily so tests can inject a fake supplier and a `TestClock`.
    pub fn from_service_with(
        service: &ServiceDescriptor,
        jwks: S,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<CoreMetrics>>,
    ) -> CoreResult<Self> {
        let registry = MethodRegistry::from_service(service);
        let authenticator = Authenticator::from_service(service, jwks, clock.clone())?;

        let check = CheckAggregator::new(
            service.service_name.clone(),
            defaults::CHECK_NUM_ENTRIES,
            defaults::CHECK_FLUSH_INTERVAL_MILLIS,
            defaults::CHECK_RESPONSE_EXPIRATION_MILLIS,
            clock.clone(),
        );
        let quota = QuotaAggregator::new(
            service.service_name.clone(),
            defaults::QUOTA_NUM_ENTRIES,
            defaults::QUOTA_REFRESH_INTERVAL_MILLIS,
            defaults::QUOTA_EXPIRATION_INTERVAL_MILLIS,
            clock.clone(),
        );
        let report = ReportAggregator::new(
            service.service_name.clone(),
            defaults::REPORT_NUM_ENTRIES,
            defaults::REPORT_FLUSH_INTERVAL_MILLIS,
            clock.clone(),
        );

        Ok(Self {
            service_name: service.service_name.clone(),
            registry,
            authenticator,
            check,
            quota,
            report,
            metrics,
            clock,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
