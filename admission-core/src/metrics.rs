//! Prometheus-backed metrics, following `auth-service::metrics::AuthMetrics`'s
//! shape: a `Registry` plus a handful of named counters/histograms, exposed
//! through small typed methods rather than raw label arrays at every call
//! site. Wired through construction as an `Option<Arc<CoreMetrics>>` so a
//! host that doesn't care about metrics pays nothing for them.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::CoreResult;

#[derive(Clone)]
pub struct CoreMetrics {
    registry: Registry,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    stale_refreshes: IntCounterVec,
    fingerprint_latency: HistogramVec,
}

impl CoreMetrics {
    pub fn new() -> CoreResult<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounterVec::new(
            Opts::new(
                "admission_core_cache_hits_total",
                "Cache hits per aggregator",
            ),
            &["aggregator"],
        )
        .map_err(registry_error)?;
        registry
            .register(Box::new(cache_hits.clone()))
            .map_err(registry_error)?;

        let cache_misses = IntCounterVec::new(
            Opts::new(
                "admission_core_cache_misses_total",
                "Cache misses per aggregator",
            ),
            &["aggregator"],
        )
        .map_err(registry_error)?;
        registry
            .register(Box::new(cache_misses.clone()))
            .map_err(registry_error)?;

        let stale_refreshes = IntCounterVec::new(
            Opts::new(
                "admission_core_stale_refreshes_total",
                "Background refreshes triggered by a stale cache entry, per aggregator",
            ),
            &["aggregator"],
        )
        .map_err(registry_error)?;
        registry
            .register(Box::new(stale_refreshes.clone()))
            .map_err(registry_error)?;

        let fingerprint_latency = HistogramVec::new(
            HistogramOpts::new(
                "admission_core_fingerprint_seconds",
                "Latency of computing a request fingerprint",
            ),
            &["aggregator"],
        )
        .map_err(registry_error)?;
        registry
            .register(Box::new(fingerprint_latency.clone()))
            .map_err(registry_error)?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            stale_refreshes,
            fingerprint_latency,
        })
    }

    pub fn record_cache_hit(&self, aggregator: &str) {
        self.cache_hits.with_label_values(&[aggregator]).inc();
    }

    pub fn record_cache_miss(&self, aggregator: &str) {
        self.cache_misses.with_label_values(&[aggregator]).inc();
    }

    pub fn record_stale_refresh(&self, aggregator: &str) {
        self.stale_refreshes.with_label_values(&[aggregator]).inc();
    }

    pub fn observe_fingerprint_latency(&self, aggregator: &str, seconds: f64) {
        self.fingerprint_latency
            .with_label_values(&[aggregator])
            .observe(seconds);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn registry_error(err: prometheus::Error) -> crate::error::CoreError {
    crate::error::CoreError::configuration(format!("metrics registration failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_without_error() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.record_cache_hit("check");
        metrics.record_cache_miss("quota");
        metrics.record_stale_refresh("check");
        metrics.observe_fingerprint_latency("report", 0.001);
        let families = metrics.registry().gather();
        assert!(!families.is_empty());
    }
}
