//! Caches AllocateQuota decisions and batches cost deltas for background
//! refresh. Mirrors the Check aggregator's cache/single-flight shape;
//! differs in using separate refresh/expiration intervals and in emitting
//! `QuotaMode::BestEffort` synthetic requests on flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Duration;

use crate::cache::AggregatingCache;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::operation::Importance;
use crate::operation_aggregator::OperationAggregator;
use crate::requests::{AllocateQuotaRequest, AllocateQuotaResponse, QuotaMode};
use crate::signing::sign_quota_request;

struct QuotaItemState {
    response: Mutex<AllocateQuotaResponse>,
    last_refresh_timestamp: Mutex<chrono::DateTime<chrono::Utc>>,
    pending: Mutex<OperationAggregator>,
    flushing: AtomicBool,
}

impl QuotaItemState {
    fn new(response: AllocateQuotaResponse, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            response: Mutex::new(response),
            last_refresh_timestamp: Mutex::new(now),
            pending: Mutex::new(OperationAggregator::new()),
            flushing: AtomicBool::new(false),
        }
    }
}

pub struct QuotaAggregator {
    service_name: String,
    refresh_interval: Duration,
    clock: Arc<dyn Clock>,
    cache: AggregatingCache<String, Arc<QuotaItemState>>,
}

impl QuotaAggregator {
    /// `expiration_interval_ms` is coerced to `max(expiration, refresh+1)` --
    /// a response must not expire before the background refresh it exists
    /// to precede has a chance to run, since nothing upstream of this
    /// aggregator guarantees that refresh < expiration is configured.
    pub fn new(
        service_name: impl Into<String>,
        num_entries: i64,
        refresh_interval_ms: i64,
        expiration_interval_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let refresh_interval = Duration::milliseconds(refresh_interval_ms);
        let expiration_ms = expiration_interval_ms.max(refresh_interval_ms + 1);
        Self {
            service_name: service_name.into(),
            refresh_interval,
            clock: clock.clone(),
            cache: AggregatingCache::new(num_entries, Duration::milliseconds(expiration_ms), clock),
        }
    }

    fn fingerprint(&self, req: &AllocateQuotaRequest) -> String {
        sign_quota_request(
            req.operation.consumer_id.as_deref(),
            &req.operation.operation_name,
            &req.operation.labels,
            &req.operation.metric_value_sets,
        )
    }

    /// Returns the cached allocation if not due for refresh, or `None` to
    /// signal the caller must send the request upstream.
    pub fn allocate_quota(
        &self,
        req: &AllocateQuotaRequest,
    ) -> CoreResult<Option<AllocateQuotaResponse>> {
        if req.service_name != self.service_name {
            return Err(CoreError::argument(format!(
                "allocate quota request service name '{}' does not match aggregator service '{}'",
                req.service_name, self.service_name
            )));
        }
        if req.operation.importance != Importance::Low {
            return Ok(None);
        }

        let fp = self.fingerprint(req);
        let (item, _) = match self.cache.get(&fp) {
            Some(found) => found,
            None => return Ok(None),
        };

        let now = self.clock.now();
        let last_refresh = *item
            .last_refresh_timestamp
            .lock()
            .expect("mutex poisoned");
        let needs_refresh = now - last_refresh > self.refresh_interval;
        let response = item.response.lock().expect("mutex poisoned").clone();

        if response.is_ok() {
            let mut pending = item.pending.lock().expect("mutex poisoned");
            pending.add(req.operation.clone())?;
        }

        if !needs_refresh {
            return Ok(Some(response));
        }

        match item
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                *item.last_refresh_timestamp.lock().expect("mutex poisoned") = now;
                Ok(None)
            }
            Err(_) => {
                tracing::warn!("quota refresh already in flight for this fingerprint");
                Ok(Some(response))
            }
        }
    }

    /// Records or refreshes the cached allocation for `sign(req)`.
    pub fn cache_response(
        &self,
        req: &AllocateQuotaRequest,
        resp: AllocateQuotaResponse,
    ) -> CoreResult<()> {
        if req.service_name != self.service_name {
            return Err(CoreError::argument(format!(
                "allocate quota response service name '{}' does not match aggregator service '{}'",
                req.service_name, self.service_name
            )));
        }
        let fp = self.fingerprint(req);
        let now = self.clock.now();
        let item = match self.cache.get(&fp) {
            Some((existing, _)) => existing,
            None => Arc::new(QuotaItemState::new(resp.clone(), now)),
        };
        *item.response.lock().expect("mutex poisoned") = resp;
        *item.last_refresh_timestamp.lock().expect("mutex poisoned") = now;
        item.flushing.store(false, Ordering::SeqCst);
        self.cache.upsert(fp, item);
        Ok(())
    }

    /// Drains the costs accumulated per fingerprint since the last flush
    /// into one `BEST_EFFORT` AllocateQuota request each.
    pub fn flush(&self) -> Vec<AllocateQuotaRequest> {
        let mut out = Vec::new();
        for (_, item) in self.cache.entries_snapshot() {
            self.drain_pending(&item, &mut out);
        }
        for item in self.cache.flush() {
            self.drain_pending(&item, &mut out);
        }
        out
    }

    fn drain_pending(&self, item: &Arc<QuotaItemState>, out: &mut Vec<AllocateQuotaRequest>) {
        let mut pending = item.pending.lock().expect("mutex poisoned");
        if let Some(op) = pending.take() {
            out.push(AllocateQuotaRequest {
                service_name: self.service_name.clone(),
                operation: op,
                quota_mode: QuotaMode::BestEffort,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::operation::{MetricValueKind, MetricValueSet, Operation};
    use chrono::Utc;
    use std::collections::HashMap;

    fn clock() -> Arc<TestClock> {
        Arc::new(TestClock::new(Utc::now()))
    }

    fn op_with_cost(cost: i64) -> Operation {
        Operation {
            operation_id: "1".into(),
            operation_name: "op".into(),
            consumer_id: Some("api_key:a".into()),
            start_time: Utc::now(),
            end_time: Utc::now(),
            importance: Importance::Low,
            labels: HashMap::new(),
            metric_value_sets: vec![MetricValueSet {
                metric_name: "serviceruntime.googleapis.com/quota/used".into(),
                values: vec![crate::operation::MetricValue::new(MetricValueKind::Int64(
                    cost,
                ))],
            }],
            log_entries: vec![],
        }
    }

    fn req(cost: i64) -> AllocateQuotaRequest {
        AllocateQuotaRequest {
            service_name: "svc".into(),
            operation: op_with_cost(cost),
            quota_mode: QuotaMode::Normal,
        }
    }

    #[test]
    fn miss_returns_none() {
        let agg = QuotaAggregator::new("svc", 10, 500, 2000, clock());
        assert!(agg.allocate_quota(&req(1)).unwrap().is_none());
    }

    #[test]
    fn within_refresh_window_serves_cached_response() {
        let clock = clock();
        let agg = QuotaAggregator::new("svc", 10, 500, 2000, clock.clone());
        let r = req(1);
        agg.cache_response(&r, AllocateQuotaResponse::default()).unwrap();
        let result = agg.allocate_quota(&r).unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[test]
    fn past_refresh_window_triggers_single_refresh() {
        let clock = clock();
        let agg = QuotaAggregator::new("svc", 10, 100, 2000, clock.clone());
        let r = req(1);
        agg.cache_response(&r, AllocateQuotaResponse::default()).unwrap();
        clock.advance(chrono::Duration::milliseconds(200));
        assert!(agg.allocate_quota(&r).unwrap().is_none());
        // second concurrent caller sees the cached response, not another refresh.
        assert!(agg.allocate_quota(&r).unwrap().unwrap().is_ok());
    }

    #[test]
    fn flush_sums_costs_into_one_best_effort_request() {
        let clock = clock();
        let agg = QuotaAggregator::new("svc", 10, 100, 2000, clock.clone());
        let r = req(1);
        agg.cache_response(&r, AllocateQuotaResponse::default()).unwrap();
        agg.allocate_quota(&r).unwrap();
        agg.allocate_quota(&r).unwrap();
        agg.allocate_quota(&r).unwrap();

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].quota_mode, QuotaMode::BestEffort);
        let values = &flushed[0].operation.metric_value_sets[0].values;
        assert_eq!(values[0].value, MetricValueKind::Int64(3));
    }
}
