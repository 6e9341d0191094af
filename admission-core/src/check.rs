//! Suppresses duplicate Check requests and serves a cached admission
//! decision while it is fresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Duration;

use crate::cache::AggregatingCache;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::operation::Importance;
use crate::operation_aggregator::OperationAggregator;
use crate::requests::{CheckRequest, CheckResponse};
use crate::signing::sign_request;

struct CheckItemState {
    response: Mutex<CheckResponse>,
    last_check_timestamp: Mutex<chrono::DateTime<chrono::Utc>>,
    pending: Mutex<OperationAggregator>,
    flushing: AtomicBool,
}

impl CheckItemState {
    fn new(response: CheckResponse, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            response: Mutex::new(response),
            last_check_timestamp: Mutex::new(now),
            pending: Mutex::new(OperationAggregator::new()),
            flushing: AtomicBool::new(false),
        }
    }
}

pub struct CheckAggregator {
    service_name: String,
    flush_interval: Duration,
    clock: Arc<dyn Clock>,
    cache: AggregatingCache<String, Arc<CheckItemState>>,
}

impl CheckAggregator {
    /// `num_entries <= 0` disables caching. `response_expiration_ms` is
    /// coerced to `max(expiration, flush_interval_ms + 1)` so a response
    /// never expires before its own background refresh can run.
    pub fn new(
        service_name: impl Into<String>,
        num_entries: i64,
        flush_interval_ms: i64,
        response_expiration_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let flush_interval = Duration::milliseconds(flush_interval_ms);
        let expiration_ms = response_expiration_ms.max(flush_interval_ms + 1);
        Self {
            service_name: service_name.into(),
            flush_interval,
            clock: clock.clone(),
            cache: AggregatingCache::new(num_entries, Duration::milliseconds(expiration_ms), clock),
        }
    }

    fn fingerprint(&self, req: &CheckRequest) -> String {
        sign_request(
            req.operation.consumer_id.as_deref(),
            &req.operation.operation_name,
            &req.operation.labels,
            &req.operation.metric_value_sets,
        )
    }

    /// Returns the cached response if fresh, or `None` to signal the
    /// caller must send the request upstream. Requests with importance !=
    /// LOW always bypass the cache.
    pub fn check(&self, req: &CheckRequest) -> CoreResult<Option<CheckResponse>> {
        if req.service_name != self.service_name {
            return Err(CoreError::argument(format!(
                "check request service name '{}' does not match aggregator service '{}'",
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
        let last_check = *item.last_check_timestamp.lock().expect("mutex poisoned");
        let is_fresh = now - last_check < self.flush_interval;
        let response = item.response.lock().expect("mutex poisoned").clone();

        if !response.is_ok() {
            if is_fresh {
                return Ok(Some(response));
            }
            return Ok(self.begin_stale_refresh(&item, now, response));
        }

        // Clean response: always merge the caller's operation into the
        // pending aggregate, whether or not a refresh is triggered.
        {
            let mut pending = item.pending.lock().expect("mutex poisoned");
            pending.add(req.operation.clone())?;
        }

        if is_fresh {
            return Ok(Some(response));
        }
        Ok(self.begin_stale_refresh(&item, now, response))
    }

    /// Attempts to claim the single-flight refresh slot for `item`. On
    /// success, stamps `last_check_timestamp` optimistically and returns
    /// `None` so the caller sends the request upstream. On failure (someone
    /// else is already refreshing), logs and returns the stale cached
    /// response instead so at most one caller is ever asked to refresh.
    fn begin_stale_refresh(
        &self,
        item: &Arc<CheckItemState>,
        now: chrono::DateTime<chrono::Utc>,
        response: CheckResponse,
    ) -> Option<CheckResponse> {
        match item
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                *item.last_check_timestamp.lock().expect("mutex poisoned") = now;
                None
            }
            Err(_) => {
                tracing::warn!("stale Check refresh already in flight for this fingerprint");
                Some(response)
            }
        }
    }

    /// Records or refreshes the cache entry for `sign(req)`: stamps
    /// `last_check_timestamp` to now and clears the flushing flag.
    pub fn add_response(&self, req: &CheckRequest, resp: CheckResponse) -> CoreResult<()> {
        if req.service_name != self.service_name {
            return Err(CoreError::argument(format!(
                "check response service name '{}' does not match aggregator service '{}'",
                req.service_name, self.service_name
            )));
        }
        let fp = self.fingerprint(req);
        let now = self.clock.now();
        let item = match self.cache.get(&fp) {
            Some((existing, _)) => existing,
            None => Arc::new(CheckItemState::new(resp.clone(), now)),
        };
        *item.response.lock().expect("mutex poisoned") = resp;
        *item.last_check_timestamp.lock().expect("mutex poisoned") = now;
        item.flushing.store(false, Ordering::SeqCst);
        self.cache.upsert(fp, item);
        Ok(())
    }

    /// Drains aggregated operations accumulated since the last flush into
    /// synthetic Check requests, one per fingerprint, for background
    /// refresh. Includes both entries still live in the cache and entries
    /// evicted since the last flush -- an evicted fingerprint's pending
    /// operations are still worth one last upstream refresh rather than
    /// being silently dropped.
    pub fn flush(&self) -> Vec<CheckRequest> {
        let mut out = Vec::new();
        for (_, item) in self.cache.entries_snapshot() {
            self.drain_pending(&item, &mut out);
        }
        for item in self.cache.flush() {
            self.drain_pending(&item, &mut out);
        }
        out
    }

    fn drain_pending(&self, item: &Arc<CheckItemState>, out: &mut Vec<CheckRequest>) {
        let mut pending = item.pending.lock().expect("mutex poisoned");
        if let Some(op) = pending.take() {
            out.push(CheckRequest {
                service_name: self.service_name.clone(),
                operation: op,
            });
        }
    }
}
