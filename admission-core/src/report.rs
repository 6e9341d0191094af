//! Batches post-request usage records for periodic upstream submission.

use std::sync::{Arc, Mutex};

use chrono::Duration;

use crate::cache::AggregatingCache;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::operation::Importance;
use crate::operation_aggregator::OperationAggregator;
use crate::requests::ReportRequest;
use crate::signing::sign_request;

pub struct ReportAggregator {
    service_name: String,
    flush_interval_ms: i64,
    cache: Option<AggregatingCache<String, Arc<Mutex<OperationAggregator>>>>,
}

impl ReportAggregator {
    /// `num_entries <= 0` disables caching: `report()` always returns
    /// `false` and `flush_interval_millis()` returns `-1`.
    pub fn new(
        service_name: impl Into<String>,
        num_entries: i64,
        flush_interval_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = if num_entries > 0 {
            Some(AggregatingCache::new(
                num_entries,
                Duration::milliseconds(flush_interval_ms),
                clock,
            ))
        } else {
            None
        };
        Self {
            service_name: service_name.into(),
            flush_interval_ms,
            cache,
        }
    }

    pub fn flush_interval_millis(&self) -> i64 {
        if self.cache.is_some() {
            self.flush_interval_ms
        } else {
            -1
        }
    }

    /// Merges every LOW-importance operation in `req` into the cache under
    /// its fingerprint and returns `true`. If any operation has importance
    /// != LOW, or caching is disabled, rejects and returns `false` so the
    /// caller sends the request synchronously.
    pub fn report(&self, req: &ReportRequest) -> CoreResult<bool> {
        if req.service_name != self.service_name {
            return Err(CoreError::argument(format!(
                "report request service name '{}' does not match aggregator service '{}'",
                req.service_name, self.service_name
            )));
        }
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return Ok(false),
        };
        if req
            .operations
            .iter()
            .any(|op| op.importance != Importance::Low)
        {
            return Ok(false);
        }

        for op in &req.operations {
            let fp = sign_request(
                op.consumer_id.as_deref(),
                &op.operation_name,
                &op.labels,
                &op.metric_value_sets,
            );
            match cache.get(&fp) {
                Some((slot, _)) => {
                    slot.lock().expect("mutex poisoned").add(op.clone())?;
                }
                None => {
                    let mut aggregator = OperationAggregator::new();
                    aggregator.add(op.clone())?;
                    cache.upsert(fp, Arc::new(Mutex::new(aggregator)));
                }
            }
        }
        Ok(true)
    }

    /// Drains the eviction queue and every live aggregate into one Report
    /// request per batch of operations sharing a fingerprint.
    pub fn flush(&self) -> Vec<ReportRequest> {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return Vec::new(),
        };

        let mut operations = Vec::new();
        for (_, slot) in cache.entries_snapshot() {
            if let Some(op) = slot.lock().expect("mutex poisoned").take() {
                operations.push(op);
            }
        }
        for slot in cache.flush() {
            if let Some(op) = slot.lock().expect("mutex poisoned").take() {
                operations.push(op);
            }
        }

        if operations.is_empty() {
            Vec::new()
        } else {
            vec![ReportRequest {
                service_name: self.service_name.clone(),
                operations,
            }]
        }
    }

    /// Invalidates the cache and output queue, discarding all pending
    /// state. Used on shutdown.
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}
