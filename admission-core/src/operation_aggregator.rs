//! Merges a sequence of operations sharing a fingerprint into one operation.
//!
//! The known-metrics table is modeled as a closed, statically iterated data
//! table of `{name, kind}` entries rather than any runtime reflection over
//! a value type.

use std::collections::HashMap;

use crate::error::CoreResult;
use crate::operation::{MetricValueSet, Operation};
use crate::signing::metric_value_fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Delta,
    Gauge,
    Cumulative,
}

pub struct MetricKindEntry {
    pub name: &'static str,
    pub kind: MetricKind,
}

/// Closed table of well-known metrics and how they combine. Names follow
/// the `serviceruntime.googleapis.com/api/*` convention used by the managed
/// services this core fronts. A metric absent from the table defaults to
/// `Delta`, the safe choice for usage counters.
pub static METRIC_KIND_TABLE: &[MetricKindEntry] = &[
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/api/request_count",
        kind: MetricKind::Delta,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/api/request_sizes",
        kind: MetricKind::Delta,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/api/response_sizes",
        kind: MetricKind::Delta,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/api/request_latencies",
        kind: MetricKind::Delta,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/quota/used",
        kind: MetricKind::Delta,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/quota/limit",
        kind: MetricKind::Gauge,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/quota/remaining",
        kind: MetricKind::Gauge,
    },
    MetricKindEntry {
        name: "serviceruntime.googleapis.com/allocation/concurrent_requests",
        kind: MetricKind::Cumulative,
    },
];

pub fn metric_kind_for(metric_name: &str) -> MetricKind {
    METRIC_KIND_TABLE
        .iter()
        .find(|entry| entry.name == metric_name)
        .map(|entry| entry.kind)
        .unwrap_or(MetricKind::Delta)
}

/// Builder holding a running merged `Operation` plus the metric-kind policy
/// used when combining metric values.
#[derive(Default)]
pub struct OperationAggregator {
    merged: Option<Operation>,
}

impl OperationAggregator {
    pub fn new() -> Self {
        Self { merged: None }
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_none()
    }

    /// Folds `op` into the running aggregate.
    pub fn add(&mut self, op: Operation) -> CoreResult<()> {
        match self.merged.take() {
            None => {
                self.merged = Some(op);
            }
            Some(mut existing) => {
                existing.start_time = existing.start_time.min(op.start_time);
                existing.end_time = existing.end_time.max(op.end_time);
                existing.log_entries.extend(op.log_entries);

                for incoming_set in op.metric_value_sets {
                    merge_metric_value_set(&mut existing.metric_value_sets, incoming_set)?;
                }
                self.merged = Some(existing);
            }
        }
        Ok(())
    }

    /// Returns a clone of the current aggregate, or `None` if nothing has
    /// been added yet.
    pub fn peek(&self) -> Option<Operation> {
        self.merged.clone()
    }

    /// Takes the current aggregate, resetting the builder to empty.
    pub fn take(&mut self) -> Option<Operation> {
        self.merged.take()
    }
}

fn merge_metric_value_set(
    existing_sets: &mut Vec<MetricValueSet>,
    incoming: MetricValueSet,
) -> CoreResult<()> {
    let kind = metric_kind_for(&incoming.metric_name);
    let target = existing_sets
        .iter_mut()
        .find(|set| set.metric_name == incoming.metric_name);

    let target = match target {
        Some(set) => set,
        None => {
            existing_sets.push(MetricValueSet {
                metric_name: incoming.metric_name.clone(),
                values: Vec::new(),
            });
            existing_sets.last_mut().expect("just pushed")
        }
    };

    // Index existing values by their merge-key fingerprint so an incoming
    // value with the same (metric name, fingerprint) combines in place.
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
    for (i, value) in target.values.iter().enumerate() {
        by_fingerprint.insert(metric_value_fingerprint(value), i);
    }

    for incoming_value in incoming.values {
        let fp = metric_value_fingerprint(&incoming_value);
        match by_fingerprint.get(&fp) {
            Some(&idx) => {
                let combined = if kind == MetricKind::Delta {
                    target.values[idx].combine_delta(&incoming_value)?
                } else {
                    target.values[idx].pick_latest(&incoming_value).clone()
                };
                target.values[idx] = combined;
            }
            None => {
                by_fingerprint.insert(fp, target.values.len());
                target.values.push(incoming_value);
            }
        }
    }

    Ok(())
}
