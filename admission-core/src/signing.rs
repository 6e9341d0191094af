//! Stable content fingerprints over operations, metric values, labels, and
//! requests, built on SHA-256 (the same primitive the surrounding stack
//! reaches for elsewhere to get a deterministic digest).

use sha2::{Digest, Sha256};

use crate::operation::{MetricValue, MetricValueKind, MetricValueSet};

/// Accumulates a fingerprint over an ordered sequence of fields. A NUL byte
/// is written before each key and before each value so that adjacent field
/// boundaries can never be confused by concatenation (`("ab", "c")` hashes
/// differently from `("a", "bc")`).
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn write_field(&mut self, key: &str, value: &str) -> &mut Self {
        self.hasher.update([0u8]);
        self.hasher.update(key.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(value.as_bytes());
        self
    }

    /// Labels are hashed in sorted key order so the fingerprint does not
    /// depend on the caller's (unordered) map iteration order.
    pub fn write_labels(&mut self, labels: &std::collections::HashMap<String, String>) -> &mut Self {
        let mut entries: Vec<_> = labels.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in entries {
            self.write_field(k, v);
        }
        self
    }

    pub fn finish(self) -> String {
        let digest = self.hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_metric_value_set(builder: &mut FingerprintBuilder, set: &MetricValueSet) {
    builder.write_field("metric_name", &set.metric_name);
    for value in &set.values {
        write_metric_value(builder, value);
    }
}

fn write_metric_value(builder: &mut FingerprintBuilder, value: &MetricValue) {
    builder.write_labels(&value.labels);
    // Numeric amounts are deliberately NOT hashed, so aggregable requests
    // with differing magnitudes collide. Only the currency code of a money
    // value participates, since mixed-currency values must not aggregate.
    if let MetricValueKind::Money(money) = &value.value {
        builder.write_field("currency_code", &money.currency_code);
    }
}

/// Fingerprint identifying a single metric value for merge-key purposes
/// (labels plus, for money, the currency code). Used by the operation
/// aggregator to decide whether two metric values for the same metric name
/// refer to the "same" series and should be combined rather than kept
/// side-by-side.
pub fn metric_value_fingerprint(value: &MetricValue) -> String {
    let mut builder = FingerprintBuilder::new();
    write_metric_value(&mut builder, value);
    builder.finish()
}

/// Fingerprint for a Check or Report request: consumerId, operationName,
/// labels, then each metric value set in the order given.
pub fn sign_request(
    consumer_id: Option<&str>,
    operation_name: &str,
    labels: &std::collections::HashMap<String, String>,
    metric_value_sets: &[MetricValueSet],
) -> String {
    let mut builder = FingerprintBuilder::new();
    builder.write_field("consumer_id", consumer_id.unwrap_or(""));
    builder.write_field("operation_name", operation_name);
    builder.write_labels(labels);
    for set in metric_value_sets {
        write_metric_value_set(&mut builder, set);
    }
    builder.finish()
}

/// Fingerprint for an AllocateQuota request: must be independent of metric
/// ordering, so metric names are sorted first. Per-value int64 costs are
/// never part of the signature (they aggregate inside the cached item).
pub fn sign_quota_request(
    consumer_id: Option<&str>,
    operation_name: &str,
    labels: &std::collections::HashMap<String, String>,
    metric_value_sets: &[MetricValueSet],
) -> String {
    let mut builder = FingerprintBuilder::new();
    builder.write_field("consumer_id", consumer_id.unwrap_or(""));
    builder.write_field("operation_name", operation_name);
    builder.write_labels(labels);

    let mut sorted: Vec<&MetricValueSet> = metric_value_sets.iter().collect();
    sorted.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    for set in sorted {
        write_metric_value_set(&mut builder, set);
    }
    builder.finish()
}
