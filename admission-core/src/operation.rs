//! The canonical unit carried by Check/Quota/Report traffic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::distribution::Distribution;
use crate::error::{CoreError, CoreResult};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Importance {
    Low,
    High,
}

impl Importance {
    pub fn is_low(self) -> bool {
        matches!(self, Importance::Low)
    }
}

/// A caller-supplied log entry attached to an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// The value carried by a single `MetricValue`. Exactly one variant, or
/// `Absent` when the operation records that a metric was observed without a
/// numeric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValueKind {
    Int64(i64),
    Double(f64),
    Distribution(Distribution),
    Bool(bool),
    String(String),
    Money(Money),
    Absent,
}

impl MetricValueKind {
    fn variant_name(&self) -> &'static str {
        match self {
            MetricValueKind::Int64(_) => "int64",
            MetricValueKind::Double(_) => "double",
            MetricValueKind::Distribution(_) => "distribution",
            MetricValueKind::Bool(_) => "bool",
            MetricValueKind::String(_) => "string",
            MetricValueKind::Money(_) => "money",
            MetricValueKind::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub labels: HashMap<String, String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub value: MetricValueKind,
}

impl MetricValue {
    pub fn new(value: MetricValueKind) -> Self {
        Self {
            labels: HashMap::new(),
            start_time: None,
            end_time: None,
            value,
        }
    }

    /// Combines two DELTA-kind values: numeric add, distribution
    /// merge, money add with currency check, time range union. Different
    /// variants is an argument error.
    pub fn combine_delta(&self, other: &MetricValue) -> CoreResult<MetricValue> {
        let value = match (&self.value, &other.value) {
            (MetricValueKind::Int64(a), MetricValueKind::Int64(b)) => MetricValueKind::Int64(a + b),
            (MetricValueKind::Double(a), MetricValueKind::Double(b)) => {
                MetricValueKind::Double(a + b)
            }
            (MetricValueKind::Distribution(a), MetricValueKind::Distribution(b)) => {
                MetricValueKind::Distribution(a.merge(b)?)
            }
            (MetricValueKind::Money(a), MetricValueKind::Money(b)) => {
                MetricValueKind::Money(a.add(b)?)
            }
            (MetricValueKind::Bool(a), MetricValueKind::Bool(b)) => MetricValueKind::Bool(*a || *b),
            (MetricValueKind::String(a), MetricValueKind::String(_)) => {
                MetricValueKind::String(a.clone())
            }
            (MetricValueKind::Absent, MetricValueKind::Absent) => MetricValueKind::Absent,
            (a, b) => {
                return Err(CoreError::argument(format!(
                    "cannot merge metric value variants {} and {}",
                    a.variant_name(),
                    b.variant_name()
                )))
            }
        };

        let start_time = match (self.start_time, other.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        let end_time = match (self.end_time, other.end_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        Ok(MetricValue {
            labels: self.labels.clone(),
            start_time,
            end_time,
            value,
        })
    }

    /// Selects the "winner" for a non-DELTA (GAUGE/CUMULATIVE) kind: the
    /// value with the later end-time; ties break toward the later arrival
    /// (i.e. `other`, since it arrived after `self`).
    pub fn pick_latest<'a>(&'a self, other: &'a MetricValue) -> &'a MetricValue {
        match (self.end_time, other.end_time) {
            (Some(a), Some(b)) => {
                if b >= a {
                    other
                } else {
                    self
                }
            }
            (None, Some(_)) => other,
            (Some(_), None) => self,
            (None, None) => other,
        }
    }
}

/// A named group of metric values recorded under one metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueSet {
    pub metric_name: String,
    pub values: Vec<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub operation_name: String,
    pub consumer_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub importance: Importance,
    pub labels: HashMap<String, String>,
    pub metric_value_sets: Vec<MetricValueSet>,
    pub log_entries: Vec<LogEntry>,
}

impl Operation {
    /// Validates the invariants: start <= end, consumer id (if
    /// present) is one of the two recognized forms.
    pub fn validate(&self) -> CoreResult<()> {
        if self.start_time > self.end_time {
            return Err(CoreError::argument("operation start_time must be <= end_time"));
        }
        if let Some(id) = &self.consumer_id {
            if !(id.starts_with("api_key:") || id.starts_with("project:")) {
                return Err(CoreError::argument(format!(
                    "unrecognized consumer id form: {id}"
                )));
            }
        }
        Ok(())
    }
}

/// Encodes a consumer id from an optional API key / project id:
/// `api_key:<key>` when a valid API key is present, else `project:<id>`
/// when a consumer project is set, else `None`.
pub fn encode_consumer_id(api_key: Option<&str>, project_id: Option<&str>) -> Option<String> {
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        return Some(format!("api_key:{key}"));
    }
    if let Some(project) = project_id.filter(|p| !p.is_empty()) {
        return Some(format!("project:{project}"));
    }
    None
}
