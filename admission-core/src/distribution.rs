//! Streaming histogram / distribution type used by metric values.
//!
//! Three bucket schemes (exponential, linear, explicit), a running
//! count/mean/min/max/sum-of-squared-deviation maintained via Welford's
//! online algorithm, and a merge operator for combining two distributions
//! built over the same scheme.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const SCHEME_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BucketScheme {
    /// `num_finite_buckets` buckets of exponentially increasing width,
    /// starting at `scale`, each `growth_factor` times the previous.
    Exponential {
        num_finite_buckets: u32,
        growth_factor: f64,
        scale: f64,
    },
    /// `num_finite_buckets` buckets of fixed `width` starting at `offset`.
    Linear {
        num_finite_buckets: u32,
        width: f64,
        offset: f64,
    },
    /// Buckets delimited by explicit, strictly increasing bounds.
    Explicit { bounds: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub scheme: BucketScheme,
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squared_deviation: f64,
}

impl Distribution {
    pub fn create_exponential(
        num_finite_buckets: u32,
        growth_factor: f64,
        scale: f64,
    ) -> CoreResult<Self> {
        if num_finite_buckets == 0 {
            return Err(CoreError::argument("exponential distribution requires N > 0"));
        }
        if !(growth_factor > 1.0) {
            return Err(CoreError::argument(
                "exponential distribution requires growth factor > 1",
            ));
        }
        if !(scale > 0.0) {
            return Err(CoreError::argument("exponential distribution requires scale > 0"));
        }
        let bucket_counts = vec![0u64; num_finite_buckets as usize + 2];
        Ok(Self::empty(
            BucketScheme::Exponential {
                num_finite_buckets,
                growth_factor,
                scale,
            },
            bucket_counts,
        ))
    }

    pub fn create_linear(num_finite_buckets: u32, width: f64, offset: f64) -> CoreResult<Self> {
        if num_finite_buckets == 0 {
            return Err(CoreError::argument("linear distribution requires N > 0"));
        }
        if !(width > 0.0) {
            return Err(CoreError::argument("linear distribution requires width > 0"));
        }
        let bucket_counts = vec![0u64; num_finite_buckets as usize + 2];
        Ok(Self::empty(
            BucketScheme::Linear {
                num_finite_buckets,
                width,
                offset,
            },
            bucket_counts,
        ))
    }

    pub fn create_explicit(mut bounds: Vec<f64>) -> CoreResult<Self> {
        if bounds.is_empty() {
            return Err(CoreError::argument(
                "explicit distribution requires at least one bound",
            ));
        }
        if bounds.iter().any(|b| b.is_nan()) {
            return Err(CoreError::argument("explicit distribution bounds must not be NaN"));
        }
        bounds.sort_by(|a, b| a.partial_cmp(b).expect("NaN bounds already rejected"));
        bounds.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
        for window in bounds.windows(2) {
            if !(window[1] > window[0]) {
                return Err(CoreError::argument(
                    "explicit distribution bounds must be strictly increasing",
                ));
            }
        }
        let bucket_counts = vec![0u64; bounds.len() + 1];
        Ok(Self::empty(BucketScheme::Explicit { bounds }, bucket_counts))
    }

    fn empty(scheme: BucketScheme, bucket_counts: Vec<u64>) -> Self {
        Self {
            scheme,
            bucket_counts,
            count: 0,
            mean: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum_of_squared_deviation: 0.0,
        }
    }

    /// Adds one sample, updating the running statistics (Welford) and the
    /// bucket it falls into.
    pub fn add_sample(&mut self, x: f64) {
        let old_mean = self.mean;
        self.count += 1;
        self.mean += (x - old_mean) / self.count as f64;
        // delta-sum-of-squares = (x - oldMean) * (x - newMean)
        self.sum_of_squared_deviation += (x - old_mean) * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);

        let bucket = self.bucket_index(x);
        self.bucket_counts[bucket] += 1;
    }

    fn bucket_index(&self, x: f64) -> usize {
        match &self.scheme {
            BucketScheme::Exponential {
                num_finite_buckets,
                growth_factor,
                scale,
            } => {
                if x <= *scale {
                    0
                } else {
                    let idx = 1.0 + (f64::ln(x / scale) / f64::ln(*growth_factor)).floor();
                    let idx = idx as i64;
                    idx.clamp(0, *num_finite_buckets as i64 + 1) as usize
                }
            }
            BucketScheme::Linear {
                num_finite_buckets,
                width,
                offset,
            } => {
                if x <= *offset {
                    0
                } else {
                    let idx = 1.0 + ((x - offset) / width).round();
                    let idx = idx as i64;
                    idx.clamp(0, *num_finite_buckets as i64 + 1) as usize
                }
            }
            BucketScheme::Explicit { bounds } => {
                // Binary search for the first bound strictly greater than x;
                // ties (x == bound) go to the next bucket.
                match bounds.binary_search_by(|b| {
                    if *b <= x {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                }) {
                    Ok(i) | Err(i) => i,
                }
            }
        }
    }

    fn scheme_matches(&self, other: &Distribution) -> bool {
        match (&self.scheme, &other.scheme) {
            (
                BucketScheme::Exponential {
                    num_finite_buckets: n1,
                    growth_factor: g1,
                    scale: s1,
                },
                BucketScheme::Exponential {
                    num_finite_buckets: n2,
                    growth_factor: g2,
                    scale: s2,
                },
            ) => {
                n1 == n2
                    && (g1 - g2).abs() < SCHEME_TOLERANCE
                    && (s1 - s2).abs() < SCHEME_TOLERANCE
            }
            (
                BucketScheme::Linear {
                    num_finite_buckets: n1,
                    width: w1,
                    offset: o1,
                },
                BucketScheme::Linear {
                    num_finite_buckets: n2,
                    width: w2,
                    offset: o2,
                },
            ) => n1 == n2 && (w1 - w2).abs() < SCHEME_TOLERANCE && (o1 - o2).abs() < SCHEME_TOLERANCE,
            (BucketScheme::Explicit { bounds: b1 }, BucketScheme::Explicit { bounds: b2 }) => {
                b1.len() == b2.len()
                    && b1
                        .iter()
                        .zip(b2.iter())
                        .all(|(a, b)| (a - b).abs() < SCHEME_TOLERANCE)
            }
            _ => false,
        }
    }

    /// Merges `other` into `self`, combining counts/bucket arrays and
    /// recomputing mean/sum-of-squared-deviation from both operands'
    /// aggregates (not by replaying samples).
    pub fn merge(&self, other: &Distribution) -> CoreResult<Distribution> {
        if !self.scheme_matches(other) {
            return Err(CoreError::argument(
                "cannot merge distributions with different bucket schemes",
            ));
        }
        if self.bucket_counts.len() != other.bucket_counts.len() {
            return Err(CoreError::argument(
                "cannot merge distributions with mismatched bucket counts length",
            ));
        }

        if self.count == 0 {
            return Ok(other.clone());
        }
        if other.count == 0 {
            return Ok(self.clone());
        }

        let count = self.count + other.count;
        let count_f = count as f64;
        let new_mean =
            (self.mean * self.count as f64 + other.mean * other.count as f64) / count_f;
        let new_ssd = self.sum_of_squared_deviation
            + other.sum_of_squared_deviation
            + self.count as f64 * (new_mean - self.mean).powi(2)
            + other.count as f64 * (new_mean - other.mean).powi(2);

        let bucket_counts = self
            .bucket_counts
            .iter()
            .zip(other.bucket_counts.iter())
            .map(|(a, b)| a + b)
            .collect();

        Ok(Distribution {
            scheme: self.scheme.clone(),
            bucket_counts,
            count,
            mean: new_mean,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum_of_squared_deviation: new_ssd,
        })
    }
}
