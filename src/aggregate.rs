//! Bucketed aggregation.
//!
//! Aggregate statements return `(sum, count, min, max)` per bucket instead of the
//! final value, so partial results from separately executed batches can be
//! combined exactly before the requested function is applied.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Count => "COUNT",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVG" => Ok(AggregateFunction::Avg),
            "MIN" => Ok(AggregateFunction::Min),
            "MAX" => Ok(AggregateFunction::Max),
            "SUM" => Ok(AggregateFunction::Sum),
            "COUNT" => Ok(AggregateFunction::Count),
            other => Err(Error::InvalidQuery(format!(
                "unknown aggregate function '{}'",
                other
            ))),
        }
    }
}

/// Combinable summary of the values in one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialAggregate {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl PartialAggregate {
    pub fn of(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    pub fn merge(&mut self, other: &PartialAggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Final value, or `None` for an empty bucket.
    pub fn finalize(&self, function: AggregateFunction) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(match function {
            AggregateFunction::Avg => self.sum / self.count as f64,
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
            AggregateFunction::Sum => self.sum,
            AggregateFunction::Count => self.count as f64,
        })
    }
}

impl Default for PartialAggregate {
    fn default() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

/// Per-bucket partials, merged across batches.
pub type Buckets = BTreeMap<i64, PartialAggregate>;

pub fn merge_buckets(into: &mut Buckets, from: Buckets) {
    for (bucket, partial) in from {
        into.entry(bucket).or_default().merge(&partial);
    }
}

pub fn finalize_buckets(buckets: &Buckets, function: AggregateFunction) -> BTreeMap<i64, f64> {
    buckets
        .iter()
        .filter_map(|(bucket, partial)| partial.finalize(function).map(|v| (*bucket, v)))
        .collect()
}

/// Start of the bucket containing `timestamp_ms`, clamped at `i64::MIN`.
pub fn bucket_start(timestamp_ms: i64, interval_ms: i64) -> i64 {
    timestamp_ms.div_euclid(interval_ms).saturating_mul(interval_ms)
}
