// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Abstract definitions for metrics.

use serde::Serialize;
use std::fmt::{self, Display};
use std::time::Instant;

/// The namespace every metric published by the renderer lives in.
pub const LUMEN_NAMESPACE: &str = "lumen";

/// A structured metric identifier: namespace, name and sorted labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MetricId {
    /// The broad category (e.g. "lumen").
    pub namespace: String,
    /// The metric name (e.g. "pso_hit_rate").
    pub name: String,
    /// Key-value labels, sorted by key.
    pub labels: Vec<(String, String)>,
}

impl MetricId {
    /// Creates an id without labels.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: Vec::new(),
        }
    }

    /// Creates an id in the [`LUMEN_NAMESPACE`].
    pub fn lumen(name: impl Into<String>) -> Self {
        Self::new(LUMEN_NAMESPACE, name)
    }

    /// Adds a label, keeping labels sorted by key.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self.labels.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)?;
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "[{labels}]")?;
        }
        Ok(())
    }
}

/// The fundamental type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricType {
    /// Monotonically increasing.
    Counter,
    /// Goes up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

/// The current value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricValue {
    /// Counter value.
    Counter(u64),
    /// Gauge value.
    Gauge(f64),
    /// Bucketed samples. `bucket_counts[i]` counts samples `<= bucket_bounds[i]`.
    Histogram {
        /// Number of recorded samples.
        count: u64,
        /// Sum of recorded samples.
        sum: f64,
        /// Upper bounds of the buckets.
        bucket_bounds: Vec<f64>,
        /// Samples per bucket.
        bucket_counts: Vec<u64>,
    },
}

impl MetricValue {
    /// The type of this value.
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Gauge(_) => MetricType::Gauge,
            MetricValue::Histogram { .. } => MetricType::Histogram,
        }
    }

    /// Counters and gauges as `f64`; histograms report their mean.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Counter(v) => Some(*v as f64),
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::Histogram { count, sum, .. } => {
                (*count > 0).then(|| sum / *count as f64)
            }
        }
    }

    /// The counter value, if this is a counter.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            MetricValue::Counter(v) => Some(*v),
            _ => None,
        }
    }

    /// The gauge value, if this is a gauge.
    pub fn as_gauge(&self) -> Option<f64> {
        match self {
            MetricValue::Gauge(v) => Some(*v),
            _ => None,
        }
    }
}

/// A metric together with its descriptive metadata.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Identifier.
    pub id: MetricId,
    /// Human-readable description.
    pub description: String,
    /// Unit of measurement (e.g. "ms", "bytes", "count").
    pub unit: String,
    /// Current value.
    pub value: MetricValue,
    /// When the value last changed.
    pub last_updated: Instant,
}

impl Metric {
    /// A counter starting at zero.
    pub fn counter(id: MetricId, description: impl Into<String>) -> Self {
        Self::with_value(id, description, "count", MetricValue::Counter(0))
    }

    /// A gauge starting at zero.
    pub fn gauge(id: MetricId, description: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::with_value(id, description, unit, MetricValue::Gauge(0.0))
    }

    /// An empty histogram with the given bucket bounds.
    pub fn histogram(
        id: MetricId,
        description: impl Into<String>,
        unit: impl Into<String>,
        bucket_bounds: Vec<f64>,
    ) -> Self {
        let bucket_counts = vec![0; bucket_bounds.len()];
        Self::with_value(
            id,
            description,
            unit,
            MetricValue::Histogram {
                count: 0,
                sum: 0.0,
                bucket_bounds,
                bucket_counts,
            },
        )
    }

    fn with_value(
        id: MetricId,
        description: impl Into<String>,
        unit: impl Into<String>,
        value: MetricValue,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            unit: unit.into(),
            value,
            last_updated: Instant::now(),
        }
    }
}

/// A specialized `Result` type for metric operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// An error of the metrics system.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// No metric is registered under the id.
    MetricNotFound(MetricId),
    /// The operation does not apply to the metric's type.
    TypeMismatch {
        /// The type the operation expected.
        expected: MetricType,
        /// The type of the registered metric.
        found: MetricType,
    },
    /// The storage backend failed.
    StorageError(String),
}

impl Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsError::MetricNotFound(id) => write!(f, "Metric not found: {id}"),
            MetricsError::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {expected:?}, found {found:?}")
            }
            MetricsError::StorageError(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for MetricsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sorted_and_formatted() {
        let id = MetricId::lumen("heap_count")
            .with_label("class", "upload")
            .with_label("backend", "headless");
        assert_eq!(id.labels[0].0, "backend");
        assert_eq!(id.to_string(), "lumen:heap_count[backend=headless,class=upload]");
        assert_eq!(MetricId::lumen("barriers").to_string(), "lumen:barriers");
    }

    #[test]
    fn histogram_mean() {
        let value = MetricValue::Histogram {
            count: 4,
            sum: 10.0,
            bucket_bounds: vec![1.0],
            bucket_counts: vec![0],
        };
        assert_eq!(value.metric_type(), MetricType::Histogram);
        assert_eq!(value.as_f64(), Some(2.5));
        assert_eq!(value.as_counter(), None);
    }
}
