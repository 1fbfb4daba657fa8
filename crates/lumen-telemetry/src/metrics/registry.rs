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

use crate::storage::{InMemoryBackend, MetricsBackend};
use anyhow::Context;
use lumen_core::telemetry::{Metric, MetricId, MetricValue, MetricsResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Main interface for registering and updating metrics.
///
/// Cloning is cheap; clones share the same backend.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    backend: Arc<dyn MetricsBackend>,
}

/// A serializable view of one metric, used for JSON snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// `namespace:name[labels]`.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Unit of measurement.
    pub unit: String,
    /// The value at snapshot time.
    pub value: MetricValue,
}

impl From<&Metric> for MetricSnapshot {
    fn from(metric: &Metric) -> Self {
        Self {
            id: metric.id.to_string(),
            description: metric.description.clone(),
            unit: metric.unit.clone(),
            value: metric.value.clone(),
        }
    }
}

impl MetricsRegistry {
    /// Create a new registry with the default in-memory backend
    pub fn new() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()))
    }

    /// Create a new registry with a custom backend
    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Register a new counter metric. Registering an existing id returns a
    /// handle to the existing metric and keeps its value.
    pub fn register_counter(&self, id: MetricId, description: &str) -> MetricsResult<CounterHandle> {
        if !self.backend.contains_metric(&id) {
            self.backend.put_metric(Metric::counter(id.clone(), description))?;
        }
        Ok(CounterHandle {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Register a new gauge metric.
    pub fn register_gauge(
        &self,
        id: MetricId,
        description: &str,
        unit: &str,
    ) -> MetricsResult<GaugeHandle> {
        if !self.backend.contains_metric(&id) {
            self.backend
                .put_metric(Metric::gauge(id.clone(), description, unit))?;
        }
        Ok(GaugeHandle {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Register a new histogram metric with the given bucket upper bounds.
    pub fn register_histogram(
        &self,
        id: MetricId,
        description: &str,
        unit: &str,
        buckets: Vec<f64>,
    ) -> MetricsResult<HistogramHandle> {
        if !self.backend.contains_metric(&id) {
            self.backend
                .put_metric(Metric::histogram(id.clone(), description, unit, buckets))?;
        }
        Ok(HistogramHandle {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Get a metric by ID
    pub fn get_metric(&self, id: &MetricId) -> MetricsResult<Metric> {
        self.backend.get_metric(id)
    }

    /// Check if a metric exists
    pub fn contains_metric(&self, id: &MetricId) -> bool {
        self.backend.contains_metric(id)
    }

    /// Get all metrics in a namespace
    pub fn get_namespace_metrics(&self, namespace: &str) -> Vec<Metric> {
        self.backend
            .list_all_metrics()
            .into_iter()
            .filter(|metric| metric.id.namespace == namespace)
            .collect()
    }

    /// Get the total number of registered metrics
    pub fn metric_count(&self) -> usize {
        self.backend.metric_count()
    }

    /// Clear all metrics (useful for testing)
    pub fn clear_all(&self) -> MetricsResult<()> {
        self.backend.clear_all()
    }

    /// Get the backend (for advanced usage)
    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    /// All metrics, sorted by id, as serializable snapshots.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let mut snapshots: Vec<MetricSnapshot> = self
            .backend
            .list_all_metrics()
            .iter()
            .map(MetricSnapshot::from)
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// The snapshot rendered as pretty JSON.
    pub fn snapshot_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(&self.snapshot()).context("serializing metrics snapshot")
    }

    /// Writes the JSON snapshot to `path`.
    pub fn write_snapshot(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = self.snapshot_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("writing metrics snapshot to {}", path.display()))
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for efficiently updating a counter metric
#[derive(Debug, Clone)]
pub struct CounterHandle {
    id: MetricId,
    backend: Arc<dyn MetricsBackend>,
}

impl CounterHandle {
    /// Increment the counter by 1
    pub fn increment(&self) -> MetricsResult<u64> {
        self.increment_by(1)
    }

    /// Increment the counter by a specific amount
    pub fn increment_by(&self, delta: u64) -> MetricsResult<u64> {
        self.backend.increment_counter(&self.id, delta)
    }

    /// Get the current counter value
    pub fn get(&self) -> MetricsResult<u64> {
        let metric = self.backend.get_metric(&self.id)?;
        Ok(metric.value.as_counter().unwrap_or(0))
    }

    /// Get the metric ID
    pub fn id(&self) -> &MetricId {
        &self.id
    }
}

/// Handle for efficiently updating a gauge metric
#[derive(Debug, Clone)]
pub struct GaugeHandle {
    id: MetricId,
    backend: Arc<dyn MetricsBackend>,
}

impl GaugeHandle {
    /// Set the gauge to a specific value
    pub fn set(&self, value: f64) -> MetricsResult<()> {
        self.backend.set_gauge(&self.id, value)
    }

    /// Add to the current gauge value
    pub fn add(&self, delta: f64) -> MetricsResult<()> {
        let current = self.get()?;
        self.set(current + delta)
    }

    /// Get the current gauge value
    pub fn get(&self) -> MetricsResult<f64> {
        let metric = self.backend.get_metric(&self.id)?;
        Ok(metric.value.as_gauge().unwrap_or(0.0))
    }

    /// Get the metric ID
    pub fn id(&self) -> &MetricId {
        &self.id
    }
}

/// Handle for recording histogram samples
#[derive(Debug, Clone)]
pub struct HistogramHandle {
    id: MetricId,
    backend: Arc<dyn MetricsBackend>,
}

impl HistogramHandle {
    /// Record a sample
    pub fn observe(&self, value: f64) -> MetricsResult<()> {
        self.backend.record_histogram_sample(&self.id, value)
    }

    /// Get the metric ID
    pub fn id(&self) -> &MetricId {
        &self.id
    }

    /// Get the current histogram metric
    pub fn get_metric(&self) -> MetricsResult<Metric> {
        self.backend.get_metric(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_registering_keeps_the_value() {
        let registry = MetricsRegistry::new();
        let first = registry
            .register_counter(MetricId::lumen("frames"), "frames rendered")
            .unwrap();
        first.increment_by(5).unwrap();

        let second = registry
            .register_counter(MetricId::lumen("frames"), "frames rendered")
            .unwrap();
        assert_eq!(second.get().unwrap(), 5);
        assert_eq!(registry.metric_count(), 1);
    }

    #[test]
    fn gauges_move_both_ways() {
        let registry = MetricsRegistry::new();
        let gauge = registry
            .register_gauge(MetricId::lumen("heap_count"), "live heaps", "count")
            .unwrap();
        gauge.set(4.0).unwrap();
        gauge.add(-1.5).unwrap();
        assert_eq!(gauge.get().unwrap(), 2.5);
    }

    #[test]
    fn namespace_filter_and_snapshot_order() {
        let registry = MetricsRegistry::new();
        registry
            .register_gauge(MetricId::lumen("pso_hit_rate"), "hit rate", "ratio")
            .unwrap();
        registry
            .register_counter(MetricId::lumen("barriers"), "barriers")
            .unwrap();
        registry
            .register_counter(MetricId::new("app", "ticks"), "ticks")
            .unwrap();

        assert_eq!(registry.get_namespace_metrics("lumen").len(), 2);
        let ids: Vec<String> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["app:ticks", "lumen:barriers", "lumen:pso_hit_rate"]);
    }

    #[test]
    fn snapshot_json_is_written() {
        let registry = MetricsRegistry::new();
        registry
            .register_counter(MetricId::lumen("draws_recorded"), "draws")
            .unwrap()
            .increment_by(12)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        registry.write_snapshot(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["id"], "lumen:draws_recorded");
        assert_eq!(json[0]["value"]["Counter"], 12);
    }
}
