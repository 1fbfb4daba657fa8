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

use super::backend::{BackendStats, MetricsBackend};
use lumen_core::telemetry::{Metric, MetricId, MetricType, MetricsError, MetricsResult};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// In-memory metrics backend using `RwLock<HashMap>`.
///
/// Many readers, one writer. The default backend of
/// [`MetricsRegistry`](crate::MetricsRegistry).
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    storage: RwLock<HashMap<MetricId, Metric>>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get statistics about this backend
    pub fn stats(&self) -> BackendStats {
        let storage = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = BackendStats {
            total_metrics: storage.len(),
            ..BackendStats::default()
        };
        for metric in storage.values() {
            match metric.value.metric_type() {
                MetricType::Counter => stats.counter_count += 1,
                MetricType::Gauge => stats.gauge_count += 1,
                MetricType::Histogram => stats.histogram_count += 1,
            }
        }
        stats
    }

    /// Get metrics by namespace
    pub fn metrics_by_namespace(&self, namespace: &str) -> Vec<Metric> {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|metric| metric.id.namespace == namespace)
            .cloned()
            .collect()
    }
}

impl MetricsBackend for InMemoryBackend {
    fn put_metric(&self, metric: Metric) -> MetricsResult<()> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| MetricsError::StorageError("Failed to acquire write lock".to_string()))?;
        storage.insert(metric.id.clone(), metric);
        Ok(())
    }

    fn get_metric(&self, id: &MetricId) -> MetricsResult<Metric> {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| MetricsError::MetricNotFound(id.clone()))
    }

    fn contains_metric(&self, id: &MetricId) -> bool {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn remove_metric(&self, id: &MetricId) -> MetricsResult<()> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| MetricsError::StorageError("Failed to acquire write lock".to_string()))?;
        storage
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetricsError::MetricNotFound(id.clone()))
    }

    fn list_all_metrics(&self) -> Vec<Metric> {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn clear_all(&self) -> MetricsResult<()> {
        self.storage
            .write()
            .map_err(|_| MetricsError::StorageError("Failed to acquire write lock".to_string()))?
            .clear();
        Ok(())
    }

    fn metric_count(&self) -> usize {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::telemetry::MetricValue;

    #[test]
    fn counter_and_gauge_updates() {
        let backend = InMemoryBackend::new();
        let counter = MetricId::lumen("frames");
        let gauge = MetricId::lumen("pso_hit_rate");
        backend
            .put_metric(Metric::counter(counter.clone(), "frames rendered"))
            .unwrap();
        backend
            .put_metric(Metric::gauge(gauge.clone(), "hit rate", "ratio"))
            .unwrap();

        assert_eq!(backend.increment_counter(&counter, 3).unwrap(), 3);
        backend.set_gauge(&gauge, 0.75).unwrap();
        assert_eq!(backend.get_metric(&gauge).unwrap().value.as_gauge(), Some(0.75));

        let err = backend.set_gauge(&counter, 1.0).unwrap_err();
        assert_eq!(
            err,
            MetricsError::TypeMismatch {
                expected: MetricType::Gauge,
                found: MetricType::Counter,
            }
        );

        let stats = backend.stats();
        assert_eq!(stats.counter_count, 1);
        assert_eq!(stats.gauge_count, 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let backend = InMemoryBackend::new();
        let id = MetricId::lumen("record_ms");
        backend
            .put_metric(Metric::histogram(id.clone(), "recording", "ms", vec![1.0, 4.0]))
            .unwrap();
        for sample in [0.5, 2.0, 8.0] {
            backend.record_histogram_sample(&id, sample).unwrap();
        }
        match backend.get_metric(&id).unwrap().value {
            MetricValue::Histogram {
                count,
                bucket_counts,
                ..
            } => {
                assert_eq!(count, 3);
                assert_eq!(bucket_counts, vec![1, 2]);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn missing_metric_is_reported() {
        let backend = InMemoryBackend::new();
        let id = MetricId::lumen("nothing");
        assert!(matches!(
            backend.increment_counter(&id, 1),
            Err(MetricsError::MetricNotFound(_))
        ));
        assert!(backend.remove_metric(&id).is_err());
    }
}
