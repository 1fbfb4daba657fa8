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

//! Publishes per-frame metrics as gauges in the `lumen` namespace.

use crate::metrics::{CounterHandle, GaugeHandle, MetricsRegistry};
use lumen_core::telemetry::{FrameMetrics, MetricId, MetricsResult};
use std::fmt;
use std::sync::Arc;

type Subscriber = Arc<dyn Fn(&FrameMetrics) + Send + Sync>;

/// Writes each [`FrameMetrics`] report into a [`MetricsRegistry`] and hands it
/// to any subscribed callbacks.
///
/// Gauges hold the latest frame's value. `frames` and `draws_skipped_total`
/// are counters accumulated over the publisher's lifetime.
#[derive(Clone)]
pub struct FrameMetricsPublisher {
    frame_time_avg: GaugeHandle,
    frame_time_variance: GaugeHandle,
    pso_hit_rate: GaugeHandle,
    descriptor_bindings: GaugeHandle,
    barriers: GaugeHandle,
    draws_recorded: GaugeHandle,
    draws_skipped: GaugeHandle,
    fragmentation: GaugeHandle,
    heap_count: GaugeHandle,
    frames: CounterHandle,
    draws_skipped_total: CounterHandle,
    gpu_waits: CounterHandle,
    last: Option<FrameMetrics>,
    subscribers: Vec<Subscriber>,
}

impl FrameMetricsPublisher {
    /// Registers the frame gauges and counters in `registry`.
    pub fn new(registry: &MetricsRegistry) -> MetricsResult<Self> {
        let gauge = |name: &str, description: &str, unit: &str| {
            registry.register_gauge(MetricId::lumen(name), description, unit)
        };
        let counter =
            |name: &str, description: &str| registry.register_counter(MetricId::lumen(name), description);

        Ok(Self {
            frame_time_avg: gauge("frame_time_avg_ms", "Rolling mean CPU frame time", "ms")?,
            frame_time_variance: gauge(
                "frame_time_variance_ms2",
                "Rolling variance of the CPU frame time",
                "ms^2",
            )?,
            pso_hit_rate: gauge("pso_hit_rate", "Pipeline cache hit rate", "ratio")?,
            descriptor_bindings: gauge("descriptor_bindings", "Descriptor binds this frame", "count")?,
            barriers: gauge("barriers", "Barriers emitted this frame", "count")?,
            draws_recorded: gauge("draws_recorded", "Draws recorded this frame", "count")?,
            draws_skipped: gauge("draws_skipped", "Draws skipped this frame", "count")?,
            fragmentation: gauge("fragmentation_percent", "Heap fragmentation", "percent")?,
            heap_count: gauge("heap_count", "Live heaps across all classes", "count")?,
            frames: counter("frames", "Frames published")?,
            draws_skipped_total: counter("draws_skipped_total", "Draws skipped since start")?,
            gpu_waits: counter("gpu_waits", "Frames whose begin had to wait for the GPU")?,
            last: None,
            subscribers: Vec::new(),
        })
    }

    /// Adds a callback invoked with every published report.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&FrameMetrics) + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(callback));
    }

    /// Publishes one frame's report.
    pub fn publish(&mut self, metrics: &FrameMetrics) -> MetricsResult<()> {
        self.frame_time_avg.set(metrics.frame_time_avg_ms)?;
        self.frame_time_variance.set(metrics.frame_time_variance_ms2)?;
        self.pso_hit_rate.set(metrics.pso_hit_rate)?;
        self.descriptor_bindings.set(metrics.descriptor_bindings as f64)?;
        self.barriers.set(metrics.barriers as f64)?;
        self.draws_recorded.set(metrics.draws_recorded as f64)?;
        self.draws_skipped.set(metrics.draws_skipped as f64)?;
        self.fragmentation.set(metrics.fragmentation_percent)?;
        self.heap_count.set(metrics.heap_count as f64)?;
        self.frames.increment()?;
        self.draws_skipped_total.increment_by(metrics.draws_skipped)?;
        if metrics.waited_on_gpu {
            self.gpu_waits.increment()?;
        }

        for subscriber in &self.subscribers {
            subscriber(metrics);
        }
        self.last = Some(*metrics);
        log::trace!(
            "FrameMetricsPublisher: frame {} avg {:.3}ms, {} draws, hit rate {:.2}",
            metrics.frame,
            metrics.frame_time_avg_ms,
            metrics.draws_recorded,
            metrics.pso_hit_rate
        );
        Ok(())
    }

    /// The most recently published report.
    pub fn last(&self) -> Option<&FrameMetrics> {
        self.last.as_ref()
    }

    /// Number of frames published.
    pub fn frames_published(&self) -> u64 {
        self.frames.get().unwrap_or(0)
    }
}

impl fmt::Debug for FrameMetricsPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMetricsPublisher")
            .field("last", &self.last)
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn report(frame: u64, skipped: u64) -> FrameMetrics {
        FrameMetrics {
            frame,
            frame_time_avg_ms: 4.0,
            pso_hit_rate: 0.5,
            draws_recorded: 10,
            draws_skipped: skipped,
            heap_count: 3,
            waited_on_gpu: frame > 2,
            ..FrameMetrics::default()
        }
    }

    #[test]
    fn gauges_hold_the_latest_frame() {
        let registry = MetricsRegistry::new();
        let mut publisher = FrameMetricsPublisher::new(&registry).unwrap();
        publisher.publish(&report(1, 2)).unwrap();
        publisher.publish(&report(2, 0)).unwrap();
        publisher.publish(&report(3, 1)).unwrap();

        let value = |name: &str| {
            registry
                .get_metric(&MetricId::lumen(name))
                .unwrap()
                .value
                .as_f64()
                .unwrap()
        };
        assert_eq!(value("draws_skipped"), 1.0);
        assert_eq!(value("draws_skipped_total"), 3.0);
        assert_eq!(value("heap_count"), 3.0);
        assert_eq!(value("gpu_waits"), 1.0);
        assert_eq!(publisher.frames_published(), 3);
        assert_eq!(publisher.last().map(|m| m.frame), Some(3));
    }

    #[test]
    fn subscribers_see_every_report() {
        let registry = MetricsRegistry::new();
        let mut publisher = FrameMetricsPublisher::new(&registry).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        publisher.subscribe(move |metrics| {
            counter.fetch_add(metrics.draws_recorded, Ordering::SeqCst);
        });

        publisher.publish(&report(1, 0)).unwrap();
        publisher.publish(&report(2, 0)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }
}
