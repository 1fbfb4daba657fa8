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

//! Turns the diagnostics bus into per-kind counters.

use crate::metrics::{CounterHandle, MetricsRegistry};
use lumen_core::event::EventBus;
use lumen_core::telemetry::{MetricId, MetricsResult};
use lumen_core::DiagnosticEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Drains a diagnostics [`EventBus`] and counts events by kind.
///
/// Counters are registered lazily as `lumen:diagnostics[kind=<kind>]`. The
/// most recent events are kept for inspection.
#[derive(Debug)]
pub struct DiagnosticsService {
    bus: Arc<EventBus<DiagnosticEvent>>,
    registry: MetricsRegistry,
    counters: HashMap<&'static str, CounterHandle>,
    recent: VecDeque<DiagnosticEvent>,
    history: usize,
    total: u64,
}

impl DiagnosticsService {
    /// A service draining `bus` into `registry`, remembering the last
    /// `history` events.
    pub fn new(bus: Arc<EventBus<DiagnosticEvent>>, registry: MetricsRegistry, history: usize) -> Self {
        Self {
            bus,
            registry,
            counters: HashMap::new(),
            recent: VecDeque::with_capacity(history),
            history,
            total: 0,
        }
    }

    /// The bus this service drains.
    pub fn bus(&self) -> &Arc<EventBus<DiagnosticEvent>> {
        &self.bus
    }

    /// Drains every queued event and returns how many were processed.
    pub fn pump(&mut self) -> MetricsResult<usize> {
        let events = self.bus.drain();
        let drained = events.len();
        for event in events {
            self.record(event)?;
        }
        if drained > 0 {
            log::trace!("DiagnosticsService: processed {drained} events");
        }
        Ok(drained)
    }

    fn record(&mut self, event: DiagnosticEvent) -> MetricsResult<()> {
        let kind = event.kind();
        if !self.counters.contains_key(kind) {
            let id = MetricId::lumen("diagnostics").with_label("kind", kind);
            let handle = self
                .registry
                .register_counter(id, "Diagnostic events by kind")?;
            self.counters.insert(kind, handle);
        }
        let counter = &self.counters[kind];
        counter.increment()?;
        self.total += 1;

        if self.history > 0 {
            if self.recent.len() == self.history {
                self.recent.pop_front();
            }
            self.recent.push_back(event);
        }
        Ok(())
    }

    /// Events of `kind` processed so far.
    pub fn count(&self, kind: &str) -> u64 {
        self.counters
            .get(kind)
            .and_then(|counter| counter.get().ok())
            .unwrap_or(0)
    }

    /// Events processed so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The most recent events, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &DiagnosticEvent> {
        self.recent.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::frame::RenderableId;
    use lumen_core::{DiagnosticSink, SkipReason};

    fn skipped(id: u64) -> DiagnosticEvent {
        DiagnosticEvent::DrawSkipped {
            renderable: RenderableId(id),
            reason: SkipReason::PipelinePending,
        }
    }

    #[test]
    fn counts_by_kind() {
        let bus = Arc::new(EventBus::new());
        let registry = MetricsRegistry::new();
        let mut service = DiagnosticsService::new(bus.clone(), registry.clone(), 2);

        bus.emit(skipped(1));
        bus.emit(skipped(2));
        bus.emit(DiagnosticEvent::BlobRejected {
            reason: "bad magic".into(),
        });
        assert_eq!(service.pump().unwrap(), 3);
        assert_eq!(service.pump().unwrap(), 0);

        assert_eq!(service.count("draw_skipped"), 2);
        assert_eq!(service.count("blob_rejected"), 1);
        assert_eq!(service.count("device_lost"), 0);
        assert_eq!(service.total(), 3);

        let id = MetricId::lumen("diagnostics").with_label("kind", "draw_skipped");
        assert_eq!(registry.get_metric(&id).unwrap().value.as_counter(), Some(2));
    }

    #[test]
    fn history_is_bounded() {
        let bus = Arc::new(EventBus::new());
        let mut service = DiagnosticsService::new(bus.clone(), MetricsRegistry::new(), 2);
        for id in 0..5 {
            bus.emit(skipped(id));
        }
        service.pump().unwrap();
        let recent: Vec<_> = service.recent().cloned().collect();
        assert_eq!(recent, vec![skipped(3), skipped(4)]);
    }
}
