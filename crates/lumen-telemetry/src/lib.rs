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

//! # Lumen Telemetry
//!
//! Observability for the orchestration core: a metrics registry over a
//! pluggable storage backend, a rolling frame-time tracker, the per-frame
//! metrics publisher, a service that turns diagnostic events into counters,
//! and logger initialization for binaries.

#![warn(missing_docs)]

pub mod diagnostics;
pub mod frame_time;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod storage;
pub mod utils;

pub use diagnostics::DiagnosticsService;
pub use frame_time::FrameTimeTracker;
pub use logging::init_logging;
pub use metrics::{CounterHandle, GaugeHandle, HistogramHandle, MetricSnapshot, MetricsRegistry};
pub use publisher::FrameMetricsPublisher;
pub use storage::{InMemoryBackend, MetricsBackend};
pub use utils::timer::ScopedMetricTimer;
