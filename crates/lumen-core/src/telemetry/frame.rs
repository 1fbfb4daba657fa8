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

//! The per-frame metrics report.

use serde::Serialize;

/// A snapshot of the renderer's health after one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FrameMetrics {
    /// The frame number the report describes.
    pub frame: u64,
    /// Rolling mean of the CPU frame time, in milliseconds.
    pub frame_time_avg_ms: f64,
    /// Rolling variance of the CPU frame time, in squared milliseconds.
    pub frame_time_variance_ms2: f64,
    /// Pipeline cache hit rate over the cache's lifetime, in `[0, 1]`.
    pub pso_hit_rate: f64,
    /// Descriptor binds (static and dynamic) performed this frame.
    pub descriptor_bindings: u64,
    /// Barriers emitted this frame.
    pub barriers: u64,
    /// Draws recorded this frame.
    pub draws_recorded: u64,
    /// Draws skipped this frame.
    pub draws_skipped: u64,
    /// Heap fragmentation, as a percentage.
    pub fragmentation_percent: f64,
    /// Number of live heaps across all classes.
    pub heap_count: usize,
    /// Whether `begin_frame` had to wait for the GPU.
    pub waited_on_gpu: bool,
}
