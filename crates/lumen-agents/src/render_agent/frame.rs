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

use ahash::AHashMap;
use lumen_core::frame::{MaterialId, Renderable};
use lumen_core::pipeline::MaterialDescription;
use lumen_core::resource::{PoolHandle, RenderTargetDescription};
use lumen_core::telemetry::FrameMetrics;
use lumen_data::ResidencyReport;
use lumen_lanes::BatchStats;

/// Everything the scene layer hands over for one frame.
///
/// The description is read-only for the duration of the frame.
#[derive(Debug, Clone, Default)]
pub struct FrameDescription {
    /// The draws of the frame, in submission order.
    pub renderables: Vec<Renderable>,
    /// The materials renderables refer to.
    pub materials: AHashMap<MaterialId, MaterialDescription>,
    /// Render targets needed only for this frame. They are acquired before
    /// recording, cleared when reused and returned to the pool after submission.
    pub render_targets: Vec<RenderTargetDescription>,
}

impl FrameDescription {
    /// An empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a material to the table.
    pub fn with_material(mut self, id: MaterialId, material: MaterialDescription) -> Self {
        self.materials.insert(id, material);
        self
    }

    /// Adds a renderable.
    pub fn with_renderable(mut self, renderable: Renderable) -> Self {
        self.renderables.push(renderable);
        self
    }

    /// Adds a transient render target.
    pub fn with_render_target(mut self, description: RenderTargetDescription) -> Self {
        self.render_targets.push(description);
        self
    }
}

/// What happened during one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    /// The frame number, equal to the graphics fence value it signaled.
    pub frame: u64,
    /// Recording counters of the command batcher.
    pub batch: BatchStats,
    /// The frame's metrics, as published.
    pub metrics: FrameMetrics,
    /// Transient render targets used by the frame, in request order. Already
    /// released back to their pool.
    pub render_targets: Vec<PoolHandle>,
    /// Clears recorded at the start of the frame.
    pub clears: usize,
    /// What the end-of-frame residency pass did.
    pub residency: ResidencyReport,
    /// Pipelines requested this frame that were still compiling when recording
    /// started.
    pub pending_pipelines: usize,
}
