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

use ahash::AHashSet;
use lumen_core::diagnostics::SkipReason;
use lumen_core::gpu::{PipelineHandle, ResourceId};
use lumen_core::pipeline::PipelineKey;
use lumen_core::resource::{PoolHandle, ResourceKind};
use lumen_data::{Buffer, RenderTarget, ResourcePool, Texture};
use lumen_lanes::{DrawResolver, PipelineStateCache};

/// Resolves pipeline keys and pool handles for the command batcher during
/// one frame.
pub(super) struct FrameResolver<'a> {
    pub(super) pipelines: &'a PipelineStateCache,
    pub(super) requested: &'a AHashSet<PipelineKey>,
    pub(super) textures: &'a ResourcePool<Texture>,
    pub(super) buffers: &'a ResourcePool<Buffer>,
    pub(super) render_targets: &'a ResourcePool<RenderTarget>,
    pub(super) fence_value: u64,
}

impl DrawResolver for FrameResolver<'_> {
    fn pipeline(&mut self, key: &PipelineKey) -> Result<PipelineHandle, SkipReason> {
        if let Some(handle) = self.pipelines.get_pinned(key, self.fence_value) {
            return Ok(handle);
        }
        if self.pipelines.failure(key).is_some() {
            return Err(SkipReason::PipelineFailed);
        }
        // A key nobody requested has no material in the frame's table.
        if self.requested.contains(key) {
            Err(SkipReason::PipelinePending)
        } else {
            Err(SkipReason::PipelineFailed)
        }
    }

    fn resource(&mut self, handle: PoolHandle) -> Option<ResourceId> {
        match handle.kind {
            ResourceKind::Texture => self.textures.get(handle).map(Texture::resource),
            ResourceKind::Buffer => self.buffers.get(handle).map(Buffer::resource),
            ResourceKind::RenderTarget => self.render_targets.get(handle).map(RenderTarget::resource),
        }
    }
}
