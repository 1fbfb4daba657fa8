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

//! The per-frame draw submission vocabulary shared by the scene producer and
//! the command batcher.

use crate::gpu::DrawArgs;
use crate::pipeline::PipelineKey;
use crate::resource::{PoolHandle, ResourceState};
use std::fmt;

/// Identifies a material in the frame's material table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

/// Identifies a renderable within the scene producer's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderableId(pub u64);

impl fmt::Display for RenderableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "renderable#{}", self.0)
    }
}

/// The pass a renderable is drawn in. Buckets are recorded in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassBucket {
    /// Depth-tested opaque geometry, grouped by pipeline.
    Opaque,
    /// Blended geometry, drawn back-to-front.
    Transparent,
    /// Overlay geometry, drawn in submission order.
    Ui,
}

impl PassBucket {
    /// All buckets in recording order.
    pub const ALL: [PassBucket; 3] = [PassBucket::Opaque, PassBucket::Transparent, PassBucket::Ui];
}

/// One resource a draw reads or writes, and the state it needs it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBinding {
    /// The pooled resource.
    pub handle: PoolHandle,
    /// The state the resource must be in when the draw executes.
    pub state: ResourceState,
}

impl ResourceBinding {
    /// A binding read by the shader.
    pub fn shader_read(handle: PoolHandle) -> Self {
        Self {
            handle,
            state: ResourceState::ShaderRead,
        }
    }
}

/// A single draw as produced by the scene layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Renderable {
    /// Producer-side identity, used in diagnostics.
    pub id: RenderableId,
    /// The material the draw uses.
    pub material: MaterialId,
    /// The pipeline key of the material.
    pub key: PipelineKey,
    /// The pass the draw belongs to.
    pub bucket: PassBucket,
    /// Resources the draw binds, in shader binding order.
    pub bindings: Vec<ResourceBinding>,
    /// View-space depth. Larger is farther from the camera.
    pub depth: f32,
    /// Draw arguments.
    pub args: DrawArgs,
}
