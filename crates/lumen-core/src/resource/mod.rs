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

//! Descriptions, states and handles for pooled GPU resources.

mod format;

pub use self::format::TextureFormat;

use crate::utils::align_up;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placement alignment for buffers, in bytes.
pub const BUFFER_PLACEMENT_ALIGNMENT: u64 = 256;
/// Placement alignment for textures and render targets, in bytes.
pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// The usage class of a GPU heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeapClass {
    /// GPU-local memory.
    Default,
    /// CPU-writable memory used for staging uploads.
    Upload,
    /// CPU-readable memory used for readbacks.
    Readback,
}

impl HeapClass {
    /// All heap classes, in a fixed order.
    pub const ALL: [HeapClass; 3] = [HeapClass::Default, HeapClass::Upload, HeapClass::Readback];

    /// A short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            HeapClass::Default => "default",
            HeapClass::Upload => "upload",
            HeapClass::Readback => "readback",
        }
    }
}

/// The broad kind of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// A sampled texture.
    Texture,
    /// A linear buffer.
    Buffer,
    /// A texture used as a color or depth attachment.
    RenderTarget,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Texture => write!(f, "texture"),
            ResourceKind::Buffer => write!(f, "buffer"),
            ResourceKind::RenderTarget => write!(f, "render target"),
        }
    }
}

/// The GPU-side state of a resource, as tracked for barrier emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Freshly created; contents undefined.
    Undefined,
    /// Generic state shared by all queues.
    Common,
    /// Source of a copy operation.
    CopySource,
    /// Destination of a copy operation.
    CopyDest,
    /// Read by a shader stage.
    ShaderRead,
    /// Read and written by a shader stage.
    UnorderedAccess,
    /// Bound as a color attachment.
    RenderTarget,
    /// Bound as a writable depth attachment.
    DepthWrite,
    /// Bound as a read-only depth attachment.
    DepthRead,
    /// Bound as a vertex buffer.
    VertexBuffer,
    /// Bound as an index buffer.
    IndexBuffer,
    /// Bound as a constant buffer.
    ConstantBuffer,
}

bitflags! {
    /// The allowed usages of a texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// The texture can be sampled from shaders.
        const SAMPLED = 1 << 0;
        /// The texture can be written from shaders.
        const STORAGE = 1 << 1;
        /// The texture can be used as the destination of a copy.
        const COPY_DST = 1 << 2;
        /// The texture can be used as the source of a copy.
        const COPY_SRC = 1 << 3;
    }
}

bitflags! {
    /// The allowed usages of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// The buffer can be bound as a vertex buffer.
        const VERTEX = 1 << 0;
        /// The buffer can be bound as an index buffer.
        const INDEX = 1 << 1;
        /// The buffer can be bound as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// The buffer can be bound as a storage buffer.
        const STORAGE = 1 << 3;
        /// The buffer can be used as the destination of a copy.
        const COPY_DST = 1 << 4;
        /// The buffer can be used as the source of a copy.
        const COPY_SRC = 1 << 5;
    }
}

/// Structural description of a pooled texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescription {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of mip levels (at least 1).
    pub mip_levels: u32,
    /// Pixel format.
    pub format: TextureFormat,
    /// Allowed usages.
    pub usage: TextureUsage,
}

impl TextureDescription {
    /// Creates a single-mip, sampled and copy-destination 2D texture description.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            format,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        }
    }

    /// Total byte size of all mip levels.
    pub fn size_bytes(&self) -> u64 {
        let bpp = self.format.bytes_per_pixel() as u64;
        (0..self.mip_levels.max(1))
            .map(|mip| {
                let w = (self.width >> mip).max(1) as u64;
                let h = (self.height >> mip).max(1) as u64;
                w * h * bpp
            })
            .sum()
    }

    /// Size rounded up to the texture placement alignment.
    pub fn placement_size(&self) -> u64 {
        align_up(self.size_bytes(), TEXTURE_PLACEMENT_ALIGNMENT)
    }
}

/// Structural description of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    /// Size in bytes.
    pub size: u64,
    /// Allowed usages.
    pub usage: BufferUsage,
    /// The heap class the buffer lives in.
    pub heap_class: HeapClass,
}

impl BufferDescription {
    /// Size rounded up to the buffer placement alignment.
    pub fn placement_size(&self) -> u64 {
        align_up(self.size.max(1), BUFFER_PLACEMENT_ALIGNMENT)
    }
}

/// Structural description of a pooled render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetDescription {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format. Depth formats produce depth attachments.
    pub format: TextureFormat,
    /// MSAA sample count (1 for no multisampling).
    pub sample_count: u32,
}

impl RenderTargetDescription {
    /// Total byte size of the attachment, including all samples.
    pub fn size_bytes(&self) -> u64 {
        self.width as u64
            * self.height as u64
            * self.format.bytes_per_pixel() as u64
            * self.sample_count.max(1) as u64
    }

    /// Size rounded up to the texture placement alignment.
    pub fn placement_size(&self) -> u64 {
        align_up(self.size_bytes(), TEXTURE_PLACEMENT_ALIGNMENT)
    }

    /// The state a render target must be in to be written by a pass.
    pub fn attachment_state(&self) -> ResourceState {
        if self.format.is_depth() {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        }
    }
}

/// How a pooled resource participates in residency management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResidencyPolicy {
    /// Never evicted automatically.
    #[default]
    Normal,
    /// Ordered by recency and evicted when the pool is over budget.
    Streaming,
}

/// A key identifying an object owned by a resource pool.
///
/// The handle carries the pool membership (kind + slot) and a generation so
/// stale handles are detected after the slot is recycled. Resources never hold
/// a reference back to their pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHandle {
    /// The kind of pool the handle belongs to.
    pub kind: ResourceKind,
    /// Slot index inside the pool.
    pub index: u32,
    /// Slot generation at acquisition time.
    pub generation: u32,
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", self.kind, self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_size_accounts_for_mips() {
        let mut desc = TextureDescription::new_2d(4, 4, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.size_bytes(), 64);
        desc.mip_levels = 3;
        // 4x4 + 2x2 + 1x1 texels
        assert_eq!(desc.size_bytes(), (16 + 4 + 1) * 4);
        assert_eq!(desc.placement_size(), TEXTURE_PLACEMENT_ALIGNMENT);
    }

    #[test]
    fn render_target_attachment_state_follows_format() {
        let color = RenderTargetDescription {
            width: 8,
            height: 8,
            format: TextureFormat::Rgba16Float,
            sample_count: 1,
        };
        let depth = RenderTargetDescription {
            format: TextureFormat::Depth32Float,
            ..color
        };
        assert_eq!(color.attachment_state(), ResourceState::RenderTarget);
        assert_eq!(depth.attachment_state(), ResourceState::DepthWrite);
    }

    #[test]
    fn buffer_placement_is_aligned() {
        let desc = BufferDescription {
            size: 300,
            usage: BufferUsage::UNIFORM,
            heap_class: HeapClass::Upload,
        };
        assert_eq!(desc.placement_size(), 512);
    }
}
