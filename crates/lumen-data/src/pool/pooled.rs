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

//! The capability trait pooled objects implement, and the three kinds the
//! renderer pools.

use crate::memory::HeapAllocation;
use lumen_core::gpu::{DescriptorRange, ResourceId, ResourceLayout};
use lumen_core::resource::{
    BufferDescription, BufferUsage, HeapClass, RenderTargetDescription, ResourceKind,
    ResourceState, TextureDescription, TextureUsage, BUFFER_PLACEMENT_ALIGNMENT,
    TEXTURE_PLACEMENT_ALIGNMENT,
};
use std::fmt::Debug;
use std::hash::Hash;

/// Where and how an object of a given description is placed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Heap class to allocate from.
    pub class: HeapClass,
    /// Bytes to reserve.
    pub size: u64,
    /// Required start alignment.
    pub alignment: u64,
    /// The device-side layout of the resource.
    pub layout: ResourceLayout,
}

/// The GPU-side handles backing one pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceParts {
    /// The placed device resource.
    pub resource: ResourceId,
    /// The heap range it occupies.
    pub allocation: HeapAllocation,
    /// Its static descriptor, for kinds that are shader-visible.
    pub descriptor: Option<DescriptorRange>,
}

/// What a [`ResourcePool`](super::ResourcePool) needs from the objects it pools.
pub trait PooledResource: Debug + Send + Sized + 'static {
    /// The structural description objects are keyed by.
    type Description: Copy + Eq + Hash + Debug + Send + 'static;

    /// The kind stamped into every handle of this pool.
    const KIND: ResourceKind;

    /// Memory placement of a new object of `description`.
    fn placement(description: &Self::Description) -> Placement;

    /// Whether new objects get a static descriptor.
    fn needs_descriptor(description: &Self::Description) -> bool;

    /// The state a freshly created or cleared object is in.
    fn initial_state(description: &Self::Description) -> ResourceState;

    /// Wraps freshly created GPU handles.
    fn from_parts(description: Self::Description, parts: ResourceParts) -> Self;

    /// The description this object was created from.
    fn describe(&self) -> &Self::Description;

    /// The GPU handles backing the object.
    fn parts(&self) -> &ResourceParts;

    /// Replaces the GPU handles after the object was moved in memory.
    fn replace_parts(&mut self, parts: ResourceParts);

    /// Prepares the object for reuse. Returns `true` if it must be cleared.
    fn reset(&mut self) -> bool;

    /// Gives up the GPU handles so they can be destroyed.
    fn release_handles(self) -> ResourceParts;
}

/// A pooled sampled texture.
#[derive(Debug)]
pub struct Texture {
    description: TextureDescription,
    parts: ResourceParts,
}

impl Texture {
    /// The placed device resource.
    pub fn resource(&self) -> ResourceId {
        self.parts.resource
    }

    /// The static descriptor of the texture.
    pub fn descriptor(&self) -> Option<DescriptorRange> {
        self.parts.descriptor
    }
}

impl PooledResource for Texture {
    type Description = TextureDescription;
    const KIND: ResourceKind = ResourceKind::Texture;

    fn placement(description: &TextureDescription) -> Placement {
        Placement {
            class: HeapClass::Default,
            size: description.placement_size(),
            alignment: TEXTURE_PLACEMENT_ALIGNMENT,
            layout: ResourceLayout::Texture {
                width: description.width,
                height: description.height,
                mip_levels: description.mip_levels.max(1),
                sample_count: 1,
                format: description.format,
                usage: description.usage,
                attachment: false,
            },
        }
    }

    fn needs_descriptor(description: &TextureDescription) -> bool {
        description
            .usage
            .intersects(TextureUsage::SAMPLED | TextureUsage::STORAGE)
    }

    fn initial_state(_: &TextureDescription) -> ResourceState {
        ResourceState::Common
    }

    fn from_parts(description: TextureDescription, parts: ResourceParts) -> Self {
        Self { description, parts }
    }

    fn describe(&self) -> &TextureDescription {
        &self.description
    }

    fn parts(&self) -> &ResourceParts {
        &self.parts
    }

    fn replace_parts(&mut self, parts: ResourceParts) {
        self.parts = parts;
    }

    // Zero-initialized on creation; reuse keeps the previous contents.
    fn reset(&mut self) -> bool {
        false
    }

    fn release_handles(self) -> ResourceParts {
        self.parts
    }
}

/// A pooled linear buffer.
#[derive(Debug)]
pub struct Buffer {
    description: BufferDescription,
    parts: ResourceParts,
}

impl Buffer {
    /// The placed device resource.
    pub fn resource(&self) -> ResourceId {
        self.parts.resource
    }

    /// The static descriptor, for uniform and storage buffers.
    pub fn descriptor(&self) -> Option<DescriptorRange> {
        self.parts.descriptor
    }

    /// Size in bytes as requested.
    pub fn size(&self) -> u64 {
        self.description.size
    }
}

impl PooledResource for Buffer {
    type Description = BufferDescription;
    const KIND: ResourceKind = ResourceKind::Buffer;

    fn placement(description: &BufferDescription) -> Placement {
        Placement {
            class: description.heap_class,
            size: description.placement_size(),
            alignment: BUFFER_PLACEMENT_ALIGNMENT,
            layout: ResourceLayout::Buffer {
                size: description.size,
                usage: description.usage,
            },
        }
    }

    fn needs_descriptor(description: &BufferDescription) -> bool {
        description
            .usage
            .intersects(BufferUsage::UNIFORM | BufferUsage::STORAGE)
    }

    fn initial_state(description: &BufferDescription) -> ResourceState {
        match description.heap_class {
            HeapClass::Upload => ResourceState::CopySource,
            HeapClass::Readback => ResourceState::CopyDest,
            HeapClass::Default => ResourceState::Common,
        }
    }

    fn from_parts(description: BufferDescription, parts: ResourceParts) -> Self {
        Self { description, parts }
    }

    fn describe(&self) -> &BufferDescription {
        &self.description
    }

    fn parts(&self) -> &ResourceParts {
        &self.parts
    }

    fn replace_parts(&mut self, parts: ResourceParts) {
        self.parts = parts;
    }

    fn reset(&mut self) -> bool {
        false
    }

    fn release_handles(self) -> ResourceParts {
        self.parts
    }
}

/// A pooled color or depth attachment.
#[derive(Debug)]
pub struct RenderTarget {
    description: RenderTargetDescription,
    parts: ResourceParts,
    reuses: u64,
}

impl RenderTarget {
    /// The placed device resource.
    pub fn resource(&self) -> ResourceId {
        self.parts.resource
    }

    /// The static descriptor used when the target is sampled by a later pass.
    pub fn descriptor(&self) -> Option<DescriptorRange> {
        self.parts.descriptor
    }

    /// How many times the target was handed out again after a release.
    pub fn reuses(&self) -> u64 {
        self.reuses
    }
}

impl PooledResource for RenderTarget {
    type Description = RenderTargetDescription;
    const KIND: ResourceKind = ResourceKind::RenderTarget;

    fn placement(description: &RenderTargetDescription) -> Placement {
        Placement {
            class: HeapClass::Default,
            size: description.placement_size(),
            alignment: TEXTURE_PLACEMENT_ALIGNMENT,
            layout: ResourceLayout::Texture {
                width: description.width,
                height: description.height,
                mip_levels: 1,
                sample_count: description.sample_count.max(1),
                format: description.format,
                usage: TextureUsage::SAMPLED,
                attachment: true,
            },
        }
    }

    fn needs_descriptor(_: &RenderTargetDescription) -> bool {
        true
    }

    fn initial_state(description: &RenderTargetDescription) -> ResourceState {
        description.attachment_state()
    }

    fn from_parts(description: RenderTargetDescription, parts: ResourceParts) -> Self {
        Self {
            description,
            parts,
            reuses: 0,
        }
    }

    fn describe(&self) -> &RenderTargetDescription {
        &self.description
    }

    fn parts(&self) -> &ResourceParts {
        &self.parts
    }

    fn replace_parts(&mut self, parts: ResourceParts) {
        self.parts = parts;
    }

    // Attachments carry the previous user's pixels; always start clean.
    fn reset(&mut self) -> bool {
        self.reuses += 1;
        true
    }

    fn release_handles(self) -> ResourceParts {
        self.parts
    }
}
