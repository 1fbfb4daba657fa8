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

//! The device contract: heaps, placed resources, descriptor tables, queues and fences.

use super::{CommandBufferId, CommandList, DescriptorTableId, FenceId, HeapId, QueueKind, ResourceId};
use crate::error::DeviceError;
use crate::resource::{BufferUsage, HeapClass, TextureFormat, TextureUsage};
use std::fmt::Debug;
use std::time::Duration;

/// Parameters for creating a GPU heap.
#[derive(Debug, Clone)]
pub struct HeapDescriptor {
    /// The usage class of the heap.
    pub class: HeapClass,
    /// Heap size in bytes.
    pub size: u64,
    /// Debug label.
    pub label: String,
}

/// The memory layout of a placed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLayout {
    /// A linear buffer.
    Buffer {
        /// Size in bytes.
        size: u64,
        /// Allowed usages.
        usage: BufferUsage,
    },
    /// A 2D texture, optionally usable as an attachment.
    Texture {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Number of mip levels.
        mip_levels: u32,
        /// Samples per pixel.
        sample_count: u32,
        /// Pixel format.
        format: TextureFormat,
        /// Allowed usages.
        usage: TextureUsage,
        /// Whether the texture is bound as a color or depth attachment.
        attachment: bool,
    },
}

/// Parameters for placing a resource inside an existing heap.
#[derive(Debug, Clone)]
pub struct PlacedResourceDescriptor {
    /// The heap that backs the resource.
    pub heap: HeapId,
    /// Byte offset inside the heap.
    pub offset: u64,
    /// Byte size reserved for the resource.
    pub size: u64,
    /// Memory layout.
    pub layout: ResourceLayout,
    /// Debug label.
    pub label: String,
}

/// The minimal platform surface the orchestration core drives.
///
/// Implementations must be thread-safe: the render thread records and submits
/// while the copy-submission thread issues uploads through the same device.
pub trait GpuDevice: Send + Sync + Debug + 'static {
    // --- Memory ---

    /// Creates a heap of the requested class and size.
    fn create_heap(&self, descriptor: &HeapDescriptor) -> Result<HeapId, DeviceError>;

    /// Destroys a heap. All resources placed in it must already be destroyed.
    fn destroy_heap(&self, id: HeapId);

    /// Places a resource at an offset inside a heap.
    fn create_placed_resource(
        &self,
        descriptor: &PlacedResourceDescriptor,
    ) -> Result<ResourceId, DeviceError>;

    /// Destroys a placed resource. The heap range is not freed by this call.
    fn destroy_resource(&self, id: ResourceId);

    // --- Descriptors ---

    /// Creates a descriptor table with `capacity` entries.
    fn create_descriptor_table(&self, capacity: u32) -> Result<DescriptorTableId, DeviceError>;

    /// Writes descriptors for `resources` starting at index `start`.
    fn write_descriptors(
        &self,
        table: DescriptorTableId,
        start: u32,
        resources: &[ResourceId],
    ) -> Result<(), DeviceError>;

    // --- Commands & queues ---

    /// Opens a command list for `queue`.
    fn create_command_list(
        &self,
        queue: QueueKind,
        label: &str,
    ) -> Result<Box<dyn CommandList>, DeviceError>;

    /// Submits finished command buffers to `queue`, in order.
    fn submit(&self, queue: QueueKind, buffers: &[CommandBufferId]) -> Result<(), DeviceError>;

    /// Makes subsequent work on `queue` wait until `fence` reaches `value`.
    fn queue_wait(&self, queue: QueueKind, fence: FenceId, value: u64) -> Result<(), DeviceError>;

    // --- Fences ---

    /// Creates a fence whose completed value starts at zero.
    fn create_fence(&self) -> Result<FenceId, DeviceError>;

    /// Enqueues a signal of `fence` to `value` after all work already submitted to `queue`.
    fn signal(&self, queue: QueueKind, fence: FenceId, value: u64) -> Result<(), DeviceError>;

    /// Returns the last value the GPU signaled on `fence`.
    fn fence_value(&self, fence: FenceId) -> Result<u64, DeviceError>;

    /// Blocks until `fence` reaches `value` or `timeout` elapses.
    ///
    /// Returns `Ok(true)` if the value was reached, `Ok(false)` on timeout.
    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Duration)
        -> Result<bool, DeviceError>;
}
