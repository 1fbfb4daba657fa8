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

//! Command recording contract.

use super::{CommandBufferId, DescriptorRange, PipelineHandle, QueueKind, ResourceId};
use crate::resource::ResourceState;

/// Arguments of a non-indexed, instanced draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawArgs {
    /// Number of vertices to draw.
    pub vertex_count: u32,
    /// Number of instances to draw.
    pub instance_count: u32,
    /// Index of the first vertex.
    pub first_vertex: u32,
    /// Index of the first instance.
    pub first_instance: u32,
}

impl DrawArgs {
    /// A single instance of `vertex_count` vertices.
    pub fn vertices(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

impl Default for DrawArgs {
    fn default() -> Self {
        Self::vertices(3)
    }
}

/// A draw as seen by the command list.
///
/// `descriptor_offset` is the index, relative to the start of the currently
/// bound descriptor range, of this draw's first binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    /// The draw arguments.
    pub args: DrawArgs,
    /// Offset of the draw's bindings in the bound descriptor range.
    pub descriptor_offset: u32,
}

/// A single state transition of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBarrier {
    /// The transitioned resource.
    pub resource: ResourceId,
    /// The state before the barrier.
    pub before: ResourceState,
    /// The state after the barrier.
    pub after: ResourceState,
}

/// An open command list recording work for one queue.
///
/// Command lists are recorded on a single thread and then consumed by
/// [`CommandList::finish`], which yields an id the device can submit.
pub trait CommandList: Send {
    /// The queue this list records for.
    fn queue(&self) -> QueueKind;

    /// Binds a compiled pipeline for subsequent draws.
    fn set_pipeline(&mut self, pipeline: PipelineHandle);

    /// Binds a descriptor range for subsequent draws.
    fn set_descriptor_table(&mut self, range: &DescriptorRange);

    /// Records a batch of resource state transitions.
    fn resource_barriers(&mut self, barriers: &[ResourceBarrier]);

    /// Clears the contents of a resource.
    fn clear_resource(&mut self, resource: ResourceId);

    /// Records a draw.
    fn draw(&mut self, call: &DrawCall);

    /// Records a compute dispatch.
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    /// Copies staging bytes into `target` at `offset`.
    fn copy_to_resource(&mut self, target: ResourceId, offset: u64, data: &[u8]);

    /// Closes the list and returns a submittable buffer id.
    fn finish(self: Box<Self>) -> CommandBufferId;
}
