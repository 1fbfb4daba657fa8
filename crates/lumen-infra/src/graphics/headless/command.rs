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

use super::device::HeadlessDevice;
use lumen_core::gpu::{
    CommandBufferId, CommandList, DescriptorRange, DrawCall, PipelineHandle, QueueKind,
    ResourceBarrier, ResourceId,
};

/// A command as recorded by a [`HeadlessCommandList`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// A pipeline bind.
    SetPipeline(PipelineHandle),
    /// A descriptor range bind.
    SetDescriptorTable(DescriptorRange),
    /// A batch of barriers.
    Barriers(Vec<ResourceBarrier>),
    /// A resource clear.
    Clear(ResourceId),
    /// A draw.
    Draw(DrawCall),
    /// A compute dispatch.
    Dispatch {
        /// Workgroups along X.
        x: u32,
        /// Workgroups along Y.
        y: u32,
        /// Workgroups along Z.
        z: u32,
    },
    /// A staging copy.
    Copy {
        /// The destination resource.
        target: ResourceId,
        /// Byte offset in the destination.
        offset: u64,
        /// The copied bytes.
        data: Vec<u8>,
    },
}

/// A command list that records into memory and registers itself with the
/// device when finished.
pub struct HeadlessCommandList {
    device: HeadlessDevice,
    queue: QueueKind,
    label: String,
    commands: Vec<RecordedCommand>,
}

impl HeadlessCommandList {
    pub(crate) fn new(device: HeadlessDevice, queue: QueueKind, label: &str) -> Self {
        Self {
            device,
            queue,
            label: label.to_string(),
            commands: Vec::new(),
        }
    }
}

impl CommandList for HeadlessCommandList {
    fn queue(&self) -> QueueKind {
        self.queue
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) {
        self.commands.push(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_descriptor_table(&mut self, range: &DescriptorRange) {
        self.commands.push(RecordedCommand::SetDescriptorTable(*range));
    }

    fn resource_barriers(&mut self, barriers: &[ResourceBarrier]) {
        if !barriers.is_empty() {
            self.commands.push(RecordedCommand::Barriers(barriers.to_vec()));
        }
    }

    fn clear_resource(&mut self, resource: ResourceId) {
        self.commands.push(RecordedCommand::Clear(resource));
    }

    fn draw(&mut self, call: &DrawCall) {
        self.commands.push(RecordedCommand::Draw(*call));
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch { x, y, z });
    }

    fn copy_to_resource(&mut self, target: ResourceId, offset: u64, data: &[u8]) {
        if self.queue != QueueKind::Copy {
            log::debug!(
                "HeadlessCommandList({}): staging copy recorded on the {} queue",
                self.label,
                self.queue.name()
            );
        }
        self.commands.push(RecordedCommand::Copy {
            target,
            offset,
            data: data.to_vec(),
        });
    }

    fn finish(self: Box<Self>) -> CommandBufferId {
        let this = *self;
        this.device
            .register_command_buffer(this.queue, this.label, this.commands)
    }
}
