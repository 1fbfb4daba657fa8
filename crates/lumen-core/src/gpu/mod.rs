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

//! Backend-agnostic contracts for the thin platform layer.
//!
//! This module defines the "common language" between the orchestration core and
//! a concrete graphics API. It describes *what* the core needs from the platform
//! (heaps, placed resources, descriptor tables, command lists, queues, fences and
//! a pipeline compiler) while the *how* lives in a backend crate such as
//! `lumen-infra`, which implements these traits.

pub mod command;
pub mod compiler;
pub mod descriptor;
pub mod device;
pub mod fence;

pub use self::command::{CommandList, DrawArgs, DrawCall, ResourceBarrier};
pub use self::compiler::{CompileRequest, PipelineCompiler};
pub use self::descriptor::{DescriptorRange, DescriptorTier};
pub use self::device::{GpuDevice, HeapDescriptor, PlacedResourceDescriptor, ResourceLayout};
pub use self::fence::FenceObserver;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

opaque_id!(
    /// An opaque handle to a GPU memory heap created by the device.
    HeapId
);
opaque_id!(
    /// An opaque handle to a placed GPU resource (texture, buffer or render target).
    ResourceId
);
opaque_id!(
    /// An opaque handle to a GPU-visible descriptor table.
    DescriptorTableId
);
opaque_id!(
    /// An opaque handle to a fence primitive.
    FenceId
);
opaque_id!(
    /// An opaque handle to a compiled pipeline state object.
    PipelineHandle
);
opaque_id!(
    /// An opaque handle to a finished, submittable command buffer.
    CommandBufferId
);

/// The hardware queues the core schedules work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueKind {
    /// The general-purpose queue used for draws.
    Graphics,
    /// The dedicated transfer queue used by the upload path.
    Copy,
    /// The asynchronous compute queue.
    Compute,
}

impl QueueKind {
    /// All queue kinds, in a fixed order.
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Copy, QueueKind::Compute];

    /// A short lowercase name, suitable for labels and metric dimensions.
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Copy => "copy",
            QueueKind::Compute => "compute",
        }
    }
}
