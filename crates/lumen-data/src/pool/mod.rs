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

//! Object pools for GPU resources.
//!
//! A [`ResourcePool`] recycles objects by structural description: releasing
//! an object parks it in a per-description free queue, and the next acquire
//! of the same description gets it back without touching the heap. Objects
//! that leave the pool for good go through a fence-tagged [`ReclaimQueue`]
//! so nothing the GPU may still read is freed early.
//!
//! [`ReclaimQueue`]: crate::ReclaimQueue

mod pooled;
mod residency;
mod resource_pool;

pub use pooled::{Buffer, Placement, PooledResource, RenderTarget, ResourceParts, Texture};
pub use residency::{ResidencyInfo, ResidencyReport};
pub use resource_pool::{PoolStats, ResourcePool};

use crate::descriptors::{DescriptorAllocator, DescriptorError};
use crate::memory::{HeapPool, MemoryError};
use lumen_core::diagnostics::DiagnosticSink;
use lumen_core::error::DeviceError;
use lumen_core::gpu::{FenceObserver, GpuDevice};
use lumen_core::resource::PoolHandle;
use thiserror::Error;

/// The managers a pool operation draws on, borrowed for one call.
pub struct PoolContext<'a> {
    /// The device resources are placed on.
    pub device: &'a dyn GpuDevice,
    /// Heap memory.
    pub heaps: &'a mut HeapPool,
    /// Static descriptors for shader-visible kinds.
    pub descriptors: &'a mut DescriptorAllocator,
    /// The graphics timeline, consulted when an eviction pass must free memory now.
    pub fences: &'a dyn FenceObserver,
    /// Where out-of-memory and eviction events go.
    pub diagnostics: &'a dyn DiagnosticSink,
    /// The frame being recorded. Its number is the graphics fence value it signals.
    pub frame: u64,
}

/// An error of a resource pool.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    /// The handle is unknown, stale, of another kind, or not currently acquired.
    #[error("stale or unknown pool handle {0}")]
    StaleHandle(PoolHandle),
    /// Heap allocation failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// Descriptor allocation failed.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// The device refused to create the resource.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl ResourceError {
    /// Returns `true` if the error must halt the frame loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            ResourceError::Descriptor(err) => err.is_fatal(),
            ResourceError::Device(DeviceError::DeviceLost(_))
            | ResourceError::Memory(MemoryError::Device(DeviceError::DeviceLost(_))) => true,
            _ => false,
        }
    }
}
