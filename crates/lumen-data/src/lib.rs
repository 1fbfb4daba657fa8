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

//! # Lumen Data
//!
//! The render-thread owned managers of GPU memory and bindings:
//!
//! - [`memory`]: byte-range suballocation inside heaps, and the per-class heap pool.
//! - [`descriptors`]: the two-tier descriptor table (static memo + per-frame ring).
//! - [`pool`]: generic object pools for textures, buffers and render targets,
//!   with residency tracking and fence-deferred reclamation.
//!
//! All of these are `&mut self` APIs driven from the render thread. They talk
//! to the platform through `&dyn GpuDevice` passed in by the caller.

#![warn(missing_docs)]

pub mod descriptors;
pub mod memory;
pub mod pool;
pub mod reclaim;

pub use descriptors::{
    DescriptorAllocator, DescriptorError, DescriptorFrameStats, PromotionPolicy,
};
pub use memory::{
    AllocationId, HeapAllocation, HeapPool, HeapPoolStats, MemoryError, MemorySuballocator,
    Relocation, SuballocatorStats,
};
pub use pool::{
    Buffer, PoolContext, PoolStats, PooledResource, RenderTarget, ResidencyInfo, ResidencyReport,
    ResourceError, ResourcePool, Texture,
};
pub use reclaim::ReclaimQueue;
