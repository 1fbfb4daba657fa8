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

//! GPU memory management: byte-range suballocation and the per-class heap pool.

mod error;
mod heap_pool;
mod suballocator;

pub use error::MemoryError;
pub use heap_pool::{HeapPool, HeapPoolStats};
pub use suballocator::{AllocationId, MemorySuballocator, Relocation, SuballocatorStats};

use lumen_core::gpu::HeapId;
use lumen_core::resource::HeapClass;

/// A byte range carved out of a heap.
///
/// Exclusively owned by whoever received it until it is handed back to the
/// allocator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapAllocation {
    /// The heap the range lives in.
    pub heap: HeapId,
    /// The usage class of that heap.
    pub class: HeapClass,
    /// Identifier of the allocation inside its heap.
    pub id: AllocationId,
    /// Byte offset inside the heap.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

impl HeapAllocation {
    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Returns `true` if both ranges live in the same heap and share a byte.
    pub fn overlaps(&self, other: &HeapAllocation) -> bool {
        self.heap == other.heap && self.offset < other.end() && other.offset < self.end()
    }
}
