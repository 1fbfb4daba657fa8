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

use super::AllocationId;
use lumen_core::error::DeviceError;
use lumen_core::resource::HeapClass;
use thiserror::Error;

/// An error of the memory subsystem.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    /// No heap of the class can satisfy the request. Recoverable by eviction.
    #[error("out of {} heap memory ({requested} bytes requested)", class.name())]
    OutOfMemory {
        /// The exhausted heap class.
        class: HeapClass,
        /// The requested size in bytes.
        requested: u64,
    },
    /// The request itself is malformed (zero size, bad alignment).
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),
    /// The allocation is not live in this allocator (double free or foreign range).
    #[error("unknown allocation {0:?}")]
    UnknownAllocation(AllocationId),
    /// The device refused to create a heap.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl MemoryError {
    /// Returns `true` for errors that an eviction pass may resolve.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, MemoryError::OutOfMemory { .. })
    }
}
