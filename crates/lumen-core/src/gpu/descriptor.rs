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

//! Descriptor table ranges.

use super::DescriptorTableId;

/// Which tier of the descriptor table a range was carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorTier {
    /// Long-lived bindings, memoized per resource.
    Static,
    /// Per-draw-batch bindings allocated from the frame ring.
    Dynamic,
}

/// A contiguous index range into a descriptor table.
///
/// The `generation` distinguishes reuses of the same indices: for static ranges
/// it is bumped every time a slot is recycled, for dynamic ranges it is the
/// fence value of the frame that owns the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    /// The table the range lives in.
    pub table: DescriptorTableId,
    /// The tier the range belongs to.
    pub tier: DescriptorTier,
    /// First descriptor index.
    pub start: u32,
    /// Number of descriptors.
    pub len: u32,
    /// Reuse generation.
    pub generation: u64,
}

impl DescriptorRange {
    /// One past the last index covered by the range.
    pub fn end(&self) -> u32 {
        self.start + self.len
    }

    /// Returns `true` if the two ranges share at least one descriptor index.
    pub fn overlaps(&self, other: &DescriptorRange) -> bool {
        self.table == other.table && self.start < other.end() && other.start < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, len: u32) -> DescriptorRange {
        DescriptorRange {
            table: DescriptorTableId(1),
            tier: DescriptorTier::Dynamic,
            start,
            len,
            generation: 0,
        }
    }

    #[test]
    fn overlap_detection() {
        assert!(range(0, 4).overlaps(&range(3, 2)));
        assert!(!range(0, 4).overlaps(&range(4, 2)));
        assert!(!range(10, 1).overlaps(&range(0, 10)));
    }
}
