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

//! Best-fit suballocation of a single heap.
//!
//! Free space is indexed twice: by `(size, offset)` for best-fit lookup and by
//! `offset` for coalescing a released range with its neighbours. Both indices
//! always describe the same set of disjoint, non-adjacent free segments.

use super::{HeapAllocation, MemoryError};
use ahash::AHashMap;
use lumen_core::gpu::HeapId;
use lumen_core::resource::HeapClass;
use lumen_core::utils::align_up;
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of a live allocation inside one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// An allocation moved by [`MemorySuballocator::defragment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// The heap the allocation lives in.
    pub heap: HeapId,
    /// The moved allocation.
    pub id: AllocationId,
    /// Offset before the move.
    pub old_offset: u64,
    /// Offset after the move.
    pub new_offset: u64,
    /// Size of the allocation.
    pub size: u64,
}

/// A snapshot of a suballocator's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SuballocatorStats {
    /// Heap size in bytes.
    pub capacity: u64,
    /// Bytes held by live allocations.
    pub used: u64,
    /// Bytes in free segments, including alignment padding.
    pub free: u64,
    /// Size of the largest free segment.
    pub largest_free: u64,
    /// Number of free segments.
    pub free_segments: usize,
    /// Number of live allocations.
    pub live_allocations: usize,
    /// `1 - largest_free / free`, or zero when nothing is free.
    pub fragmentation: f64,
}

#[derive(Debug, Clone, Copy)]
struct LiveRange {
    offset: u64,
    size: u64,
    alignment: u64,
    movable: bool,
}

/// Carves one fixed-size heap into reusable byte ranges.
#[derive(Debug)]
pub struct MemorySuballocator {
    heap: HeapId,
    class: HeapClass,
    capacity: u64,
    free_by_size: BTreeSet<(u64, u64)>,
    free_by_offset: BTreeMap<u64, u64>,
    live: AHashMap<AllocationId, LiveRange>,
    used: u64,
    next_id: u64,
}

impl MemorySuballocator {
    /// Creates an allocator covering `capacity` bytes of `heap`, all free.
    pub fn new(heap: HeapId, class: HeapClass, capacity: u64) -> Self {
        let mut allocator = Self {
            heap,
            class,
            capacity,
            free_by_size: BTreeSet::new(),
            free_by_offset: BTreeMap::new(),
            live: AHashMap::new(),
            used: 0,
            next_id: 1,
        };
        if capacity > 0 {
            allocator.insert_segment(0, capacity);
        }
        allocator
    }

    /// The heap this allocator manages.
    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// The usage class of the heap.
    pub fn class(&self) -> HeapClass {
        self.class
    }

    /// The heap size in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by live allocations.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Returns `true` when no allocation is live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Returns `true` if `allocation` is live in this heap at its recorded range.
    pub fn contains(&self, allocation: &HeapAllocation) -> bool {
        allocation.heap == self.heap
            && self
                .live
                .get(&allocation.id)
                .is_some_and(|r| r.offset == allocation.offset && r.size == allocation.size)
    }

    /// Allocates `size` bytes whose start is a multiple of `alignment`.
    ///
    /// Picks the smallest free segment that still fits once its start is
    /// aligned. The padding in front of the aligned start stays free.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<HeapAllocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidRequest(
                "zero-sized allocation".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidRequest(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let found = self
            .free_by_size
            .range((size, 0)..)
            .find(|&&(segment_size, segment_offset)| {
                let pad = align_up(segment_offset, alignment) - segment_offset;
                pad + size <= segment_size
            })
            .copied();

        let Some((segment_size, segment_offset)) = found else {
            return Err(MemoryError::OutOfMemory {
                class: self.class,
                requested: size,
            });
        };

        self.remove_segment(segment_offset, segment_size);
        let offset = align_up(segment_offset, alignment);
        let pad = offset - segment_offset;
        if pad > 0 {
            self.insert_segment(segment_offset, pad);
        }
        let tail = segment_size - pad - size;
        if tail > 0 {
            self.insert_segment(offset + size, tail);
        }

        let id = AllocationId(self.next_id);
        self.next_id += 1;
        self.live.insert(
            id,
            LiveRange {
                offset,
                size,
                alignment,
                movable: false,
            },
        );
        self.used += size;

        Ok(HeapAllocation {
            heap: self.heap,
            class: self.class,
            id,
            offset,
            size,
        })
    }

    /// Returns a range to the free list, merging it with adjacent free space.
    ///
    /// Ranges that are not live in this heap are rejected and leave the
    /// allocator untouched.
    pub fn deallocate(&mut self, allocation: &HeapAllocation) -> Result<(), MemoryError> {
        if !self.contains(allocation) {
            log::warn!(
                "MemorySuballocator({:?}): rejected release of {:?} [{}..{})",
                self.heap,
                allocation.id,
                allocation.offset,
                allocation.end()
            );
            return Err(MemoryError::UnknownAllocation(allocation.id));
        }
        self.live.remove(&allocation.id);
        self.used -= allocation.size;
        self.release_range(allocation.offset, allocation.size);
        Ok(())
    }

    /// Marks whether `defragment` may move the allocation.
    pub fn set_movable(&mut self, id: AllocationId, movable: bool) -> Result<(), MemoryError> {
        let range = self
            .live
            .get_mut(&id)
            .ok_or(MemoryError::UnknownAllocation(id))?;
        range.movable = movable;
        Ok(())
    }

    /// The current range of a live allocation.
    pub fn allocation(&self, id: AllocationId) -> Option<HeapAllocation> {
        self.live.get(&id).map(|r| HeapAllocation {
            heap: self.heap,
            class: self.class,
            id,
            offset: r.offset,
            size: r.size,
        })
    }

    /// Slides movable allocations toward the start of the heap.
    ///
    /// Non-movable allocations stay where they are and act as walls. Returns
    /// every move made; the caller must re-place the moved resources.
    pub fn defragment(&mut self) -> Vec<Relocation> {
        let mut order: Vec<(u64, AllocationId)> =
            self.live.iter().map(|(id, r)| (r.offset, *id)).collect();
        order.sort_unstable();

        let mut relocations = Vec::new();
        let mut cursor = 0u64;
        for (_, id) in order {
            let Some(range) = self.live.get_mut(&id) else {
                continue;
            };
            if range.movable {
                let target = align_up(cursor, range.alignment);
                if target < range.offset {
                    relocations.push(Relocation {
                        heap: self.heap,
                        id,
                        old_offset: range.offset,
                        new_offset: target,
                        size: range.size,
                    });
                    range.offset = target;
                }
            }
            cursor = cursor.max(range.offset + range.size);
        }

        if !relocations.is_empty() {
            self.rebuild_free_space();
            log::debug!(
                "MemorySuballocator({:?}): defragmented, {} allocations moved",
                self.heap,
                relocations.len()
            );
        }
        relocations
    }

    /// A snapshot of the current occupancy.
    pub fn stats(&self) -> SuballocatorStats {
        let free = self.capacity - self.used;
        let largest_free = self.largest_free();
        SuballocatorStats {
            capacity: self.capacity,
            used: self.used,
            free,
            largest_free,
            free_segments: self.free_by_offset.len(),
            live_allocations: self.live.len(),
            fragmentation: fragmentation(largest_free, free),
        }
    }

    /// Size of the largest free segment.
    pub fn largest_free(&self) -> u64 {
        self.free_by_size.last().map_or(0, |&(size, _)| size)
    }

    fn insert_segment(&mut self, offset: u64, size: u64) {
        self.free_by_size.insert((size, offset));
        self.free_by_offset.insert(offset, size);
    }

    fn remove_segment(&mut self, offset: u64, size: u64) {
        self.free_by_size.remove(&(size, offset));
        self.free_by_offset.remove(&offset);
    }

    fn release_range(&mut self, mut offset: u64, mut size: u64) {
        let previous = self
            .free_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = previous {
            if prev_offset + prev_size == offset {
                self.remove_segment(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free_by_offset.get(&(offset + size)) {
            self.remove_segment(offset + size, next_size);
            size += next_size;
        }
        self.insert_segment(offset, size);
    }

    fn rebuild_free_space(&mut self) {
        self.free_by_size.clear();
        self.free_by_offset.clear();
        let mut ranges: Vec<(u64, u64)> =
            self.live.values().map(|r| (r.offset, r.size)).collect();
        ranges.sort_unstable();

        let mut cursor = 0u64;
        for (offset, size) in ranges {
            if offset > cursor {
                self.insert_segment(cursor, offset - cursor);
            }
            cursor = cursor.max(offset + size);
        }
        if cursor < self.capacity {
            self.insert_segment(cursor, self.capacity - cursor);
        }
    }
}

/// `1 - largest / total`, clamped to zero when nothing is free.
pub(crate) fn fragmentation(largest_free: u64, total_free: u64) -> f64 {
    if total_free == 0 {
        0.0
    } else {
        1.0 - largest_free as f64 / total_free as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(capacity: u64) -> MemorySuballocator {
        MemorySuballocator::new(HeapId(1), HeapClass::Default, capacity)
    }

    /// xorshift64, enough to drive randomized sequences deterministically.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn best_fit_prefers_the_smallest_segment() {
        let mut heap = allocator(1024);
        let a = heap.allocate(100, 1).unwrap();
        let _b = heap.allocate(300, 1).unwrap();
        let c = heap.allocate(50, 1).unwrap();
        let _d = heap.allocate(100, 1).unwrap();
        heap.deallocate(&a).unwrap();
        heap.deallocate(&c).unwrap();

        // Free: [0..100), [400..450), [550..1024). 40 bytes best-fit into the 50-byte hole.
        let e = heap.allocate(40, 1).unwrap();
        assert_eq!(e.offset, 400);
    }

    #[test]
    fn release_coalesces_with_both_neighbours() {
        let mut heap = allocator(300);
        let a = heap.allocate(100, 1).unwrap();
        let b = heap.allocate(100, 1).unwrap();
        let c = heap.allocate(100, 1).unwrap();
        heap.deallocate(&a).unwrap();
        heap.deallocate(&c).unwrap();
        assert_eq!(heap.stats().free_segments, 2);

        heap.deallocate(&b).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.free_segments, 1);
        assert_eq!(stats.largest_free, 300);
        assert_eq!(stats.fragmentation, 0.0);
    }

    #[test]
    fn alignment_padding_stays_free() {
        let mut heap = allocator(1024);
        let _a = heap.allocate(10, 1).unwrap();
        let b = heap.allocate(64, 256).unwrap();
        assert_eq!(b.offset, 256);

        let pad = heap.allocate(200, 1).unwrap();
        assert_eq!(pad.offset, 10);
    }

    #[test]
    fn invalid_and_foreign_releases_are_rejected() {
        let mut heap = allocator(1024);
        assert!(matches!(
            heap.allocate(0, 1),
            Err(MemoryError::InvalidRequest(_))
        ));
        assert!(matches!(
            heap.allocate(8, 3),
            Err(MemoryError::InvalidRequest(_))
        ));

        let a = heap.allocate(64, 1).unwrap();
        heap.deallocate(&a).unwrap();
        assert_eq!(heap.deallocate(&a), Err(MemoryError::UnknownAllocation(a.id)));

        let mut other = MemorySuballocator::new(HeapId(2), HeapClass::Default, 1024);
        let foreign = other.allocate(64, 1).unwrap();
        assert!(heap.deallocate(&foreign).is_err());
        assert_eq!(heap.stats().largest_free, 1024);
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let mut heap = allocator(128);
        heap.allocate(100, 1).unwrap();
        assert!(heap.allocate(64, 1).unwrap_err().is_out_of_memory());
    }

    #[test]
    fn random_sequences_never_overlap_or_overcommit() {
        let capacity = 1 << 20;
        let mut heap = allocator(capacity);
        let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
        let mut live: Vec<HeapAllocation> = Vec::new();

        for _ in 0..5_000 {
            if live.is_empty() || rng.next() % 3 != 0 {
                let size = 1 + rng.next() % 8192;
                let alignment = 1 << (rng.next() % 9);
                if let Ok(allocation) = heap.allocate(size, alignment) {
                    assert_eq!(allocation.offset % alignment, 0);
                    assert!(allocation.end() <= capacity);
                    live.push(allocation);
                }
            } else {
                let index = (rng.next() % live.len() as u64) as usize;
                let allocation = live.swap_remove(index);
                heap.deallocate(&allocation).unwrap();
            }

            let total: u64 = live.iter().map(|a| a.size).sum();
            assert!(total <= capacity);
            assert_eq!(total, heap.used());
        }

        live.sort_by_key(|a| a.offset);
        for pair in live.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]), "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        for allocation in live.drain(..) {
            heap.deallocate(&allocation).unwrap();
        }
        assert_eq!(heap.stats().largest_free, capacity);
    }

    #[test]
    fn defragment_moves_only_movable_allocations() {
        let mut heap = allocator(1000);
        let a = heap.allocate(100, 1).unwrap();
        let pinned = heap.allocate(100, 1).unwrap();
        let c = heap.allocate(100, 1).unwrap();
        let d = heap.allocate(100, 1).unwrap();
        heap.deallocate(&a).unwrap();
        heap.deallocate(&c).unwrap();
        heap.set_movable(d.id, true).unwrap();
        assert!(heap.stats().fragmentation > 0.0);

        let moves = heap.defragment();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].id, d.id);
        assert_eq!(moves[0].old_offset, 300);
        assert_eq!(moves[0].new_offset, 200);
        assert_eq!(heap.allocation(pinned.id).unwrap().offset, 100);

        let stats = heap.stats();
        assert_eq!(stats.largest_free, 700);
        assert_eq!(stats.free_segments, 2);
    }
}
