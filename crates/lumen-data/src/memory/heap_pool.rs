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

//! The per-class pool of device heaps.

use super::suballocator::fragmentation;
use super::{HeapAllocation, MemoryError, MemorySuballocator, Relocation};
use lumen_core::config::MemoryConfig;
use lumen_core::error::DeviceError;
use lumen_core::gpu::{GpuDevice, HeapDescriptor, HeapId};
use lumen_core::resource::{HeapClass, TEXTURE_PLACEMENT_ALIGNMENT};
use lumen_core::utils::align_up;

/// Aggregate occupancy of every heap in a [`HeapPool`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeapPoolStats {
    /// Number of live heaps.
    pub heaps: usize,
    /// Total heap bytes.
    pub capacity: u64,
    /// Bytes held by live allocations.
    pub used: u64,
    /// Free bytes across heaps.
    pub free: u64,
    /// Largest free segment in any heap.
    pub largest_free: u64,
    /// `1 - Σ largest_free(heap) / Σ free(heap)`: zero when each heap's free
    /// space is one contiguous segment.
    pub fragmentation: f64,
}

impl HeapPoolStats {
    /// Fragmentation as a percentage.
    pub fn fragmentation_percent(&self) -> f64 {
        self.fragmentation * 100.0
    }
}

#[derive(Debug)]
struct PoolHeap {
    allocator: MemorySuballocator,
    dedicated: bool,
}

/// Owns a bounded number of large heaps per usage class and suballocates them.
///
/// Heaps are created lazily on first need. Requests larger than a class's heap
/// size get a dedicated heap, which is destroyed as soon as it empties.
#[derive(Debug)]
pub struct HeapPool {
    config: MemoryConfig,
    heaps: Vec<PoolHeap>,
    peak_heap_count: usize,
    heaps_created: u64,
}

impl HeapPool {
    /// Creates an empty pool. No device heap exists until the first allocation.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            heaps: Vec::new(),
            peak_heap_count: 0,
            heaps_created: 0,
        }
    }

    /// Allocates `size` bytes aligned to `alignment` from a heap of `class`.
    ///
    /// Existing heaps are tried fullest first so that nearly empty heaps drain
    /// and can be trimmed. A new heap is created only when none fits.
    pub fn allocate(
        &mut self,
        device: &dyn GpuDevice,
        class: HeapClass,
        size: u64,
        alignment: u64,
    ) -> Result<HeapAllocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidRequest(
                "zero-sized allocation".to_string(),
            ));
        }
        let class_config = self.config.class(class);

        if size > class_config.heap_size {
            let heap_size = align_up(size, TEXTURE_PLACEMENT_ALIGNMENT);
            let index = self.create_heap(device, class, heap_size, true, size)?;
            return self.heaps[index].allocator.allocate(size, alignment);
        }

        let mut candidates: Vec<usize> = self
            .heaps
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.dedicated && h.allocator.class() == class)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| std::cmp::Reverse(self.heaps[i].allocator.used()));

        for index in candidates {
            match self.heaps[index].allocator.allocate(size, alignment) {
                Ok(allocation) => return Ok(allocation),
                Err(MemoryError::OutOfMemory { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        let index = self.create_heap(device, class, class_config.heap_size, false, size)?;
        self.heaps[index].allocator.allocate(size, alignment)
    }

    /// Returns a range to its heap. Dedicated heaps are destroyed once empty.
    pub fn deallocate(
        &mut self,
        device: &dyn GpuDevice,
        allocation: &HeapAllocation,
    ) -> Result<(), MemoryError> {
        let index = self
            .heap_index(allocation.heap)
            .ok_or(MemoryError::UnknownAllocation(allocation.id))?;
        self.heaps[index].allocator.deallocate(allocation)?;

        let heap = &self.heaps[index];
        if heap.dedicated && heap.allocator.is_empty() {
            let id = heap.allocator.heap();
            self.heaps.swap_remove(index);
            device.destroy_heap(id);
            log::debug!("HeapPool: released dedicated heap {id:?}");
        }
        Ok(())
    }

    /// Marks whether `defragment` may move the allocation.
    pub fn set_movable(
        &mut self,
        allocation: &HeapAllocation,
        movable: bool,
    ) -> Result<(), MemoryError> {
        let index = self
            .heap_index(allocation.heap)
            .ok_or(MemoryError::UnknownAllocation(allocation.id))?;
        self.heaps[index].allocator.set_movable(allocation.id, movable)
    }

    /// Compacts movable allocations in every heap.
    pub fn defragment(&mut self) -> Vec<Relocation> {
        self.heaps
            .iter_mut()
            .flat_map(|h| h.allocator.defragment())
            .collect()
    }

    /// Destroys empty heaps beyond the first of each class. Returns how many
    /// heaps were released.
    pub fn trim(&mut self, device: &dyn GpuDevice) -> usize {
        let mut kept = [false; 3];
        let mut released = 0;
        self.heaps.retain(|heap| {
            let class_slot = heap.allocator.class() as usize;
            if !heap.allocator.is_empty() {
                return true;
            }
            if !heap.dedicated && !kept[class_slot] {
                kept[class_slot] = true;
                return true;
            }
            device.destroy_heap(heap.allocator.heap());
            released += 1;
            false
        });
        if released > 0 {
            log::info!("HeapPool: trimmed {released} empty heaps");
        }
        released
    }

    /// Destroys every heap, live allocations included. Used on shutdown and
    /// device recovery, after all placed resources have been dropped.
    pub fn destroy_all(&mut self, device: &dyn GpuDevice) {
        for heap in self.heaps.drain(..) {
            device.destroy_heap(heap.allocator.heap());
        }
    }

    /// Number of live heaps.
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Number of live heaps of `class`.
    pub fn heap_count_of(&self, class: HeapClass) -> usize {
        self.heaps
            .iter()
            .filter(|h| h.allocator.class() == class)
            .count()
    }

    /// The highest heap count ever reached.
    pub fn peak_heap_count(&self) -> usize {
        self.peak_heap_count
    }

    /// Number of heaps created over the pool's lifetime.
    pub fn heaps_created(&self) -> u64 {
        self.heaps_created
    }

    /// Aggregated occupancy.
    pub fn stats(&self) -> HeapPoolStats {
        let mut stats = HeapPoolStats {
            heaps: self.heaps.len(),
            ..HeapPoolStats::default()
        };
        let mut largest_sum = 0u64;
        for heap in &self.heaps {
            let s = heap.allocator.stats();
            stats.capacity += s.capacity;
            stats.used += s.used;
            stats.free += s.free;
            stats.largest_free = stats.largest_free.max(s.largest_free);
            largest_sum += s.largest_free;
        }
        stats.fragmentation = fragmentation(largest_sum, stats.free);
        stats
    }

    fn heap_index(&self, heap: HeapId) -> Option<usize> {
        self.heaps.iter().position(|h| h.allocator.heap() == heap)
    }

    fn create_heap(
        &mut self,
        device: &dyn GpuDevice,
        class: HeapClass,
        heap_size: u64,
        dedicated: bool,
        requested: u64,
    ) -> Result<usize, MemoryError> {
        let max_heaps = self.config.class(class).max_heaps;
        if self.heap_count_of(class) >= max_heaps as usize {
            log::warn!(
                "HeapPool: {} class is at its limit of {max_heaps} heaps",
                class.name()
            );
            return Err(MemoryError::OutOfMemory { class, requested });
        }

        let label = format!(
            "lumen-{}-heap-{}{}",
            class.name(),
            self.heaps_created,
            if dedicated { "-dedicated" } else { "" }
        );
        let id = device
            .create_heap(&HeapDescriptor {
                class,
                size: heap_size,
                label,
            })
            .map_err(|err| match err {
                DeviceError::OutOfDeviceMemory => MemoryError::OutOfMemory { class, requested },
                other => MemoryError::Device(other),
            })?;

        log::debug!(
            "HeapPool: created {} heap {id:?} of {heap_size} bytes",
            class.name()
        );
        self.heaps.push(PoolHeap {
            allocator: MemorySuballocator::new(id, class, heap_size),
            dedicated,
        });
        self.heaps_created += 1;
        self.peak_heap_count = self.peak_heap_count.max(self.heaps.len());
        Ok(self.heaps.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::config::HeapClassConfig;
    use lumen_infra::HeadlessDevice;

    fn small_config() -> MemoryConfig {
        let class = HeapClassConfig {
            heap_size: 1024 * 1024,
            max_heaps: 2,
        };
        MemoryConfig {
            default_heaps: class,
            upload_heaps: class,
            readback_heaps: class,
        }
    }

    #[test]
    fn heaps_are_created_lazily_and_capped() {
        let device = HeadlessDevice::new();
        let mut pool = HeapPool::new(small_config());
        assert_eq!(pool.heap_count(), 0);

        let a = pool.allocate(&device, HeapClass::Default, 768 * 1024, 256).unwrap();
        let b = pool.allocate(&device, HeapClass::Default, 768 * 1024, 256).unwrap();
        assert_ne!(a.heap, b.heap);
        assert_eq!(pool.heap_count_of(HeapClass::Default), 2);

        let err = pool
            .allocate(&device, HeapClass::Default, 768 * 1024, 256)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(pool.heap_count_of(HeapClass::Upload), 0);
    }

    #[test]
    fn fullest_heap_is_tried_first() {
        let device = HeadlessDevice::new();
        let mut pool = HeapPool::new(small_config());
        let big = pool.allocate(&device, HeapClass::Default, 900 * 1024, 256).unwrap();
        let other = pool.allocate(&device, HeapClass::Default, 200 * 1024, 256).unwrap();
        assert_ne!(big.heap, other.heap);

        let small = pool.allocate(&device, HeapClass::Default, 64 * 1024, 256).unwrap();
        assert_eq!(small.heap, big.heap);
    }

    #[test]
    fn oversize_requests_get_a_dedicated_heap() {
        let device = HeadlessDevice::new();
        let mut pool = HeapPool::new(small_config());
        let huge = pool
            .allocate(&device, HeapClass::Default, 3 * 1024 * 1024 + 1, 256)
            .unwrap();
        assert_eq!(device.live_heap_count(), 1);

        pool.deallocate(&device, &huge).unwrap();
        assert_eq!(pool.heap_count(), 0);
        assert_eq!(device.live_heap_count(), 0);
    }

    #[test]
    fn device_budget_maps_to_out_of_memory() {
        let device = HeadlessDevice::new();
        device.set_heap_budget(512 * 1024);
        let mut pool = HeapPool::new(small_config());
        let err = pool
            .allocate(&device, HeapClass::Upload, 1024, 256)
            .unwrap_err();
        assert_eq!(
            err,
            MemoryError::OutOfMemory {
                class: HeapClass::Upload,
                requested: 1024
            }
        );
    }

    #[test]
    fn trim_keeps_one_heap_per_class() {
        let device = HeadlessDevice::new();
        let mut pool = HeapPool::new(small_config());
        let a = pool.allocate(&device, HeapClass::Default, 768 * 1024, 256).unwrap();
        let b = pool.allocate(&device, HeapClass::Default, 768 * 1024, 256).unwrap();
        pool.deallocate(&device, &a).unwrap();
        pool.deallocate(&device, &b).unwrap();

        assert_eq!(pool.trim(&device), 1);
        assert_eq!(pool.heap_count(), 1);
        assert_eq!(device.live_heap_count(), 1);
        assert_eq!(pool.peak_heap_count(), 2);
    }

    #[test]
    fn stats_aggregate_heaps() {
        let device = HeadlessDevice::new();
        let mut pool = HeapPool::new(small_config());
        pool.allocate(&device, HeapClass::Default, 1024, 256).unwrap();
        pool.allocate(&device, HeapClass::Upload, 2048, 256).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.heaps, 2);
        assert_eq!(stats.capacity, 2 * 1024 * 1024);
        assert_eq!(stats.used, 3072);
        assert_eq!(stats.fragmentation, 0.0);
    }
}
