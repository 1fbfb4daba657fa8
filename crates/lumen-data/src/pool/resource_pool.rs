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

use super::pooled::{PooledResource, ResourceParts};
use super::residency::{LruOrder, ResidencyInfo, ResidencyReport};
use super::{PoolContext, ResourceError};
use crate::memory::{HeapAllocation, MemoryError};
use crate::reclaim::ReclaimQueue;
use ahash::AHashMap;
use lumen_core::diagnostics::DiagnosticEvent;
use lumen_core::gpu::{PlacedResourceDescriptor, ResourceId};
use lumen_core::resource::{PoolHandle, ResidencyPolicy};
use std::collections::VecDeque;

/// Counters and gauges of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Objects currently acquired.
    pub live: usize,
    /// Objects parked in free queues.
    pub idle: usize,
    /// Acquired objects whose memory is evicted.
    pub non_resident: usize,
    /// Objects created over the pool's lifetime.
    pub created: u64,
    /// Acquisitions served from a free queue.
    pub reused: u64,
    /// Objects that left the pool for good.
    pub disposed: u64,
    /// Streaming objects evicted.
    pub evicted: u64,
    /// Bytes held by resident objects, idle ones included.
    pub memory_bytes: u64,
}

#[derive(Debug)]
struct Entry<R: PooledResource> {
    description: R::Description,
    object: Option<R>,
    in_use: bool,
    residency: ResidencyInfo,
    bytes: u64,
}

#[derive(Debug)]
struct Slot<R: PooledResource> {
    generation: u32,
    entry: Option<Entry<R>>,
}

/// A pool of objects of one kind, keyed by structural description.
#[derive(Debug)]
pub struct ResourcePool<R: PooledResource> {
    slots: Vec<Slot<R>>,
    vacant: Vec<u32>,
    free_queues: AHashMap<R::Description, VecDeque<u32>>,
    lru: LruOrder,
    reclaim: ReclaimQueue<ResourceParts>,
    pending_clears: Vec<ResourceId>,
    max_free_per_key: usize,
    stats: PoolStats,
}

impl<R: PooledResource> ResourcePool<R> {
    /// Creates an empty pool. A release is disposed once more than
    /// `max_free_per_key` idle objects of its description are parked, so a
    /// queue tops out at `max_free_per_key + 1`.
    pub fn new(max_free_per_key: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            free_queues: AHashMap::new(),
            lru: LruOrder::default(),
            reclaim: ReclaimQueue::new(),
            pending_clears: Vec::new(),
            max_free_per_key,
            stats: PoolStats::default(),
        }
    }

    /// Acquires an object of `description` with the normal residency policy.
    pub fn acquire(
        &mut self,
        description: R::Description,
        ctx: &mut PoolContext<'_>,
    ) -> Result<PoolHandle, ResourceError> {
        self.acquire_with_policy(description, ResidencyPolicy::Normal, ctx)
    }

    /// Acquires an object of `description`.
    ///
    /// An idle object of the same description is reused first. Otherwise a new
    /// one is placed in heap memory; streaming acquisitions that run out of
    /// memory evict once and retry.
    pub fn acquire_with_policy(
        &mut self,
        description: R::Description,
        policy: ResidencyPolicy,
        ctx: &mut PoolContext<'_>,
    ) -> Result<PoolHandle, ResourceError> {
        let reusable = self
            .free_queues
            .get_mut(&description)
            .and_then(|queue| queue.pop_back());

        if let Some(index) = reusable {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation;
            if let Some(entry) = slot.entry.as_mut() {
                entry.in_use = true;
                entry.residency = ResidencyInfo::new(policy, ctx.frame);
                if let Some(object) = entry.object.as_mut() {
                    if object.reset() {
                        self.pending_clears.push(object.parts().resource);
                    }
                }
                if policy == ResidencyPolicy::Streaming {
                    self.lru.touch(index);
                }
                self.stats.reused += 1;
                return Ok(self.handle(index, generation));
            }
        }

        let object = self.create(description, policy, ctx)?;
        let bytes = object.parts().allocation.size;
        let entry = Entry {
            description,
            object: Some(object),
            in_use: true,
            residency: ResidencyInfo::new(policy, ctx.frame),
            bytes,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.stats.memory_bytes += bytes;
        if policy == ResidencyPolicy::Streaming {
            self.lru.touch(index);
        }
        Ok(self.handle(index, self.slots[index as usize].generation))
    }

    /// Returns an acquired object to its free queue, or disposes of it when
    /// the queue already holds more than the cap.
    pub fn release(
        &mut self,
        handle: PoolHandle,
        ctx: &mut PoolContext<'_>,
    ) -> Result<(), ResourceError> {
        let index = self.live_index(handle)?;
        self.lru.remove(index);

        let (description, resident) = {
            let Some(entry) = self.slots[index as usize].entry.as_mut() else {
                return Err(ResourceError::StaleHandle(handle));
            };
            entry.in_use = false;
            entry.residency.last_access_frame = entry.residency.last_access_frame.max(ctx.frame);
            (entry.description, entry.object.is_some())
        };

        let queue = self.free_queues.entry(description).or_default();
        if resident && queue.len() <= self.max_free_per_key {
            queue.push_back(index);
        } else {
            self.dispose(index, ctx.frame);
        }
        Ok(())
    }

    /// The acquired, resident object behind `handle`.
    ///
    /// `None` for unknown, stale, released or evicted handles.
    pub fn get(&self, handle: PoolHandle) -> Option<&R> {
        let index = self.live_index(handle).ok()?;
        self.slots[index as usize]
            .entry
            .as_ref()
            .and_then(|e| e.object.as_ref())
    }

    /// Returns `true` if `handle` is acquired, resident or not.
    pub fn contains(&self, handle: PoolHandle) -> bool {
        self.live_index(handle).is_ok()
    }

    /// Residency state of an acquired object.
    pub fn residency(&self, handle: PoolHandle) -> Option<ResidencyInfo> {
        let index = self.live_index(handle).ok()?;
        self.slots[index as usize].entry.as_ref().map(|e| e.residency)
    }

    /// Records a use of `handle` by `frame`.
    pub fn touch(&mut self, handle: PoolHandle, frame: u64) {
        let Ok(index) = self.live_index(handle) else {
            return;
        };
        if let Some(entry) = self.slots[index as usize].entry.as_mut() {
            entry.residency.last_access_frame = entry.residency.last_access_frame.max(frame);
            if entry.residency.policy == ResidencyPolicy::Streaming && entry.object.is_some() {
                self.lru.touch(index);
            }
        }
    }

    /// Allows or forbids eviction of `handle`.
    pub fn set_evictable(&mut self, handle: PoolHandle, evictable: bool) {
        let Ok(index) = self.live_index(handle) else {
            return;
        };
        if let Some(entry) = self.slots[index as usize].entry.as_mut() {
            entry.residency.evictable = evictable;
        }
    }

    /// Marks every acquired object evictable again. Called when a new frame
    /// starts binding.
    pub fn reset_evictable(&mut self) {
        for entry in self.slots.iter_mut().filter_map(|s| s.entry.as_mut()) {
            entry.residency.evictable = true;
        }
    }

    /// Brings memory use down to `budget` bytes.
    ///
    /// Idle objects go first, oldest release first. Then streaming objects are
    /// evicted least recently used first, skipping non-evictable ones. Memory
    /// is returned to the heaps once the frames that used it retire.
    pub fn optimize_residency(&mut self, budget: u64, ctx: &mut PoolContext<'_>) -> ResidencyReport {
        let mut report = ResidencyReport::default();
        if self.stats.memory_bytes <= budget {
            return report;
        }

        let mut idle: Vec<(u64, u32)> = self
            .free_queues
            .values()
            .flatten()
            .filter_map(|&index| {
                self.slots[index as usize]
                    .entry
                    .as_ref()
                    .map(|e| (e.residency.last_access_frame, index))
            })
            .collect();
        idle.sort_unstable();
        for (last_access, index) in idle {
            if self.stats.memory_bytes <= budget {
                break;
            }
            self.unpark(index);
            report.bytes_freed += self.dispose(index, last_access);
            report.disposed_idle += 1;
        }

        for index in self.lru.oldest_first() {
            if self.stats.memory_bytes <= budget {
                break;
            }
            if let Some(bytes) = self.evict(index, ctx) {
                report.bytes_freed += bytes;
                report.evicted += 1;
            }
        }

        if report.disposed_idle + report.evicted > 0 {
            log::debug!(
                "ResourcePool({}): residency pass disposed {} idle and evicted {} objects ({} bytes)",
                R::KIND,
                report.disposed_idle,
                report.evicted,
                report.bytes_freed
            );
        }
        if self.stats.memory_bytes > budget {
            log::warn!(
                "ResourcePool({}): still {} bytes over the {budget} byte budget",
                R::KIND,
                self.stats.memory_bytes - budget
            );
        }
        report
    }

    /// Re-creates the memory of an evicted object. Resident objects are left alone.
    pub fn make_resident(
        &mut self,
        handle: PoolHandle,
        ctx: &mut PoolContext<'_>,
    ) -> Result<(), ResourceError> {
        let index = self.live_index(handle)?;
        let (description, policy) = match self.slots[index as usize].entry.as_ref() {
            Some(entry) if entry.object.is_none() => (entry.description, entry.residency.policy),
            Some(_) => return Ok(()),
            None => return Err(ResourceError::StaleHandle(handle)),
        };

        let object = self.create(description, policy, ctx)?;
        let bytes = object.parts().allocation.size;
        if let Some(entry) = self.slots[index as usize].entry.as_mut() {
            entry.object = Some(object);
            entry.bytes = bytes;
            entry.residency.resident = true;
            entry.residency.last_access_frame = ctx.frame;
        }
        self.stats.memory_bytes += bytes;
        if policy == ResidencyPolicy::Streaming {
            self.lru.touch(index);
        }
        log::debug!("ResourcePool({}): {handle} is resident again", R::KIND);
        Ok(())
    }

    /// Compacts the heap ranges of idle objects and re-places them.
    ///
    /// The old placed resources are destroyed immediately, so the GPU must be
    /// idle. Returns how many objects moved.
    pub fn defragment(&mut self, ctx: &mut PoolContext<'_>) -> Result<usize, ResourceError> {
        let idle: Vec<u32> = self.free_queues.values().flatten().copied().collect();
        let mut by_allocation = AHashMap::new();
        for &index in &idle {
            if let Some(object) = self.object(index) {
                let allocation = object.parts().allocation;
                ctx.heaps.set_movable(&allocation, true)?;
                by_allocation.insert((allocation.heap, allocation.id), index);
            }
        }
        let relocations = ctx.heaps.defragment();
        for &index in &idle {
            if let Some(allocation) = self.object(index).map(|o| o.parts().allocation) {
                ctx.heaps.set_movable(&allocation, false)?;
            }
        }

        let mut moved = 0;
        for relocation in relocations {
            let Some(&index) = by_allocation.get(&(relocation.heap, relocation.id)) else {
                continue;
            };
            let Some(entry) = self.slots[index as usize].entry.as_mut() else {
                continue;
            };
            let Some(object) = entry.object.as_mut() else {
                continue;
            };

            let old = *object.parts();
            let allocation = HeapAllocation {
                offset: relocation.new_offset,
                ..old.allocation
            };
            ctx.device.destroy_resource(old.resource);
            if old.descriptor.is_some() {
                ctx.descriptors.release_static(old.resource);
            }
            let resource = ctx.device.create_placed_resource(&PlacedResourceDescriptor {
                heap: allocation.heap,
                offset: allocation.offset,
                size: allocation.size,
                layout: R::placement(&entry.description).layout,
                label: format!("{}-relocated", R::KIND),
            })?;
            let descriptor = match old.descriptor {
                Some(_) => Some(ctx.descriptors.bind_static(ctx.device, resource)?),
                None => None,
            };
            object.replace_parts(ResourceParts {
                resource,
                allocation,
                descriptor,
            });
            self.pending_clears.push(resource);
            moved += 1;
        }

        if moved > 0 {
            log::info!("ResourcePool({}): defragmentation moved {moved} idle objects", R::KIND);
        }
        Ok(moved)
    }

    /// Destroys disposed objects whose last frame has retired. Returns the
    /// destroyed device resources so per-resource state elsewhere can be dropped.
    pub fn collect(&mut self, completed: u64, ctx: &mut PoolContext<'_>) -> Vec<ResourceId> {
        self.reclaim
            .drain_completed(completed)
            .into_iter()
            .map(|parts| destroy_parts(parts, ctx))
            .collect()
    }

    /// Destroys every object immediately. The GPU must be idle.
    pub fn destroy_all(&mut self, ctx: &mut PoolContext<'_>) -> Vec<ResourceId> {
        let mut destroyed: Vec<ResourceId> = self
            .reclaim
            .drain_all()
            .into_iter()
            .map(|parts| destroy_parts(parts, ctx))
            .collect();
        for slot in &mut self.slots {
            if let Some(object) = slot.entry.take().and_then(|e| e.object) {
                destroyed.push(destroy_parts(object.release_handles(), ctx));
            }
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.vacant = (0..self.slots.len() as u32).rev().collect();
        self.free_queues.clear();
        self.lru.clear();
        self.pending_clears.clear();
        self.stats.memory_bytes = 0;
        destroyed
    }

    /// Takes the resources that must be cleared before their next use.
    pub fn drain_clears(&mut self) -> Vec<ResourceId> {
        std::mem::take(&mut self.pending_clears)
    }

    /// Objects waiting for their fence before destruction.
    pub fn pending_reclaims(&self) -> usize {
        self.reclaim.len()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats;
        stats.idle = self.free_queues.values().map(VecDeque::len).sum();
        stats.live = 0;
        stats.non_resident = 0;
        for entry in self.slots.iter().filter_map(|s| s.entry.as_ref()) {
            if entry.in_use {
                stats.live += 1;
                if entry.object.is_none() {
                    stats.non_resident += 1;
                }
            }
        }
        stats
    }

    fn handle(&self, index: u32, generation: u32) -> PoolHandle {
        PoolHandle {
            kind: R::KIND,
            index,
            generation,
        }
    }

    fn live_index(&self, handle: PoolHandle) -> Result<u32, ResourceError> {
        let live = handle.kind == R::KIND
            && self.slots.get(handle.index as usize).is_some_and(|slot| {
                slot.generation == handle.generation
                    && slot.entry.as_ref().is_some_and(|e| e.in_use)
            });
        if live {
            Ok(handle.index)
        } else {
            Err(ResourceError::StaleHandle(handle))
        }
    }

    fn object(&self, index: u32) -> Option<&R> {
        self.slots[index as usize]
            .entry
            .as_ref()
            .and_then(|e| e.object.as_ref())
    }

    fn unpark(&mut self, index: u32) {
        let Some(description) = self.slots[index as usize]
            .entry
            .as_ref()
            .map(|e| e.description)
        else {
            return;
        };
        if let Some(queue) = self.free_queues.get_mut(&description) {
            queue.retain(|&i| i != index);
        }
    }

    /// Removes the object from its slot for good and schedules its handles
    /// for destruction after `last_frame` retires. Returns the bytes released.
    fn dispose(&mut self, index: u32, last_frame: u64) -> u64 {
        let slot = &mut self.slots[index as usize];
        let Some(entry) = slot.entry.take() else {
            return 0;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
        self.lru.remove(index);
        self.stats.disposed += 1;

        match entry.object {
            Some(object) => {
                self.reclaim.push(last_frame, object.release_handles());
                self.stats.memory_bytes -= entry.bytes;
                entry.bytes
            }
            None => 0,
        }
    }

    /// Makes an acquired streaming object non-resident. Returns the bytes
    /// released, or `None` if the object cannot be evicted.
    fn evict(&mut self, index: u32, ctx: &PoolContext<'_>) -> Option<u64> {
        let generation = self.slots[index as usize].generation;
        let entry = self.slots[index as usize].entry.as_mut()?;
        if !entry.in_use
            || !entry.residency.evictable
            || entry.residency.policy != ResidencyPolicy::Streaming
        {
            return None;
        }
        let object = entry.object.take()?;
        entry.residency.resident = false;
        let bytes = entry.bytes;
        let last_frame = entry.residency.last_access_frame;

        self.reclaim.push(last_frame, object.release_handles());
        self.lru.remove(index);
        self.stats.memory_bytes -= bytes;
        self.stats.evicted += 1;
        ctx.diagnostics.emit(DiagnosticEvent::ResidencyEvicted {
            handle: self.handle(index, generation),
            bytes,
        });
        Some(bytes)
    }

    fn create(
        &mut self,
        description: R::Description,
        policy: ResidencyPolicy,
        ctx: &mut PoolContext<'_>,
    ) -> Result<R, ResourceError> {
        let placement = R::placement(&description);
        let allocation = match ctx.heaps.allocate(
            ctx.device,
            placement.class,
            placement.size,
            placement.alignment,
        ) {
            Ok(allocation) => allocation,
            Err(MemoryError::OutOfMemory { class, requested }) => {
                ctx.diagnostics
                    .emit(DiagnosticEvent::OutOfMemory { class, requested });
                if policy != ResidencyPolicy::Streaming {
                    return Err(MemoryError::OutOfMemory { class, requested }.into());
                }

                let target = self.stats.memory_bytes.saturating_sub(placement.size);
                let report = self.optimize_residency(target, ctx);
                let completed = ctx.fences.completed_value();
                self.collect(completed, ctx);
                log::debug!(
                    "ResourcePool({}): out of memory, evicted {} objects and retrying",
                    R::KIND,
                    report.evicted + report.disposed_idle
                );

                ctx.heaps
                    .allocate(ctx.device, placement.class, placement.size, placement.alignment)
                    .inspect_err(|err| {
                        if let MemoryError::OutOfMemory { class, requested } = err {
                            ctx.diagnostics.emit(DiagnosticEvent::OutOfMemory {
                                class: *class,
                                requested: *requested,
                            });
                        }
                    })?
            }
            Err(err) => return Err(err.into()),
        };

        let resource = match ctx.device.create_placed_resource(&PlacedResourceDescriptor {
            heap: allocation.heap,
            offset: allocation.offset,
            size: allocation.size,
            layout: placement.layout,
            label: format!("{}-{}", R::KIND, self.stats.created),
        }) {
            Ok(resource) => resource,
            Err(err) => {
                release_allocation(ctx, &allocation);
                return Err(err.into());
            }
        };

        let descriptor = if R::needs_descriptor(&description) {
            match ctx.descriptors.bind_static(ctx.device, resource) {
                Ok(range) => Some(range),
                Err(err) => {
                    ctx.device.destroy_resource(resource);
                    release_allocation(ctx, &allocation);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        self.pending_clears.push(resource);
        self.stats.created += 1;
        Ok(R::from_parts(
            description,
            ResourceParts {
                resource,
                allocation,
                descriptor,
            },
        ))
    }
}

fn release_allocation(ctx: &mut PoolContext<'_>, allocation: &HeapAllocation) {
    if let Err(err) = ctx.heaps.deallocate(ctx.device, allocation) {
        log::warn!("ResourcePool: failed to return {:?}: {err}", allocation.id);
    }
}

fn destroy_parts(parts: ResourceParts, ctx: &mut PoolContext<'_>) -> ResourceId {
    ctx.device.destroy_resource(parts.resource);
    if parts.descriptor.is_some() {
        ctx.descriptors.release_static(parts.resource);
    }
    release_allocation(ctx, &parts.allocation);
    parts.resource
}
