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

//! The two-tier descriptor allocator.
//!
//! One device descriptor table is split in two: `[0, static_capacity)` holds
//! long-lived bindings memoized per resource, and the remainder is a ring from
//! which each frame carves short-lived ranges. Ring space is reclaimed when the
//! owning frame's fence retires. Resources bound dynamically often enough are
//! promoted to the static tier.

mod ring;

use ahash::AHashMap;
use lumen_core::config::DescriptorConfig;
use lumen_core::error::{DeviceError, SyncError};
use lumen_core::gpu::{
    DescriptorRange, DescriptorTableId, DescriptorTier, FenceObserver, GpuDevice, ResourceId,
};
use ring::{DescriptorRing, RingAttempt};
use thiserror::Error;

/// An error of the descriptor allocator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DescriptorError {
    /// The tier has no room for the request.
    #[error("out of {tier:?} descriptors ({requested} requested, {available} available)")]
    OutOfDescriptors {
        /// The exhausted tier.
        tier: DescriptorTier,
        /// Number of descriptors requested.
        requested: u32,
        /// Number of descriptors that could still be handed out.
        available: u32,
    },
    /// A dynamic binding was requested outside `begin_frame` / `end_frame`.
    #[error("no frame is open for dynamic descriptor allocation")]
    NoFrameOpen,
    /// A dynamic binding of zero resources.
    #[error("empty descriptor binding")]
    EmptyBinding,
    /// The table layout is inconsistent.
    #[error("invalid descriptor configuration: {0}")]
    InvalidConfig(String),
    /// Waiting for an in-flight frame to release ring space failed. Fatal.
    #[error("descriptor ring wait failed: {0}")]
    Sync(#[from] SyncError),
    /// The device rejected a descriptor write.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl DescriptorError {
    /// Returns `true` if the error must halt the frame loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DescriptorError::Sync(_) | DescriptorError::Device(DeviceError::DeviceLost(_))
        )
    }
}

/// How dynamic bind counts accumulate toward promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionPolicy {
    /// Counts accumulate for the lifetime of the resource.
    Cumulative,
    /// Counts are reset every `frames` frames.
    Windowed {
        /// Window length in frames.
        frames: u32,
    },
}

/// Counters of the frame currently (or last) recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorFrameStats {
    /// Binds served from the static tier.
    pub static_binds: u64,
    /// Dynamic ranges allocated.
    pub dynamic_binds: u64,
    /// Descriptors written into the ring.
    pub dynamic_descriptors: u64,
    /// Resources promoted to the static tier.
    pub promotions: u64,
    /// Times the ring had to wait for an in-flight frame.
    pub ring_waits: u64,
}

impl DescriptorFrameStats {
    /// Every bind of the frame, static or dynamic.
    pub fn total_binds(&self) -> u64 {
        self.static_binds + self.dynamic_binds
    }
}

/// Owns one descriptor table and hands out static and per-frame ranges.
#[derive(Debug)]
pub struct DescriptorAllocator {
    table: DescriptorTableId,
    static_capacity: u32,
    static_next: u32,
    static_free: Vec<u32>,
    static_generations: Vec<u64>,
    static_bindings: AHashMap<ResourceId, DescriptorRange>,
    ring: DescriptorRing,
    frame_fence: Option<u64>,
    bind_counts: AHashMap<ResourceId, u32>,
    promotion_threshold: u32,
    policy: PromotionPolicy,
    frames_in_window: u32,
    stats: DescriptorFrameStats,
}

impl DescriptorAllocator {
    /// Creates the descriptor table on `device` and splits it per `config`.
    pub fn new(device: &dyn GpuDevice, config: &DescriptorConfig) -> Result<Self, DescriptorError> {
        if config.static_capacity > config.capacity {
            return Err(DescriptorError::InvalidConfig(format!(
                "static tier ({}) larger than the table ({})",
                config.static_capacity, config.capacity
            )));
        }
        let table = device.create_descriptor_table(config.capacity)?;
        let policy = match config.promotion_window_frames {
            Some(frames) if frames > 0 => PromotionPolicy::Windowed { frames },
            _ => PromotionPolicy::Cumulative,
        };
        log::info!(
            "DescriptorAllocator: table {table:?} with {} static and {} dynamic descriptors",
            config.static_capacity,
            config.capacity - config.static_capacity
        );

        Ok(Self {
            table,
            static_capacity: config.static_capacity,
            static_next: 0,
            static_free: Vec::new(),
            static_generations: vec![0; config.static_capacity as usize],
            static_bindings: AHashMap::new(),
            ring: DescriptorRing::new(
                config.static_capacity,
                config.capacity - config.static_capacity,
            ),
            frame_fence: None,
            bind_counts: AHashMap::new(),
            promotion_threshold: config.promotion_threshold,
            policy,
            frames_in_window: 0,
            stats: DescriptorFrameStats::default(),
        })
    }

    /// The device table all ranges index into.
    pub fn table(&self) -> DescriptorTableId {
        self.table
    }

    /// The active promotion policy.
    pub fn promotion_policy(&self) -> PromotionPolicy {
        self.policy
    }

    /// Opens the ring segment of the frame that will signal `fence_value`.
    pub fn begin_frame(&mut self, fence_value: u64) {
        self.stats = DescriptorFrameStats::default();
        if let PromotionPolicy::Windowed { frames } = self.policy {
            self.frames_in_window += 1;
            if self.frames_in_window >= frames {
                self.frames_in_window = 0;
                self.bind_counts.clear();
            }
        }
        self.ring.begin_frame(fence_value);
        self.frame_fence = Some(fence_value);
    }

    /// Closes the current frame's ring segment.
    pub fn end_frame(&mut self) {
        self.ring.end_frame();
        self.frame_fence = None;
    }

    /// Releases the ring space of every frame whose fence value is `<= completed`.
    pub fn retire(&mut self, completed: u64) {
        self.ring.retire(completed);
    }

    /// Binds `resource` into the static tier, or returns its existing range.
    pub fn bind_static(
        &mut self,
        device: &dyn GpuDevice,
        resource: ResourceId,
    ) -> Result<DescriptorRange, DescriptorError> {
        if let Some(range) = self.static_bindings.get(&resource) {
            self.stats.static_binds += 1;
            return Ok(*range);
        }

        let index = match self.static_free.pop() {
            Some(index) => index,
            None if self.static_next < self.static_capacity => {
                self.static_next += 1;
                self.static_next - 1
            }
            None => {
                return Err(DescriptorError::OutOfDescriptors {
                    tier: DescriptorTier::Static,
                    requested: 1,
                    available: 0,
                })
            }
        };
        if let Err(err) = device.write_descriptors(self.table, index, &[resource]) {
            self.static_free.push(index);
            return Err(err.into());
        }

        let range = DescriptorRange {
            table: self.table,
            tier: DescriptorTier::Static,
            start: index,
            len: 1,
            generation: self.static_generations[index as usize],
        };
        self.static_bindings.insert(resource, range);
        self.bind_counts.remove(&resource);
        self.stats.static_binds += 1;
        Ok(range)
    }

    /// Returns the static slot of a destroyed resource to the free list.
    ///
    /// Returns `false` if the resource had no static binding.
    pub fn release_static(&mut self, resource: ResourceId) -> bool {
        self.bind_counts.remove(&resource);
        match self.static_bindings.remove(&resource) {
            Some(range) => {
                self.static_generations[range.start as usize] += 1;
                self.static_free.push(range.start);
                true
            }
            None => false,
        }
    }

    /// The static range of `resource`, if it has one.
    pub fn static_range(&self, resource: ResourceId) -> Option<DescriptorRange> {
        self.static_bindings.get(&resource).copied()
    }

    /// Allocates a fresh contiguous ring range for `resources` and writes them.
    ///
    /// Never deduplicated. If the range would overwrite space still owned by
    /// an in-flight frame, blocks on that frame's fence through `fences`.
    pub fn bind_dynamic(
        &mut self,
        device: &dyn GpuDevice,
        fences: &dyn FenceObserver,
        resources: &[ResourceId],
    ) -> Result<DescriptorRange, DescriptorError> {
        if resources.is_empty() {
            return Err(DescriptorError::EmptyBinding);
        }
        let fence_value = self.frame_fence.ok_or(DescriptorError::NoFrameOpen)?;
        let count = resources.len() as u32;

        let start = loop {
            match self.ring.try_allocate(count) {
                RingAttempt::Allocated(start) => break start,
                RingAttempt::Blocked(value) => {
                    log::debug!(
                        "DescriptorAllocator: ring full, waiting for frame fence {value}"
                    );
                    self.stats.ring_waits += 1;
                    fences.wait_for(value)?;
                    self.ring.retire(fences.completed_value().max(value));
                }
                RingAttempt::Exhausted { available } => {
                    return Err(DescriptorError::OutOfDescriptors {
                        tier: DescriptorTier::Dynamic,
                        requested: count,
                        available,
                    })
                }
                RingAttempt::NoFrame => return Err(DescriptorError::NoFrameOpen),
            }
        };

        device.write_descriptors(self.table, start, resources)?;
        for resource in resources {
            let count = self.bind_counts.entry(*resource).or_insert(0);
            *count = count.saturating_add(1);
        }
        self.stats.dynamic_binds += 1;
        self.stats.dynamic_descriptors += u64::from(count);

        Ok(DescriptorRange {
            table: self.table,
            tier: DescriptorTier::Dynamic,
            start,
            len: count,
            generation: fence_value,
        })
    }

    /// Binds a single resource through whichever tier it belongs to.
    ///
    /// Statically bound resources reuse their range. A resource whose dynamic
    /// bind count has exceeded the promotion threshold is moved to the static
    /// tier on this call. Everything else gets a fresh dynamic range.
    pub fn bind(
        &mut self,
        device: &dyn GpuDevice,
        fences: &dyn FenceObserver,
        resource: ResourceId,
    ) -> Result<DescriptorRange, DescriptorError> {
        if let Some(range) = self.static_bindings.get(&resource) {
            self.stats.static_binds += 1;
            return Ok(*range);
        }

        if self.bind_count(resource) > self.promotion_threshold {
            match self.bind_static(device, resource) {
                Ok(range) => {
                    self.stats.promotions += 1;
                    log::debug!(
                        "DescriptorAllocator: promoted {resource:?} to static slot {}",
                        range.start
                    );
                    return Ok(range);
                }
                Err(DescriptorError::OutOfDescriptors { .. }) => {
                    log::debug!(
                        "DescriptorAllocator: static tier full, {resource:?} stays dynamic"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        self.bind_dynamic(device, fences, &[resource])
    }

    /// Dynamic binds counted toward promotion for `resource`.
    pub fn bind_count(&self, resource: ResourceId) -> u32 {
        self.bind_counts.get(&resource).copied().unwrap_or(0)
    }

    /// Counters of the current frame.
    pub fn frame_stats(&self) -> DescriptorFrameStats {
        self.stats
    }

    /// Number of live static bindings.
    pub fn static_in_use(&self) -> usize {
        self.static_bindings.len()
    }

    /// Ring descriptors owned by frames that have not retired.
    pub fn ring_in_flight(&self) -> u32 {
        self.ring.in_flight()
    }

    /// Size of the dynamic ring.
    pub fn ring_capacity(&self) -> u32 {
        self.ring.size()
    }

    /// Number of closed frames still holding ring space.
    pub fn frames_in_flight(&self) -> usize {
        self.ring.frames_in_flight()
    }

    /// Forgets all ring segments. Only valid once the GPU is idle.
    pub fn reset_ring(&mut self) {
        self.ring.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::gpu::QueueKind;
    use lumen_infra::HeadlessDevice;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// A timeline the test drives by hand; waits complete instantly.
    #[derive(Default)]
    struct TestFences {
        completed: AtomicU64,
        waits: AtomicU64,
    }

    impl FenceObserver for TestFences {
        fn completed_value(&self) -> u64 {
            self.completed.load(Ordering::SeqCst)
        }

        fn wait_for(&self, value: u64) -> Result<(), SyncError> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.completed.fetch_max(value, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StuckFences;

    impl FenceObserver for StuckFences {
        fn completed_value(&self) -> u64 {
            0
        }

        fn wait_for(&self, value: u64) -> Result<(), SyncError> {
            Err(SyncError::FenceTimeout {
                queue: QueueKind::Graphics,
                value,
                waited: Duration::from_millis(5),
            })
        }
    }

    fn config(capacity: u32, static_capacity: u32, threshold: u32) -> DescriptorConfig {
        DescriptorConfig {
            capacity,
            static_capacity,
            promotion_threshold: threshold,
            promotion_window_frames: None,
        }
    }

    #[test]
    fn static_binding_is_idempotent() {
        let device = HeadlessDevice::new();
        let mut descriptors = DescriptorAllocator::new(&device, &config(16, 8, 10)).unwrap();
        let first = descriptors.bind_static(&device, ResourceId(7)).unwrap();
        let second = descriptors.bind_static(&device, ResourceId(7)).unwrap();
        assert_eq!(first, second);
        assert_eq!(descriptors.static_in_use(), 1);
        assert_eq!(device.descriptor(descriptors.table(), first.start), Some(ResourceId(7)));
    }

    #[test]
    fn released_static_slots_are_recycled_with_a_new_generation() {
        let device = HeadlessDevice::new();
        let mut descriptors = DescriptorAllocator::new(&device, &config(4, 2, 10)).unwrap();
        let a = descriptors.bind_static(&device, ResourceId(1)).unwrap();
        descriptors.bind_static(&device, ResourceId(2)).unwrap();
        assert!(matches!(
            descriptors.bind_static(&device, ResourceId(3)),
            Err(DescriptorError::OutOfDescriptors {
                tier: DescriptorTier::Static,
                ..
            })
        ));

        assert!(descriptors.release_static(ResourceId(1)));
        assert!(!descriptors.release_static(ResourceId(1)));
        let c = descriptors.bind_static(&device, ResourceId(3)).unwrap();
        assert_eq!(c.start, a.start);
        assert_eq!(c.generation, a.generation + 1);
    }

    #[test]
    fn dynamic_ranges_of_unretired_frames_never_overlap() {
        let device = HeadlessDevice::new();
        let fences = TestFences::default();
        let mut descriptors = DescriptorAllocator::new(&device, &config(40, 8, 1000)).unwrap();
        let resources: Vec<ResourceId> = (0..5).map(ResourceId).collect();

        let mut live: Vec<DescriptorRange> = Vec::new();
        for frame in 1..=20u64 {
            descriptors.retire(fences.completed_value());
            descriptors.begin_frame(frame);
            for _ in 0..3 {
                let range = descriptors.bind_dynamic(&device, &fences, &resources).unwrap();
                assert!(range.start >= 8 && range.end() <= 40);
                // A bind may have waited for older frames to retire.
                live.retain(|r| r.generation > fences.completed_value());
                for other in &live {
                    assert!(!range.overlaps(other), "{range:?} overlaps {other:?}");
                }
                live.push(range);
            }
            descriptors.end_frame();
        }
        assert!(fences.waits.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn wrap_waits_on_the_oldest_frame() {
        let device = HeadlessDevice::new();
        let fences = TestFences::default();
        let mut descriptors = DescriptorAllocator::new(&device, &config(10, 2, 1000)).unwrap();

        descriptors.begin_frame(1);
        descriptors
            .bind_dynamic(&device, &fences, &[ResourceId(1); 6])
            .unwrap();
        descriptors.end_frame();

        descriptors.begin_frame(2);
        descriptors
            .bind_dynamic(&device, &fences, &[ResourceId(2); 4])
            .unwrap();
        assert_eq!(descriptors.frame_stats().ring_waits, 1);
        assert_eq!(fences.completed_value(), 1);
    }

    #[test]
    fn ring_wait_timeout_is_fatal() {
        let device = HeadlessDevice::new();
        let mut descriptors = DescriptorAllocator::new(&device, &config(10, 2, 1000)).unwrap();
        descriptors.begin_frame(1);
        descriptors
            .bind_dynamic(&device, &StuckFences, &[ResourceId(1); 6])
            .unwrap();
        descriptors.end_frame();

        descriptors.begin_frame(2);
        let err = descriptors
            .bind_dynamic(&device, &StuckFences, &[ResourceId(2); 4])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_and_unframed_requests_are_rejected() {
        let device = HeadlessDevice::new();
        let fences = TestFences::default();
        let mut descriptors = DescriptorAllocator::new(&device, &config(10, 2, 1000)).unwrap();
        assert_eq!(
            descriptors.bind_dynamic(&device, &fences, &[ResourceId(1)]),
            Err(DescriptorError::NoFrameOpen)
        );

        descriptors.begin_frame(1);
        assert!(matches!(
            descriptors.bind_dynamic(&device, &fences, &[ResourceId(1); 9]),
            Err(DescriptorError::OutOfDescriptors {
                tier: DescriptorTier::Dynamic,
                requested: 9,
                ..
            })
        ));
        assert_eq!(
            descriptors.bind_dynamic(&device, &fences, &[]),
            Err(DescriptorError::EmptyBinding)
        );
    }

    #[test]
    fn hot_resources_are_promoted_after_the_threshold() {
        let device = HeadlessDevice::new();
        let fences = TestFences::default();
        let mut descriptors = DescriptorAllocator::new(&device, &config(64, 8, 3)).unwrap();
        let hot = ResourceId(42);

        descriptors.begin_frame(1);
        for _ in 0..4 {
            let range = descriptors.bind(&device, &fences, hot).unwrap();
            assert_eq!(range.tier, DescriptorTier::Dynamic);
        }
        let promoted = descriptors.bind(&device, &fences, hot).unwrap();
        assert_eq!(promoted.tier, DescriptorTier::Static);
        assert_eq!(descriptors.bind(&device, &fences, hot).unwrap(), promoted);

        let stats = descriptors.frame_stats();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.dynamic_binds, 4);
        assert_eq!(stats.static_binds, 2);
        descriptors.end_frame();
    }

    #[test]
    fn windowed_policy_resets_bind_counts() {
        let device = HeadlessDevice::new();
        let fences = TestFences::default();
        let mut cfg = config(64, 8, 3);
        cfg.promotion_window_frames = Some(2);
        let mut descriptors = DescriptorAllocator::new(&device, &cfg).unwrap();
        let resource = ResourceId(9);

        for frame in 1..=6u64 {
            descriptors.retire(frame - 1);
            descriptors.begin_frame(frame);
            for _ in 0..2 {
                let range = descriptors.bind(&device, &fences, resource).unwrap();
                assert_eq!(range.tier, DescriptorTier::Dynamic);
            }
            descriptors.end_frame();
        }
        assert!(descriptors.static_range(resource).is_none());
    }
}
