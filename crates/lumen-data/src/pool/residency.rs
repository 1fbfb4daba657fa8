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

//! Residency bookkeeping for streaming resources.

use ahash::AHashMap;
use lumen_core::resource::ResidencyPolicy;
use std::collections::BTreeMap;

/// Residency state of one pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyInfo {
    /// Whether the object takes part in automatic eviction.
    pub policy: ResidencyPolicy,
    /// The last frame that used the object. Frame numbers are the graphics
    /// fence values their frames signal.
    pub last_access_frame: u64,
    /// `false` while the object is bound by the frame being recorded.
    pub evictable: bool,
    /// `false` once the object's memory was evicted.
    pub resident: bool,
}

impl ResidencyInfo {
    pub(crate) fn new(policy: ResidencyPolicy, frame: u64) -> Self {
        Self {
            policy,
            last_access_frame: frame,
            evictable: true,
            resident: true,
        }
    }
}

/// What a residency pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResidencyReport {
    /// Idle free-queue objects disposed.
    pub disposed_idle: usize,
    /// Streaming objects made non-resident.
    pub evicted: usize,
    /// Bytes scheduled for release.
    pub bytes_freed: u64,
}

/// Recency order of pool slots; the front is the least recently used.
#[derive(Debug, Default)]
pub(crate) struct LruOrder {
    order: BTreeMap<u64, u32>,
    ticks: AHashMap<u32, u64>,
    next_tick: u64,
}

impl LruOrder {
    /// Moves `slot` to the most recently used position.
    pub(crate) fn touch(&mut self, slot: u32) {
        if let Some(tick) = self.ticks.remove(&slot) {
            self.order.remove(&tick);
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, slot);
        self.ticks.insert(slot, tick);
    }

    pub(crate) fn remove(&mut self, slot: u32) {
        if let Some(tick) = self.ticks.remove(&slot) {
            self.order.remove(&tick);
        }
    }

    /// Slots from least to most recently used.
    pub(crate) fn oldest_first(&self) -> Vec<u32> {
        self.order.values().copied().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.ticks.clear();
    }
}
