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

//! Minimal state-transition emission.

use ahash::AHashMap;
use lumen_core::gpu::{ResourceBarrier, ResourceId};
use lumen_core::resource::ResourceState;

/// Tracks the last known GPU state of every resource and turns state requests
/// into the smallest set of barriers.
///
/// Requests accumulate until [`flush`](Self::flush). Several requests for one
/// resource collapse into a single barrier from its known state to the last
/// requested state, and transitions to the state a resource is already in are
/// dropped. Untracked resources are assumed [`ResourceState::Undefined`].
#[derive(Debug, Default)]
pub struct ResourceBarrierOptimizer {
    states: AHashMap<ResourceId, ResourceState>,
    pending: Vec<ResourceId>,
    targets: AHashMap<ResourceId, ResourceState>,
    emitted: u64,
}

impl ResourceBarrierOptimizer {
    /// Creates an optimizer that tracks nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the state `resource` is in without emitting a barrier, e.g. right
    /// after creation.
    pub fn set_state(&mut self, resource: ResourceId, state: ResourceState) {
        self.states.insert(resource, state);
    }

    /// The last known state of `resource`, if tracked.
    pub fn state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    /// Requests that `resource` be in `state` before the next recorded work.
    pub fn request(&mut self, resource: ResourceId, state: ResourceState) {
        if self.targets.insert(resource, state).is_none() {
            self.pending.push(resource);
        }
    }

    /// Number of resources with a pending request.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Resolves pending requests into barriers, in the order resources were
    /// first requested, and updates the tracked states.
    pub fn flush(&mut self) -> Vec<ResourceBarrier> {
        let mut barriers = Vec::with_capacity(self.pending.len());
        for resource in self.pending.drain(..) {
            let Some(after) = self.targets.remove(&resource) else {
                continue;
            };
            let before = self
                .states
                .insert(resource, after)
                .unwrap_or(ResourceState::Undefined);
            if before != after {
                barriers.push(ResourceBarrier {
                    resource,
                    before,
                    after,
                });
            }
        }
        self.emitted += barriers.len() as u64;
        barriers
    }

    /// Stops tracking a disposed resource and drops its pending request.
    pub fn forget(&mut self, resource: ResourceId) {
        self.states.remove(&resource);
        if self.targets.remove(&resource).is_some() {
            self.pending.retain(|pending| *pending != resource);
        }
    }

    /// Drops every tracked state. Used after the device is rebuilt.
    pub fn clear(&mut self) {
        self.states.clear();
        self.pending.clear();
        self.targets.clear();
    }

    /// Number of tracked resources.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Total barriers emitted since creation.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
