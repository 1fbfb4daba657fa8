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

//! Fence-deferred destruction.

use std::collections::VecDeque;

/// Items waiting for a frame fence to retire before they may be destroyed.
///
/// Items are tagged with the fence value of the last frame that may still
/// reference them and kept ordered by that value, so retirement only ever
/// looks at the front.
#[derive(Debug)]
pub struct ReclaimQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> ReclaimQueue<T> {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Defers `item` until `fence_value` has been signaled.
    pub fn push(&mut self, fence_value: u64, item: T) {
        let index = self.entries.partition_point(|(fence, _)| *fence <= fence_value);
        self.entries.insert(index, (fence_value, item));
    }

    /// Removes and returns every item whose fence value is `<= completed`.
    pub fn drain_completed(&mut self, completed: u64) -> Vec<T> {
        let mut ready = Vec::new();
        while self.entries.front().is_some_and(|(fence, _)| *fence <= completed) {
            if let Some((_, item)) = self.entries.pop_front() {
                ready.push(item);
            }
        }
        ready
    }

    /// Removes every item regardless of its fence. Only valid once the GPU is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ReclaimQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
