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

//! Fence observation.

use crate::error::SyncError;

/// Read access to the graphics frame timeline.
///
/// Managers that recycle per-frame memory (the descriptor ring, deferred
/// reclamation) use this to learn which frames the GPU has finished, and to
/// block in a bounded way when they must reuse memory of a frame still in flight.
pub trait FenceObserver {
    /// The highest graphics fence value known to be signaled.
    fn completed_value(&self) -> u64;

    /// Blocks until the graphics fence reaches `value`, bounded by the
    /// configured fence timeout.
    fn wait_for(&self, value: u64) -> Result<(), SyncError>;
}
