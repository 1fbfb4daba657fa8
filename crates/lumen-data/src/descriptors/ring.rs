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

//! The dynamic tier's ring of descriptor indices.
//!
//! Positions are tracked as monotonically increasing virtual offsets; the
//! physical index is `base + position % size`. Each frame owns the span
//! `[start, end)` it allocated from, including any tail it skipped to keep a
//! range contiguous across the wrap point.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct RingSegment {
    fence_value: u64,
    start: u64,
    end: u64,
}

/// The outcome of a ring allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingAttempt {
    /// The range starts at this table index.
    Allocated(u32),
    /// The range would overwrite the oldest in-flight frame, which signals this
    /// fence value.
    Blocked(u64),
    /// The request cannot fit even once every older frame retires.
    Exhausted {
        /// Descriptors the current frame could still obtain.
        available: u32,
    },
    /// No frame is open.
    NoFrame,
}

#[derive(Debug)]
pub(crate) struct DescriptorRing {
    base: u32,
    size: u32,
    head: u64,
    closed: VecDeque<RingSegment>,
    open: Option<RingSegment>,
}

impl DescriptorRing {
    pub(crate) fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            head: 0,
            closed: VecDeque::new(),
            open: None,
        }
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Opens the segment of the frame that will signal `fence_value`.
    pub(crate) fn begin_frame(&mut self, fence_value: u64) {
        if self.open.is_some() {
            log::warn!("DescriptorRing: frame opened while the previous one was still open");
            self.end_frame();
        }
        self.open = Some(RingSegment {
            fence_value,
            start: self.head,
            end: self.head,
        });
    }

    pub(crate) fn end_frame(&mut self) {
        if let Some(segment) = self.open.take() {
            if segment.end > segment.start {
                self.closed.push_back(segment);
            }
        }
    }

    /// Drops segments whose frames have retired.
    pub(crate) fn retire(&mut self, completed: u64) {
        while self
            .closed
            .front()
            .is_some_and(|s| s.fence_value <= completed)
        {
            self.closed.pop_front();
        }
    }

    /// Descriptors owned by closed or open frames.
    pub(crate) fn in_flight(&self) -> u32 {
        (self.head - self.oldest_live()) as u32
    }

    /// Number of closed frames still holding ring space.
    pub(crate) fn frames_in_flight(&self) -> usize {
        self.closed.len()
    }

    pub(crate) fn try_allocate(&mut self, count: u32) -> RingAttempt {
        let size = u64::from(self.size);
        let count = u64::from(count);
        let Some(open_start) = self.open.map(|s| s.start) else {
            return RingAttempt::NoFrame;
        };
        if count > size {
            return RingAttempt::Exhausted {
                available: self.available_to_open_frame(open_start),
            };
        }

        let mut start = self.head;
        if start % size + count > size {
            start = (start / size + 1) * size;
        }
        let end = start + count;

        if end - self.oldest_live() > size {
            return match self.closed.front() {
                Some(oldest) => RingAttempt::Blocked(oldest.fence_value),
                None => RingAttempt::Exhausted {
                    available: self.available_to_open_frame(open_start),
                },
            };
        }

        self.head = end;
        if let Some(open) = self.open.as_mut() {
            open.end = end;
        }
        RingAttempt::Allocated(self.base + (start % size) as u32)
    }

    /// Forgets every segment. Only valid once the GPU is idle.
    pub(crate) fn reset(&mut self) {
        self.closed.clear();
        if let Some(open) = self.open.as_mut() {
            open.start = self.head;
            open.end = self.head;
        }
    }

    fn oldest_live(&self) -> u64 {
        self.closed
            .front()
            .map(|s| s.start)
            .or(self.open.map(|s| s.start))
            .unwrap_or(self.head)
    }

    fn available_to_open_frame(&self, open_start: u64) -> u32 {
        (u64::from(self.size) - (self.head - open_start).min(u64::from(self.size))) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_stay_contiguous_across_the_wrap() {
        let mut ring = DescriptorRing::new(100, 10);
        ring.begin_frame(1);
        assert_eq!(ring.try_allocate(6), RingAttempt::Allocated(100));
        ring.end_frame();
        ring.retire(1);

        ring.begin_frame(2);
        // Only 4 indices remain before the wrap point; a 5-wide range skips them.
        assert_eq!(ring.try_allocate(5), RingAttempt::Allocated(100));
    }

    #[test]
    fn unretired_frames_block_reuse() {
        let mut ring = DescriptorRing::new(0, 8);
        ring.begin_frame(1);
        assert_eq!(ring.try_allocate(6), RingAttempt::Allocated(0));
        ring.end_frame();

        ring.begin_frame(2);
        assert_eq!(ring.try_allocate(2), RingAttempt::Allocated(6));
        assert_eq!(ring.try_allocate(1), RingAttempt::Blocked(1));
        ring.retire(1);
        assert_eq!(ring.try_allocate(1), RingAttempt::Allocated(0));
        assert_eq!(ring.in_flight(), 3);
    }

    #[test]
    fn a_single_frame_cannot_overrun_itself() {
        let mut ring = DescriptorRing::new(0, 8);
        assert_eq!(ring.try_allocate(1), RingAttempt::NoFrame);
        ring.begin_frame(1);
        assert_eq!(ring.try_allocate(6), RingAttempt::Allocated(0));
        assert_eq!(
            ring.try_allocate(3),
            RingAttempt::Exhausted { available: 2 }
        );
        assert_eq!(
            ring.try_allocate(9),
            RingAttempt::Exhausted { available: 2 }
        );
    }
}
