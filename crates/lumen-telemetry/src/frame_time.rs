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

//! Rolling frame-time statistics.

use std::collections::VecDeque;
use std::time::Duration;

/// Keeps the last `window` frame times and reports their mean and variance.
#[derive(Debug, Clone)]
pub struct FrameTimeTracker {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl FrameTimeTracker {
    /// A tracker over the last `window` frames. A zero window is treated as one.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Records one frame time in milliseconds, dropping the oldest sample when
    /// the window is full.
    pub fn record_ms(&mut self, ms: f64) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(ms);
        self.sum += ms;
    }

    /// Records one frame time.
    pub fn record(&mut self, frame_time: Duration) {
        self.record_ms(frame_time.as_secs_f64() * 1000.0);
    }

    /// Mean over the window, or 0 with no samples.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f64
    }

    /// Population variance over the window, or 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        self.samples
            .iter()
            .map(|sample| (sample - mean).powi(2))
            .sum::<f64>()
            / self.samples.len() as f64
    }

    /// The most recent sample.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` before the first sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Drops every sample.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}
