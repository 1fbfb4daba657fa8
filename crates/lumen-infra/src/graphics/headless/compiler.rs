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

//! A pipeline compiler that "compiles" by inspecting source text.
//!
//! Sources containing `#error` fail in the offending stage, and sources
//! containing `#panic` make the compiler panic. Everything else succeeds after
//! the configured delay. The compiler records enough bookkeeping for tests to
//! assert on concurrency bounds and deduplication.

use ahash::{AHashMap, AHashSet};
use lumen_core::error::CompilationError;
use lumen_core::gpu::{CompileRequest, PipelineCompiler, PipelineHandle};
use lumen_core::pipeline::{PipelineKey, ShaderStage};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const BLOB_MAGIC: &[u8; 4] = b"HPSO";

/// An in-process [`PipelineCompiler`].
#[derive(Debug)]
pub struct HeadlessCompiler {
    delay: Duration,
    next_handle: AtomicU64,
    compilations: AtomicU64,
    failures: AtomicU64,
    blob_hits: AtomicU64,
    released: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    duplicate_concurrent: AtomicU64,
    active_keys: Mutex<AHashSet<PipelineKey>>,
    live: Mutex<AHashMap<PipelineHandle, PipelineKey>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HeadlessCompiler {
    /// A compiler that returns immediately.
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// A compiler that sleeps `delay` per compilation.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            next_handle: AtomicU64::new(1),
            compilations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            blob_hits: AtomicU64::new(0),
            released: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            duplicate_concurrent: AtomicU64::new(0),
            active_keys: Mutex::new(AHashSet::new()),
            live: Mutex::new(AHashMap::new()),
        }
    }

    /// Number of `compile` calls, successful or not.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Number of failed compilations.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Number of compilations that received a matching cached blob.
    pub fn blob_hits(&self) -> u64 {
        self.blob_hits.load(Ordering::SeqCst)
    }

    /// Number of released pipelines.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of pipelines compiled and not yet released.
    pub fn live_pipelines(&self) -> usize {
        lock(&self.live).len()
    }

    /// Highest number of simultaneous compilations observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of times a key was compiled while another compilation of the same
    /// key was still running.
    pub fn duplicate_concurrent_compiles(&self) -> u64 {
        self.duplicate_concurrent.load(Ordering::SeqCst)
    }

    fn blob_for(key: &PipelineKey) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(BLOB_MAGIC);
        bytes.extend_from_slice(&key.stable_hash().to_le_bytes());
        bytes
    }
}

impl Default for HeadlessCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineCompiler for HeadlessCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<PipelineHandle, CompilationError> {
        if request.vertex.source.contains("#panic") || request.fragment.source.contains("#panic") {
            panic!("HeadlessCompiler: '{}' requested a panic", request.label);
        }

        self.compilations.fetch_add(1, Ordering::SeqCst);
        if !lock(&self.active_keys).insert(request.key) {
            self.duplicate_concurrent.fetch_add(1, Ordering::SeqCst);
        }
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if request
            .cached_blob
            .as_deref()
            .is_some_and(|blob| blob == Self::blob_for(&request.key).as_slice())
        {
            self.blob_hits.fetch_add(1, Ordering::SeqCst);
        } else if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let mut failed_stages = Vec::new();
        if request.vertex.source.contains("#error") {
            failed_stages.push(ShaderStage::Vertex);
        }
        if request.fragment.source.contains("#error") {
            failed_stages.push(ShaderStage::Fragment);
        }

        let result = if failed_stages.is_empty() {
            let handle = PipelineHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
            lock(&self.live).insert(handle, request.key);
            Ok(handle)
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Err(CompilationError::new(
                request.label.clone(),
                failed_stages,
                "#error directive encountered",
            ))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.active_keys).remove(&request.key);
        result
    }

    fn release(&self, handle: PipelineHandle) {
        if lock(&self.live).remove(&handle).is_some() {
            self.released.fetch_add(1, Ordering::SeqCst);
        } else {
            log::warn!("HeadlessCompiler: release of unknown pipeline {handle:?}");
        }
    }

    fn serialize(&self, handle: PipelineHandle) -> Option<Vec<u8>> {
        lock(&self.live).get(&handle).map(Self::blob_for)
    }
}
