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

use super::blob::{BlobError, PipelineCacheBlob};
use super::task::{PipelineError, PipelineTask};
use super::worker::{spawn_workers, CompileJob};
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::Sender;
use lumen_core::config::PipelineConfig;
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink};
use lumen_core::error::CompilationError;
use lumen_core::gpu::{CompileRequest, PipelineCompiler, PipelineHandle};
use lumen_core::pipeline::{MaterialDescription, PipelineKey};
use lumen_core::sync::completion_pair;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Lookup and compilation counters of a [`PipelineStateCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineCacheStats {
    /// Requests served by a compiled entry.
    pub hits: u64,
    /// Requests not served by a compiled entry, joins and rejections included.
    pub misses: u64,
    /// Misses that joined a compilation already in flight.
    pub dedup_joins: u64,
    /// Misses rejected because the key is known-bad.
    pub known_bad_rejections: u64,
    /// Compilations queued to the workers.
    pub compilations_started: u64,
    /// Compilations that produced a pipeline.
    pub compilations_completed: u64,
    /// Compilations that failed or panicked.
    pub compilations_failed: u64,
    /// Compiled entries evicted or explicitly removed.
    pub evictions: u64,
    /// Finished compilations whose result was discarded.
    pub abandoned: u64,
}

impl PipelineCacheStats {
    /// `hits / (hits + misses)`, or zero before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Counters accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &PipelineCacheStats) -> PipelineCacheStats {
        PipelineCacheStats {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            dedup_joins: self.dedup_joins.saturating_sub(earlier.dedup_joins),
            known_bad_rejections: self
                .known_bad_rejections
                .saturating_sub(earlier.known_bad_rejections),
            compilations_started: self
                .compilations_started
                .saturating_sub(earlier.compilations_started),
            compilations_completed: self
                .compilations_completed
                .saturating_sub(earlier.compilations_completed),
            compilations_failed: self
                .compilations_failed
                .saturating_sub(earlier.compilations_failed),
            evictions: self.evictions.saturating_sub(earlier.evictions),
            abandoned: self.abandoned.saturating_sub(earlier.abandoned),
        }
    }
}

#[derive(Debug)]
struct ReadyEntry {
    handle: PipelineHandle,
    last_used: u64,
    pinned_until: u64,
}

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    task: PipelineTask,
}

#[derive(Debug, Default)]
struct CacheState {
    ready: AHashMap<PipelineKey, ReadyEntry>,
    in_flight: AHashMap<PipelineKey, InFlight>,
    failed: AHashMap<PipelineKey, CompilationError>,
    abandoned: AHashSet<u64>,
    blob: AHashMap<u64, Arc<[u8]>>,
    capacity: usize,
    tick: u64,
    next_ticket: u64,
    completed_fence: u64,
    stats: PipelineCacheStats,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evicts least recently used, unpinned entries until the cache fits its
    /// capacity. `keep` is never chosen. Returns the pipelines to release.
    fn evict_over_capacity(&mut self, keep: Option<PipelineKey>) -> Vec<PipelineHandle> {
        let mut released = Vec::new();
        while self.ready.len() > self.capacity {
            let completed = self.completed_fence;
            let victim = self
                .ready
                .iter()
                .filter(|(key, entry)| Some(**key) != keep && entry.pinned_until <= completed)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                log::debug!(
                    "PipelineStateCache: {} entries over capacity, all pinned by in-flight frames",
                    self.ready.len() - self.capacity
                );
                break;
            };
            if let Some(entry) = self.ready.remove(&key) {
                self.stats.evictions += 1;
                released.push(entry.handle);
            }
        }
        released
    }
}

/// State shared between the cache and its workers.
pub(crate) struct CacheShared {
    compiler: Arc<dyn PipelineCompiler>,
    diagnostics: Arc<dyn DiagnosticSink>,
    state: Mutex<CacheState>,
}

impl fmt::Debug for CacheShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheShared")
            .field("compiler", &self.compiler)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn compiler(&self) -> &dyn PipelineCompiler {
        self.compiler.as_ref()
    }

    /// Records a finished compilation and returns what its waiters receive.
    pub(crate) fn finish(
        &self,
        ticket: u64,
        key: PipelineKey,
        result: Result<PipelineHandle, CompilationError>,
    ) -> Result<PipelineHandle, PipelineError> {
        let mut released = Vec::new();
        let abandoned = {
            let mut state = self.lock();
            if state.in_flight.get(&key).is_some_and(|f| f.ticket == ticket) {
                state.in_flight.remove(&key);
            }
            let abandoned = state.abandoned.remove(&ticket);
            if abandoned {
                state.stats.abandoned += 1;
            }
            match &result {
                Ok(handle) => {
                    state.stats.compilations_completed += 1;
                    if abandoned {
                        released.push(*handle);
                    } else {
                        let tick = state.next_tick();
                        state.ready.insert(
                            key,
                            ReadyEntry {
                                handle: *handle,
                                last_used: tick,
                                pinned_until: 0,
                            },
                        );
                        released.extend(state.evict_over_capacity(Some(key)));
                    }
                }
                Err(error) => {
                    state.stats.compilations_failed += 1;
                    if !abandoned {
                        state.failed.insert(key, error.clone());
                    }
                }
            }
            abandoned
        };

        if abandoned {
            log::debug!("PipelineStateCache: discarded abandoned compilation #{ticket}");
        }
        if let Err(error) = &result {
            log::warn!("PipelineStateCache: {error}");
            if !abandoned {
                self.diagnostics.emit(DiagnosticEvent::CompilationFailed {
                    key_hash: key.stable_hash(),
                    error: error.clone(),
                });
            }
        }
        for handle in released {
            self.compiler.release(handle);
        }
        result.map_err(PipelineError::from)
    }
}

/// A content-addressed cache of compiled pipelines with asynchronous,
/// bounded-concurrency compilation.
///
/// All methods take `&self`; the cache can be shared across threads.
#[derive(Debug)]
pub struct PipelineStateCache {
    shared: Arc<CacheShared>,
    jobs: Option<Sender<CompileJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineStateCache {
    /// Creates the cache and starts its compile workers.
    pub fn new(
        compiler: Arc<dyn PipelineCompiler>,
        diagnostics: Arc<dyn DiagnosticSink>,
        config: &PipelineConfig,
    ) -> Self {
        let shared = Arc::new(CacheShared {
            compiler,
            diagnostics,
            state: Mutex::new(CacheState {
                capacity: config.cache_capacity.max(1),
                ..CacheState::default()
            }),
        });
        let (sender, receiver) = crossbeam_channel::unbounded();
        let workers = spawn_workers(config.compile_workers.max(1), shared.clone(), receiver);
        log::info!(
            "PipelineStateCache: {} compile workers, capacity {}",
            workers.len(),
            config.cache_capacity
        );
        Self {
            shared,
            jobs: Some(sender),
            workers,
        }
    }

    /// Resolves the pipeline of `material`, compiling it on a miss.
    pub fn get_or_create(&self, material: &MaterialDescription) -> PipelineTask {
        self.get_or_create_with_key(PipelineKey::from_material(material), material)
    }

    /// Resolves the pipeline of `key`, compiling `material` on a miss.
    ///
    /// Hits resolve immediately. Concurrent misses for one key share a single
    /// compilation. Known-bad keys reject without recompiling.
    pub fn get_or_create_with_key(
        &self,
        key: PipelineKey,
        material: &MaterialDescription,
    ) -> PipelineTask {
        let (ticket, completer, task, cached_blob) = {
            let mut state = self.shared.lock();
            let tick = state.next_tick();
            if let Some(entry) = state.ready.get_mut(&key) {
                entry.last_used = tick;
                let handle = entry.handle;
                state.stats.hits += 1;
                return PipelineTask::resolved(Ok(handle));
            }

            state.stats.misses += 1;
            if let Some(error) = state.failed.get(&key).cloned() {
                state.stats.known_bad_rejections += 1;
                return PipelineTask::resolved(Err(error.into()));
            }
            if let Some(in_flight) = state.in_flight.get(&key) {
                let task = in_flight.task.clone();
                state.stats.dedup_joins += 1;
                return task;
            }
            if self.jobs.is_none() {
                return PipelineTask::resolved(Err(PipelineError::Shutdown));
            }

            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let (completer, completion) = completion_pair();
            let task = PipelineTask::new(completion);
            state.in_flight.insert(
                key,
                InFlight {
                    ticket,
                    task: task.clone(),
                },
            );
            state.stats.compilations_started += 1;
            let cached_blob = state.blob.get(&key.stable_hash()).cloned();
            (ticket, completer, task, cached_blob)
        };

        log::debug!(
            "PipelineStateCache: compiling '{}' ({:016x})",
            material.label,
            key.stable_hash()
        );
        let job = CompileJob {
            ticket,
            request: CompileRequest {
                key,
                label: material.label.clone(),
                vertex: material.vertex.clone(),
                fragment: material.fragment.clone(),
                defines: material.sorted_defines(),
                cached_blob,
            },
            completer,
        };
        if let Some(Err(returned)) = self.jobs.as_ref().map(|jobs| jobs.send(job)) {
            log::error!("PipelineStateCache: compile workers are gone");
            let job = returned.into_inner();
            let mut state = self.shared.lock();
            if state.in_flight.get(&key).is_some_and(|f| f.ticket == ticket) {
                state.in_flight.remove(&key);
            }
            drop(state);
            job.completer.complete(Err(PipelineError::Shutdown));
        }
        task
    }

    /// The compiled pipeline of `key`, if ready. Refreshes its recency.
    pub fn get(&self, key: &PipelineKey) -> Option<PipelineHandle> {
        let mut state = self.shared.lock();
        let tick = state.next_tick();
        state.ready.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.handle
        })
    }

    /// Marks `key` as used by the frame that signals `fence_value`; it cannot be
    /// evicted until that value retires.
    pub fn pin(&self, key: &PipelineKey, fence_value: u64) {
        let mut state = self.shared.lock();
        if let Some(entry) = state.ready.get_mut(key) {
            entry.pinned_until = entry.pinned_until.max(fence_value);
        }
    }

    /// [`get`](Self::get) and [`pin`](Self::pin) under one lock, so the entry
    /// cannot be evicted between the lookup and the pin.
    pub fn get_pinned(&self, key: &PipelineKey, fence_value: u64) -> Option<PipelineHandle> {
        let mut state = self.shared.lock();
        let tick = state.next_tick();
        state.ready.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.pinned_until = entry.pinned_until.max(fence_value);
            entry.handle
        })
    }

    /// Records the completed graphics fence value and evicts entries that
    /// were only kept alive by now-retired pins.
    pub fn retire(&self, completed_fence: u64) {
        let released = {
            let mut state = self.shared.lock();
            state.completed_fence = state.completed_fence.max(completed_fence);
            state.evict_over_capacity(None)
        };
        self.release_all(released);
    }

    /// Removes `key`. A compiled entry is released unless an in-flight frame
    /// pins it; a compilation in flight is abandoned. Returns `true` if
    /// anything was removed.
    pub fn evict(&self, key: &PipelineKey) -> bool {
        let (removed, released) = {
            let mut state = self.shared.lock();
            let mut removed = false;
            if let Some(in_flight) = state.in_flight.remove(key) {
                state.abandoned.insert(in_flight.ticket);
                removed = true;
            }
            let completed = state.completed_fence;
            let pinned = state
                .ready
                .get(key)
                .is_some_and(|entry| entry.pinned_until > completed);
            let released = if pinned {
                log::debug!("PipelineStateCache: refusing to evict a pinned pipeline");
                None
            } else {
                state.ready.remove(key).map(|entry| {
                    state.stats.evictions += 1;
                    entry.handle
                })
            };
            (removed || released.is_some(), released)
        };
        self.release_all(released);
        removed
    }

    /// Drops every entry, abandons every compilation in flight and forgets all
    /// known-bad keys. Compiled pipelines are released, so the GPU must be idle.
    pub fn clear(&self) {
        let released: Vec<PipelineHandle> = {
            let mut state = self.shared.lock();
            let tickets: Vec<u64> = state.in_flight.drain().map(|(_, f)| f.ticket).collect();
            state.abandoned.extend(tickets);
            state.failed.clear();
            let released: Vec<PipelineHandle> =
                state.ready.drain().map(|(_, entry)| entry.handle).collect();
            state.stats.evictions += released.len() as u64;
            released
        };
        log::info!("PipelineStateCache: cleared {} pipelines", released.len());
        self.release_all(released);
    }

    /// Forgets the retired fence value. Called when the frame timeline starts
    /// over on new fences, after the cache was cleared.
    pub fn restart_timeline(&self) {
        self.shared.lock().completed_fence = 0;
    }

    /// Allows `key` to be compiled again after a failure.
    pub fn forget_failure(&self, key: &PipelineKey) -> bool {
        self.shared.lock().failed.remove(key).is_some()
    }

    /// The cached failure of `key`, if it is known-bad.
    pub fn failure(&self, key: &PipelineKey) -> Option<CompilationError> {
        self.shared.lock().failed.get(key).cloned()
    }

    /// Returns `true` if a compiled pipeline for `key` is cached.
    pub fn contains(&self, key: &PipelineKey) -> bool {
        self.shared.lock().ready.contains_key(key)
    }

    /// Number of compiled entries.
    pub fn len(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// Returns `true` if no compiled entry is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of compilations in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> PipelineCacheStats {
        self.shared.lock().stats
    }

    /// Loads compile hints from a persisted blob.
    ///
    /// Failures are logged and returned; the cache keeps working and simply
    /// compiles from scratch. Returns the number of hints loaded.
    pub fn load_blob(&self, path: impl AsRef<Path>) -> Result<usize, BlobError> {
        let path = path.as_ref();
        match PipelineCacheBlob::load(path) {
            Ok(blob) => {
                let count = blob.len();
                self.shared.lock().blob.extend(blob.into_entries());
                log::info!(
                    "PipelineStateCache: loaded {count} pipelines from {}",
                    path.display()
                );
                Ok(count)
            }
            Err(BlobError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                log::info!("PipelineStateCache: no pipeline blob at {}", path.display());
                Err(BlobError::Io(err))
            }
            Err(err) => {
                log::warn!(
                    "PipelineStateCache: ignoring pipeline blob {}: {err}",
                    path.display()
                );
                self.shared.diagnostics.emit(DiagnosticEvent::BlobRejected {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Writes every serializable compiled pipeline, plus hints loaded earlier,
    /// to `path`. Returns the number of pipelines written.
    ///
    /// Pipelines are serialized under the cache lock, so an eviction or clear
    /// racing with the save cannot release a handle mid-serialization.
    pub fn save_blob(&self, path: impl AsRef<Path>) -> Result<usize, BlobError> {
        let mut blob = PipelineCacheBlob::new();
        {
            let state = self.shared.lock();
            for (hash, bytes) in &state.blob {
                blob.insert(*hash, bytes.clone());
            }
            for (key, entry) in &state.ready {
                if let Some(bytes) = self.shared.compiler.serialize(entry.handle) {
                    blob.insert(key.stable_hash(), bytes);
                }
            }
        }
        blob.save(path.as_ref())?;
        log::info!(
            "PipelineStateCache: saved {} pipelines to {}",
            blob.len(),
            path.as_ref().display()
        );
        Ok(blob.len())
    }

    /// Stops accepting work and joins the workers once the queue drains.
    pub fn shutdown(&mut self) {
        if self.jobs.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("PipelineStateCache: a compile worker panicked");
            }
        }
        log::debug!("PipelineStateCache: workers stopped");
    }

    fn release_all(&self, handles: impl IntoIterator<Item = PipelineHandle>) {
        for handle in handles {
            self.shared.compiler.release(handle);
        }
    }
}

impl Drop for PipelineStateCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
