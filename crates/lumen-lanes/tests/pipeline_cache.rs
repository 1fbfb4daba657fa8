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

use lumen_core::config::PipelineConfig;
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink, NullSink};
use lumen_core::error::CompilationError;
use lumen_core::event::EventBus;
use lumen_core::gpu::{CompileRequest, PipelineCompiler, PipelineHandle};
use lumen_core::pipeline::{MaterialDescription, PipelineKey, ShaderStageSource};
use lumen_infra::HeadlessCompiler;
use lumen_lanes::{PipelineError, PipelineStateCache};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

fn material(label: &str, fragment: &str) -> MaterialDescription {
    MaterialDescription::new(
        label,
        ShaderStageSource::new("vertex body", "vs_main"),
        ShaderStageSource::new(fragment.to_string(), "fs_main"),
    )
}

fn variant(index: usize) -> MaterialDescription {
    material("variant", "fragment body").with_define("VARIANT", index.to_string())
}

fn config(capacity: usize, workers: usize) -> PipelineConfig {
    PipelineConfig {
        cache_capacity: capacity,
        compile_workers: workers,
        blob_path: None,
    }
}

fn cache_with(
    compiler: &Arc<HeadlessCompiler>,
    capacity: usize,
    workers: usize,
) -> PipelineStateCache {
    PipelineStateCache::new(compiler.clone(), Arc::new(NullSink), &config(capacity, workers))
}

#[test]
fn hit_returns_the_compiled_handle() {
    let compiler = Arc::new(HeadlessCompiler::new());
    let cache = cache_with(&compiler, 16, 2);
    let mat = material("lit", "fs");

    let first = cache.get_or_create(&mat).wait().expect("compiles");
    let second = cache.get_or_create(&mat);
    assert!(second.is_ready());
    assert_eq!(second.poll(), Some(Ok(first)));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(compiler.compilations(), 1);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn concurrent_requests_share_one_compilation_per_variant() {
    let compiler = Arc::new(HeadlessCompiler::with_delay(Duration::from_millis(1)));
    let cache = Arc::new(cache_with(&compiler, 1024, 4));

    let requesters: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                (0..600)
                    .map(|i| cache.get_or_create(&variant(i)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for requester in requesters {
        for task in requester.join().expect("requester panicked") {
            task.wait().expect("variant compiles");
        }
    }

    assert_eq!(compiler.compilations(), 600);
    assert_eq!(compiler.duplicate_concurrent_compiles(), 0);
    assert!(compiler.max_concurrency() <= 4);
    assert_eq!(cache.len(), 600);
    assert_eq!(cache.in_flight(), 0);
    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, 2400);
    assert_eq!(stats.compilations_started, 600);
}

#[test]
fn failed_compilation_is_cached_as_known_bad() {
    let compiler = Arc::new(HeadlessCompiler::new());
    let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
    let sink: Arc<dyn DiagnosticSink> = bus.clone();
    let cache = PipelineStateCache::new(compiler.clone(), sink, &config(8, 1));
    let broken = material("broken", "#error");
    let key = PipelineKey::from_material(&broken);

    let err = cache.get_or_create(&broken).wait().unwrap_err();
    assert!(matches!(err, PipelineError::Compilation(_)));
    assert!(cache.failure(&key).is_some());

    let again = cache.get_or_create(&broken);
    assert!(again.is_ready());
    assert!(matches!(again.poll(), Some(Err(PipelineError::Compilation(_)))));
    assert_eq!(compiler.compilations(), 1);
    assert_eq!(cache.stats().known_bad_rejections, 1);

    let events = bus.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "compilation_failed");

    assert!(cache.forget_failure(&key));
    assert!(cache.get_or_create(&broken).wait().is_err());
    assert_eq!(compiler.compilations(), 2);
}

#[test]
fn panicking_compiler_fails_the_task() {
    let compiler = Arc::new(HeadlessCompiler::new());
    let cache = cache_with(&compiler, 8, 1);

    let err = cache
        .get_or_create(&material("explosive", "#panic"))
        .wait()
        .unwrap_err();
    match err {
        PipelineError::Compilation(error) => assert!(error.diagnostic.contains("panicked")),
        other => panic!("unexpected error {other:?}"),
    }

    // The worker survives and keeps compiling.
    assert!(cache.get_or_create(&material("calm", "fs")).wait().is_ok());
}

#[test]
fn lru_eviction_skips_pinned_entries() {
    let compiler = Arc::new(HeadlessCompiler::new());
    let cache = cache_with(&compiler, 2, 1);
    let a = variant(1);
    let b = variant(2);
    let c = variant(3);
    let key_a = PipelineKey::from_material(&a);
    let key_b = PipelineKey::from_material(&b);

    cache.get_or_create(&a).wait().expect("a");
    cache.get_or_create(&b).wait().expect("b");
    cache.pin(&key_a, 5);

    cache.get_or_create(&c).wait().expect("c");
    assert!(cache.contains(&key_a), "pinned entry must survive");
    assert!(!cache.contains(&key_b), "least recently used unpinned entry goes");
    assert_eq!(cache.len(), 2);
    assert_eq!(compiler.released(), 1);

    assert!(!cache.evict(&key_a));
    cache.retire(5);
    assert!(cache.evict(&key_a));
    assert_eq!(compiler.live_pipelines(), 1);
}

#[test]
fn evicted_in_flight_compilation_is_discarded() {
    let compiler = Arc::new(HeadlessCompiler::with_delay(Duration::from_millis(100)));
    let cache = cache_with(&compiler, 8, 1);
    let mat = material("slow", "fs");
    let key = PipelineKey::from_material(&mat);

    let task = cache.get_or_create(&mat);
    assert!(cache.evict(&key));
    assert!(task.wait().is_ok(), "waiters still receive the result");

    assert!(!cache.contains(&key));
    assert_eq!(cache.stats().abandoned, 1);
    assert_eq!(compiler.live_pipelines(), 0);
}

#[test]
fn shutdown_rejects_new_requests() {
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut cache = cache_with(&compiler, 8, 2);
    cache.shutdown();
    let result = cache.get_or_create(&material("late", "fs")).wait();
    assert_eq!(result, Err(PipelineError::Shutdown));
}

#[test]
fn blob_round_trip_warms_a_fresh_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipelines.bin");

    let compiler = Arc::new(HeadlessCompiler::new());
    let cache = cache_with(&compiler, 8, 1);
    cache.get_or_create(&variant(1)).wait().expect("compiles");
    cache.get_or_create(&variant(2)).wait().expect("compiles");
    assert_eq!(cache.save_blob(&path).expect("saves"), 2);

    let warm_compiler = Arc::new(HeadlessCompiler::new());
    let warm = cache_with(&warm_compiler, 8, 1);
    assert_eq!(warm.load_blob(&path).expect("loads"), 2);
    warm.get_or_create(&variant(1)).wait().expect("compiles");
    warm.get_or_create(&variant(3)).wait().expect("compiles");
    assert_eq!(warm_compiler.blob_hits(), 1);
}

/// Serializes slowly and counts serializations of already released handles.
#[derive(Debug)]
struct SlowSerializer {
    inner: HeadlessCompiler,
    started: crossbeam_channel::Sender<()>,
    released: Mutex<Vec<PipelineHandle>>,
    serialized_after_release: AtomicU64,
}

impl PipelineCompiler for SlowSerializer {
    fn compile(&self, request: &CompileRequest) -> Result<PipelineHandle, CompilationError> {
        self.inner.compile(request)
    }

    fn release(&self, handle: PipelineHandle) {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self.inner.release(handle);
    }

    fn serialize(&self, handle: PipelineHandle) -> Option<Vec<u8>> {
        let _ = self.started.send(());
        thread::sleep(Duration::from_millis(40));
        let released = self
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle);
        if released {
            self.serialized_after_release.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.serialize(handle)
    }
}

#[test]
fn clear_during_save_waits_for_serialization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipelines.bin");
    let (started, serializing) = crossbeam_channel::unbounded();
    let compiler = Arc::new(SlowSerializer {
        inner: HeadlessCompiler::new(),
        started,
        released: Mutex::new(Vec::new()),
        serialized_after_release: AtomicU64::new(0),
    });
    let cache = Arc::new(PipelineStateCache::new(
        compiler.clone(),
        Arc::new(NullSink),
        &config(8, 1),
    ));
    for i in 0..3 {
        cache.get_or_create(&variant(i)).wait().expect("compiles");
    }

    let saver = {
        let cache = cache.clone();
        thread::spawn(move || cache.save_blob(&path))
    };
    serializing.recv().expect("save started serializing");
    cache.clear();

    let written = saver.join().expect("saver panicked").expect("saves");
    assert_eq!(written, 3);
    assert_eq!(compiler.serialized_after_release.load(Ordering::SeqCst), 0);
    assert_eq!(compiler.inner.released(), 3);
    assert!(cache.is_empty());
}

#[test]
fn corrupt_blob_is_reported_and_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipelines.bin");
    std::fs::write(&path, b"LPSO but not really a blob").expect("write");

    let compiler = Arc::new(HeadlessCompiler::new());
    let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
    let sink: Arc<dyn DiagnosticSink> = bus.clone();
    let cache = PipelineStateCache::new(compiler.clone(), sink, &config(8, 1));

    assert!(cache.load_blob(&path).is_err());
    assert_eq!(bus.drain()[0].kind(), "blob_rejected");
    assert!(cache.get_or_create(&variant(7)).wait().is_ok());

    assert!(cache.load_blob(dir.path().join("missing.bin")).is_err());
    assert!(bus.is_empty(), "a missing blob is not a diagnostic");
}
