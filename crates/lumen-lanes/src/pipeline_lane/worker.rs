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

//! Compile worker threads.

use super::cache::CacheShared;
use super::task::PipelineError;
use crossbeam_channel::Receiver;
use lumen_core::error::CompilationError;
use lumen_core::gpu::{CompileRequest, PipelineHandle};
use lumen_core::pipeline::ShaderStage;
use lumen_core::sync::Completer;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// One queued compilation.
pub(crate) struct CompileJob {
    pub(crate) ticket: u64,
    pub(crate) request: CompileRequest,
    pub(crate) completer: Completer<Result<PipelineHandle, PipelineError>>,
}

/// Spawns `count` workers draining `jobs`. Each exits when the channel closes.
pub(crate) fn spawn_workers(
    count: usize,
    shared: Arc<CacheShared>,
    jobs: Receiver<CompileJob>,
) -> Vec<thread::JoinHandle<()>> {
    (0..count)
        .filter_map(|index| {
            let shared = shared.clone();
            let jobs = jobs.clone();
            thread::Builder::new()
                .name(format!("lumen-pso-{index}"))
                .spawn(move || run(&shared, &jobs))
                .map_err(|err| {
                    log::error!("PipelineStateCache: failed to spawn compile worker {index}: {err}")
                })
                .ok()
        })
        .collect()
}

fn run(shared: &CacheShared, jobs: &Receiver<CompileJob>) {
    while let Ok(job) = jobs.recv() {
        let compiler = shared.compiler();
        let result = panic::catch_unwind(AssertUnwindSafe(|| compiler.compile(&job.request)))
            .unwrap_or_else(|payload| {
                Err(CompilationError::new(
                    job.request.label.clone(),
                    vec![ShaderStage::Vertex, ShaderStage::Fragment],
                    format!("compiler panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        let outcome = shared.finish(job.ticket, job.request.key, result);
        job.completer.complete(outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
