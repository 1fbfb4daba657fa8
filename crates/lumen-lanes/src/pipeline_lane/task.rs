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

//! The handle returned for a pipeline request.

use lumen_core::error::CompilationError;
use lumen_core::gpu::PipelineHandle;
use lumen_core::sync::{Canceled, Completion};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;

/// Why a pipeline task did not produce a pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The compiler rejected the pipeline. The key is cached as known-bad.
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// The cache shut down before the compilation finished.
    #[error("pipeline cache shut down before compilation finished")]
    Shutdown,
}

impl From<Canceled> for PipelineError {
    fn from(_: Canceled) -> Self {
        PipelineError::Shutdown
    }
}

pub(crate) type CompileOutcome = Result<PipelineHandle, PipelineError>;

/// A pending or finished pipeline request.
///
/// Cheap to clone: every clone observes the same result. Cache hits return
/// a task that is already resolved.
#[derive(Debug, Clone)]
pub struct PipelineTask {
    completion: Completion<CompileOutcome>,
}

impl PipelineTask {
    pub(crate) fn new(completion: Completion<CompileOutcome>) -> Self {
        Self { completion }
    }

    pub(crate) fn resolved(outcome: CompileOutcome) -> Self {
        Self::new(Completion::resolved(outcome))
    }

    /// The result, if the task has finished. Never blocks.
    pub fn poll(&self) -> Option<CompileOutcome> {
        self.completion.poll().map(flatten)
    }

    /// Returns `true` once the task has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.completion.is_complete()
    }

    /// Blocks until the task finishes.
    pub fn wait(&self) -> CompileOutcome {
        flatten(self.completion.wait())
    }

    /// Blocks until the task finishes or `timeout` elapses. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompileOutcome> {
        self.completion.wait_timeout(timeout).map(flatten)
    }
}

impl Future for PipelineTask {
    type Output = CompileOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx).map(flatten)
    }
}

fn flatten(result: Result<CompileOutcome, Canceled>) -> CompileOutcome {
    result.map_err(PipelineError::from).and_then(|outcome| outcome)
}
