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

//! The pipeline compiler contract.

use super::PipelineHandle;
use crate::error::CompilationError;
use crate::pipeline::{PipelineKey, ShaderStageSource};
use std::fmt::Debug;
use std::sync::Arc;

/// Everything a backend needs to compile one pipeline state object.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// The content-addressed key of the pipeline.
    pub key: PipelineKey,
    /// Debug label, usually the material label.
    pub label: String,
    /// Vertex stage.
    pub vertex: ShaderStageSource,
    /// Fragment stage.
    pub fragment: ShaderStageSource,
    /// Preprocessor defines, sorted by name.
    pub defines: Vec<(String, String)>,
    /// Previously serialized pipeline bytes for this key, if a persisted cache had them.
    pub cached_blob: Option<Arc<[u8]>>,
}

/// A backend able to turn a [`CompileRequest`] into a pipeline object.
///
/// `compile` is synchronous and is called concurrently from the pipeline
/// cache's worker threads.
pub trait PipelineCompiler: Send + Sync + Debug + 'static {
    /// Compiles a pipeline. Slow; never called on the render thread.
    fn compile(&self, request: &CompileRequest) -> Result<PipelineHandle, CompilationError>;

    /// Releases a pipeline previously returned by `compile`.
    fn release(&self, handle: PipelineHandle);

    /// Serializes a compiled pipeline for the persisted cache.
    ///
    /// Backends without a serializable pipeline format return `None`.
    fn serialize(&self, _handle: PipelineHandle) -> Option<Vec<u8>> {
        None
    }
}
