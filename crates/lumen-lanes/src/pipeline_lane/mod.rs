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

//! Content-addressed pipeline compilation.
//!
//! [`PipelineStateCache`] maps a [`PipelineKey`] to a compiled pipeline. Misses
//! are compiled on a fixed pool of worker threads; callers get a
//! [`PipelineTask`] they can poll, block on, or await.
//!
//! [`PipelineKey`]: lumen_core::pipeline::PipelineKey

mod blob;
mod cache;
mod task;
mod worker;

pub use blob::{BlobError, PipelineCacheBlob};
pub use cache::{PipelineCacheStats, PipelineStateCache};
pub use task::{PipelineError, PipelineTask};
