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

//! # Lumen Lanes
//!
//! The hot-path stages a frame flows through:
//!
//! - [`pipeline_lane`]: the content-addressed pipeline cache, its compile
//!   workers and the persisted blob.
//! - [`command_lane`]: batching renderables into barrier-minimal command streams.
//! - [`frame_lane`]: frame-slot fencing across queues and the async upload path.

#![warn(missing_docs)]

pub mod command_lane;
pub mod frame_lane;
pub mod pipeline_lane;

pub use command_lane::{
    BatchError, BatchState, BatchStats, CommandBatcher, DrawResolver, RecordContext,
    ResourceBarrierOptimizer,
};
pub use frame_lane::{
    FrameContext, FrameSynchronizer, SlotState, UploadError, UploadHandle, UploadManager,
    UploadStats,
};
pub use pipeline_lane::{
    BlobError, PipelineCacheBlob, PipelineCacheStats, PipelineError, PipelineStateCache,
    PipelineTask,
};
