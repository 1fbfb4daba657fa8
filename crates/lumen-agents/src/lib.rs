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

//! # Lumen Agents
//!
//! The orchestration layer. A [`RenderOrchestrator`] owns every manager of
//! the lower crates and drives them through one frame at a time: it decides
//! *when* memory is reclaimed, pipelines are requested, resources are bound
//! and work is submitted, and delegates *how* to the data and lane crates.

#![warn(missing_docs)]

pub mod render_agent;

pub use render_agent::{FrameDescription, FrameReport, OrchestratorStats, RenderOrchestrator};
