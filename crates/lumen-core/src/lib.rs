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

//! # Lumen Core
//!
//! Foundational crate containing the backend contracts, value types, error
//! taxonomy and diagnostics primitives shared by every Lumen crate.
//!
//! Nothing in here owns GPU state. The managers that do (heaps, descriptors,
//! pipelines, frames) live in `lumen-data` and `lumen-lanes` and talk to the
//! platform exclusively through the traits in [`gpu`].

#![warn(missing_docs)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod frame;
pub mod gpu;
pub mod pipeline;
pub mod resource;
pub mod sync;
pub mod telemetry;
pub mod utils;

pub use config::LumenConfig;
pub use diagnostics::{DiagnosticEvent, DiagnosticSink, SkipReason};
pub use error::{CompilationError, DeviceError, RenderError, SyncError};
pub use sync::{completion_pair, Canceled, Completer, Completion};
pub use utils::timer::Stopwatch;
