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

//! Structured diagnostics emitted by the orchestration core.
//!
//! Diagnostics are fire-and-forget: components emit them into a
//! [`DiagnosticSink`] and move on. Nothing in the core waits on a consumer.

use crate::error::CompilationError;
use crate::event::EventBus;
use crate::frame::RenderableId;
use crate::gpu::QueueKind;
use crate::resource::{HeapClass, PoolHandle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a draw was left out of the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A bound pool handle is unknown or stale.
    MissingBinding(PoolHandle),
    /// The draw's pipeline is still compiling.
    PipelinePending,
    /// The draw's pipeline failed to compile.
    PipelineFailed,
    /// The draw's descriptors could not be allocated.
    DescriptorUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingBinding(handle) => write!(f, "missing binding {handle}"),
            SkipReason::PipelinePending => write!(f, "pipeline pending"),
            SkipReason::PipelineFailed => write!(f, "pipeline failed"),
            SkipReason::DescriptorUnavailable => write!(f, "descriptors unavailable"),
        }
    }
}

/// A structured event describing something a collaborator may want to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A pipeline failed to compile and its key is now known-bad.
    CompilationFailed {
        /// Stable hash of the pipeline key.
        key_hash: u64,
        /// The compiler's error.
        error: CompilationError,
    },
    /// A heap allocation could not be satisfied.
    OutOfMemory {
        /// The heap class that was exhausted.
        class: HeapClass,
        /// The requested size, in bytes.
        requested: u64,
    },
    /// A draw was skipped.
    DrawSkipped {
        /// The skipped renderable.
        renderable: RenderableId,
        /// Why it was skipped.
        reason: SkipReason,
    },
    /// A fence wait timed out. Fatal for the frame loop.
    FenceTimeout {
        /// The queue whose fence was awaited.
        queue: QueueKind,
        /// The awaited value.
        value: u64,
        /// How long the wait lasted.
        waited: Duration,
    },
    /// The device was lost. Fatal for the frame loop.
    DeviceLost {
        /// Where the loss was observed.
        context: String,
    },
    /// An asynchronous upload failed.
    UploadFailed {
        /// The upload's sequence number.
        upload: u64,
        /// The failure reason.
        reason: String,
    },
    /// A persisted pipeline blob was rejected and will be rebuilt.
    BlobRejected {
        /// Why it was rejected.
        reason: String,
    },
    /// A streaming resource was evicted to meet the memory budget.
    ResidencyEvicted {
        /// The evicted resource.
        handle: PoolHandle,
        /// Bytes released.
        bytes: u64,
    },
}

impl DiagnosticEvent {
    /// A short, stable name of the event kind, usable as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            DiagnosticEvent::CompilationFailed { .. } => "compilation_failed",
            DiagnosticEvent::OutOfMemory { .. } => "out_of_memory",
            DiagnosticEvent::DrawSkipped { .. } => "draw_skipped",
            DiagnosticEvent::FenceTimeout { .. } => "fence_timeout",
            DiagnosticEvent::DeviceLost { .. } => "device_lost",
            DiagnosticEvent::UploadFailed { .. } => "upload_failed",
            DiagnosticEvent::BlobRejected { .. } => "blob_rejected",
            DiagnosticEvent::ResidencyEvicted { .. } => "residency_evicted",
        }
    }

    /// The log level this event is reported at.
    pub fn level(&self) -> log::Level {
        match self {
            DiagnosticEvent::CompilationFailed { .. }
            | DiagnosticEvent::FenceTimeout { .. }
            | DiagnosticEvent::DeviceLost { .. }
            | DiagnosticEvent::UploadFailed { .. } => log::Level::Error,
            DiagnosticEvent::OutOfMemory { .. }
            | DiagnosticEvent::DrawSkipped { .. }
            | DiagnosticEvent::BlobRejected { .. } => log::Level::Warn,
            DiagnosticEvent::ResidencyEvicted { .. } => log::Level::Debug,
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::CompilationFailed { key_hash, error } => {
                write!(f, "pipeline {key_hash:016x} failed: {error}")
            }
            DiagnosticEvent::OutOfMemory { class, requested } => {
                write!(f, "out of {} heap memory ({requested} bytes requested)", class.name())
            }
            DiagnosticEvent::DrawSkipped { renderable, reason } => {
                write!(f, "{renderable} skipped: {reason}")
            }
            DiagnosticEvent::FenceTimeout {
                queue,
                value,
                waited,
            } => write!(
                f,
                "{} fence value {value} not reached after {waited:?}",
                queue.name()
            ),
            DiagnosticEvent::DeviceLost { context } => write!(f, "device lost during {context}"),
            DiagnosticEvent::UploadFailed { upload, reason } => {
                write!(f, "upload #{upload} failed: {reason}")
            }
            DiagnosticEvent::BlobRejected { reason } => {
                write!(f, "pipeline blob rejected: {reason}")
            }
            DiagnosticEvent::ResidencyEvicted { handle, bytes } => {
                write!(f, "{handle} evicted ({bytes} bytes)")
            }
        }
    }
}

/// A consumer of diagnostic events. Emission must never block.
pub trait DiagnosticSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: DiagnosticEvent);
}

impl DiagnosticSink for EventBus<DiagnosticEvent> {
    fn emit(&self, event: DiagnosticEvent) {
        self.publish(event);
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn emit(&self, event: DiagnosticEvent) {
        (**self).emit(event);
    }
}

/// A sink that writes every event to the log and optionally forwards it.
#[derive(Default)]
pub struct LogSink {
    forward: Option<Arc<dyn DiagnosticSink>>,
}

impl LogSink {
    /// A sink that only logs.
    pub fn new() -> Self {
        Self { forward: None }
    }

    /// A sink that logs, then forwards to `inner`.
    pub fn forwarding(inner: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            forward: Some(inner),
        }
    }
}

impl DiagnosticSink for LogSink {
    fn emit(&self, event: DiagnosticEvent) {
        log::log!(event.level(), "Diagnostics: {event}");
        if let Some(inner) = &self.forward {
            inner.emit(event);
        }
    }
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _event: DiagnosticEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bus_is_a_sink() {
        let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
        let sink: Arc<dyn DiagnosticSink> = bus.clone();
        sink.emit(DiagnosticEvent::BlobRejected {
            reason: "checksum".to_string(),
        });
        let events = bus.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "blob_rejected");
    }

    #[test]
    fn log_sink_forwards() {
        let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
        let sink = LogSink::forwarding(bus.clone());
        sink.emit(DiagnosticEvent::OutOfMemory {
            class: HeapClass::Upload,
            requested: 4096,
        });
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn display_is_human_readable() {
        let event = DiagnosticEvent::DrawSkipped {
            renderable: RenderableId(4),
            reason: SkipReason::PipelinePending,
        };
        assert_eq!(event.to_string(), "renderable#4 skipped: pipeline pending");
        assert_eq!(event.level(), log::Level::Warn);
    }
}
