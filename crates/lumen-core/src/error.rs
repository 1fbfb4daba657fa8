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

//! Defines the error types shared across the backend contracts.
//!
//! Component-local errors (memory, descriptors, pools, batching, blobs) live
//! next to their components. The types here cross crate boundaries: they are
//! returned by backend traits or carried by diagnostics.

use crate::gpu::QueueKind;
use crate::pipeline::ShaderStage;
use std::fmt;
use std::time::Duration;

/// A pipeline failed to compile.
///
/// Compilation errors are cached as known-bad by the pipeline cache and
/// surfaced to every caller that asks for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationError {
    /// The label of the material whose pipeline failed.
    pub label: String,
    /// The stages the compiler rejected.
    pub stages: Vec<ShaderStage>,
    /// The compiler's diagnostic output.
    pub diagnostic: String,
}

impl CompilationError {
    /// Creates a compilation error.
    pub fn new(label: impl Into<String>, stages: Vec<ShaderStage>, diagnostic: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages,
            diagnostic: diagnostic.into(),
        }
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages = self
            .stages
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "Pipeline compilation failed for '{}' [{}]: {}",
            self.label, stages, self.diagnostic
        )
    }
}

impl std::error::Error for CompilationError {}

/// An error raised by the platform layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device was lost and no further work can be executed.
    DeviceLost(String),
    /// The device could not satisfy a heap or resource allocation.
    OutOfDeviceMemory,
    /// A handle passed to the device does not refer to a live object.
    InvalidHandle(String),
    /// Any other backend-specific failure.
    Backend(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::DeviceLost(reason) => write!(f, "Device lost: {reason}"),
            DeviceError::OutOfDeviceMemory => write!(f, "Out of device memory"),
            DeviceError::InvalidHandle(what) => write!(f, "Invalid device handle: {what}"),
            DeviceError::Backend(msg) => write!(f, "Backend error: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// A failure of GPU/CPU synchronization. Both variants are fatal for the frame loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A bounded fence wait expired before the GPU reached the value.
    FenceTimeout {
        /// The queue whose fence was awaited.
        queue: QueueKind,
        /// The awaited fence value.
        value: u64,
        /// How long the caller waited.
        waited: Duration,
    },
    /// The device was lost while waiting or signaling.
    DeviceLost(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::FenceTimeout {
                queue,
                value,
                waited,
            } => write!(
                f,
                "Timed out after {:?} waiting for {} fence value {}",
                waited,
                queue.name(),
                value
            ),
            SyncError::DeviceLost(reason) => write!(f, "Device lost: {reason}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<DeviceError> for SyncError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::DeviceLost(reason) => SyncError::DeviceLost(reason),
            other => SyncError::DeviceLost(other.to_string()),
        }
    }
}

/// The top-level error of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A fatal synchronization error. The frame loop halts until recovered.
    Fatal(SyncError),
    /// The frame loop is halted after a fatal error and refuses new frames.
    Halted,
    /// A non-fatal device error while recording or submitting.
    Device(DeviceError),
    /// The frame was driven out of order (e.g. two `begin_frame` calls).
    InvalidFrameState(String),
}

impl RenderError {
    /// Returns `true` if the error requires a recovery before the next frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Fatal(_) | RenderError::Halted)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Fatal(err) => write!(f, "Fatal render error: {err}"),
            RenderError::Halted => write!(f, "Renderer is halted and must be recovered"),
            RenderError::Device(err) => write!(f, "Device error: {err}"),
            RenderError::InvalidFrameState(msg) => write!(f, "Invalid frame state: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Fatal(err) => Some(err),
            RenderError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SyncError> for RenderError {
    fn from(err: SyncError) -> Self {
        RenderError::Fatal(err)
    }
}

impl From<DeviceError> for RenderError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::DeviceLost(reason) => RenderError::Fatal(SyncError::DeviceLost(reason)),
            other => RenderError::Device(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_error_display() {
        let err = CompilationError::new(
            "water",
            vec![ShaderStage::Vertex, ShaderStage::Fragment],
            "unknown identifier",
        );
        assert_eq!(
            err.to_string(),
            "Pipeline compilation failed for 'water' [vertex, fragment]: unknown identifier"
        );
    }

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::FenceTimeout {
            queue: QueueKind::Graphics,
            value: 7,
            waited: Duration::from_millis(5),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5ms waiting for graphics fence value 7"
        );
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let err: RenderError = DeviceError::DeviceLost("reset".to_string()).into();
        assert!(err.is_fatal());
        assert_eq!(err, RenderError::Fatal(SyncError::DeviceLost("reset".to_string())));

        let err: RenderError = DeviceError::OutOfDeviceMemory.into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_device_error_maps_to_device_lost_sync_error() {
        let err: SyncError = DeviceError::Backend("queue hung".to_string()).into();
        assert_eq!(
            err,
            SyncError::DeviceLost("Backend error: queue hung".to_string())
        );
    }
}
