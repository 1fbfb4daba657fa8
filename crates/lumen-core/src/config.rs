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

//! Runtime configuration of the orchestration core.
//!
//! Every field has a default, so a RON file only needs to mention what it
//! overrides:
//!
//! ```ron
//! (
//!     frames: (frames_in_flight: 3),
//!     pipelines: (compile_workers: 2),
//! )
//! ```

use crate::resource::HeapClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Frame pacing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Number of frames the CPU may record ahead of the GPU (2 or 3).
    pub frames_in_flight: u32,
    /// Upper bound of any fence wait, in milliseconds.
    pub fence_timeout_ms: u64,
}

impl FrameConfig {
    /// The fence timeout as a [`Duration`].
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ms: 2_000,
        }
    }
}

/// Heap sizing of one heap class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapClassConfig {
    /// Size of a regular heap, in bytes. Oversize requests get a dedicated heap.
    pub heap_size: u64,
    /// Maximum number of heaps of this class, dedicated heaps included.
    pub max_heaps: u32,
}

impl Default for HeapClassConfig {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024,
            max_heaps: 16,
        }
    }
}

/// GPU memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// GPU-local heaps.
    pub default_heaps: HeapClassConfig,
    /// Staging heaps.
    pub upload_heaps: HeapClassConfig,
    /// Readback heaps.
    pub readback_heaps: HeapClassConfig,
}

impl MemoryConfig {
    /// Returns the settings of `class`.
    pub fn class(&self, class: HeapClass) -> HeapClassConfig {
        match class {
            HeapClass::Default => self.default_heaps,
            HeapClass::Upload => self.upload_heaps,
            HeapClass::Readback => self.readback_heaps,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_heaps: HeapClassConfig::default(),
            upload_heaps: HeapClassConfig {
                heap_size: 16 * 1024 * 1024,
                max_heaps: 8,
            },
            readback_heaps: HeapClassConfig {
                heap_size: 4 * 1024 * 1024,
                max_heaps: 4,
            },
        }
    }
}

/// Descriptor table settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Total number of descriptors in the table.
    pub capacity: u32,
    /// Number of descriptors reserved for the static tier. The rest is the dynamic ring.
    pub static_capacity: u32,
    /// Dynamic binds after which a resource is promoted to the static tier.
    pub promotion_threshold: u32,
    /// When set, bind counts reset every this many frames instead of accumulating forever.
    pub promotion_window_frames: Option<u32>,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            static_capacity: 8_192,
            promotion_threshold: 1_000,
            promotion_window_frames: None,
        }
    }
}

/// Pipeline cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of compiled pipelines kept in memory.
    pub cache_capacity: usize,
    /// Number of compile worker threads. Bounds concurrent compilations.
    pub compile_workers: usize,
    /// Where the persisted pipeline blob is read from and written to.
    pub blob_path: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 512,
            compile_workers: 4,
            blob_path: None,
        }
    }
}

/// Resource pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Releases are disposed once more than this many idle objects of the same
    /// description are parked.
    pub max_free_per_key: usize,
    /// Memory budget enforced by residency optimization, in bytes.
    pub residency_budget_bytes: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_per_key: 4,
            residency_budget_bytes: None,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Number of frames in the rolling frame-time window.
    pub frame_time_window: usize,
    /// Whether per-frame metrics are published to the metrics registry.
    pub publish_metrics: bool,
    /// Whether diagnostic events are also written to the log.
    pub log_diagnostics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            frame_time_window: 120,
            publish_metrics: true,
            log_diagnostics: true,
        }
    }
}

/// The complete configuration of a Lumen renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    /// Frame pacing.
    pub frames: FrameConfig,
    /// GPU heaps.
    pub memory: MemoryConfig,
    /// Descriptor tables.
    pub descriptors: DescriptorConfig,
    /// Pipeline cache.
    pub pipelines: PipelineConfig,
    /// Resource pools.
    pub pools: PoolConfig,
    /// Telemetry.
    pub telemetry: TelemetryConfig,
}

impl LumenConfig {
    /// Parses a configuration from RON text and validates it.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: LumenConfig =
            ron::de::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a RON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_ron_str(&text)?;
        log::info!("LumenConfig: loaded '{}'", path.display());
        Ok(config)
    }

    /// Serializes the configuration to pretty RON.
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        let pretty = ron::ser::PrettyConfig::default().indentor("  ".to_string());
        ron::ser::to_string_pretty(self, pretty).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=3).contains(&self.frames.frames_in_flight) {
            return Err(ConfigError::invalid(
                "frames.frames_in_flight",
                "must be 2 or 3",
            ));
        }
        if self.frames.fence_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "frames.fence_timeout_ms",
                "must be greater than zero",
            ));
        }
        for class in HeapClass::ALL {
            let heaps = self.memory.class(class);
            if heaps.heap_size == 0 || heaps.max_heaps == 0 {
                return Err(ConfigError::invalid(
                    format!("memory.{}_heaps", class.name()),
                    "heap_size and max_heaps must be greater than zero",
                ));
            }
        }
        let d = &self.descriptors;
        if d.static_capacity >= d.capacity {
            return Err(ConfigError::invalid(
                "descriptors.static_capacity",
                "must be smaller than descriptors.capacity",
            ));
        }
        if d.promotion_window_frames == Some(0) {
            return Err(ConfigError::invalid(
                "descriptors.promotion_window_frames",
                "must be greater than zero when set",
            ));
        }
        if self.pipelines.compile_workers == 0 {
            return Err(ConfigError::invalid(
                "pipelines.compile_workers",
                "must be greater than zero",
            ));
        }
        if self.pipelines.cache_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipelines.cache_capacity",
                "must be greater than zero",
            ));
        }
        if self.telemetry.frame_time_window == 0 {
            return Err(ConfigError::invalid(
                "telemetry.frame_time_window",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// An error produced while loading or validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read.
    Io {
        /// The path that failed to load.
        path: String,
        /// The underlying I/O error.
        message: String,
    },
    /// The text is not valid RON for [`LumenConfig`].
    Parse(String),
    /// A value is out of its allowed range.
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "Failed to read config '{path}': {message}")
            }
            ConfigError::Parse(msg) => write!(f, "Failed to parse config: {msg}"),
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid config value '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LumenConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.pipelines.cache_capacity, 512);
        assert_eq!(config.pipelines.compile_workers, 4);
        assert_eq!(config.descriptors.promotion_threshold, 1_000);
    }

    #[test]
    fn partial_ron_overrides_only_named_fields() {
        let config = LumenConfig::from_ron_str(
            "(frames: (frames_in_flight: 3), descriptors: (promotion_window_frames: Some(60)))",
        )
        .expect("valid config");
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.frames.fence_timeout_ms, 2_000);
        assert_eq!(config.descriptors.promotion_window_frames, Some(60));
        assert_eq!(config.descriptors.capacity, 16_384);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = LumenConfig::from_ron_str("(frames: (frames_in_flight: 5))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "frames.frames_in_flight"));

        let err = LumenConfig::from_ron_str(
            "(descriptors: (capacity: 128, static_capacity: 128))",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn malformed_ron_is_a_parse_error() {
        let err = LumenConfig::from_ron_str("(frames: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn pretty_output_parses_back() {
        let mut config = LumenConfig::default();
        config.pools.max_free_per_key = 9;
        let text = config.to_ron_string().expect("serializable");
        assert_eq!(LumenConfig::from_ron_str(&text).expect("valid"), config);
    }
}
