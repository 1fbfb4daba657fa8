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

use crate::resource::TextureFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    /// The vertex stage.
    Vertex,
    /// The fragment stage.
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// Defines which face of a triangle to cull (not render).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    /// No culling is performed.
    None,
    /// Cull front-facing triangles.
    Front,
    /// Cull back-facing triangles.
    #[default]
    Back,
}

/// The source of one shader stage.
///
/// The source text is shared so that many material variants can point at the
/// same program without copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageSource {
    /// Shader source text. Its contents are opaque to the core.
    pub source: Arc<str>,
    /// The entry point function name.
    pub entry_point: String,
}

impl ShaderStageSource {
    /// Creates a stage source.
    pub fn new(source: impl Into<Arc<str>>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
        }
    }
}

/// The data type of a material parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// A single float.
    Float,
    /// A four-component float vector.
    Vec4,
    /// An RGBA color.
    Color,
    /// A sampled texture binding.
    Texture,
}

impl ParameterKind {
    fn tag(&self) -> u8 {
        match self {
            ParameterKind::Float => 0,
            ParameterKind::Vec4 => 1,
            ParameterKind::Color => 2,
            ParameterKind::Texture => 3,
        }
    }
}

/// One named material parameter.
///
/// Only the name and kind contribute to the pipeline layout; the value is
/// per-instance data and never affects which pipeline is used.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialParameter {
    /// Parameter name as referenced by the shader.
    pub name: String,
    /// Parameter type.
    pub kind: ParameterKind,
    /// Current value. Scalars use the first component.
    pub value: [f32; 4],
}

impl MaterialParameter {
    /// Creates a parameter with a zero value.
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: [0.0; 4],
        }
    }

    /// Returns the parameter with its value replaced.
    pub fn with_value(mut self, value: [f32; 4]) -> Self {
        self.value = value;
        self
    }

    pub(crate) fn layout_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.kind.tag());
    }
}

/// A full description of a material: everything that determines its pipeline
/// plus the per-instance parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDescription {
    /// Debug label used in logs and errors.
    pub label: String,
    /// Vertex stage source.
    pub vertex: ShaderStageSource,
    /// Fragment stage source.
    pub fragment: ShaderStageSource,
    /// Preprocessor defines applied to both stages.
    pub defines: Vec<(String, String)>,
    /// Color attachment format.
    pub render_target_format: TextureFormat,
    /// Depth-stencil attachment format, if any.
    pub depth_format: Option<TextureFormat>,
    /// Face culling.
    pub cull_mode: CullMode,
    /// Whether alpha blending is enabled.
    pub blend_enabled: bool,
    /// Ordered parameter list.
    pub parameters: Vec<MaterialParameter>,
}

impl MaterialDescription {
    /// Creates an opaque material with default state and no parameters.
    pub fn new(
        label: impl Into<String>,
        vertex: ShaderStageSource,
        fragment: ShaderStageSource,
    ) -> Self {
        Self {
            label: label.into(),
            vertex,
            fragment,
            defines: Vec::new(),
            render_target_format: TextureFormat::Rgba8UnormSrgb,
            depth_format: Some(TextureFormat::Depth32Float),
            cull_mode: CullMode::Back,
            blend_enabled: false,
            parameters: Vec::new(),
        }
    }

    /// Adds a preprocessor define.
    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    /// Appends a parameter.
    pub fn with_parameter(mut self, parameter: MaterialParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Enables or disables alpha blending.
    pub fn with_blend(mut self, enabled: bool) -> Self {
        self.blend_enabled = enabled;
        self
    }

    /// Defines sorted by name, so that declaration order does not change the key.
    pub fn sorted_defines(&self) -> Vec<(String, String)> {
        let mut defines = self.defines.clone();
        defines.sort();
        defines
    }
}
