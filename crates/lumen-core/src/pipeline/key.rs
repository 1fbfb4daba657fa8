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

use super::material::{CullMode, MaterialDescription, ShaderStageSource};
use super::stable_hash64;
use crate::resource::TextureFormat;

/// The content-addressed identity of a graphics pipeline.
///
/// Two materials that differ only in parameter *values* produce the same key.
/// Stage hashes cover the source text, the entry point and the defines, so any
/// change to what the compiler would see yields a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Hash of the vertex stage (source, entry point, defines).
    pub vertex_hash: u64,
    /// Hash of the fragment stage (source, entry point, defines).
    pub fragment_hash: u64,
    /// Color attachment format.
    pub render_target_format: TextureFormat,
    /// Depth-stencil attachment format, if any.
    pub depth_format: Option<TextureFormat>,
    /// Face culling.
    pub cull_mode: CullMode,
    /// Whether alpha blending is enabled.
    pub blend_enabled: bool,
    /// Hash of the ordered parameter layout (names and kinds).
    pub layout_hash: u64,
}

impl PipelineKey {
    /// Derives the key of a material.
    pub fn from_material(material: &MaterialDescription) -> Self {
        let defines = material.sorted_defines();

        let mut layout = Vec::with_capacity(material.parameters.len() * 16);
        for parameter in &material.parameters {
            parameter.layout_bytes(&mut layout);
        }

        Self {
            vertex_hash: stage_hash(b'v', &material.vertex, &defines),
            fragment_hash: stage_hash(b'f', &material.fragment, &defines),
            render_target_format: material.render_target_format,
            depth_format: material.depth_format,
            cull_mode: material.cull_mode,
            blend_enabled: material.blend_enabled,
            layout_hash: stable_hash64(&layout),
        }
    }

    /// A 64-bit digest of the whole key, stable across processes.
    ///
    /// Used to break sorting ties deterministically and to index the
    /// persisted pipeline blob.
    pub fn stable_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(&self.vertex_hash.to_le_bytes());
        bytes.extend_from_slice(&self.fragment_hash.to_le_bytes());
        bytes.push(format_tag(Some(self.render_target_format)));
        bytes.push(format_tag(self.depth_format));
        bytes.push(match self.cull_mode {
            CullMode::None => 0,
            CullMode::Front => 1,
            CullMode::Back => 2,
        });
        bytes.push(self.blend_enabled as u8);
        bytes.extend_from_slice(&self.layout_hash.to_le_bytes());
        stable_hash64(&bytes)
    }
}

fn stage_hash(stage: u8, source: &ShaderStageSource, defines: &[(String, String)]) -> u64 {
    let mut bytes = Vec::with_capacity(source.source.len() + 64);
    bytes.push(stage);
    bytes.extend_from_slice(&(source.source.len() as u64).to_le_bytes());
    bytes.extend_from_slice(source.source.as_bytes());
    bytes.extend_from_slice(&(source.entry_point.len() as u32).to_le_bytes());
    bytes.extend_from_slice(source.entry_point.as_bytes());
    for (name, value) in defines {
        bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        bytes.extend_from_slice(value.as_bytes());
    }
    stable_hash64(&bytes)
}

fn format_tag(format: Option<TextureFormat>) -> u8 {
    match format {
        None => 0,
        Some(TextureFormat::R8Unorm) => 1,
        Some(TextureFormat::Rgba8Unorm) => 2,
        Some(TextureFormat::Rgba8UnormSrgb) => 3,
        Some(TextureFormat::Bgra8UnormSrgb) => 4,
        Some(TextureFormat::Rgba16Float) => 5,
        Some(TextureFormat::R32Float) => 6,
        Some(TextureFormat::Rgba32Float) => 7,
        Some(TextureFormat::Depth24PlusStencil8) => 8,
        Some(TextureFormat::Depth32Float) => 9,
    }
}
