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

//! Material descriptions and the content-addressed pipeline key derived from them.

mod key;
mod material;

pub use self::key::PipelineKey;
pub use self::material::{
    CullMode, MaterialDescription, MaterialParameter, ParameterKind, ShaderStage,
    ShaderStageSource,
};

/// Hashes bytes with BLAKE3 and truncates the digest to 64 bits.
///
/// The result is stable across processes and platforms, which makes it usable
/// as an index into persisted data.
pub fn stable_hash64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}
