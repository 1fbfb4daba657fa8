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

//! The persisted pipeline cache.
//!
//! Layout: `LPSO` magic, format version (u32 LE), BLAKE3 checksum of the
//! payload (32 bytes), payload length (u64 LE), then the bincode payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"LPSO";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 32 + 8;

/// Why a blob could not be read or written.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The file could not be read or written.
    #[error("blob i/o error: {0}")]
    Io(#[from] io::Error),
    /// The file is shorter than its header claims.
    #[error("blob is truncated ({0} bytes)")]
    Truncated(usize),
    /// The file does not start with the blob magic.
    #[error("not a pipeline cache blob")]
    BadMagic,
    /// The file was written by another format version.
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u32),
    /// The payload does not match its checksum.
    #[error("blob checksum mismatch")]
    ChecksumMismatch,
    /// The payload could not be decoded.
    #[error("blob payload is malformed: {0}")]
    Decode(String),
    /// The payload could not be encoded.
    #[error("blob payload could not be encoded: {0}")]
    Encode(String),
}

#[derive(Serialize, Deserialize)]
struct BlobPayload {
    entries: Vec<(u64, Vec<u8>)>,
}

/// Backend-serialized pipelines indexed by [`PipelineKey::stable_hash`].
///
/// [`PipelineKey::stable_hash`]: lumen_core::pipeline::PipelineKey::stable_hash
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineCacheBlob {
    entries: BTreeMap<u64, Arc<[u8]>>,
}

impl PipelineCacheBlob {
    /// An empty blob.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the serialized pipeline of `key_hash`.
    pub fn insert(&mut self, key_hash: u64, bytes: impl Into<Arc<[u8]>>) {
        self.entries.insert(key_hash, bytes.into());
    }

    /// The serialized pipeline of `key_hash`.
    pub fn get(&self, key_hash: u64) -> Option<&Arc<[u8]>> {
        self.entries.get(&key_hash)
    }

    /// Number of stored pipelines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no pipeline is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (u64, Arc<[u8]>)> {
        self.entries.into_iter()
    }

    /// Serializes the blob.
    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        let payload = BlobPayload {
            entries: self
                .entries
                .iter()
                .map(|(hash, bytes)| (*hash, bytes.to_vec()))
                .collect(),
        };
        let payload = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| BlobError::Encode(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(blake3::hash(&payload).as_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parses and verifies a serialized blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() < HEADER_LEN {
            return Err(BlobError::Truncated(bytes.len()));
        }
        let (magic, rest) = bytes.split_at(4);
        if magic != MAGIC {
            return Err(BlobError::BadMagic);
        }
        let (version, rest) = rest.split_at(4);
        let version = u32::from_le_bytes(array(version)?);
        if version != VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }
        let (checksum, rest) = rest.split_at(32);
        let (len, payload) = rest.split_at(8);
        let len = u64::from_le_bytes(array(len)?) as usize;
        if payload.len() < len {
            return Err(BlobError::Truncated(bytes.len()));
        }
        let payload = &payload[..len];
        if blake3::hash(payload).as_bytes() != checksum {
            return Err(BlobError::ChecksumMismatch);
        }

        let (decoded, _): (BlobPayload, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| BlobError::Decode(e.to_string()))?;
        Ok(Self {
            entries: decoded
                .entries
                .into_iter()
                .map(|(hash, bytes)| (hash, Arc::from(bytes)))
                .collect(),
        })
    }

    /// Reads a blob from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlobError> {
        Self::decode(&fs::read(path)?)
    }

    /// Writes the blob to a sibling temp file, then renames it over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BlobError> {
        let path = path.as_ref();
        let bytes = self.encode()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], BlobError> {
    bytes
        .try_into()
        .map_err(|_| BlobError::Truncated(bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineCacheBlob {
        let mut blob = PipelineCacheBlob::new();
        blob.insert(1, vec![1, 2, 3]);
        blob.insert(99, vec![7; 64]);
        blob
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipelines.lpso");
        sample().save(&path).unwrap();
        let loaded = PipelineCacheBlob::load(&path).unwrap();
        assert_eq!(loaded, sample());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corruption_is_detected() {
        let mut bytes = sample().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            PipelineCacheBlob::decode(&bytes),
            Err(BlobError::ChecksumMismatch)
        ));
    }

    #[test]
    fn truncation_and_foreign_files_are_rejected() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            PipelineCacheBlob::decode(&bytes[..bytes.len() - 5]),
            Err(BlobError::Truncated(_))
        ));
        assert!(matches!(
            PipelineCacheBlob::decode(&bytes[..10]),
            Err(BlobError::Truncated(10))
        ));
        let mut foreign = bytes.clone();
        foreign[0] = b'X';
        assert!(matches!(
            PipelineCacheBlob::decode(&foreign),
            Err(BlobError::BadMagic)
        ));
        let mut future = bytes;
        future[4] = 2;
        assert!(matches!(
            PipelineCacheBlob::decode(&future),
            Err(BlobError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PipelineCacheBlob::load(dir.path().join("absent")),
            Err(BlobError::Io(_))
        ));
    }
}
