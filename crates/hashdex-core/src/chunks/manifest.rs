//! Reserved files at the root of every chunk.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::IndexResult;
use crate::models::CHUNK_FORMAT_VERSION;

pub const MANIFEST_FILE: &str = "chunk.json";
pub const EMPTY_INDEXES_FILE: &str = "empty-indexes.json";
pub const HASHES_FILE: &str = "hashes.db";

/// Describes what a chunk covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub format_version: u32,
    pub name: String,
    /// Every covered index and sub-index, with the kind version it was
    /// built with. Empty ones are listed too.
    pub kinds: BTreeMap<String, u32>,
    pub file_count: usize,
    pub hash_count: usize,
}

impl ChunkManifest {
    pub fn new(name: &str) -> Self {
        Self {
            format_version: CHUNK_FORMAT_VERSION,
            name: name.to_string(),
            kinds: BTreeMap::new(),
            file_count: 0,
            hash_count: 0,
        }
    }

    pub fn read(dir: &Path) -> IndexResult<Self> {
        let raw = std::fs::read(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn write(&self, dir: &Path) -> IndexResult<()> {
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Kinds that produced no data, so consumers can skip opening them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyIndexes {
    pub content_kinds: Vec<String>,
    pub structural_kinds: Vec<String>,
}

impl EmptyIndexes {
    pub fn contains(&self, name: &str) -> bool {
        self.content_kinds.iter().any(|k| k == name)
            || self.structural_kinds.iter().any(|k| k == name)
    }

    pub fn len(&self) -> usize {
        self.content_kinds.len() + self.structural_kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A missing file means nothing is empty.
    pub fn read(dir: &Path) -> IndexResult<Self> {
        let path = dir.join(EMPTY_INDEXES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    pub fn write(&self, dir: &Path) -> IndexResult<()> {
        std::fs::write(dir.join(EMPTY_INDEXES_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_files_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = ChunkManifest::new("stdlib");
        manifest.kinds.insert("words".into(), 1);
        manifest.file_count = 3;
        manifest.write(dir.path()).unwrap();
        assert_eq!(ChunkManifest::read(dir.path()).unwrap(), manifest);

        assert!(EmptyIndexes::read(dir.path()).unwrap().is_empty());
        let empty = EmptyIndexes {
            content_kinds: vec![],
            structural_kinds: vec!["structure.imports".into()],
        };
        empty.write(dir.path()).unwrap();
        let loaded = EmptyIndexes::read(dir.path()).unwrap();
        assert!(loaded.contains("structure.imports"));
        assert!(!loaded.contains("words"));
    }
}
