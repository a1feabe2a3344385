//! File -> chunk-hash association, used to find the chunk serving a file.

use std::path::Path;

use tracing::warn;

use crate::errors::{IndexError, IndexResult};
use crate::index::derived::DerivedDataIndex;
use crate::index::storage_path;
use crate::models::{ChunkHashId, ChunkId, FileId, FileMeta, InputData, Stamp, NULL_CHUNK_ID};
use crate::store::storage::{MemoryIndexStorage, SqliteIndexStorage};

pub const CONTENT_HASH_INDEX: &str = "content-hash";
const CONTENT_HASH_VERSION: u32 = 1;

const CHUNK_PREFIX: &str = "chunk:";
const HASH_PREFIX: &str = "hash:";

/// Shared content-hash index. Only consulted when shared chunk reuse is on.
pub struct FileContentHashIndex {
    index: DerivedDataIndex,
}

impl FileContentHashIndex {
    pub fn open(root: &Path) -> IndexResult<Self> {
        let storage = SqliteIndexStorage::open(&storage_path(root, CONTENT_HASH_INDEX))?;
        Ok(Self::from_index(DerivedDataIndex::new(
            CONTENT_HASH_INDEX,
            CONTENT_HASH_VERSION,
            Box::new(storage),
        )))
    }

    pub fn in_memory() -> Self {
        Self::from_index(DerivedDataIndex::new(
            CONTENT_HASH_INDEX,
            CONTENT_HASH_VERSION,
            Box::new(MemoryIndexStorage::new()),
        ))
    }

    pub fn from_index(index: DerivedDataIndex) -> Self {
        Self { index }
    }

    /// Record that `meta`, at its current content version, is served by `id`.
    pub fn associate(&self, meta: &FileMeta, id: ChunkHashId) -> IndexResult<()> {
        let mut data = InputData::new();
        data.insert(format!("{CHUNK_PREFIX}{}", id.chunk_id().0), Vec::new());
        data.insert(format!("{HASH_PREFIX}{}", id.0), Vec::new());
        let stamp = Stamp::from_chunk(meta.content_version, CONTENT_HASH_VERSION, id.chunk_id());
        self.index.update(meta.id.0 as u64, &data, stamp)?;
        Ok(())
    }

    /// Drop any association; the file is indexed locally.
    pub fn dissociate(&self, meta: &FileMeta) -> IndexResult<()> {
        let stamp = Stamp::local(meta.content_version, CONTENT_HASH_VERSION);
        self.index.update(meta.id.0 as u64, &InputData::new(), stamp)?;
        Ok(())
    }

    /// Association of `meta` at its current content version.
    pub fn associated(&self, meta: &FileMeta) -> IndexResult<Option<ChunkHashId>> {
        let input = meta.id.0 as u64;
        let current = self
            .index
            .stamp(input)?
            .is_some_and(|s| s.fingerprint == meta.content_version && s.chunk.is_some());
        if !current {
            return Ok(None);
        }
        let data = self.index.forward(input)?;
        Ok(data
            .keys()
            .find_map(|k| k.strip_prefix(HASH_PREFIX))
            .and_then(|v| v.parse::<u64>().ok())
            .map(ChunkHashId))
    }

    /// Chunk serving `meta`, or `NULL_CHUNK_ID`. Faults never propagate: a
    /// storage fault schedules a rebuild of this index and reads as "none".
    pub fn associated_chunk_id(&self, meta: &FileMeta) -> ChunkId {
        match self.associated(meta) {
            Ok(id) => id.map_or(NULL_CHUNK_ID, ChunkHashId::chunk_id),
            Err(IndexError::RebuildPending(_)) => NULL_CHUNK_ID,
            Err(e) => {
                if e.is_storage_fault() {
                    self.index.request_rebuild(&e.to_string());
                } else {
                    warn!(file = %meta.id, error = %e, "content hash lookup failed");
                }
                NULL_CHUNK_ID
            }
        }
    }

    pub fn files_for_chunk(&self, chunk: ChunkId) -> IndexResult<Vec<FileId>> {
        self.files_for_key(&format!("{CHUNK_PREFIX}{}", chunk.0))
    }

    pub fn files_for_hash(&self, id: ChunkHashId) -> IndexResult<Vec<FileId>> {
        self.files_for_key(&format!("{HASH_PREFIX}{}", id.0))
    }

    fn files_for_key(&self, key: &str) -> IndexResult<Vec<FileId>> {
        Ok(self
            .index
            .values(key)?
            .into_iter()
            .map(|(input, _)| FileId(input as u32))
            .collect())
    }

    pub fn is_rebuild_pending(&self) -> bool {
        self.index.is_rebuild_pending()
    }

    /// Rebuild if one was requested; returns whether it ran.
    pub fn run_pending_rebuild(&self) -> IndexResult<bool> {
        if !self.index.is_rebuild_pending() {
            return Ok(false);
        }
        self.index.rebuild()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileOrigin, HashId};
    use std::path::PathBuf;

    fn meta(id: u32, version: u64) -> FileMeta {
        FileMeta {
            id: FileId(id),
            path: PathBuf::from(format!("f{id}.txt")),
            size: 1,
            content_version: version,
            origin: FileOrigin::Local,
            is_directory: false,
        }
    }

    #[test]
    fn test_associate_and_reverse_lookup() {
        let index = FileContentHashIndex::in_memory();
        let h1 = ChunkHashId::new(ChunkId(2), HashId(10));
        index.associate(&meta(1, 1), h1).unwrap();
        index.associate(&meta(2, 1), h1).unwrap();
        index
            .associate(&meta(3, 1), ChunkHashId::new(ChunkId(3), HashId(10)))
            .unwrap();

        assert_eq!(index.associated_chunk_id(&meta(1, 1)), ChunkId(2));
        assert_eq!(index.files_for_hash(h1).unwrap(), vec![FileId(1), FileId(2)]);
        assert_eq!(index.files_for_chunk(ChunkId(3)).unwrap(), vec![FileId(3)]);
    }

    #[test]
    fn test_association_follows_content_version() {
        let index = FileContentHashIndex::in_memory();
        index
            .associate(&meta(1, 1), ChunkHashId::new(ChunkId(2), HashId(1)))
            .unwrap();
        assert_eq!(index.associated_chunk_id(&meta(1, 2)), NULL_CHUNK_ID);
        index.dissociate(&meta(1, 2)).unwrap();
        assert_eq!(index.associated(&meta(1, 2)).unwrap(), None);
        assert!(index.files_for_chunk(ChunkId(2)).unwrap().is_empty());
    }

    #[test]
    fn test_pending_rebuild_reads_as_no_association() {
        let index = FileContentHashIndex::in_memory();
        index
            .associate(&meta(1, 1), ChunkHashId::new(ChunkId(2), HashId(1)))
            .unwrap();
        index.index.request_rebuild("test");
        assert_eq!(index.associated_chunk_id(&meta(1, 1)), NULL_CHUNK_ID);
        assert!(index.run_pending_rebuild().unwrap());
        assert!(!index.run_pending_rebuild().unwrap());
        assert_eq!(index.associated_chunk_id(&meta(1, 1)), NULL_CHUNK_ID);
    }
}
