//! The host's live file set, as seen by the scanner and the local indexer.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;

use crate::errors::{IndexError, IndexResult};
use crate::models::{ContentHash, FileId, FileMeta, FileOrigin};

/// Content source collaborator.
pub trait FileSource: Send + Sync {
    /// Files to evaluate. May contain duplicates.
    fn candidates(&self) -> IndexResult<Vec<FileId>>;

    /// Current metadata, or `None` once the file became invalid.
    fn meta(&self, id: FileId) -> Option<FileMeta>;

    fn load(&self, id: FileId) -> IndexResult<Vec<u8>>;

    /// Digest of the current content when the host already knows it.
    fn known_hash(&self, _meta: &FileMeta) -> Option<ContentHash> {
        None
    }
}

struct MemoryFile {
    meta: FileMeta,
    bytes: Vec<u8>,
    loads: usize,
}

/// In-memory file set for embedders and tests.
pub struct MemoryFileSource {
    files: Mutex<BTreeMap<FileId, MemoryFile>>,
    next_id: Mutex<u32>,
    cache_hashes: bool,
}

impl Default for MemoryFileSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSource {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
            cache_hashes: false,
        }
    }

    /// Report content hashes without loading, like a host with a digest
    /// cache.
    pub fn with_known_hashes(mut self) -> Self {
        self.cache_hashes = true;
        self
    }

    pub fn add(&self, path: impl AsRef<Path>, bytes: &[u8]) -> FileId {
        self.add_with_origin(path, bytes, FileOrigin::Local)
    }

    pub fn add_with_origin(&self, path: impl AsRef<Path>, bytes: &[u8], origin: FileOrigin) -> FileId {
        self.insert(path.as_ref(), bytes, origin, false)
    }

    pub fn add_directory(&self, path: impl AsRef<Path>) -> FileId {
        self.insert(path.as_ref(), &[], FileOrigin::Local, true)
    }

    fn insert(&self, path: &Path, bytes: &[u8], origin: FileOrigin, is_directory: bool) -> FileId {
        let id = {
            let mut next = self.next_id.lock();
            let id = FileId(*next);
            *next += 1;
            id
        };
        let meta = FileMeta {
            id,
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            content_version: 1,
            origin,
            is_directory,
        };
        self.files.lock().insert(
            id,
            MemoryFile {
                meta,
                bytes: bytes.to_vec(),
                loads: 0,
            },
        );
        id
    }

    /// Replace the content of `id`, bumping its content version.
    pub fn write(&self, id: FileId, bytes: &[u8]) {
        if let Some(file) = self.files.lock().get_mut(&id) {
            file.bytes = bytes.to_vec();
            file.meta.size = bytes.len() as u64;
            file.meta.content_version += 1;
        }
    }

    pub fn remove(&self, id: FileId) {
        self.files.lock().remove(&id);
    }

    /// How often `load` returned the content of `id`.
    pub fn load_count(&self, id: FileId) -> usize {
        self.files.lock().get(&id).map_or(0, |f| f.loads)
    }
}

impl FileSource for MemoryFileSource {
    fn candidates(&self) -> IndexResult<Vec<FileId>> {
        Ok(self.files.lock().keys().copied().collect())
    }

    fn meta(&self, id: FileId) -> Option<FileMeta> {
        self.files.lock().get(&id).map(|f| f.meta.clone())
    }

    fn load(&self, id: FileId) -> IndexResult<Vec<u8>> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&id)
            .ok_or_else(|| IndexError::Index(format!("{id} no longer exists")))?;
        file.loads += 1;
        Ok(file.bytes.clone())
    }

    fn known_hash(&self, meta: &FileMeta) -> Option<ContentHash> {
        if !self.cache_hashes {
            return None;
        }
        let files = self.files.lock();
        let file = files.get(&meta.id)?;
        (file.meta.content_version == meta.content_version).then(|| ContentHash::of(&file.bytes))
    }
}
