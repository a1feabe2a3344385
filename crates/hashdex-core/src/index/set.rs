//! File-based index facade: every registered kind of one project.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::{IndexError, IndexResult};
use crate::index::derived::DerivedDataIndex;
use crate::index::kinds::{IndexKind, KindOutput};
use crate::index::storage_path;
use crate::models::{
    ChunkId, FileId, FileIndexingState, FileMeta, InputData, InputSnapshot, Stamp,
};
use crate::store::storage::{IndexStorage, MemoryIndexStorage, SqliteIndexStorage};

/// One `DerivedDataIndex` per kind (and per sub-index of composite kinds),
/// plus the memoized "indexed" marks of the current process.
pub struct IndexSet {
    kinds: Vec<Arc<dyn IndexKind>>,
    indexes: HashMap<String, DerivedDataIndex>,
    /// file -> content version at which the file last finished a pass.
    indexed: Mutex<HashMap<FileId, u64>>,
}

impl IndexSet {
    /// Open on-disk tables below `root`.
    pub fn open(root: &Path, kinds: Vec<Arc<dyn IndexKind>>) -> IndexResult<Self> {
        Self::with_storage(kinds, |name| {
            Ok(Box::new(SqliteIndexStorage::open(&storage_path(root, name))?))
        })
    }

    pub fn in_memory(kinds: Vec<Arc<dyn IndexKind>>) -> IndexResult<Self> {
        Self::with_storage(kinds, |_| Ok(Box::new(MemoryIndexStorage::new())))
    }

    /// Build the set with storages produced by `factory`, called once per
    /// index name.
    pub fn with_storage<F>(kinds: Vec<Arc<dyn IndexKind>>, mut factory: F) -> IndexResult<Self>
    where
        F: FnMut(&str) -> IndexResult<Box<dyn IndexStorage>>,
    {
        let mut indexes = HashMap::new();
        for kind in &kinds {
            let d = kind.descriptor();
            let names = std::iter::once(&d.name).chain(d.sub_indexes.iter());
            for name in names {
                if indexes.contains_key(name) {
                    return Err(IndexError::Index(format!("duplicate index kind {name}")));
                }
                let index = DerivedDataIndex::new(name, d.version, factory(name.as_str())?);
                indexes.insert(name.clone(), index);
            }
        }
        Ok(Self {
            kinds,
            indexes,
            indexed: Mutex::new(HashMap::new()),
        })
    }

    pub fn kinds(&self) -> &[Arc<dyn IndexKind>] {
        &self.kinds
    }

    pub fn kind(&self, name: &str) -> Option<&Arc<dyn IndexKind>> {
        self.kinds.iter().find(|k| k.descriptor().name == name)
    }

    /// The distinguished file-type kind, when one is registered.
    pub fn file_type_kind(&self) -> Option<&Arc<dyn IndexKind>> {
        self.kinds.iter().find(|k| k.descriptor().is_file_type)
    }

    /// Kinds that need loaded content, in registration order.
    pub fn content_kinds(&self) -> impl Iterator<Item = &Arc<dyn IndexKind>> {
        self.kinds.iter().filter(|k| k.descriptor().depends_on_content)
    }

    pub fn content_independent_kinds(&self) -> impl Iterator<Item = &Arc<dyn IndexKind>> {
        self.kinds
            .iter()
            .filter(|k| k.descriptor().is_content_independent())
    }

    pub fn index(&self, name: &str) -> IndexResult<&DerivedDataIndex> {
        self.indexes
            .get(name)
            .ok_or_else(|| IndexError::UnknownKind(name.to_string()))
    }

    pub fn snapshot(kind: &dyn IndexKind, meta: &FileMeta) -> InputSnapshot {
        InputSnapshot {
            fingerprint: kind.input_fingerprint(meta),
            kind_version: kind.descriptor().version,
        }
    }

    /// Whether `kind` must (re)index `meta`. Storage faults surface as errors.
    pub fn state(&self, kind: &dyn IndexKind, meta: &FileMeta) -> IndexResult<FileIndexingState> {
        let d = kind.descriptor();
        let family_pending = d
            .sub_indexes
            .iter()
            .filter_map(|s| self.indexes.get(s))
            .any(DerivedDataIndex::is_rebuild_pending);
        if family_pending {
            return Ok(FileIndexingState::ShouldIndex);
        }
        let up_to_date = self
            .index(&d.name)?
            .is_up_to_date(meta.id.0 as u64, &Self::snapshot(kind, meta))?;
        Ok(if up_to_date {
            FileIndexingState::UpToDate
        } else {
            FileIndexingState::ShouldIndex
        })
    }

    /// Store locally computed output for `meta` and advance its stamps.
    pub fn update(&self, kind: &dyn IndexKind, meta: &FileMeta, output: &KindOutput) -> IndexResult<()> {
        let stamp = Stamp::local(kind.input_fingerprint(meta), kind.descriptor().version);
        self.write_family(kind, meta.id, output, stamp)
    }

    /// Record that `chunk` supplies the data of `kind` for `meta`. Any local
    /// data the file had is dropped.
    pub fn adopt_chunk(&self, kind: &dyn IndexKind, meta: &FileMeta, chunk: ChunkId) -> IndexResult<()> {
        let stamp = Stamp::from_chunk(kind.input_fingerprint(meta), kind.descriptor().version, chunk);
        self.write_family(kind, meta.id, &KindOutput::default(), stamp)
    }

    fn write_family(&self, kind: &dyn IndexKind, file: FileId, output: &KindOutput, stamp: Stamp) -> IndexResult<()> {
        let d = kind.descriptor();
        let input = file.0 as u64;
        let mut first_err = None;
        for sub in &d.sub_indexes {
            let data: InputData = output
                .sub_index_keys
                .get(sub)
                .map(|keys| keys.iter().map(|k| (k.clone(), Vec::new())).collect())
                .unwrap_or_default();
            if let Err(e) = self.index(sub).and_then(|ix| ix.update(input, &data, stamp)) {
                first_err.get_or_insert(e);
            }
        }
        // The parent stamp goes last: a failed sub-index leaves the kind stale.
        if let Some(e) = first_err {
            return Err(e);
        }
        self.index(&d.name)?.update(input, &output.data, stamp)?;
        Ok(())
    }

    /// Reset the stamps of every content-dependent kind for `file` and forget
    /// its memo mark. Attempts every kind; reports the first failure.
    pub fn reset_all_for_file(&self, file: FileId) -> IndexResult<()> {
        self.forget(file);
        let mut first_err = None;
        for kind in self.content_kinds() {
            let d = kind.descriptor();
            for name in std::iter::once(&d.name).chain(d.sub_indexes.iter()) {
                if let Err(e) = self.index(name).and_then(|ix| ix.reset_state_for_file(file.0 as u64)) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Remove every content-derived entry and stamp of `file`. Used when the
    /// file can no longer be indexed by content, e.g. it grew too large.
    pub fn remove_content(&self, file: FileId) -> IndexResult<()> {
        self.forget(file);
        let mut first_err = None;
        for kind in self.content_kinds() {
            let d = kind.descriptor();
            for name in std::iter::once(&d.name).chain(d.sub_indexes.iter()) {
                if let Err(e) = self.index(name).and_then(|ix| ix.remove_input(file.0 as u64)) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Local reverse lookup for one kind or sub-index.
    pub fn values(&self, name: &str, key: &str) -> IndexResult<Vec<(FileId, Vec<u8>)>> {
        let rows = self.index(name)?.values(key)?;
        Ok(rows
            .into_iter()
            .map(|(input, value)| (FileId(input as u32), value))
            .collect())
    }

    // -- memo ----------------------------------------------------------------

    pub fn is_indexed(&self, meta: &FileMeta) -> bool {
        self.indexed.lock().get(&meta.id) == Some(&meta.content_version)
    }

    pub fn mark_indexed(&self, meta: &FileMeta) {
        self.indexed.lock().insert(meta.id, meta.content_version);
    }

    pub fn forget(&self, file: FileId) {
        self.indexed.lock().remove(&file);
    }

    // -- rebuilds ------------------------------------------------------------

    /// Mark `name` unusable for reads until the next `run_pending_rebuilds`.
    pub fn request_rebuild(&self, name: &str, reason: &str) -> IndexResult<()> {
        self.index(name)?.request_rebuild(reason);
        self.indexed.lock().clear();
        Ok(())
    }

    /// Schedule a rebuild of every content-dependent kind.
    pub fn request_rebuild_all_content(&self, reason: &str) {
        for kind in self.content_kinds() {
            if let Some(ix) = self.indexes.get(&kind.descriptor().name) {
                ix.request_rebuild(reason);
            }
        }
        self.indexed.lock().clear();
    }

    pub fn pending_rebuilds(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indexes
            .values()
            .filter(|ix| ix.is_rebuild_pending())
            .map(|ix| ix.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Clear every kind with a pending rebuild. A composite kind is rebuilt
    /// together with all its sub-indexes, since staleness is tracked on the
    /// parent only.
    pub fn run_pending_rebuilds(&self) -> IndexResult<Vec<String>> {
        let mut rebuilt = Vec::new();
        for kind in &self.kinds {
            let d = kind.descriptor();
            let family: Vec<&String> = std::iter::once(&d.name).chain(d.sub_indexes.iter()).collect();
            let pending = family
                .iter()
                .any(|name| self.indexes.get(*name).is_some_and(|ix| ix.is_rebuild_pending()));
            if !pending {
                continue;
            }
            for name in family {
                self.index(name)?.rebuild()?;
                rebuilt.push(name.clone());
            }
        }
        if !rebuilt.is_empty() {
            self.indexed.lock().clear();
            info!(kinds = ?rebuilt, "rebuilt index kinds");
        }
        Ok(rebuilt)
    }

    /// Route a failed state check or update: storage faults schedule a
    /// rebuild of the kind, anything else is only logged.
    pub fn report_fault(&self, kind: &dyn IndexKind, err: &IndexError) {
        let name = &kind.descriptor().name;
        if err.is_storage_fault() {
            if let Err(e) = self.request_rebuild(name, &err.to_string()) {
                warn!(kind = %name, error = %e, "failed to schedule rebuild");
            }
        } else {
            warn!(kind = %name, error = %err, "index kind failed");
        }
    }
}
