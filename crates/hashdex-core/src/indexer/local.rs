//! Local indexing of the files the scanner selected.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::errors::IndexResult;
use crate::index::kinds::{chunk_key, IndexKind, KindOutput};
use crate::index::set::IndexSet;
use crate::indexer::source::FileSource;
use crate::indexer::SharedContext;
use crate::models::{
    ChunkHashId, Completion, ContentHash, FileIndexingState, FileMeta, HashId, LoadedContent,
};
use crate::progress::{worker_pool, ProgressScope, Stop};
use crate::store::hash_store::ContentHashStore;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocalIndexStats {
    pub indexed: usize,
    pub reused_from_chunks: usize,
    /// Content changed while computing; results were dropped.
    pub discarded: usize,
    /// Deleted, oversized or unreadable by the time it was claimed.
    pub vanished: usize,
    /// Files where at least one kind failed and stays stale.
    pub incomplete: usize,
    /// Kind computations skipped because identical content was already
    /// computed in this session.
    pub shared_computations: usize,
}

enum FileOutcome {
    Indexed { complete: bool, shared: usize },
    Reused,
    Discarded,
    Vanished,
}

type ComputeGate = Arc<OnceLock<Option<Arc<KindOutput>>>>;

/// Computes each (kind, content) pair once per session.
#[derive(Default)]
struct SessionCache {
    gates: Mutex<HashMap<(usize, HashId), ComputeGate>>,
}

impl SessionCache {
    /// Output of kind number `slot` for content `hash`. The bool is true when
    /// another file already paid for the computation.
    fn get_or_compute<F>(&self, slot: usize, hash: Option<HashId>, compute: F) -> (Option<Arc<KindOutput>>, bool)
    where
        F: FnOnce() -> Option<KindOutput>,
    {
        let Some(hash) = hash else {
            return (compute().map(Arc::new), false);
        };
        let gate = Arc::clone(self.gates.lock().entry((slot, hash)).or_default());
        let mut computed_here = false;
        let output = gate
            .get_or_init(|| {
                computed_here = true;
                compute().map(Arc::new)
            })
            .clone();
        (output, !computed_here)
    }
}

pub struct LocalIndexer<'a> {
    source: &'a dyn FileSource,
    indexes: &'a IndexSet,
    hashes: &'a ContentHashStore,
    config: &'a IndexerConfig,
    shared: Option<SharedContext<'a>>,
}

impl<'a> LocalIndexer<'a> {
    pub fn new(
        source: &'a dyn FileSource,
        indexes: &'a IndexSet,
        hashes: &'a ContentHashStore,
        config: &'a IndexerConfig,
        shared: Option<SharedContext<'a>>,
    ) -> Self {
        Self {
            source,
            indexes,
            hashes,
            config,
            shared,
        }
    }

    /// Index `files` on the worker pool. Each file is either served by a
    /// shared chunk or computed once for every stale content kind.
    pub fn index_files(&self, files: &[FileMeta], scope: &ProgressScope) -> IndexResult<Completion<LocalIndexStats>> {
        let cache = SessionCache::default();
        let stats = Mutex::new(LocalIndexStats::default());
        let pool = worker_pool(self.config.workers)?;
        let result = pool.install(|| {
            files.par_iter().try_for_each(|file| {
                if scope.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                let outcome = self.index_file(file, &cache);
                let mut stats = stats.lock();
                match outcome {
                    FileOutcome::Indexed { complete, shared } => {
                        stats.indexed += 1;
                        stats.shared_computations += shared;
                        if !complete {
                            stats.incomplete += 1;
                        }
                    }
                    FileOutcome::Reused => stats.reused_from_chunks += 1,
                    FileOutcome::Discarded => stats.discarded += 1,
                    FileOutcome::Vanished => stats.vanished += 1,
                }
                drop(stats);
                scope.advance();
                Ok(())
            })
        });
        match result {
            Ok(()) => Ok(Completion::Finished(stats.into_inner())),
            Err(Stop::Cancelled) => Ok(Completion::Cancelled),
            Err(Stop::Failed(e)) => Err(e),
        }
    }

    fn index_file(&self, hint: &FileMeta, cache: &SessionCache) -> FileOutcome {
        let Some(meta) = self.source.meta(hint.id) else {
            return FileOutcome::Vanished;
        };
        if meta.is_directory || self.config.is_too_large(meta.size) {
            return FileOutcome::Vanished;
        }

        let mut bytes = None;
        let mut hash = None;
        if let Some(shared) = &self.shared {
            hash = self.source.known_hash(&meta);
            if hash.is_none() {
                match self.source.load(meta.id) {
                    Ok(b) => {
                        hash = Some(ContentHash::of(&b));
                        bytes = Some(b);
                    }
                    Err(e) => {
                        debug!(file = %meta.id, error = %e, "file vanished before indexing");
                        return FileOutcome::Vanished;
                    }
                }
            }
            let found = hash
                .as_ref()
                .map(|h| chunk_key(self.indexes.kinds(), &meta, h))
                .and_then(|key| shared.provider.lookup(&key));
            if let Some(found) = found {
                if let Some(outcome) = self.try_reuse(shared, &meta, found) {
                    return outcome;
                }
            }
        }

        let bytes = match bytes {
            Some(b) => b,
            None => match self.source.load(meta.id) {
                Ok(b) => b,
                Err(e) => {
                    debug!(file = %meta.id, error = %e, "file vanished before indexing");
                    return FileOutcome::Vanished;
                }
            },
        };
        let hash = hash.unwrap_or_else(|| ContentHash::of(&bytes));
        let hash_id = match self.hashes.enumerate(&hash) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(file = %meta.id, error = %e, "content hash store unavailable");
                None
            }
        };
        self.compute_locally(&meta, LoadedContent::with_bytes(meta.clone(), bytes), hash_id, cache)
    }

    /// Serve `meta` from the chunk holding its content. `None` falls back to
    /// local computation.
    fn try_reuse(&self, shared: &SharedContext<'_>, meta: &FileMeta, found: ChunkHashId) -> Option<FileOutcome> {
        let chunk = found.chunk_id();
        let outcome = shared.registry.try_attach(chunk, shared.provider);
        if !outcome.attached {
            if outcome.performed {
                shared.reset_files_of(self.indexes, chunk);
            }
            return None;
        }
        if !self.content_unchanged(meta) {
            return Some(FileOutcome::Discarded);
        }
        for kind in self.indexes.content_kinds() {
            if let Err(e) = self.indexes.adopt_chunk(kind.as_ref(), meta, chunk) {
                warn!(file = %meta.id, %chunk, error = %e, "could not adopt chunk data");
                return None;
            }
        }
        if let Err(e) = shared.content_hashes.associate(meta, found) {
            // Unassociated chunk data would be invisible to reads.
            warn!(file = %meta.id, %chunk, error = %e, "could not record chunk association");
            if let Err(e) = self.indexes.reset_all_for_file(meta.id) {
                warn!(file = %meta.id, error = %e, "failed to reset stamps");
            }
            return None;
        }
        self.indexes.mark_indexed(meta);
        Some(FileOutcome::Reused)
    }

    fn compute_locally(
        &self,
        meta: &FileMeta,
        content: LoadedContent,
        hash_id: Option<HashId>,
        cache: &SessionCache,
    ) -> FileOutcome {
        let mut complete = true;
        let mut shared_count = 0;
        let mut results: Vec<(&Arc<dyn IndexKind>, Arc<KindOutput>)> = Vec::new();

        for (slot, kind) in self.indexes.kinds().iter().enumerate() {
            if !kind.descriptor().depends_on_content {
                continue;
            }
            match self.indexes.state(kind.as_ref(), meta) {
                Ok(FileIndexingState::UpToDate) => continue,
                Ok(FileIndexingState::ShouldIndex) => {}
                Err(e) => {
                    self.indexes.report_fault(kind.as_ref(), &e);
                    complete = false;
                    continue;
                }
            }
            if !kind.accepts(meta) {
                results.push((kind, Arc::new(KindOutput::default())));
                continue;
            }
            let (output, reused) = cache.get_or_compute(slot, hash_id, || {
                kind.compute(&content)
                    .map_err(|e| {
                        warn!(file = %meta.id, kind = %kind.descriptor().name, error = %e, "indexing failed");
                    })
                    .ok()
            });
            match output {
                Some(output) => {
                    if reused {
                        shared_count += 1;
                    }
                    results.push((kind, output));
                }
                None => complete = false,
            }
        }

        if !self.content_unchanged(meta) {
            debug!(file = %meta.id, "content changed while indexing; results dropped");
            return FileOutcome::Discarded;
        }

        for (kind, output) in results {
            if let Err(e) = self.indexes.update(kind.as_ref(), meta, &output) {
                // The index already scheduled its own rebuild on storage faults.
                warn!(file = %meta.id, kind = %kind.descriptor().name, error = %e, "index update failed");
                complete = false;
            }
        }
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.content_hashes.dissociate(meta) {
                warn!(file = %meta.id, error = %e, "could not clear chunk association");
            }
        }
        if complete {
            self.indexes.mark_indexed(meta);
        }
        FileOutcome::Indexed {
            complete,
            shared: shared_count,
        }
    }

    /// Optimistic read fence: the file still has the content version the
    /// work was based on.
    fn content_unchanged(&self, meta: &FileMeta) -> bool {
        self.source
            .meta(meta.id)
            .is_some_and(|current| current.content_version == meta.content_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IndexError;
    use crate::index::kinds::{builtin_kinds, STRUCTURE_DECLARATIONS, WORDS_KIND};
    use crate::indexer::scanner::UnindexedFileScanner;
    use crate::indexer::source::MemoryFileSource;
    use crate::models::{ContentHash, FileId, InputData, Stamp};
    use crate::store::storage::{IndexStorage, MemoryIndexStorage, UpdateDelta};

    fn config() -> IndexerConfig {
        IndexerConfig {
            workers: 2,
            ..IndexerConfig::default()
        }
    }

    fn scan_and_index(indexes: &IndexSet, source: &dyn FileSource, config: &IndexerConfig) -> LocalIndexStats {
        let hashes = ContentHashStore::open_in_memory().unwrap();
        let scope = ProgressScope::new();
        let scan = UnindexedFileScanner::new(source, indexes, config, None)
            .scan(&scope)
            .unwrap()
            .finished()
            .unwrap();
        LocalIndexer::new(source, indexes, &hashes, config, None)
            .index_files(&scan.files, &scope)
            .unwrap()
            .finished()
            .unwrap()
    }

    #[test]
    fn test_index_then_query() {
        let config = config();
        let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
        let source = MemoryFileSource::new();
        let a = source.add("a.rs", b"fn alpha() { beta(); }");
        let b = source.add("b.md", b"beta notes");

        let stats = scan_and_index(&indexes, &source, &config);
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.incomplete, 0);
        let hits: Vec<FileId> = indexes
            .values(WORDS_KIND, "beta")
            .unwrap()
            .into_iter()
            .map(|(f, _)| f)
            .collect();
        assert_eq!(hits, vec![a, b]);
        assert_eq!(indexes.values(STRUCTURE_DECLARATIONS, "alpha").unwrap().len(), 1);
    }

    #[test]
    fn test_identical_content_is_computed_once() {
        let config = IndexerConfig {
            workers: 1,
            ..IndexerConfig::default()
        };
        let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
        let source = MemoryFileSource::new();
        source.add("a.rs", b"fn same() {}");
        source.add("b.rs", b"fn same() {}");
        let stats = scan_and_index(&indexes, &source, &config);
        assert_eq!(stats.indexed, 2);
        // words + structure computed once, reused for the second file.
        assert_eq!(stats.shared_computations, 2);
        assert_eq!(indexes.values(WORDS_KIND, "same").unwrap().len(), 2);
    }

    /// Storage that fails every commit.
    struct BrokenStorage;

    impl IndexStorage for BrokenStorage {
        fn read_forward(&self, _input_id: u64) -> IndexResult<InputData> {
            Ok(InputData::new())
        }
        fn read_stamp(&self, _input_id: u64) -> IndexResult<Option<Stamp>> {
            Ok(None)
        }
        fn write_stamp(&self, _input_id: u64, _stamp: Option<Stamp>) -> IndexResult<()> {
            Ok(())
        }
        fn commit(&self, _input_id: u64, _delta: &UpdateDelta, _stamp: Option<Stamp>) -> IndexResult<()> {
            Err(IndexError::Storage("disk full".into()))
        }
        fn values_for_key(&self, _key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>> {
            Ok(Vec::new())
        }
        fn keys(&self) -> IndexResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn input_count(&self) -> IndexResult<usize> {
            Ok(0)
        }
        fn clear(&self) -> IndexResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_storage_fault_isolated_to_one_kind() {
        let config = config();
        let indexes = IndexSet::with_storage(builtin_kinds(), |name| {
            if name == WORDS_KIND {
                Ok(Box::new(BrokenStorage) as Box<dyn IndexStorage>)
            } else {
                Ok(Box::new(MemoryIndexStorage::new()))
            }
        })
        .unwrap();
        let source = MemoryFileSource::new();
        let f = source.add("f.rs", b"fn gamma() {}");

        let stats = scan_and_index(&indexes, &source, &config);
        assert_eq!(stats.incomplete, 1);
        assert_eq!(indexes.pending_rebuilds(), vec![WORDS_KIND.to_string()]);
        assert_eq!(indexes.values(STRUCTURE_DECLARATIONS, "gamma").unwrap(), vec![(f, Vec::new())]);
        assert!(indexes.values(WORDS_KIND, "gamma").is_err());
        assert!(!indexes.is_indexed(&source.meta(f).unwrap()));
    }

    /// Source whose file changes under the indexer on every load.
    struct MutatingSource {
        inner: MemoryFileSource,
    }

    impl FileSource for MutatingSource {
        fn candidates(&self) -> IndexResult<Vec<FileId>> {
            self.inner.candidates()
        }
        fn meta(&self, id: FileId) -> Option<FileMeta> {
            self.inner.meta(id)
        }
        fn load(&self, id: FileId) -> IndexResult<Vec<u8>> {
            let bytes = self.inner.load(id)?;
            self.inner.write(id, b"fn edited() {}");
            Ok(bytes)
        }
        fn known_hash(&self, meta: &FileMeta) -> Option<ContentHash> {
            self.inner.known_hash(meta)
        }
    }

    #[test]
    fn test_concurrent_edit_discards_results() {
        let config = config();
        let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
        let source = MutatingSource {
            inner: MemoryFileSource::new(),
        };
        let id = source.inner.add("a.rs", b"fn original() {}");
        let stats = scan_and_index(&indexes, &source, &config);
        assert_eq!(stats.discarded, 1);
        assert!(indexes.values(WORDS_KIND, "original").unwrap().is_empty());
        let words = indexes.kind(WORDS_KIND).unwrap().clone();
        assert_eq!(
            indexes.state(words.as_ref(), &source.meta(id).unwrap()).unwrap(),
            FileIndexingState::ShouldIndex
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let config = config();
        let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
        let hashes = ContentHashStore::open_in_memory().unwrap();
        let source = MemoryFileSource::new();
        let id = source.add("a.rs", b"fn a() {}");
        let scope = ProgressScope::new();
        scope.cancel();
        let result = LocalIndexer::new(&source, &indexes, &hashes, &config, None)
            .index_files(&[source.meta(id).unwrap()], &scope)
            .unwrap();
        assert!(result.is_cancelled());
        assert_eq!(source.load_count(id), 0);
    }
}
