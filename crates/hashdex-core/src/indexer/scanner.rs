//! Unindexed-file scanner: decides per file whether it is up to date, can be
//! served by a shared chunk, or needs local indexing.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::errors::IndexResult;
use crate::index::kinds::IndexKind;
use crate::index::set::IndexSet;
use crate::indexer::source::FileSource;
use crate::indexer::SharedContext;
use crate::models::{
    ChunkId, Completion, FileId, FileIndexingState, FileMeta, FileOrigin, FileVerdict,
    LoadedContent,
};
use crate::progress::{worker_pool, ProgressScope, Stop};

/// Per-scan counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub candidates: usize,
    pub skipped: usize,
    pub oversized: usize,
    pub up_to_date: usize,
    pub reused_from_chunks: usize,
    pub needs_local_index: usize,
    /// Files whose chunk was rejected; they re-enter local indexing next scan.
    pub deferred: usize,
}

/// Files needing local indexing, in presentation order, plus counters.
#[derive(Clone, Debug, Default)]
pub struct ScanOutput {
    pub files: Vec<FileMeta>,
    pub stats: ScanStats,
}

impl ScanOutput {
    pub fn file_ids(&self) -> Vec<FileId> {
        self.files.iter().map(|f| f.id).collect()
    }
}

/// Internal per-file result; richer than [`FileVerdict`].
enum ScanStep {
    Skipped,
    Oversized,
    UpToDate,
    Reused(ChunkId),
    NeedsLocal(FileMeta),
    Deferred,
}

impl ScanStep {
    fn verdict(&self) -> FileVerdict {
        match self {
            ScanStep::Skipped | ScanStep::Oversized => FileVerdict::Skipped,
            ScanStep::UpToDate => FileVerdict::UpToDate,
            ScanStep::Reused(_) => FileVerdict::ReuseChunk,
            ScanStep::NeedsLocal(_) | ScanStep::Deferred => FileVerdict::NeedsLocalIndex,
        }
    }
}

#[derive(Default)]
struct Collector {
    local: BTreeMap<FileId, FileMeta>,
    archive: BTreeMap<FileId, FileMeta>,
    stats: ScanStats,
}

impl Collector {
    fn record(&mut self, step: ScanStep) {
        match step {
            ScanStep::Skipped => self.stats.skipped += 1,
            ScanStep::Oversized => self.stats.oversized += 1,
            ScanStep::UpToDate => self.stats.up_to_date += 1,
            ScanStep::Reused(_) => self.stats.reused_from_chunks += 1,
            ScanStep::Deferred => self.stats.deferred += 1,
            ScanStep::NeedsLocal(meta) => {
                let bucket = match meta.origin {
                    FileOrigin::Local => &mut self.local,
                    FileOrigin::Archive => &mut self.archive,
                };
                bucket.insert(meta.id, meta);
            }
        }
    }

    /// Local-origin files first, then archive-origin, each by file id.
    fn finish(mut self) -> ScanOutput {
        let mut files: Vec<FileMeta> = self.local.into_values().collect();
        files.extend(self.archive.into_values());
        self.stats.needs_local_index = files.len();
        ScanOutput {
            files,
            stats: self.stats,
        }
    }
}

pub struct UnindexedFileScanner<'a> {
    source: &'a dyn FileSource,
    indexes: &'a IndexSet,
    config: &'a IndexerConfig,
    shared: Option<SharedContext<'a>>,
}

impl<'a> UnindexedFileScanner<'a> {
    pub fn new(
        source: &'a dyn FileSource,
        indexes: &'a IndexSet,
        config: &'a IndexerConfig,
        shared: Option<SharedContext<'a>>,
    ) -> Self {
        Self {
            source,
            indexes,
            config,
            shared,
        }
    }

    /// Evaluate every candidate on the worker pool. Stops claiming files
    /// once `scope` is cancelled.
    pub fn scan(&self, scope: &ProgressScope) -> IndexResult<Completion<ScanOutput>> {
        let mut seen = HashSet::new();
        let candidates: Vec<FileId> = self
            .source
            .candidates()?
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let collector = Mutex::new(Collector::default());
        let pool = worker_pool(self.config.workers)?;
        let result = pool.install(|| {
            candidates.par_iter().try_for_each(|id| {
                if scope.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                let step = self.scan_file(*id);
                collector.lock().record(step);
                scope.advance();
                Ok(())
            })
        });
        match result {
            Ok(()) => {}
            Err(Stop::Cancelled) => return Ok(Completion::Cancelled),
            Err(Stop::Failed(e)) => return Err(e),
        }

        let mut output = collector.into_inner().finish();
        output.stats.candidates = candidates.len();
        Ok(Completion::Finished(output))
    }

    /// Classify one file, applying the same side effects as a scan.
    pub fn classify(&self, id: FileId) -> FileVerdict {
        self.scan_file(id).verdict()
    }

    fn scan_file(&self, id: FileId) -> ScanStep {
        let Some(meta) = self.source.meta(id) else {
            return ScanStep::Skipped;
        };
        if self.indexes.is_indexed(&meta) {
            return if meta.is_directory { ScanStep::Skipped } else { ScanStep::UpToDate };
        }

        // Directories and oversized files only get metadata-based kinds.
        if meta.is_directory || self.config.is_too_large(meta.size) {
            let mut clean = self.update_content_independent(&meta);
            if !meta.is_directory {
                clean &= self.drop_content_data(&meta);
            }
            if clean {
                self.indexes.mark_indexed(&meta);
            }
            return if meta.is_directory { ScanStep::Skipped } else { ScanStep::Oversized };
        }

        let mut faulted = false;
        let mut needs_local = false;

        if let Some(file_type) = self.indexes.file_type_kind() {
            match self.indexes.state(file_type.as_ref(), &meta) {
                Ok(FileIndexingState::UpToDate) => {}
                Ok(FileIndexingState::ShouldIndex) => {
                    if let Err(e) = self.indexes.reset_all_for_file(meta.id) {
                        warn!(file = %meta.id, error = %e, "failed to reset stamps after file type change");
                    }
                    needs_local = true;
                }
                Err(e) => {
                    self.indexes.report_fault(file_type.as_ref(), &e);
                    faulted = true;
                }
            }
        }

        if !needs_local {
            for kind in self.indexes.content_kinds() {
                match self.indexes.state(kind.as_ref(), &meta) {
                    Ok(FileIndexingState::UpToDate) => {}
                    Ok(FileIndexingState::ShouldIndex) => {
                        debug!(
                            file = %meta.id,
                            kind = %kind.descriptor().name,
                            "stale kind forces local indexing of the whole file"
                        );
                        needs_local = true;
                        break;
                    }
                    Err(e) => {
                        self.indexes.report_fault(kind.as_ref(), &e);
                        faulted = true;
                    }
                }
            }
        }

        faulted |= !self.update_content_independent(&meta);

        if needs_local {
            return ScanStep::NeedsLocal(meta);
        }

        let mut reused = None;
        if let Some(shared) = &self.shared {
            let chunk = shared.content_hashes.associated_chunk_id(&meta);
            if !chunk.is_null() {
                let outcome = shared.registry.try_attach(chunk, shared.provider);
                if !outcome.attached {
                    if outcome.performed {
                        shared.reset_files_of(self.indexes, chunk);
                    } else if let Err(e) = self.indexes.reset_all_for_file(meta.id) {
                        warn!(file = %meta.id, error = %e, "failed to reset stamps");
                    }
                    return ScanStep::Deferred;
                }
                reused = Some(chunk);
            }
        }

        if !faulted {
            self.indexes.mark_indexed(&meta);
        }
        match reused {
            Some(chunk) => ScanStep::Reused(chunk),
            None => ScanStep::UpToDate,
        }
    }

    /// Withdraw data computed while the file was small enough to index, so
    /// reads match its current content. Returns false when it could not be
    /// fully removed.
    fn drop_content_data(&self, meta: &FileMeta) -> bool {
        let mut clean = true;
        if let Err(e) = self.indexes.remove_content(meta.id) {
            warn!(file = %meta.id, error = %e, "failed to drop content data of oversized file");
            clean = false;
        }
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.content_hashes.dissociate(meta) {
                warn!(file = %meta.id, error = %e, "could not clear chunk association");
                clean = false;
            }
        }
        clean
    }

    /// Bring every content-independent kind up to date from metadata alone.
    /// Returns false when any kind failed.
    fn update_content_independent(&self, meta: &FileMeta) -> bool {
        let content = LoadedContent::metadata_only(meta.clone());
        let mut clean = true;
        for kind in self.indexes.content_independent_kinds() {
            if let Err(e) = self.refresh_kind(kind.as_ref(), &content) {
                self.indexes.report_fault(kind.as_ref(), &e);
                clean = false;
            }
        }
        clean
    }

    fn refresh_kind(&self, kind: &dyn IndexKind, content: &LoadedContent) -> IndexResult<()> {
        if self.indexes.state(kind, &content.meta)? == FileIndexingState::UpToDate {
            return Ok(());
        }
        let output = kind.compute(content)?;
        self.indexes.update(kind, &content.meta, &output)
    }
}
