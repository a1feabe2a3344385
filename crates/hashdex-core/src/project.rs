//! Per-project facade: owns the stores, runs indexing sessions and answers
//! reads across local and shared chunk data.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunks::catalog::ChunkCatalog;
use crate::chunks::registry::ChunkRegistry;
use crate::chunks::ChunkProvider;
use crate::config::IndexerConfig;
use crate::errors::IndexResult;
use crate::index::content_hash::FileContentHashIndex;
use crate::index::kinds::IndexKind;
use crate::index::set::IndexSet;
use crate::indexer::local::{LocalIndexStats, LocalIndexer};
use crate::indexer::scanner::{ScanOutput, ScanStats, UnindexedFileScanner};
use crate::indexer::source::FileSource;
use crate::indexer::SharedContext;
use crate::models::{ChunkHashId, ChunkId, Completion, FileId, FileMeta, FileVerdict};
use crate::progress::ProgressScope;
use crate::store::database::{expand_tilde, Database};
use crate::store::hash_store::ContentHashStore;

const PROJECT_DB: &str = "project.db";
const HASHES_DB: &str = "hashes.db";
const INDEXES_DIR: &str = "indexes";
const UNPACKED_CHUNKS_DIR: &str = "chunks";

/// Outcome of one `run_session`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    /// Index kinds cleared before scanning.
    pub rebuilt: Vec<String>,
    pub scan: ScanStats,
    pub local: LocalIndexStats,
    pub attached_chunks: Vec<ChunkId>,
    pub invalid_chunks: Vec<ChunkId>,
    pub elapsed_ms: u64,
}

pub struct ProjectIndex {
    config: IndexerConfig,
    db: Arc<Database>,
    hashes: ContentHashStore,
    indexes: IndexSet,
    content_hashes: Option<FileContentHashIndex>,
    registry: ChunkRegistry,
    provider: Option<Arc<dyn ChunkProvider>>,
}

impl ProjectIndex {
    /// Open (or create) the project stores below `config.data_dir`. The chunk
    /// catalog is only opened when shared chunks are active.
    pub fn open(config: IndexerConfig, kinds: Vec<Arc<dyn IndexKind>>) -> IndexResult<Self> {
        let data_dir = expand_tilde(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let db = Arc::new(Database::open(&data_dir.join(PROJECT_DB))?);
        let hashes = ContentHashStore::open(&data_dir.join(HASHES_DB))?;
        let indexes_root = data_dir.join(INDEXES_DIR);

        let mut content_hashes = None;
        let mut provider: Option<Arc<dyn ChunkProvider>> = None;
        let chunks_dir = config
            .shared_chunks_dir
            .as_ref()
            .filter(|_| config.shared_chunks_active());
        if let Some(chunks_dir) = chunks_dir {
            let catalog = ChunkCatalog::open(
                &expand_tilde(chunks_dir),
                &data_dir.join(UNPACKED_CHUNKS_DIR),
                &db,
                &kinds,
            )?;
            content_hashes = Some(FileContentHashIndex::open(&indexes_root)?);
            provider = Some(Arc::new(catalog));
        }
        let indexes = IndexSet::open(&indexes_root, kinds)?;
        info!(
            data_dir = %data_dir.display(),
            shared_chunks = provider.is_some(),
            "project index opened"
        );
        Ok(Self {
            config,
            db,
            hashes,
            indexes,
            content_hashes,
            registry: ChunkRegistry::new(),
            provider,
        })
    }

    /// Fully in-memory project. Chunk reuse is active when a provider is
    /// given and the shared-indexes toggle is on.
    pub fn in_memory(
        config: IndexerConfig,
        kinds: Vec<Arc<dyn IndexKind>>,
        provider: Option<Arc<dyn ChunkProvider>>,
    ) -> IndexResult<Self> {
        let provider = provider.filter(|_| config.shared_indexes_enabled);
        Ok(Self {
            db: Arc::new(Database::open_in_memory()?),
            hashes: ContentHashStore::open_in_memory()?,
            indexes: IndexSet::in_memory(kinds)?,
            content_hashes: provider.as_ref().map(|_| FileContentHashIndex::in_memory()),
            registry: ChunkRegistry::new(),
            provider,
            config,
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    pub fn shared_chunks_enabled(&self) -> bool {
        self.shared().is_some()
    }

    fn shared(&self) -> Option<SharedContext<'_>> {
        match (&self.content_hashes, &self.provider) {
            (Some(content_hashes), Some(provider)) => Some(SharedContext {
                content_hashes,
                registry: &self.registry,
                provider: provider.as_ref(),
            }),
            _ => None,
        }
    }

    /// Pending rebuilds, then a scan, then local indexing of what the scan
    /// selected.
    pub fn run_session(&self, source: &dyn FileSource, scope: &ProgressScope) -> IndexResult<Completion<SessionReport>> {
        let started = Instant::now();
        let rebuilt = self.prepare_session()?;

        let scan = match self.scan(source, scope)? {
            Completion::Finished(scan) => scan,
            Completion::Cancelled => return Ok(Completion::Cancelled),
        };
        let local = match self.index_files(source, &scan.files, scope)? {
            Completion::Finished(local) => local,
            Completion::Cancelled => return Ok(Completion::Cancelled),
        };

        let report = SessionReport {
            rebuilt,
            scan: scan.stats,
            local,
            attached_chunks: self.provider.as_ref().map(|p| p.attached_chunks()).unwrap_or_default(),
            invalid_chunks: self.registry.invalid_chunks(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            candidates = report.scan.candidates,
            needs_local = report.scan.needs_local_index,
            indexed = report.local.indexed,
            reused = report.scan.reused_from_chunks + report.local.reused_from_chunks,
            elapsed_ms = report.elapsed_ms,
            "indexing session finished"
        );
        Ok(Completion::Finished(report))
    }

    /// Run requested rebuilds and start a fresh attachment session.
    fn prepare_session(&self) -> IndexResult<Vec<String>> {
        if let Some(content_hashes) = &self.content_hashes {
            if content_hashes.run_pending_rebuild()? {
                // Chunk-served stamps can no longer be traced to their chunk.
                self.indexes
                    .request_rebuild_all_content("content hash index was rebuilt");
            }
        }
        let rebuilt = self.indexes.run_pending_rebuilds()?;
        self.registry.reset_session();
        Ok(rebuilt)
    }

    pub fn scan(&self, source: &dyn FileSource, scope: &ProgressScope) -> IndexResult<Completion<ScanOutput>> {
        UnindexedFileScanner::new(source, &self.indexes, &self.config, self.shared()).scan(scope)
    }

    pub fn classify(&self, source: &dyn FileSource, id: FileId) -> FileVerdict {
        UnindexedFileScanner::new(source, &self.indexes, &self.config, self.shared()).classify(id)
    }

    pub fn index_files(
        &self,
        source: &dyn FileSource,
        files: &[FileMeta],
        scope: &ProgressScope,
    ) -> IndexResult<Completion<LocalIndexStats>> {
        LocalIndexer::new(source, &self.indexes, &self.hashes, &self.config, self.shared())
            .index_files(files, scope)
    }

    /// Files with `key` in index `kind`, from local data and from every
    /// attached chunk that is not invalid. Sorted by file id.
    pub fn values(&self, kind: &str, key: &str) -> IndexResult<Vec<(FileId, Vec<u8>)>> {
        let mut rows = self.indexes.values(kind, key)?;
        if let Some(shared) = self.shared() {
            for chunk in shared.provider.attached_chunks() {
                if shared.registry.is_invalid(chunk) {
                    continue;
                }
                for (hash, value) in shared.provider.values(chunk, kind, key)? {
                    for file in shared.content_hashes.files_for_hash(ChunkHashId::new(chunk, hash))? {
                        rows.push((file, value.clone()));
                    }
                }
            }
        }
        rows.sort();
        rows.dedup();
        Ok(rows)
    }

    /// Withdraw `chunk` and send the files it served back to local indexing.
    pub fn invalidate_chunk(&self, chunk: ChunkId) -> usize {
        match self.shared() {
            Some(shared) => shared.invalidate(&self.indexes, chunk),
            None => {
                warn!(%chunk, "shared chunks are disabled; nothing to invalidate");
                0
            }
        }
    }

    /// Persist a free-form marker in the project database, e.g. the roots
    /// of the last session.
    pub fn record_roots(&self, roots: &[impl AsRef<Path>]) -> IndexResult<()> {
        let joined: Vec<String> = roots
            .iter()
            .map(|r| r.as_ref().to_string_lossy().into_owned())
            .collect();
        self.db.set_meta("last_roots", &serde_json::to_string(&joined)?)
    }
}
