//! Offline chunk export: index a directory tree by content hash and pack the
//! result into a single archive.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunks::archive::{pack_directory, with_suffix};
use crate::chunks::manifest::{ChunkManifest, EmptyIndexes, HASHES_FILE};
use crate::config::IndexerConfig;
use crate::errors::{IndexError, IndexResult};
use crate::index::derived::DerivedDataIndex;
use crate::index::kinds::{chunk_key, IndexKind, KindOutput};
use crate::index::storage_path;
use crate::models::{
    Completion, ContentHash, FileId, FileMeta, FileOrigin, HashId, InputData, LoadedContent, Stamp,
};
use crate::progress::{worker_pool, ProgressScope, Stop};
use crate::store::hash_store::ContentHashStore;
use crate::store::storage::SqliteIndexStorage;

/// Diagnostics of one finished export.
#[derive(Clone, Debug, Serialize)]
pub struct ExportReport {
    pub name: String,
    pub archive: PathBuf,
    /// Files indexed into the chunk.
    pub files: usize,
    pub oversized: usize,
    pub unique_hashes: usize,
    /// Entries per covered index, in kind registration order.
    pub entries: IndexMap<String, usize>,
    pub empty_content_kinds: Vec<String>,
    pub empty_structural_kinds: Vec<String>,
    pub archive_entries: usize,
    pub elapsed_ms: u64,
}

impl ExportReport {
    pub fn non_empty_kinds(&self) -> usize {
        self.entries.values().filter(|n| **n > 0).count()
    }
}

/// One covered index table of the chunk under construction.
struct ChunkTable {
    index: DerivedDataIndex,
    structural: bool,
}

/// Builds chunks from directory trees.
pub struct ChunkExporter {
    kinds: Vec<Arc<dyn IndexKind>>,
    config: IndexerConfig,
}

impl ChunkExporter {
    pub fn new(kinds: Vec<Arc<dyn IndexKind>>, config: IndexerConfig) -> Self {
        Self { kinds, config }
    }

    /// Kinds a chunk carries: content-dependent ones except the file-type
    /// kind. Composite kinds are exported with their sub-indexes.
    fn covered_kinds(&self) -> Vec<&Arc<dyn IndexKind>> {
        self.kinds
            .iter()
            .filter(|k| {
                let d = k.descriptor();
                d.is_exportable() || (d.is_composite && d.depends_on_content && !d.is_file_type)
            })
            .collect()
    }

    /// Export every regular file below `roots` into the archive `out`.
    ///
    /// Either a complete archive is written or nothing is: a failure on any
    /// file aborts the export, and cancellation leaves no output behind.
    pub fn export(
        &self,
        roots: &[PathBuf],
        out: &Path,
        name: Option<&str>,
        scope: &ProgressScope,
    ) -> IndexResult<Completion<ExportReport>> {
        let started = Instant::now();
        let name = match name {
            Some(n) => n.to_string(),
            None => out
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| export_error(out, "archive path has no file name"))?,
        };
        let workdir = with_suffix(out, ".unpacked");
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir)?;
        }
        std::fs::create_dir_all(&workdir)?;

        let result = self.build(roots, &workdir, scope).and_then(|built| match built {
            Completion::Finished(built) => self.finish(built, &workdir, out, &name).map(Completion::Finished),
            Completion::Cancelled => Ok(Completion::Cancelled),
        });
        if let Err(e) = std::fs::remove_dir_all(&workdir) {
            warn!(dir = %workdir.display(), error = %e, "could not remove export working directory");
        }
        let mut report = match result? {
            Completion::Finished(report) => report,
            Completion::Cancelled => {
                info!(chunk = %name, "export cancelled");
                return Ok(Completion::Cancelled);
            }
        };
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            chunk = %report.name,
            files = report.files,
            oversized = report.oversized,
            hashes = report.unique_hashes,
            non_empty = report.non_empty_kinds(),
            empty = report.empty_content_kinds.len() + report.empty_structural_kinds.len(),
            elapsed_ms = report.elapsed_ms,
            "chunk exported"
        );
        Ok(Completion::Finished(report))
    }

    fn collect_files(&self, roots: &[PathBuf]) -> IndexResult<(BTreeSet<PathBuf>, usize)> {
        let mut files = BTreeSet::new();
        let mut oversized = 0;
        for root in roots {
            let root = std::fs::canonicalize(root).map_err(|e| export_error(root, &e.to_string()))?;
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| export_error(&root, &e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let size = entry.metadata().map_err(|e| export_error(entry.path(), &e.to_string()))?.len();
                if self.config.is_too_large(size) {
                    oversized += 1;
                    continue;
                }
                files.insert(entry.into_path());
            }
        }
        Ok((files, oversized))
    }

    fn build(&self, roots: &[PathBuf], workdir: &Path, scope: &ProgressScope) -> IndexResult<Completion<BuiltChunk>> {
        let (files, oversized) = self.collect_files(roots)?;
        let hashes = ContentHashStore::open(&workdir.join(HASHES_FILE))?;
        let mut tables = BTreeMap::new();
        for kind in self.covered_kinds() {
            let d = kind.descriptor();
            for name in std::iter::once(&d.name).chain(d.sub_indexes.iter()) {
                let storage = SqliteIndexStorage::open(&storage_path(workdir, name))?;
                tables.insert(
                    name.clone(),
                    ChunkTable {
                        index: DerivedDataIndex::new(name, d.version, Box::new(storage)),
                        structural: d.is_composite,
                    },
                );
            }
        }

        let admitted: Mutex<HashSet<HashId>> = Mutex::new(HashSet::new());
        let files: Vec<PathBuf> = files.into_iter().collect();
        let pool = worker_pool(self.config.workers)?;
        let result = pool.install(|| {
            files.par_iter().try_for_each(|path| {
                if scope.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                self.export_file(path, &hashes, &tables, &admitted)
                    .map_err(|e| match e {
                        e @ IndexError::Export { .. } => Stop::Failed(e),
                        other => Stop::Failed(export_error(path, &other.to_string())),
                    })?;
                scope.advance();
                Ok(())
            })
        });
        match result {
            Ok(()) => {}
            Err(Stop::Cancelled) => return Ok(Completion::Cancelled),
            Err(Stop::Failed(e)) => return Err(e),
        }
        let unique_hashes = admitted.lock().len();
        Ok(Completion::Finished(BuiltChunk {
            hashes,
            tables,
            files: files.len(),
            oversized,
            unique_hashes,
        }))
    }

    fn export_file(
        &self,
        path: &Path,
        hashes: &ContentHashStore,
        tables: &BTreeMap<String, ChunkTable>,
        admitted: &Mutex<HashSet<HashId>>,
    ) -> IndexResult<()> {
        let bytes = std::fs::read(path)?;
        let mut meta = FileMeta {
            id: FileId(0),
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            content_version: 0,
            origin: FileOrigin::Local,
            is_directory: false,
        };
        let hash_id = hashes.enumerate(&chunk_key(&self.kinds, &meta, &ContentHash::of(&bytes)))?;
        if !admitted.lock().insert(hash_id) {
            return Ok(());
        }
        meta.id = FileId(hash_id.0);
        let content = LoadedContent::with_bytes(meta, bytes);
        let input = hash_id.0 as u64;
        for kind in self.covered_kinds() {
            if !kind.accepts(&content.meta) {
                continue;
            }
            let d = kind.descriptor();
            let output = kind.compute(&content)?;
            let stamp = Stamp::local(0, d.version);
            for sub in &d.sub_indexes {
                let data = sub_index_data(&output, sub);
                table(tables, sub)?.update(input, &data, stamp)?;
            }
            table(tables, &d.name)?.update(input, &output.data, stamp)?;
        }
        Ok(())
    }

    fn finish(&self, built: BuiltChunk, workdir: &Path, out: &Path, name: &str) -> IndexResult<ExportReport> {
        let BuiltChunk {
            hashes,
            tables,
            files,
            oversized,
            unique_hashes,
        } = built;

        let mut manifest = ChunkManifest::new(name);
        manifest.file_count = files;
        manifest.hash_count = hashes.len()?;
        drop(hashes);

        let mut counts = BTreeMap::new();
        let mut empty = EmptyIndexes::default();
        for (table_name, table) in &tables {
            let count = table.index.input_count()?;
            counts.insert(table_name.clone(), count);
            manifest.kinds.insert(table_name.clone(), table.index.version());
            if count == 0 {
                if table.structural {
                    empty.structural_kinds.push(table_name.clone());
                } else {
                    empty.content_kinds.push(table_name.clone());
                }
            }
        }
        // Close every table before touching its files.
        drop(tables);
        for kind in empty.content_kinds.iter().chain(empty.structural_kinds.iter()) {
            remove_table(workdir, kind)?;
        }
        manifest.write(workdir)?;
        empty.write(workdir)?;
        let archive_entries = pack_directory(workdir, out)?;

        let mut entries = IndexMap::new();
        for kind in self.covered_kinds() {
            let d = kind.descriptor();
            for table_name in std::iter::once(&d.name).chain(d.sub_indexes.iter()) {
                entries.insert(table_name.clone(), counts.get(table_name).copied().unwrap_or(0));
            }
        }
        Ok(ExportReport {
            name: name.to_string(),
            archive: out.to_path_buf(),
            files,
            oversized,
            unique_hashes,
            entries,
            empty_content_kinds: empty.content_kinds,
            empty_structural_kinds: empty.structural_kinds,
            archive_entries,
            elapsed_ms: 0,
        })
    }
}

struct BuiltChunk {
    hashes: ContentHashStore,
    tables: BTreeMap<String, ChunkTable>,
    files: usize,
    oversized: usize,
    unique_hashes: usize,
}

fn table<'t>(tables: &'t BTreeMap<String, ChunkTable>, name: &str) -> IndexResult<&'t DerivedDataIndex> {
    tables
        .get(name)
        .map(|t| &t.index)
        .ok_or_else(|| IndexError::UnknownKind(name.to_string()))
}

fn sub_index_data(output: &KindOutput, sub: &str) -> InputData {
    output
        .sub_index_keys
        .get(sub)
        .map(|keys| keys.iter().map(|k| (k.clone(), Vec::new())).collect())
        .unwrap_or_default()
}

/// Delete an empty table and any directory it leaves empty.
fn remove_table(workdir: &Path, name: &str) -> IndexResult<()> {
    let path = storage_path(workdir, name);
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let file = with_suffix(&path, suffix);
        if file.exists() {
            std::fs::remove_file(&file)?;
        }
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == workdir || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
    Ok(())
}

fn export_error(path: &Path, message: &str) -> IndexError {
    IndexError::Export {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}
