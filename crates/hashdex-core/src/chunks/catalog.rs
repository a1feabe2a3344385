//! Consumer side of shared chunks: discovers archives, unpacks them and
//! serves their data once attached.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::chunks::archive::unpack_archive;
use crate::chunks::manifest::{ChunkManifest, EmptyIndexes, HASHES_FILE, MANIFEST_FILE};
use crate::chunks::ChunkProvider;
use crate::errors::{IndexError, IndexResult};
use crate::index::kinds::IndexKind;
use crate::index::storage_path;
use crate::models::{ChunkHashId, ChunkId, ContentHash, HashId, CHUNK_FORMAT_VERSION};
use crate::store::database::Database;
use crate::store::hash_store::ContentHashStore;
use crate::store::storage::{IndexStorage, SqliteIndexStorage};

/// A chunk known to the catalog, attached or not.
struct CatalogEntry {
    name: String,
    dir: PathBuf,
    hashes: ContentHashStore,
}

/// Opened per-kind tables of an attached chunk. Kinds listed as empty have
/// no table.
struct AttachedChunk {
    tables: HashMap<String, SqliteIndexStorage>,
}

pub struct ChunkCatalog {
    /// Sorted by chunk id so lookups prefer older chunks deterministically.
    entries: BTreeMap<ChunkId, CatalogEntry>,
    /// Local index and sub-index versions a chunk must match.
    expected: BTreeMap<String, u32>,
    attached: RwLock<HashMap<ChunkId, Arc<AttachedChunk>>>,
    attach_calls: AtomicUsize,
}

impl ChunkCatalog {
    /// Register every `*.zip` in `chunks_dir`, unpacking new ones below
    /// `unpack_root`. Archives that fail to unpack are skipped with a warning.
    pub fn open(
        chunks_dir: &Path,
        unpack_root: &Path,
        db: &Database,
        kinds: &[Arc<dyn IndexKind>],
    ) -> IndexResult<Self> {
        let mut archives: Vec<PathBuf> = match std::fs::read_dir(chunks_dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == "zip"))
                .collect(),
            Err(e) => {
                warn!(dir = %chunks_dir.display(), error = %e, "shared chunks directory unreadable");
                Vec::new()
            }
        };
        archives.sort();

        let mut entries = BTreeMap::new();
        for archive in archives {
            let Some(name) = archive.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let dir = unpack_root.join(&name);
            match Self::prepare(&archive, &dir) {
                Ok(hashes) => {
                    let id = db.chunk_id_for_name(&name)?;
                    entries.insert(id, CatalogEntry { name, dir, hashes });
                }
                Err(e) => {
                    warn!(archive = %archive.display(), error = %e, "skipping unreadable chunk");
                }
            }
        }
        info!(chunks = entries.len(), "shared chunk catalog ready");
        Ok(Self {
            entries,
            expected: expected_versions(kinds),
            attached: RwLock::new(HashMap::new()),
            attach_calls: AtomicUsize::new(0),
        })
    }

    fn prepare(archive: &Path, dir: &Path) -> IndexResult<ContentHashStore> {
        let stale = match (std::fs::metadata(archive), std::fs::metadata(dir.join(MANIFEST_FILE))) {
            (Ok(a), Ok(m)) => match (a.modified(), m.modified()) {
                (Ok(a), Ok(m)) => a > m,
                _ => true,
            },
            _ => true,
        };
        if stale {
            unpack_archive(archive, dir)?;
        }
        ContentHashStore::open(&dir.join(HASHES_FILE))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunk_name(&self, chunk: ChunkId) -> Option<&str> {
        self.entries.get(&chunk).map(|e| e.name.as_str())
    }

    /// Number of attach attempts that reached this catalog.
    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::Relaxed)
    }

    fn load(&self, entry: &CatalogEntry) -> IndexResult<AttachedChunk> {
        let manifest = ChunkManifest::read(&entry.dir)?;
        if manifest.format_version != CHUNK_FORMAT_VERSION {
            return Err(IndexError::Index(format!(
                "chunk {} has format version {}, expected {}",
                entry.name, manifest.format_version, CHUNK_FORMAT_VERSION
            )));
        }
        for (kind, version) in &self.expected {
            match manifest.kinds.get(kind) {
                Some(v) if v == version => {}
                Some(v) => {
                    return Err(IndexError::Index(format!(
                        "chunk {} built {kind} v{v}, local is v{version}",
                        entry.name
                    )))
                }
                None => {
                    return Err(IndexError::Index(format!(
                        "chunk {} does not cover {kind}",
                        entry.name
                    )))
                }
            }
        }
        let empty = EmptyIndexes::read(&entry.dir)?;
        let mut tables = HashMap::new();
        for kind in self.expected.keys() {
            if empty.contains(kind) {
                continue;
            }
            let path = storage_path(&entry.dir, kind);
            if !path.exists() {
                return Err(IndexError::Index(format!(
                    "chunk {} is missing table {kind}",
                    entry.name
                )));
            }
            tables.insert(kind.clone(), SqliteIndexStorage::open(&path)?);
        }
        Ok(AttachedChunk { tables })
    }
}

/// Kinds a chunk must cover: everything content-dependent except the
/// file-type kind, with sub-indexes.
fn expected_versions(kinds: &[Arc<dyn IndexKind>]) -> BTreeMap<String, u32> {
    let mut expected = BTreeMap::new();
    for kind in kinds {
        let d = kind.descriptor();
        if !d.depends_on_content || d.is_file_type {
            continue;
        }
        expected.insert(d.name.clone(), d.version);
        for sub in &d.sub_indexes {
            expected.insert(sub.clone(), d.version);
        }
    }
    expected
}

impl ChunkProvider for ChunkCatalog {
    fn lookup(&self, hash: &ContentHash) -> Option<ChunkHashId> {
        for (id, entry) in &self.entries {
            match entry.hashes.lookup(hash) {
                Ok(Some(hash_id)) => return Some(ChunkHashId::new(*id, hash_id)),
                Ok(None) => {}
                Err(e) => warn!(chunk = %id, error = %e, "chunk hash table unreadable"),
            }
        }
        None
    }

    fn attach(&self, chunk: ChunkId) -> IndexResult<()> {
        self.attach_calls.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .entries
            .get(&chunk)
            .ok_or_else(|| IndexError::Index(format!("unknown {chunk}")))?;
        let loaded = self.load(entry)?;
        self.attached.write().insert(chunk, Arc::new(loaded));
        info!(%chunk, name = %entry.name, "shared chunk attached");
        Ok(())
    }

    fn detach(&self, chunk: ChunkId) {
        self.attached.write().remove(&chunk);
    }

    fn attached_chunks(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.attached.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn values(&self, chunk: ChunkId, kind: &str, key: &str) -> IndexResult<Vec<(HashId, Vec<u8>)>> {
        let Some(attached) = self.attached.read().get(&chunk).cloned() else {
            return Ok(Vec::new());
        };
        let Some(table) = attached.tables.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values_for_key(key)?
            .into_iter()
            .map(|(input, value)| (HashId(input as u32), value))
            .collect())
    }
}
