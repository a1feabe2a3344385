//! Scan, local indexing and chunk export pipelines.

pub mod exporter;
pub mod filesystem;
pub mod local;
pub mod scanner;
pub mod source;

use tracing::{info, warn};

use crate::chunks::registry::ChunkRegistry;
use crate::chunks::ChunkProvider;
use crate::index::content_hash::FileContentHashIndex;
use crate::index::set::IndexSet;
use crate::models::ChunkId;

/// Everything shared-chunk reuse needs. Absent when reuse is disabled, in
/// which case the pipelines behave as plain local indexers.
#[derive(Clone, Copy)]
pub struct SharedContext<'a> {
    pub content_hashes: &'a FileContentHashIndex,
    pub registry: &'a ChunkRegistry,
    pub provider: &'a dyn ChunkProvider,
}

impl SharedContext<'_> {
    /// Withdraw `chunk` and reset the stamps of every file it served, so the
    /// next scan sends them to local indexing.
    pub fn invalidate(&self, indexes: &IndexSet, chunk: ChunkId) -> usize {
        self.registry.invalidate(chunk);
        self.provider.detach(chunk);
        self.reset_files_of(indexes, chunk)
    }

    /// Reset stamps of the files associated with a chunk the registry
    /// already marked invalid. Returns how many files were reset.
    pub fn reset_files_of(&self, indexes: &IndexSet, chunk: ChunkId) -> usize {
        let files = match self.content_hashes.files_for_chunk(chunk) {
            Ok(files) => files,
            Err(e) => {
                // The served files cannot be found, so every content kind is
                // rebuilt instead.
                warn!(%chunk, error = %e, "could not list files of invalid chunk");
                indexes.request_rebuild_all_content("chunk association unavailable");
                return 0;
            }
        };
        for file in &files {
            if let Err(e) = indexes.reset_all_for_file(*file) {
                warn!(%file, error = %e, "failed to reset stamps");
            }
        }
        info!(%chunk, files = files.len(), "chunk invalidated; files return to local indexing");
        files.len()
    }
}
