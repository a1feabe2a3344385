//! Shared index chunks: archive layout, attachment registry, local catalog.

pub mod archive;
pub mod catalog;
pub mod manifest;
pub mod registry;

use crate::errors::IndexResult;
use crate::models::{ChunkHashId, ChunkId, ContentHash, HashId};

/// Consumer-side access to prebuilt chunks.
///
/// `attach` is the possibly expensive step guarded by
/// [`registry::ChunkRegistry`]; it must publish the chunk atomically, so a
/// failed attach leaves nothing visible.
pub trait ChunkProvider: Send + Sync {
    /// Chunk-qualified hash id of `hash`, if any known chunk covers it.
    fn lookup(&self, hash: &ContentHash) -> Option<ChunkHashId>;

    fn attach(&self, chunk: ChunkId) -> IndexResult<()>;

    /// Withdraw a chunk's data from reads.
    fn detach(&self, chunk: ChunkId);

    fn attached_chunks(&self) -> Vec<ChunkId>;

    /// Reverse lookup of `key` in one kind of an attached chunk. Inputs are
    /// the chunk's own hash ids.
    fn values(&self, chunk: ChunkId, kind: &str, key: &str) -> IndexResult<Vec<(HashId, Vec<u8>)>>;
}
