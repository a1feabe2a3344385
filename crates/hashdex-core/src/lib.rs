//! hashdex core library: incremental, content-addressed file indexing.
//!
//! A project keeps one derived-data index per index kind, brought up to date
//! by a scanner that decides per file whether it is current, can be served by
//! a prebuilt shared chunk, or must be indexed locally. Chunks are produced
//! offline by the exporter and are keyed by content hash, so any project whose
//! files match a chunk's hashes can attach it.

pub mod chunks;
pub mod config;
pub mod errors;
pub mod index;
pub mod indexer;
pub mod models;
pub mod progress;
pub mod project;
pub mod store;

pub use config::IndexerConfig;
pub use errors::{IndexError, IndexResult};
pub use index::kinds::{builtin_kinds, IndexKind, IndexKindDescriptor, KindOutput};
pub use indexer::exporter::{ChunkExporter, ExportReport};
pub use indexer::filesystem::FsFileSource;
pub use indexer::source::{FileSource, MemoryFileSource};
pub use models::{Completion, ContentHash, FileId, FileMeta, FileOrigin};
pub use progress::ProgressScope;
pub use project::{ProjectIndex, SessionReport};
