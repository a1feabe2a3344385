//! Shared typed models used across the store, index, chunk and indexer layers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{IndexError, IndexResult};

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Version of the chunk archive layout. Consumers reject chunks written with
/// any other value.
pub const CHUNK_FORMAT_VERSION: u32 = 1;

/// Hash id reserved for "no hash computed".
pub const NULL_HASH_ID: HashId = HashId(0);

/// Chunk id reserved for "no associated chunk".
pub const NULL_CHUNK_ID: ChunkId = ChunkId(0);

/// Bytes inspected when deciding whether content is text or binary.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Data produced by one index kind for one input: key -> opaque value.
pub type InputData = BTreeMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable per-path file identity, assigned by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Dense id assigned by a Content Hash Store on first insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashId(pub u32);

/// Dense id of a shared chunk within one project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl HashId {
    pub fn is_null(self) -> bool {
        self == NULL_HASH_ID
    }
}

impl ChunkId {
    pub fn is_null(self) -> bool {
        self == NULL_CHUNK_ID
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// A hash id qualified by the chunk whose hash store assigned it.
///
/// The chunk id lives in the upper 32 bits so a single integer is enough to
/// join a project file to the data stored in one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHashId(pub u64);

impl ChunkHashId {
    pub fn new(chunk: ChunkId, hash: HashId) -> Self {
        Self(((chunk.0 as u64) << 32) | hash.0 as u64)
    }

    pub fn chunk_id(self) -> ChunkId {
        ChunkId((self.0 >> 32) as u32)
    }

    pub fn hash_id(self) -> HashId {
        HashId(self.0 as u32)
    }
}

// ---------------------------------------------------------------------------
// Content hash
// ---------------------------------------------------------------------------

/// SHA-256 digest of a file's normalized content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash `bytes` after normalization. Text has its UTF-8 BOM stripped and
    /// CRLF / CR line endings folded to LF; binary content is hashed raw.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        if is_binary(bytes) {
            hasher.update(bytes);
        } else {
            let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            let mut start = 0;
            let mut i = 0;
            while i < body.len() {
                if body[i] == b'\r' {
                    hasher.update(&body[start..i]);
                    hasher.update(b"\n");
                    if body.get(i + 1) == Some(&b'\n') {
                        i += 1;
                    }
                    start = i + 1;
                }
                i += 1;
            }
            hasher.update(&body[start..]);
        }
        Self(hasher.finalize().into())
    }

    /// Digest of this hash combined with `salt`. Chunks are keyed by the
    /// content hash salted with the file-type fingerprint, so identical bytes
    /// classified differently never share chunk data.
    pub fn salted(&self, salt: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(salt.to_le_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> IndexResult<Self> {
        let hex = hex.trim();
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(IndexError::Index(format!("malformed content hash: {hex:?}")));
        }
        let mut out = [0u8; 32];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| IndexError::Index(format!("malformed content hash: {hex:?}")))?;
        }
        Ok(Self(out))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Filesystem a file was observed on. Only used to order scanner output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    Local,
    Archive,
}

/// Host-provided metadata for one live file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: FileId,
    pub path: PathBuf,
    pub size: u64,
    /// Monotonic marker that changes whenever the file's content changes.
    pub content_version: u64,
    pub origin: FileOrigin,
    pub is_directory: bool,
}

impl FileMeta {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// A file handed to index kinds. `bytes` is `None` for content-independent
/// kinds and for files too large for content indexing.
#[derive(Clone, Debug)]
pub struct LoadedContent {
    pub meta: FileMeta,
    pub bytes: Option<Vec<u8>>,
}

impl LoadedContent {
    pub fn metadata_only(meta: FileMeta) -> Self {
        Self { meta, bytes: None }
    }

    pub fn with_bytes(meta: FileMeta, bytes: Vec<u8>) -> Self {
        Self {
            meta,
            bytes: Some(bytes),
        }
    }

    /// Content as text, lossily decoded. Empty for metadata-only inputs.
    pub fn text(&self) -> String {
        match &self.bytes {
            Some(b) => String::from_utf8_lossy(b).into_owned(),
            None => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stamps and scan outcomes
// ---------------------------------------------------------------------------

/// Per-file, per-kind marker recording which input has been folded into an
/// index kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub fingerprint: u64,
    pub kind_version: u32,
    /// Chunk that supplied the data, when it was not computed locally.
    pub chunk: Option<ChunkId>,
}

impl Stamp {
    pub fn local(fingerprint: u64, kind_version: u32) -> Self {
        Self {
            fingerprint,
            kind_version,
            chunk: None,
        }
    }

    pub fn from_chunk(fingerprint: u64, kind_version: u32, chunk: ChunkId) -> Self {
        Self {
            fingerprint,
            kind_version,
            chunk: Some(chunk),
        }
    }

    /// Whether this stamp describes the given current input.
    pub fn matches(&self, snapshot: &InputSnapshot) -> bool {
        self.fingerprint == snapshot.fingerprint && self.kind_version == snapshot.kind_version
    }
}

/// The current input of one file, as seen by one index kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSnapshot {
    pub fingerprint: u64,
    pub kind_version: u32,
}

/// Answer of an index kind to "does this file need indexing?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileIndexingState {
    UpToDate,
    ShouldIndex,
}

/// Terminal per-scan state of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileVerdict {
    Skipped,
    UpToDate,
    NeedsLocalIndex,
    ReuseChunk,
}

/// Result of a cancellable long-running operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion<T> {
    Finished(T),
    Cancelled,
}

impl<T> Completion<T> {
    pub fn finished(self) -> Option<T> {
        match self {
            Completion::Finished(v) => Some(v),
            Completion::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_normalizes_line_endings() {
        let unix = ContentHash::of(b"fn main() {}\nlet x = 1;\n");
        let dos = ContentHash::of(b"fn main() {}\r\nlet x = 1;\r\n");
        let mac = ContentHash::of(b"fn main() {}\rlet x = 1;\r");
        let bom = ContentHash::of(b"\xEF\xBB\xBFfn main() {}\nlet x = 1;\n");
        assert_eq!(unix, dos);
        assert_eq!(unix, mac);
        assert_eq!(unix, bom);
        assert_ne!(unix, ContentHash::of(b"fn main() {}\n"));
    }

    #[test]
    fn test_content_hash_binary_is_raw() {
        let a = ContentHash::of(b"\x00\x01\r\n");
        let b = ContentHash::of(b"\x00\x01\n");
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::of(b"hello");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(ContentHash::from_hex("abc").is_err());
    }

    #[test]
    fn test_chunk_hash_id_packing() {
        let id = ChunkHashId::new(ChunkId(7), HashId(42));
        assert_eq!(id.chunk_id(), ChunkId(7));
        assert_eq!(id.hash_id(), HashId(42));
        assert_eq!(ChunkHashId::new(ChunkId(0), HashId(u32::MAX)).chunk_id(), NULL_CHUNK_ID);
    }

    #[test]
    fn test_stamp_matches_snapshot() {
        let stamp = Stamp::local(10, 2);
        assert!(stamp.matches(&InputSnapshot {
            fingerprint: 10,
            kind_version: 2
        }));
        assert!(!stamp.matches(&InputSnapshot {
            fingerprint: 10,
            kind_version: 3
        }));
    }
}
