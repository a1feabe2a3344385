//! Index kinds: capability descriptors and the built-in data extractors.
//!
//! The engine never special-cases a kind by name. Everything the scanner and
//! the exporter need to know comes from [`IndexKindDescriptor`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};
use crate::models::{ContentHash, FileMeta, InputData, LoadedContent};

pub const FILE_TYPE_KIND: &str = "file-type";
pub const FILE_NAME_KIND: &str = "file-name";
pub const WORDS_KIND: &str = "words";
pub const STRUCTURE_KIND: &str = "structure";
pub const STRUCTURE_DECLARATIONS: &str = "structure.declarations";
pub const STRUCTURE_IMPORTS: &str = "structure.imports";

const FILE_TYPE_BY_EXTENSION: &[(&str, &str)] = &[
    ("py", "python"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "javascript"),
    ("go", "go"),
    ("rs", "rust"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("md", "markdown"),
    ("txt", "plain-text"),
    ("json", "json"),
    ("toml", "toml"),
    ("jar", "archive"),
    ("zip", "archive"),
    ("png", "image"),
    ("jpg", "image"),
];

const UNKNOWN_FILE_TYPE: &str = "unknown";

/// Declared capabilities of one index kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKindDescriptor {
    pub name: String,
    /// Bumping the version invalidates every stamp written by older versions.
    pub version: u32,
    pub depends_on_content: bool,
    /// Built from per-key sub-indexes; exported by its own generator.
    pub is_composite: bool,
    /// The distinguished kind whose staleness invalidates all other kinds.
    pub is_file_type: bool,
    /// Sub-index names of a composite kind.
    pub sub_indexes: Vec<String>,
}

impl IndexKindDescriptor {
    pub fn content(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
            depends_on_content: true,
            is_composite: false,
            is_file_type: false,
            sub_indexes: Vec::new(),
        }
    }

    pub fn content_independent(name: &str, version: u32) -> Self {
        Self {
            depends_on_content: false,
            ..Self::content(name, version)
        }
    }

    pub fn is_content_independent(&self) -> bool {
        !self.depends_on_content
    }

    /// Kinds the chunk exporter runs through the generic per-kind generator.
    pub fn is_exportable(&self) -> bool {
        self.depends_on_content && !self.is_file_type && !self.is_composite
    }
}

/// Output of one kind for one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KindOutput {
    pub data: InputData,
    /// Composite kinds only: keys contributed to each sub-index.
    pub sub_index_keys: BTreeMap<String, BTreeSet<String>>,
}

impl KindOutput {
    pub fn from_data(data: InputData) -> Self {
        Self {
            data,
            sub_index_keys: BTreeMap::new(),
        }
    }
}

/// "Compute derived data for loaded content" capability of one kind.
pub trait IndexKind: Send + Sync {
    fn descriptor(&self) -> &IndexKindDescriptor;

    /// Value recorded in stamps. Content kinds use the content version.
    fn input_fingerprint(&self, meta: &FileMeta) -> u64 {
        meta.content_version
    }

    /// Whether this kind indexes the given file at all.
    fn accepts(&self, _meta: &FileMeta) -> bool {
        true
    }

    fn compute(&self, content: &LoadedContent) -> IndexResult<KindOutput>;
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

pub fn detect_file_type(meta: &FileMeta) -> &'static str {
    if meta.is_directory {
        return "directory";
    }
    let Some(ext) = meta.extension() else {
        return UNKNOWN_FILE_TYPE;
    };
    FILE_TYPE_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext.as_str())
        .map(|(_, t)| *t)
        .unwrap_or(UNKNOWN_FILE_TYPE)
}

pub fn file_type_fingerprint(file_type: &str) -> u64 {
    crc32fast::hash(file_type.as_bytes()) as u64
}

/// Key under which chunks store the data of `meta`: its content hash salted
/// with the file-type fingerprint. Kinds decide by file type whether they
/// apply, so the same bytes under another type must not match.
pub fn chunk_key(kinds: &[Arc<dyn IndexKind>], meta: &FileMeta, content: &ContentHash) -> ContentHash {
    let file_type = kinds
        .iter()
        .find(|k| k.descriptor().is_file_type)
        .map_or(0, |k| k.input_fingerprint(meta));
    content.salted(file_type)
}

fn is_textual(file_type: &str) -> bool {
    !matches!(file_type, "archive" | "image" | "directory")
}

/// Classifies files by extension. Its fingerprint is the classification
/// itself, so a changed classification makes the file stale everywhere.
pub struct FileTypeKind {
    descriptor: IndexKindDescriptor,
}

impl FileTypeKind {
    pub fn new() -> Self {
        Self {
            descriptor: IndexKindDescriptor {
                is_file_type: true,
                ..IndexKindDescriptor::content_independent(FILE_TYPE_KIND, 1)
            },
        }
    }
}

impl Default for FileTypeKind {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexKind for FileTypeKind {
    fn descriptor(&self) -> &IndexKindDescriptor {
        &self.descriptor
    }

    fn input_fingerprint(&self, meta: &FileMeta) -> u64 {
        file_type_fingerprint(detect_file_type(meta))
    }

    fn compute(&self, content: &LoadedContent) -> IndexResult<KindOutput> {
        let mut data = InputData::new();
        data.insert(detect_file_type(&content.meta).to_string(), Vec::new());
        Ok(KindOutput::from_data(data))
    }
}

/// Lower-cased file name -> file. Needs metadata only.
pub struct FileNameKind {
    descriptor: IndexKindDescriptor,
}

impl FileNameKind {
    pub fn new() -> Self {
        Self {
            descriptor: IndexKindDescriptor::content_independent(FILE_NAME_KIND, 1),
        }
    }
}

impl Default for FileNameKind {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexKind for FileNameKind {
    fn descriptor(&self) -> &IndexKindDescriptor {
        &self.descriptor
    }

    fn compute(&self, content: &LoadedContent) -> IndexResult<KindOutput> {
        let mut data = InputData::new();
        let name = content.meta.file_name().to_lowercase();
        if !name.is_empty() {
            data.insert(name, Vec::new());
        }
        Ok(KindOutput::from_data(data))
    }
}

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").expect("static regex"));

/// Identifier-like words -> occurrence count (little-endian u32).
pub struct WordKind {
    descriptor: IndexKindDescriptor,
}

impl WordKind {
    pub fn new() -> Self {
        Self {
            descriptor: IndexKindDescriptor::content(WORDS_KIND, 1),
        }
    }
}

impl Default for WordKind {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexKind for WordKind {
    fn descriptor(&self) -> &IndexKindDescriptor {
        &self.descriptor
    }

    fn accepts(&self, meta: &FileMeta) -> bool {
        is_textual(detect_file_type(meta))
    }

    fn compute(&self, content: &LoadedContent) -> IndexResult<KindOutput> {
        let text = content.text();
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for m in WORD_RE.find_iter(&text) {
            *counts.entry(m.as_str().to_lowercase()).or_default() += 1;
        }
        let data = counts
            .into_iter()
            .map(|(word, count)| (word, count.to_le_bytes().to_vec()))
            .collect();
        Ok(KindOutput::from_data(data))
    }
}

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:pub(?:\([a-z]+\))?\s+|export\s+|public\s+|private\s+|static\s+|async\s+)*(fn|struct|enum|trait|class|interface|def|func|type|object)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("static regex")
});

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:use|import|from|#include)\s+[<"]?([A-Za-z_][A-Za-z0-9_.:/]*)"#)
        .expect("static regex")
});

/// Serialized structural tree of one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureTree {
    pub declarations: Vec<Declaration>,
    pub imports: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub keyword: String,
    pub name: String,
    pub line: u32,
}

/// Composite structural kind: stores one tree per file and fans declared
/// names and imports out into its sub-indexes.
pub struct StructureKind {
    descriptor: IndexKindDescriptor,
}

impl StructureKind {
    pub const TREE_KEY: &'static str = "tree";

    pub fn new() -> Self {
        Self {
            descriptor: IndexKindDescriptor {
                is_composite: true,
                sub_indexes: vec![
                    STRUCTURE_DECLARATIONS.to_string(),
                    STRUCTURE_IMPORTS.to_string(),
                ],
                ..IndexKindDescriptor::content(STRUCTURE_KIND, 1)
            },
        }
    }

    pub fn parse(text: &str) -> StructureTree {
        let mut tree = StructureTree::default();
        for (idx, line) in text.lines().enumerate() {
            if let Some(caps) = DECLARATION_RE.captures(line) {
                tree.declarations.push(Declaration {
                    keyword: caps[1].to_string(),
                    name: caps[2].to_string(),
                    line: idx as u32 + 1,
                });
            } else if let Some(caps) = IMPORT_RE.captures(line) {
                tree.imports.push(caps[1].trim_end_matches(';').to_string());
            }
        }
        tree
    }
}

impl Default for StructureKind {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexKind for StructureKind {
    fn descriptor(&self) -> &IndexKindDescriptor {
        &self.descriptor
    }

    fn accepts(&self, meta: &FileMeta) -> bool {
        !matches!(
            detect_file_type(meta),
            "archive" | "image" | "directory" | "plain-text" | "markdown" | UNKNOWN_FILE_TYPE
        )
    }

    fn compute(&self, content: &LoadedContent) -> IndexResult<KindOutput> {
        let tree = Self::parse(&content.text());
        let mut output = KindOutput::default();
        if tree.declarations.is_empty() && tree.imports.is_empty() {
            return Ok(output);
        }
        let declarations: BTreeSet<String> =
            tree.declarations.iter().map(|d| d.name.clone()).collect();
        let imports: BTreeSet<String> = tree.imports.iter().cloned().collect();
        output.data.insert(
            Self::TREE_KEY.to_string(),
            serde_json::to_vec(&tree).map_err(IndexError::from)?,
        );
        if !declarations.is_empty() {
            output
                .sub_index_keys
                .insert(STRUCTURE_DECLARATIONS.to_string(), declarations);
        }
        if !imports.is_empty() {
            output
                .sub_index_keys
                .insert(STRUCTURE_IMPORTS.to_string(), imports);
        }
        Ok(output)
    }
}

/// The default kind set: file type, file name, words, structure.
pub fn builtin_kinds() -> Vec<Arc<dyn IndexKind>> {
    vec![
        Arc::new(FileTypeKind::new()),
        Arc::new(FileNameKind::new()),
        Arc::new(WordKind::new()),
        Arc::new(StructureKind::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileId, FileOrigin};
    use std::path::PathBuf;

    fn meta(path: &str) -> FileMeta {
        FileMeta {
            id: FileId(1),
            path: PathBuf::from(path),
            size: 10,
            content_version: 1,
            origin: FileOrigin::Local,
            is_directory: false,
        }
    }

    #[test]
    fn test_descriptor_capabilities() {
        assert!(FileTypeKind::new().descriptor().is_file_type);
        assert!(FileTypeKind::new().descriptor().is_content_independent());
        assert!(WordKind::new().descriptor().is_exportable());
        assert!(!StructureKind::new().descriptor().is_exportable());
        assert!(!FileNameKind::new().descriptor().is_exportable());
    }

    #[test]
    fn test_file_type_fingerprint_follows_classification() {
        let kind = FileTypeKind::new();
        let a = meta("src/a.rs");
        let mut renamed = a.clone();
        renamed.content_version = 99;
        assert_eq!(kind.input_fingerprint(&a), kind.input_fingerprint(&renamed));
        assert_ne!(
            kind.input_fingerprint(&a),
            kind.input_fingerprint(&meta("src/a.py"))
        );
    }

    #[test]
    fn test_chunk_key_separates_file_types() {
        let kinds = builtin_kinds();
        let content = ContentHash::of(b"fn alpha() {}");
        let rust = chunk_key(&kinds, &meta("lib/geo.rs"), &content);
        assert_eq!(rust, chunk_key(&kinds, &meta("src/other.rs"), &content));
        assert_ne!(rust, chunk_key(&kinds, &meta("notes.txt"), &content));
        assert_ne!(rust, content);

        let no_file_type: Vec<Arc<dyn IndexKind>> = vec![Arc::new(WordKind::new())];
        assert_eq!(
            chunk_key(&no_file_type, &meta("a.rs"), &content),
            chunk_key(&no_file_type, &meta("a.txt"), &content)
        );
    }

    #[test]
    fn test_directories_have_their_own_file_type() {
        let dir = FileMeta {
            is_directory: true,
            ..meta("src")
        };
        assert_eq!(detect_file_type(&dir), "directory");
        assert!(!WordKind::new().accepts(&dir));
        assert!(!StructureKind::new().accepts(&dir));
    }

    #[test]
    fn test_word_counts() {
        let content = LoadedContent::with_bytes(
            meta("a.txt"),
            b"let alpha = beta + alpha; x = 1".to_vec(),
        );
        let out = WordKind::new().compute(&content).unwrap();
        assert_eq!(out.data.get("alpha"), Some(&2u32.to_le_bytes().to_vec()));
        assert_eq!(out.data.get("beta"), Some(&1u32.to_le_bytes().to_vec()));
        assert!(!out.data.contains_key("x"));
    }

    #[test]
    fn test_structure_fans_out_sub_indexes() {
        let source = "use std::fmt;\n\npub struct Point {}\nfn distance() {}\n";
        let content = LoadedContent::with_bytes(meta("geo.rs"), source.as_bytes().to_vec());
        let out = StructureKind::new().compute(&content).unwrap();
        let tree: StructureTree =
            serde_json::from_slice(&out.data[StructureKind::TREE_KEY]).unwrap();
        assert_eq!(tree.declarations.len(), 2);
        assert_eq!(tree.declarations[0].name, "Point");
        assert_eq!(tree.declarations[1].line, 4);
        assert!(out.sub_index_keys[STRUCTURE_DECLARATIONS].contains("distance"));
        assert!(out.sub_index_keys[STRUCTURE_IMPORTS].contains("std::fmt"));
    }

    #[test]
    fn test_structure_empty_for_prose() {
        let content = LoadedContent::with_bytes(meta("notes.rs"), b"just words".to_vec());
        let out = StructureKind::new().compute(&content).unwrap();
        assert!(out.data.is_empty());
        assert!(out.sub_index_keys.is_empty());
        assert!(!StructureKind::new().accepts(&meta("notes.txt")));
    }
}
