//! Filesystem-backed file source: walks project roots and assigns file ids
//! from the project database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use parking_lot::RwLock;

use crate::errors::{IndexError, IndexResult};
use crate::indexer::source::FileSource;
use crate::models::{FileId, FileMeta, FileOrigin};
use crate::store::database::Database;

const DEFAULT_SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", ".hashdex"];

const IGNORE_FILE: &str = ".hashdexignore";

#[derive(Clone)]
struct ExcludeRule {
    pattern: String,
    directory_only: bool,
}

impl ExcludeRule {
    fn parse(raw: &str) -> Option<Self> {
        let stripped = raw.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            return None;
        }
        let directory_only = stripped.ends_with('/');
        let pattern = stripped.trim_end_matches('/');
        let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
        Some(Self {
            pattern: pattern.to_string(),
            directory_only,
        })
    }
}

fn matches_pattern(rel_path: &str, pattern: &str) -> bool {
    let file_name = Path::new(rel_path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    glob_match(rel_path, pattern) || glob_match(&file_name, pattern)
}

/// Glob match supporting `*` and `?`.
fn glob_match(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let mut dp = vec![vec![false; p.len() + 1]; t.len() + 1];
    dp[0][0] = true;
    for j in 1..=p.len() {
        if p[j - 1] == '*' {
            dp[0][j] = dp[0][j - 1];
        }
    }
    for i in 1..=t.len() {
        for j in 1..=p.len() {
            dp[i][j] = match p[j - 1] {
                '*' => dp[i][j - 1] || dp[i - 1][j],
                '?' => dp[i - 1][j - 1],
                c => c == t[i - 1] && dp[i - 1][j - 1],
            };
        }
    }
    dp[t.len()][p.len()]
}

fn is_excluded(rel_path: &str, is_dir: bool, rules: &[ExcludeRule]) -> bool {
    rules.iter().any(|rule| {
        if rule.directory_only && !is_dir {
            return false;
        }
        matches_pattern(rel_path, &rule.pattern)
            || rel_path.starts_with(&format!("{}/", rule.pattern))
    })
}

fn exclude_sensitive() -> bool {
    match std::env::var("HASHDEX_EXCLUDE_SENSITIVE") {
        Ok(val) => {
            let v = val.trim().to_lowercase();
            !matches!(v.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Every regular file below `root`, honouring `.gitignore`, `.hashdexignore`
/// and `exclude_patterns`. Sorted.
pub fn walk_files(root: &Path, exclude_patterns: &[String]) -> Vec<PathBuf> {
    let mut rules: Vec<ExcludeRule> = exclude_patterns
        .iter()
        .filter_map(|p| ExcludeRule::parse(p))
        .collect();
    if exclude_sensitive() {
        rules.extend(
            DEFAULT_SENSITIVE_EXCLUDE_PATTERNS
                .iter()
                .filter_map(|p| ExcludeRule::parse(p)),
        );
    }
    let rules = Arc::new(rules);

    let filter_rules = Arc::clone(&rules);
    let filter_root = root.to_path_buf();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .require_git(false)
        .follow_links(false)
        .add_custom_ignore_filename(IGNORE_FILE)
        .filter_entry(move |entry| {
            if entry.depth() == 0 || !entry.file_type().is_some_and(|t| t.is_dir()) {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if IMPLICIT_IGNORED_DIRS.contains(&&*name) {
                return false;
            }
            !is_excluded(&relative(entry.path(), &filter_root), true, &filter_rules)
        })
        .build();

    let mut files: Vec<PathBuf> = walker
        .flatten()
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .filter(|p| !is_excluded(&relative(p, root), false, &rules))
        .collect();
    files.sort();
    files
}

/// Content version of a file on disk: changes whenever mtime or size do.
fn content_version(md: &std::fs::Metadata) -> u64 {
    let nanos = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as u64);
    nanos.wrapping_mul(1_000_003) ^ md.len()
}

/// File source over one or more directory roots.
pub struct FsFileSource {
    db: Arc<Database>,
    roots: Vec<(PathBuf, FileOrigin)>,
    exclude_patterns: Vec<String>,
    known: RwLock<HashMap<FileId, (PathBuf, FileOrigin)>>,
}

impl FsFileSource {
    pub fn new(db: Arc<Database>, exclude_patterns: Vec<String>) -> Self {
        Self {
            db,
            roots: Vec::new(),
            exclude_patterns,
            known: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>, origin: FileOrigin) -> Self {
        self.roots.push((root.into(), origin));
        self
    }

    fn locate(&self, id: FileId) -> Option<(PathBuf, FileOrigin)> {
        if let Some(found) = self.known.read().get(&id) {
            return Some(found.clone());
        }
        let path = self.db.path_for_file_id(id).ok().flatten()?;
        Some((path, FileOrigin::Local))
    }
}

impl FileSource for FsFileSource {
    fn candidates(&self) -> IndexResult<Vec<FileId>> {
        let mut ids = Vec::new();
        for (root, origin) in &self.roots {
            let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
            for path in walk_files(&root, &self.exclude_patterns) {
                let id = self.db.file_id_for_path(&path)?;
                self.known.write().insert(id, (path, *origin));
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn meta(&self, id: FileId) -> Option<FileMeta> {
        let (path, origin) = self.locate(id)?;
        let md = std::fs::metadata(&path).ok()?;
        Some(FileMeta {
            id,
            size: md.len(),
            content_version: content_version(&md),
            origin,
            is_directory: md.is_dir(),
            path,
        })
    }

    fn load(&self, id: FileId) -> IndexResult<Vec<u8>> {
        let (path, _) = self
            .locate(id)
            .ok_or_else(|| IndexError::Index(format!("{id} has no known path")))?;
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("config.pem", "*.pem"));
        assert!(glob_match("a/b.rs", "a/?.rs"));
        assert!(!glob_match("b.rs", "*.py"));
    }

    #[test]
    fn test_walk_honours_ignore_files_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("target")).unwrap();
        std::fs::create_dir_all(root.join("vendor")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".gitignore"), "target/\n").unwrap();
        std::fs::write(root.join(".hashdexignore"), "*.log\n").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("target/out.rs"), "x").unwrap();
        std::fs::write(root.join("vendor/lib.rs"), "x").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(root.join("debug.log"), "x").unwrap();
        std::fs::write(root.join("server.pem"), "x").unwrap();

        let files: Vec<String> = walk_files(root, &["vendor/".to_string()])
            .iter()
            .map(|p| relative(p, root))
            .collect();
        assert!(files.contains(&"src/main.rs".to_string()));
        assert!(!files.iter().any(|f| f.starts_with("target/")));
        assert!(!files.iter().any(|f| f.starts_with("vendor/")));
        assert!(!files.iter().any(|f| f.starts_with(".git/")));
        assert!(!files.contains(&"debug.log".to_string()));
        assert!(!files.contains(&"server.pem".to_string()));
    }

    #[test]
    fn test_fs_source_tracks_edits_and_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let source =
            FsFileSource::new(Arc::clone(&db), Vec::new()).with_root(dir.path(), FileOrigin::Local);

        let ids = source.candidates().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(source.candidates().unwrap(), ids);
        let before = source.meta(ids[0]).unwrap();
        assert_eq!(source.load(ids[0]).unwrap(), b"one");

        std::fs::write(&file, "three").unwrap();
        let after = source.meta(ids[0]).unwrap();
        assert_ne!(before.content_version, after.content_version);

        std::fs::remove_file(&file).unwrap();
        assert!(source.meta(ids[0]).is_none());
    }
}
