//! Derived-data indexes: kinds, generic per-kind storage, the per-project set.

pub mod content_hash;
pub mod derived;
pub mod kinds;
pub mod set;

use std::path::{Path, PathBuf};

/// Table file of an index (or sub-index) below `root`.
///
/// Sub-index names are dotted (`structure.declarations`) and nest under their
/// parent's directory, so `structure/declarations/index.db`.
pub fn storage_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in name.split('.') {
        path.push(part);
    }
    path.push("index.db");
    path
}
