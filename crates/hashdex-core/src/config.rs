//! Indexer configuration: defaults, optional JSON file, environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::IndexResult;

pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 20 * 1024 * 1024;

const DEFAULT_DATA_DIR: &str = ".hashdex";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Directory holding the project's persistent tables.
    pub data_dir: PathBuf,
    /// Directory of shared chunk archives (`*.zip`).
    pub shared_chunks_dir: Option<PathBuf>,
    pub shared_indexes_enabled: bool,
    /// Files above this size only get content-independent indexing.
    pub max_file_size_bytes: u64,
    pub workers: usize,
    pub exclude_patterns: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            shared_chunks_dir: None,
            shared_indexes_enabled: true,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            workers: default_workers(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl IndexerConfig {
    /// Defaults overridden by `HASHDEX_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON config file, then apply environment overrides on top.
    pub fn from_file(path: &Path) -> IndexResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(enabled) = env_flag("HASHDEX_SHARED_INDEXES") {
            self.shared_indexes_enabled = enabled;
        }
        if let Some(dir) = env_path("HASHDEX_SHARED_CHUNKS_DIR") {
            self.shared_chunks_dir = Some(dir);
        }
        if let Some(dir) = env_path("HASHDEX_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(size) = env_number("HASHDEX_MAX_FILE_SIZE") {
            self.max_file_size_bytes = size;
        }
        if let Some(workers) = env_number("HASHDEX_WORKERS") {
            self.workers = (workers as usize).max(1);
        }
    }

    /// Shared-chunk reuse needs both the toggle and a place to find chunks.
    pub fn shared_chunks_active(&self) -> bool {
        self.shared_indexes_enabled && self.shared_chunks_dir.is_some()
    }

    pub fn is_too_large(&self, size: u64) -> bool {
        size > self.max_file_size_bytes
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Parse a boolean toggle; `0|false|no|off` disable, anything else enables.
fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let v = val.trim().to_lowercase();
    Some(!matches!(v.as_str(), "0" | "false" | "no" | "off"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    let val = std::env::var(name).ok()?;
    let trimmed = val.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
