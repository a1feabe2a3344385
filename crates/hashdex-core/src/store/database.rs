//! SQLite project database: file identities, chunk identities, metadata.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{IndexError, IndexResult};
use crate::models::{ChunkId, FileId};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if raw.len() > 2 {
                expanded.push(&raw[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

/// Open a table file, creating parent directories, in WAL mode.
pub fn open_connection(path: &Path) -> IndexResult<Connection> {
    let resolved = expand_tilde(path);
    if let Some(parent) = resolved.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(&resolved)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Project-level persistent tables.
///
/// Ids handed out here are append-only: a path keeps its id for the lifetime
/// of the database, and so does a chunk name.
pub struct Database {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &Path) -> IndexResult<Self> {
        let conn = open_connection(db_path)?;
        Self::init(Some(expand_tilde(db_path)), conn)
    }

    pub fn open_in_memory() -> IndexResult<Self> {
        Self::init(None, Connection::open_in_memory()?)
    }

    fn init(db_path: Option<PathBuf>, conn: Connection) -> IndexResult<Self> {
        schema::apply_statements(&conn, schema::PROJECT_SCHEMA_STATEMENTS)?;
        schema::migrate_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Id of `path`, assigning a fresh one on first observation.
    pub fn file_id_for_path(&self, path: &Path) -> IndexResult<FileId> {
        let key = path.to_string_lossy().replace('\\', "/");
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO file_ids(path) VALUES (?1);",
            params![key],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM file_ids WHERE path = ?1;",
            params![key],
            |row| row.get(0),
        )?;
        to_u32(id).map(FileId)
    }

    pub fn path_for_file_id(&self, id: FileId) -> IndexResult<Option<PathBuf>> {
        let conn = self.conn.lock();
        let path: Option<String> = conn
            .query_row(
                "SELECT path FROM file_ids WHERE id = ?1;",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    /// Id of the chunk called `name`, assigning a fresh one on first use.
    pub fn chunk_id_for_name(&self, name: &str) -> IndexResult<ChunkId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO chunk_ids(name) VALUES (?1);",
            params![name],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM chunk_ids WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )?;
        to_u32(id).map(ChunkId)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> IndexResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> IndexResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1;", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

pub(crate) fn to_u32(id: i64) -> IndexResult<u32> {
    u32::try_from(id).map_err(|_| IndexError::Storage(format!("id {id} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_ids_are_stable() {
        let db = Database::open_in_memory().unwrap();
        let a = db.file_id_for_path(Path::new("src/a.rs")).unwrap();
        let b = db.file_id_for_path(Path::new("src/b.rs")).unwrap();
        assert_ne!(a, b);
        assert_eq!(db.file_id_for_path(Path::new("src/a.rs")).unwrap(), a);
        assert_eq!(
            db.path_for_file_id(b).unwrap(),
            Some(PathBuf::from("src/b.rs"))
        );
    }

    #[test]
    fn test_chunk_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.db");
        let first = {
            let db = Database::open(&path).unwrap();
            db.chunk_id_for_name("jdk-17").unwrap()
        };
        let db = Database::open(&path).unwrap();
        assert_eq!(db.chunk_id_for_name("jdk-17").unwrap(), first);
        assert!(!first.is_null());
    }

    #[test]
    fn test_meta_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_meta("last_session").unwrap(), None);
        db.set_meta("last_session", "1").unwrap();
        db.set_meta("last_session", "2").unwrap();
        assert_eq!(db.get_meta("last_session").unwrap(), Some("2".to_string()));
    }
}
