//! Content Hash Store: persistent digest -> dense hash id enumerator.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::IndexResult;
use crate::models::{ContentHash, HashId};
use crate::store::database::{open_connection, to_u32};
use crate::store::schema;

/// Deduplicates identical content across a corpus.
///
/// `enumerate` is serialized on the connection lock, so concurrent indexing
/// workers always agree on the id of a digest.
pub struct ContentHashStore {
    conn: Mutex<Connection>,
}

impl ContentHashStore {
    pub fn open(path: &Path) -> IndexResult<Self> {
        let conn = open_connection(path)?;
        schema::apply_statements(&conn, schema::HASH_STORE_STATEMENTS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_statements(&conn, schema::HASH_STORE_STATEMENTS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Id of `hash`, assigning the next dense id on first sight. Never
    /// returns the null hash id; a table fault surfaces as an error.
    pub fn enumerate(&self, hash: &ContentHash) -> IndexResult<HashId> {
        let conn = self.conn.lock();
        if let Some(id) = lookup_locked(&conn, hash)? {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO content_hashes(digest) VALUES (?1);",
            params![&hash.0[..]],
        )?;
        to_u32(conn.last_insert_rowid()).map(HashId)
    }

    /// Read-only lookup; `None` when the digest was never enumerated.
    pub fn lookup(&self, hash: &ContentHash) -> IndexResult<Option<HashId>> {
        let conn = self.conn.lock();
        lookup_locked(&conn, hash)
    }

    pub fn len(&self) -> IndexResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM content_hashes;", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn lookup_locked(conn: &Connection, hash: &ContentHash) -> IndexResult<Option<HashId>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM content_hashes WHERE digest = ?1;",
            params![&hash.0[..]],
            |row| row.get(0),
        )
        .optional()?;
    id.map(|v| to_u32(v).map(HashId)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_enumerate_is_idempotent() {
        let store = ContentHashStore::open_in_memory().unwrap();
        let a = ContentHash::of(b"alpha");
        let b = ContentHash::of(b"beta");
        let id_a = store.enumerate(&a).unwrap();
        let id_b = store.enumerate(&b).unwrap();
        assert_ne!(id_a, id_b);
        assert!(!id_a.is_null());
        assert_eq!(store.enumerate(&a).unwrap(), id_a);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_ids_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.db");
        let hash = ContentHash::of(b"same bytes");
        let first = ContentHashStore::open(&path).unwrap().enumerate(&hash).unwrap();
        let reopened = ContentHashStore::open(&path).unwrap();
        assert_eq!(reopened.lookup(&hash).unwrap(), Some(first));
        assert_eq!(reopened.enumerate(&hash).unwrap(), first);
    }

    #[test]
    fn test_lookup_does_not_insert() {
        let store = ContentHashStore::open_in_memory().unwrap();
        assert_eq!(store.lookup(&ContentHash::of(b"x")).unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_enumerate_agrees() {
        let store = Arc::new(ContentHashStore::open_in_memory().unwrap());
        let hash = ContentHash::of(b"shared");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.enumerate(&hash).unwrap())
            })
            .collect();
        let ids: Vec<HashId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len().unwrap(), 1);
    }
}
