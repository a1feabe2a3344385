//! Persistent key/value tables backing one index kind.
//!
//! Every index kind owns a forward table (`input -> key set`), an inverted
//! table (`key -> inputs`) and a stamp table. Inputs are file ids for project
//! indexes and hash ids for chunk-local indexes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::IndexResult;
use crate::models::{ChunkId, InputData, Stamp};
use crate::store::database::{open_connection, to_u32};
use crate::store::schema;

/// Incremental change of one input's key set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateDelta {
    pub removed: Vec<String>,
    pub upserted: Vec<(String, Vec<u8>)>,
}

impl UpdateDelta {
    /// Diff the stored forward entry against freshly computed data.
    pub fn between(old: &InputData, new: &InputData) -> Self {
        let removed = old
            .keys()
            .filter(|k| !new.contains_key(*k))
            .cloned()
            .collect();
        let upserted = new
            .iter()
            .filter(|(k, v)| old.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { removed, upserted }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.upserted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removed.len() + self.upserted.len()
    }
}

/// Point lookup / point update table contract used by `DerivedDataIndex`.
///
/// Implementations serialize their own writes; a `commit` is atomic.
pub trait IndexStorage: Send + Sync {
    fn read_forward(&self, input_id: u64) -> IndexResult<InputData>;

    fn read_stamp(&self, input_id: u64) -> IndexResult<Option<Stamp>>;

    /// Set (`Some`) or drop (`None`) the stamp of an input.
    fn write_stamp(&self, input_id: u64, stamp: Option<Stamp>) -> IndexResult<()>;

    /// Apply `delta` to both tables and set the stamp, all or nothing.
    fn commit(&self, input_id: u64, delta: &UpdateDelta, stamp: Option<Stamp>) -> IndexResult<()>;

    fn values_for_key(&self, key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>>;

    /// Every key present in the inverted table, sorted.
    fn keys(&self) -> IndexResult<Vec<String>>;

    /// Number of inputs with a non-empty forward entry.
    fn input_count(&self) -> IndexResult<usize>;

    fn clear(&self) -> IndexResult<()>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteIndexStorage {
    conn: Mutex<Connection>,
}

impl SqliteIndexStorage {
    pub fn open(path: &Path) -> IndexResult<Self> {
        let conn = open_connection(path)?;
        schema::apply_statements(&conn, schema::INDEX_STORAGE_STATEMENTS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_statements(&conn, schema::INDEX_STORAGE_STATEMENTS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn write_stamp_on(conn: &Connection, input_id: u64, stamp: Option<Stamp>) -> rusqlite::Result<()> {
    match stamp {
        Some(stamp) => {
            conn.execute(
                "INSERT INTO stamps(input_id, fingerprint, kind_version, chunk_id) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(input_id) DO UPDATE SET fingerprint = excluded.fingerprint, \
                 kind_version = excluded.kind_version, chunk_id = excluded.chunk_id;",
                params![
                    input_id as i64,
                    stamp.fingerprint as i64,
                    stamp.kind_version as i64,
                    stamp.chunk.map(|c| c.0 as i64)
                ],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM stamps WHERE input_id = ?1;",
                params![input_id as i64],
            )?;
        }
    }
    Ok(())
}

impl IndexStorage for SqliteIndexStorage {
    fn read_forward(&self, input_id: u64) -> IndexResult<InputData> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT key, value FROM forward_entries WHERE input_id = ?1;")?;
        let rows = stmt.query_map(params![input_id as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut data = InputData::new();
        for row in rows {
            let (key, value) = row?;
            data.insert(key, value);
        }
        Ok(data)
    }

    fn read_stamp(&self, input_id: u64) -> IndexResult<Option<Stamp>> {
        let conn = self.conn.lock();
        let row: Option<(i64, i64, Option<i64>)> = conn
            .query_row(
                "SELECT fingerprint, kind_version, chunk_id FROM stamps WHERE input_id = ?1;",
                params![input_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((fingerprint, kind_version, chunk)) => Ok(Some(Stamp {
                fingerprint: fingerprint as u64,
                kind_version: to_u32(kind_version)?,
                chunk: chunk.map(to_u32).transpose()?.map(ChunkId),
            })),
        }
    }

    fn write_stamp(&self, input_id: u64, stamp: Option<Stamp>) -> IndexResult<()> {
        let conn = self.conn.lock();
        write_stamp_on(&conn, input_id, stamp)?;
        Ok(())
    }

    fn commit(&self, input_id: u64, delta: &UpdateDelta, stamp: Option<Stamp>) -> IndexResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut del_fwd = tx.prepare_cached(
                "DELETE FROM forward_entries WHERE input_id = ?1 AND key = ?2;",
            )?;
            let mut del_inv =
                tx.prepare_cached("DELETE FROM inverted_entries WHERE key = ?1 AND input_id = ?2;")?;
            for key in &delta.removed {
                del_fwd.execute(params![input_id as i64, key])?;
                del_inv.execute(params![key, input_id as i64])?;
            }

            let mut put_fwd = tx.prepare_cached(
                "INSERT INTO forward_entries(input_id, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(input_id, key) DO UPDATE SET value = excluded.value;",
            )?;
            let mut put_inv = tx.prepare_cached(
                "INSERT INTO inverted_entries(key, input_id, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key, input_id) DO UPDATE SET value = excluded.value;",
            )?;
            for (key, value) in &delta.upserted {
                put_fwd.execute(params![input_id as i64, key, value])?;
                put_inv.execute(params![key, input_id as i64, value])?;
            }
        }
        write_stamp_on(&tx, input_id, stamp)?;
        tx.commit()?;
        Ok(())
    }

    fn values_for_key(&self, key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT input_id, value FROM inverted_entries WHERE key = ?1 ORDER BY input_id;",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    fn keys(&self) -> IndexResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT key FROM inverted_entries ORDER BY key;")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn input_count(&self) -> IndexResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT input_id) FROM forward_entries;",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn clear(&self) -> IndexResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM stamps; DELETE FROM forward_entries; DELETE FROM inverted_entries;",
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryTables {
    stamps: HashMap<u64, Stamp>,
    forward: HashMap<u64, InputData>,
    inverted: BTreeMap<String, BTreeMap<u64, Vec<u8>>>,
}

/// Non-persistent storage for scratch indexes and tests.
#[derive(Default)]
pub struct MemoryIndexStorage {
    tables: Mutex<MemoryTables>,
}

impl MemoryIndexStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStorage for MemoryIndexStorage {
    fn read_forward(&self, input_id: u64) -> IndexResult<InputData> {
        Ok(self
            .tables
            .lock()
            .forward
            .get(&input_id)
            .cloned()
            .unwrap_or_default())
    }

    fn read_stamp(&self, input_id: u64) -> IndexResult<Option<Stamp>> {
        Ok(self.tables.lock().stamps.get(&input_id).copied())
    }

    fn write_stamp(&self, input_id: u64, stamp: Option<Stamp>) -> IndexResult<()> {
        let mut tables = self.tables.lock();
        match stamp {
            Some(stamp) => {
                tables.stamps.insert(input_id, stamp);
            }
            None => {
                tables.stamps.remove(&input_id);
            }
        }
        Ok(())
    }

    fn commit(&self, input_id: u64, delta: &UpdateDelta, stamp: Option<Stamp>) -> IndexResult<()> {
        let mut tables = self.tables.lock();
        let tables = &mut *tables;
        let forward = tables.forward.entry(input_id).or_default();
        for key in &delta.removed {
            forward.remove(key);
            if let Some(inputs) = tables.inverted.get_mut(key) {
                inputs.remove(&input_id);
                if inputs.is_empty() {
                    tables.inverted.remove(key);
                }
            }
        }
        for (key, value) in &delta.upserted {
            forward.insert(key.clone(), value.clone());
            tables
                .inverted
                .entry(key.clone())
                .or_default()
                .insert(input_id, value.clone());
        }
        if forward.is_empty() {
            tables.forward.remove(&input_id);
        }
        match stamp {
            Some(stamp) => {
                tables.stamps.insert(input_id, stamp);
            }
            None => {
                tables.stamps.remove(&input_id);
            }
        }
        Ok(())
    }

    fn values_for_key(&self, key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>> {
        Ok(self
            .tables
            .lock()
            .inverted
            .get(key)
            .map(|inputs| inputs.iter().map(|(id, v)| (*id, v.clone())).collect())
            .unwrap_or_default())
    }

    fn keys(&self) -> IndexResult<Vec<String>> {
        Ok(self.tables.lock().inverted.keys().cloned().collect())
    }

    fn input_count(&self) -> IndexResult<usize> {
        Ok(self.tables.lock().forward.len())
    }

    fn clear(&self) -> IndexResult<()> {
        *self.tables.lock() = MemoryTables::default();
        Ok(())
    }
}
