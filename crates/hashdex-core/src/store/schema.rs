//! SQLite schema DDL and migration framework.
//!
//! Three kinds of table files exist: the project database (file ids, chunk
//! ids), Content Hash Stores, and one storage file per index kind. All DDL
//! uses `CREATE … IF NOT EXISTS` so it is safe to replay.

use rusqlite::Connection;

use crate::errors::IndexResult;

/// Current project schema version. Migrations run from whatever the DB
/// currently reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Project database: metadata, migration history, file identities.
pub const PROJECT_SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS file_ids (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE
    );",
];

/// Content Hash Store: digest -> dense id. AUTOINCREMENT starts at 1, which
/// keeps 0 free for the null hash id.
pub const HASH_STORE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS content_hashes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        digest BLOB NOT NULL UNIQUE
    );",
];

/// Storage of one index kind. `input_id` is a file id for project indexes
/// and a hash id for chunk-local indexes.
pub const INDEX_STORAGE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stamps (
        input_id INTEGER PRIMARY KEY,
        fingerprint INTEGER NOT NULL,
        kind_version INTEGER NOT NULL,
        chunk_id INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS forward_entries (
        input_id INTEGER NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY(input_id, key)
    );",
    "CREATE TABLE IF NOT EXISTS inverted_entries (
        key TEXT NOT NULL,
        input_id INTEGER NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY(key, input_id)
    );",
    "CREATE INDEX IF NOT EXISTS idx_inverted_input ON inverted_entries(input_id);",
];

/// Apply the base DDL of a table file.
pub fn apply_statements(conn: &Connection, statements: &[&str]) -> IndexResult<()> {
    for stmt in statements {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending project migrations up to [`SCHEMA_VERSION`]. Each step is
/// wrapped in a SAVEPOINT so a failure rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> IndexResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT hashdex_migrate_step;")?;

        let step_result = (|| -> IndexResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT hashdex_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT hashdex_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT hashdex_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `meta`.
/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> IndexResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> IndexResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> IndexResult<()> {
    Ok(())
}

/// v1 -> v2: persistent chunk ids for the shared chunk catalog.
fn migrate_to_v2(conn: &Connection) -> IndexResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chunk_ids (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );",
    )?;
    Ok(())
}
