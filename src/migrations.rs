//! # Schema bootstrap
//!
//! Diesel's `table!` macro models the relational shape for query building,
//! but it does not issue DDL and cannot express an FTS5 virtual table or
//! triggers. This module is the other half: [`run`] creates every base table
//! idempotently (`CREATE TABLE IF NOT EXISTS`) and wires up the `chunks_fts`
//! full-text mirror and its sync triggers, called once from
//! [`crate::store::Store::init`].

use diesel::connection::Connection as _;
use diesel::{RunQueryDsl, SqliteConnection};

use crate::error::{Result, StoreError};

const CREATE_COLLECTIONS: &str = "
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    dimensions INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    metadata TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);";

const CREATE_DOCUMENTS: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT,
    source_url TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    author TEXT,
    metadata TEXT,
    acl TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);";

const CREATE_EMBEDDINGS: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    collection_id INTEGER NOT NULL DEFAULT 1 REFERENCES collections(id),
    vector BLOB NOT NULL,
    content TEXT NOT NULL,
    doc_id TEXT REFERENCES documents(id) ON DELETE CASCADE,
    metadata TEXT,
    acl TEXT,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS embeddings_collection_id_idx ON embeddings(collection_id);
CREATE INDEX IF NOT EXISTS embeddings_doc_id_idx ON embeddings(doc_id);";

const CREATE_INDEX_SNAPSHOTS: &str = "
CREATE TABLE IF NOT EXISTS index_snapshots (
    kind TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    created_at TIMESTAMP NOT NULL
);";

const CREATE_CONVERSATIONS: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_name TEXT NOT NULL
);";

const CREATE_MESSAGES: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    dynamic BOOLEAN NOT NULL DEFAULT 0,
    conversation_id INTEGER REFERENCES conversations(id)
);";

/// `content_rowid=embeddings.rowid` keeps the FTS shadow keyed to the base
/// table's implicit rowid rather than its text `id`.
const CREATE_CHUNKS_FTS: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    content='embeddings',
    content_rowid='rowid'
);";

const CREATE_FTS_TRIGGERS: &str = "
CREATE TRIGGER IF NOT EXISTS embeddings_ai AFTER INSERT ON embeddings BEGIN
    INSERT INTO chunks_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS embeddings_ad AFTER DELETE ON embeddings BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS embeddings_au AFTER UPDATE ON embeddings BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    INSERT INTO chunks_fts(rowid, content) VALUES (new.rowid, new.content);
END;";

/// WAL journaling, NORMAL synchronous mode, a 5-second busy timeout, and a
/// 2 MB page cache.
///
/// `foreign_keys` and `busy_timeout` are connection-scoped pragmas in
/// SQLite, not database-scoped ones — every connection the pool hands out
/// needs them reapplied, not just the one [`run`] happens to be called on.
/// See [`crate::store::PragmaCustomizer`], which runs this same string via
/// `diesel::r2d2::CustomizeConnection::on_acquire` for every pooled
/// connection.
pub(crate) const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA cache_size = -2048;
PRAGMA foreign_keys = ON;";

/// Create every base table, and apply the store's pragma set. The
/// `chunks_fts` mirror and its sync triggers are created only when
/// `fts_enabled` is set — `config.fts.enabled` gates this at
/// [`crate::store::Store::init`] time, since a store with FTS disabled has
/// no use for the shadow table or the write-path cost of keeping it synced.
///
/// Called once per connection during [`crate::store::Store::init`]. Safe to
/// call on an already-initialized file: every statement is idempotent.
pub fn run(conn: &mut SqliteConnection, fts_enabled: bool) -> Result<()> {
    // `sql_query(..).execute()` prepares and steps a single statement;
    // several of the strings below are `;`-separated batches (multiple
    // `CREATE INDEX`/`CREATE TRIGGER` statements, multiple pragmas), so
    // `batch_execute` (backed by `sqlite3_exec`, the same primitive behind
    // `rusqlite::Connection::execute_batch`) is the one that runs all of
    // them rather than silently dropping everything after the first `;`.
    conn.batch_execute(PRAGMAS)
        .map_err(|e| StoreError::internal("init", e))?;

    for stmt in [
        CREATE_COLLECTIONS,
        CREATE_DOCUMENTS,
        CREATE_EMBEDDINGS,
        CREATE_INDEX_SNAPSHOTS,
        CREATE_CONVERSATIONS,
        CREATE_MESSAGES,
    ] {
        conn.batch_execute(stmt)
            .map_err(|e| StoreError::internal("init", e))?;
    }

    if fts_enabled {
        for stmt in [CREATE_CHUNKS_FTS, CREATE_FTS_TRIGGERS] {
            conn.batch_execute(stmt)
                .map_err(|e| StoreError::internal("init", e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::Connection;

    fn memory_conn() -> SqliteConnection {
        SqliteConnection::establish(":memory:").unwrap()
    }

    #[test]
    fn run_is_idempotent() {
        let mut conn = memory_conn();
        run(&mut conn, true).unwrap();
        run(&mut conn, true).unwrap();
    }

    #[test]
    fn run_without_fts_skips_shadow_table() {
        let mut conn = memory_conn();
        run(&mut conn, false).unwrap();

        let err = diesel::sql_query("SELECT COUNT(*) FROM chunks_fts")
            .execute(&mut conn)
            .unwrap_err();
        assert!(matches!(err, diesel::result::Error::DatabaseError(..)));
    }

    #[test]
    fn fts_mirror_tracks_inserts() {
        let mut conn = memory_conn();
        run(&mut conn, true).unwrap();

        diesel::sql_query(
            "INSERT INTO collections (id, name, dimensions, created_at, updated_at)
             VALUES (1, 'default', 3, datetime('now'), datetime('now'))",
        )
        .execute(&mut conn)
        .unwrap();

        diesel::sql_query(
            "INSERT INTO embeddings (id, collection_id, vector, content, created_at)
             VALUES ('e1', 1, x'00000000', 'hello world', datetime('now'))",
        )
        .execute(&mut conn)
        .unwrap();

        #[derive(diesel::QueryableByName)]
        struct Count {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            n: i64,
        }

        let rows: Vec<Count> =
            diesel::sql_query("SELECT COUNT(*) as n FROM chunks_fts WHERE chunks_fts MATCH 'hello'")
                .load(&mut conn)
                .unwrap();
        assert_eq!(rows[0].n, 1);
    }
}
