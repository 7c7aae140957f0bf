//! SQLite-backed local store.
//!
//! Persists documents in a single table keyed by primary key, with
//! secondary indexes on the sync envelope so unsynced records can be
//! scanned without loading the whole store.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use synceddb_common::{
    document_action, document_key, document_state, set_document_key, Document, Error, RecordKey,
    Result,
};

use crate::store::{BatchOp, IndexValue, LocalStore, StoreConfig, StoreIndex};

/// Local store on top of an SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    config: StoreConfig,
}

fn sqlite_err(err: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite error: {}", err))
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl SqliteStore {
    /// Create or open a store table in the given database file.
    ///
    /// # Errors
    /// - Invalid table name (only ASCII letters, digits and `_`)
    /// - Database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>, table: &str, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sqlite_err)?;
        Self::from_connection(conn, table, config)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(table: &str, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::from_connection(conn, table, config)
    }

    fn from_connection(conn: Connection, table: &str, config: StoreConfig) -> Result<Self> {
        if !valid_table_name(table) {
            return Err(Error::InvalidInput(format!(
                "Invalid table name: {}",
                table
            )));
        }

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                sync_state TEXT,
                sync_action TEXT,
                doc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_sync_state ON {table}(sync_state);
            CREATE INDEX IF NOT EXISTS idx_{table}_sync_action ON {table}(sync_action);

            CREATE TABLE IF NOT EXISTS synceddb_sequences (
                name TEXT PRIMARY KEY,
                next_key INTEGER NOT NULL
            );
            "#
        ))
        .map_err(sqlite_err)?;

        info!("SQLite store '{}' opened", table);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            config,
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str, &StoreConfig) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = self.table.clone();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&mut guard, &table, &config)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

/// Pick the key of a document, drawing from the table sequence if allowed.
fn resolve_key(
    tx: &Transaction<'_>,
    table: &str,
    config: &StoreConfig,
    doc: &mut Document,
) -> Result<RecordKey> {
    if let Some(key) = document_key(doc, &config.key_name) {
        return Ok(key);
    }
    if !config.auto_increment {
        return Err(Error::MissingKey(config.key_name.clone()));
    }

    let mut next: i64 = tx
        .query_row(
            "SELECT next_key FROM synceddb_sequences WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite_err)?
        .unwrap_or(1);

    let key = loop {
        let candidate = RecordKey::new(next.to_string())?;
        next += 1;
        if !key_exists(tx, table, &candidate)? {
            break candidate;
        }
    };

    tx.execute(
        "INSERT OR REPLACE INTO synceddb_sequences (name, next_key) VALUES (?1, ?2)",
        params![table, next],
    )
    .map_err(sqlite_err)?;

    set_document_key(doc, &config.key_name, &key);
    Ok(key)
}

fn key_exists(tx: &Transaction<'_>, table: &str, key: &RecordKey) -> Result<bool> {
    tx.query_row(
        &format!("SELECT 1 FROM {} WHERE key = ?1", table),
        params![key.as_str()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(sqlite_err)
}

fn write_doc(tx: &Transaction<'_>, table: &str, key: &RecordKey, doc: &Document) -> Result<()> {
    let json = serde_json::to_string(doc)?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (key, sync_state, sync_action, doc) VALUES (?1, ?2, ?3, ?4)",
            table
        ),
        params![
            key.as_str(),
            document_state(doc).map(|s| s.as_str()),
            document_action(doc).map(|a| a.as_str()),
            json
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

fn parse_doc(json: String) -> Result<Document> {
    serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))
}

fn query_docs(conn: &Connection, sql: &str, param: Option<&str>) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(sql).map_err(sqlite_err)?;
    let rows = match param {
        Some(value) => stmt
            .query_map(params![value], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?
            .collect::<std::result::Result<Vec<_>, _>>(),
        None => stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?
            .collect::<std::result::Result<Vec<_>, _>>(),
    }
    .map_err(sqlite_err)?;

    rows.into_iter().map(parse_doc).collect()
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn key_name(&self) -> &str {
        &self.config.key_name
    }

    fn auto_increment(&self) -> bool {
        self.config.auto_increment
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Document>> {
        let key = key.clone();
        self.with_conn(move |conn, table, _| {
            let json: Option<String> = conn
                .query_row(
                    &format!("SELECT doc FROM {} WHERE key = ?1", table),
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            json.map(parse_doc).transpose()
        })
        .await
    }

    async fn put(&self, mut doc: Document) -> Result<RecordKey> {
        self.with_conn(move |conn, table, config| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let key = resolve_key(&tx, table, config, &mut doc)?;
            write_doc(&tx, table, &key, &doc)?;
            tx.commit().map_err(sqlite_err)?;
            debug!("Put {} into {}", key, table);
            Ok(key)
        })
        .await
    }

    async fn add(&self, mut doc: Document) -> Result<RecordKey> {
        self.with_conn(move |conn, table, config| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let key = resolve_key(&tx, table, config, &mut doc)?;
            if key_exists(&tx, table, &key)? {
                return Err(Error::AlreadyExists(format!("Key already exists: {}", key)));
            }
            write_doc(&tx, table, &key, &doc)?;
            tx.commit().map_err(sqlite_err)?;
            debug!("Added {} to {}", key, table);
            Ok(key)
        })
        .await
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn, table, _| {
            conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", table),
                params![key.as_str()],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Document>> {
        self.with_conn(|conn, table, _| {
            query_docs(conn, &format!("SELECT doc FROM {} ORDER BY key", table), None)
        })
        .await
    }

    async fn list_by_index(&self, value: IndexValue) -> Result<Vec<Document>> {
        self.with_conn(move |conn, table, _| {
            let column = match value.index() {
                StoreIndex::SyncState => "sync_state",
                StoreIndex::SyncAction => "sync_action",
            };
            query_docs(
                conn,
                &format!(
                    "SELECT doc FROM {} WHERE {} = ?1 ORDER BY key",
                    table, column
                ),
                Some(value.as_str()),
            )
        })
        .await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.with_conn(move |conn, table, config| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let count = ops.len();

            for op in ops {
                match op {
                    BatchOp::Put(doc) => {
                        let key = document_key(&doc, &config.key_name)
                            .ok_or_else(|| Error::MissingKey(config.key_name.clone()))?;
                        write_doc(&tx, table, &key, &doc)?;
                    }
                    BatchOp::Delete(key) => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE key = ?1", table),
                            params![key.as_str()],
                        )
                        .map_err(sqlite_err)?;
                    }
                }
            }

            // Dropping the transaction on an early return rolls it back.
            tx.commit().map_err(sqlite_err)?;
            debug!("Committed batch of {} operations on {}", count, table);
            Ok(())
        })
        .await
    }
}
