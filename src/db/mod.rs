//! Data store behind the membership pages.
//!
//! Profiles, chapters, announcements and direct messages all go through the
//! generic [`DataStore`] capability set. [`SqliteStore`] is the local
//! implementation, with change notifications delivered in-process.

pub mod models;

use chrono::{SecondsFormat, Utc};
use futures::stream::BoxStream;
use models::{ChangeEvent, Filter, Order, Row};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No row {id} in {table}")]
    NotFound { table: String, id: String },
}

pub trait DataStore: Send + Sync {
    fn query(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Insert `row`, generating an `id` when it has none.
    fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Merge `patch` into the stored row. The `id` column cannot be changed.
    fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, StoreError>;

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Store `bytes` and return the public URL they are served from.
    fn upload_blob(&self, bucket: &str, path: &str, bytes: &[u8]) -> Result<String, StoreError>;

    /// Changes to `table` that match `filter`, from now on.
    fn subscribe(&self, table: &str, filter: Filter) -> BoxStream<'static, ChangeEvent>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    public_url: String,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path, public_url: impl Into<String>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(path)?, public_url.into())
    }

    pub fn in_memory(public_url: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, public_url.into())
    }

    fn with_connection(conn: Connection, public_url: String) -> Result<Self, StoreError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            public_url,
            changes,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (tbl, id)
            );

            CREATE TABLE IF NOT EXISTS blobs (
                bucket TEXT NOT NULL,
                path TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (bucket, path)
            );
            ",
        )?;
        Ok(())
    }

    /// Bytes previously stored with [`DataStore::upload_blob`].
    pub fn blob(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let data = conn
            .query_row(
                "SELECT data FROM blobs WHERE bucket = ?1 AND path = ?2",
                params![bucket, normalize_path(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    fn get(conn: &Connection, table: &str, id: &str) -> Result<Row, StoreError> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE tbl = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            }),
        }
    }

    fn notify(&self, event: ChangeEvent) {
        // No subscribers is not an error
        let receivers = self.changes.send(event).unwrap_or(0);
        debug!(receivers, "Change published");
    }
}

impl DataStore for SqliteStore {
    fn query(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM records WHERE tbl = ?1 ORDER BY rowid")?;
        let mut rows = Vec::new();
        for data in stmt.query_map(params![table], |row| row.get::<_, String>(0))? {
            let row: Row = serde_json::from_str(&data?)?;
            if filter.matches(&row) {
                rows.push(row);
            }
        }
        if let Some(order) = order {
            rows.sort_by(|a, b| order.compare(a, b));
        }
        Ok(rows)
    }

    fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        let id = match row.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        row.insert("id".into(), Value::String(id.clone()));
        row.entry("created_at").or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        });

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO records (tbl, id, data) VALUES (?1, ?2, ?3)",
                params![table, id, serde_json::to_string(&row)?],
            )?;
        }

        self.notify(ChangeEvent::Insert {
            table: table.to_string(),
            new: row.clone(),
        });
        Ok(row)
    }

    fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, StoreError> {
        let (old, new) = {
            let conn = self.conn.lock();
            let old = Self::get(&conn, table, id)?;
            let mut new = old.clone();
            for (column, value) in patch {
                if column == "id" {
                    warn!(table, id, "Ignoring attempt to change a row id");
                    continue;
                }
                new.insert(column, value);
            }
            conn.execute(
                "UPDATE records SET data = ?1 WHERE tbl = ?2 AND id = ?3",
                params![serde_json::to_string(&new)?, table, id],
            )?;
            (old, new)
        };

        self.notify(ChangeEvent::Update {
            table: table.to_string(),
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let old = {
            let conn = self.conn.lock();
            let old = Self::get(&conn, table, id)?;
            conn.execute(
                "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                params![table, id],
            )?;
            old
        };

        self.notify(ChangeEvent::Delete {
            table: table.to_string(),
            old,
        });
        Ok(())
    }

    fn upload_blob(&self, bucket: &str, path: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let path = normalize_path(path);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (bucket, path, data) VALUES (?1, ?2, ?3)",
            params![bucket, path, bytes],
        )?;
        debug!(bucket, path, bytes = bytes.len(), "Blob stored");
        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.public_url.trim_end_matches('/'),
            bucket,
            path
        ))
    }

    fn subscribe(&self, table: &str, filter: Filter) -> BoxStream<'static, ChangeEvent> {
        let mut rx = self.changes.subscribe();
        let table = table.to_string();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.matches(&table, &filter) {
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(table = %table, missed, "Subscriber fell behind, changes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}
