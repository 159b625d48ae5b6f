use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

use crate::error::CacheStoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS followup_cache (
    user_id          TEXT    NOT NULL,
    cache_key        TEXT    NOT NULL,
    payload          BLOB    NOT NULL,
    expires_at       INTEGER NOT NULL,
    metadata_version INTEGER NOT NULL,
    PRIMARY KEY (user_id, cache_key)
);
CREATE INDEX IF NOT EXISTS followup_cache_expiry_idx ON followup_cache(expires_at);
"#;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) `followup.db` inside `db_dir`.
    pub fn new<P: AsRef<Path>>(db_dir: P) -> Result<Self, CacheStoreError> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;

        let conn = Connection::open(db_dir.join("followup.db"))?;
        Self::with_connection(conn)
    }

    /// Database that lives only as long as the process. Used in tests.
    pub fn in_memory() -> Result<Self, CacheStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheStoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}
