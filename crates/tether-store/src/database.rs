use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the SQLite store. rusqlite connections are not Sync,
/// so access goes through a parking_lot::Mutex; clones share the same
/// underlying connection.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database file, applying pragmas and migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        let db = Self::bootstrap(conn, path.to_owned())?;
        info!(path = %path.display(), "store ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, PathBuf::from(":memory:"))
    }

    fn bootstrap(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        // Stamp a fresh database; refuse one written by a newer build.
        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();
        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [schema::SCHEMA_VERSION],
                )?;
            }
            Some(found) if found > schema::SCHEMA_VERSION => {
                return Err(StoreError::Database(format!(
                    "schema version {found} is newer than supported {}",
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run a closure against the locked connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tether-store-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn in_memory_uses_sentinel_path() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn schema_version_written_once() {
        let dir = temp_dir();
        let path = dir.join("store.db");

        let db = Database::open(&path).unwrap();
        drop(db);
        let db = Database::open(&path).unwrap();

        let (version, rows): (u32, u32) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT version, (SELECT COUNT(*) FROM schema_version) FROM schema_version",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
        assert_eq!(rows, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_database_from_newer_build() {
        let dir = temp_dir();
        let path = dir.join("store.db");

        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE schema_version SET version = 999", [])?;
            Ok(())
        })
        .unwrap();
        drop(db);

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn expected_tables_exist() {
        let db = Database::in_memory().unwrap();
        let count: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                     ('devices', 'conversations', 'messages', 'sync_state', 'boundaries', 'sessions')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn file_database_runs_in_wal_mode() {
        let dir = temp_dir();
        let db = Database::open(&dir.join("store.db")).unwrap();

        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clones_share_the_connection() {
        let db = Database::in_memory().unwrap();
        let other = db.clone();

        db.with_conn(|conn| {
            conn.execute("CREATE TABLE scratch (n INTEGER)", [])?;
            conn.execute("INSERT INTO scratch (n) VALUES (7)", [])?;
            Ok(())
        })
        .unwrap();

        let n: i64 = other
            .with_conn(|conn| Ok(conn.query_row("SELECT n FROM scratch", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(n, 7);
    }
}
