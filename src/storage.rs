//! Durable client-side storage.
//!
//! Keyed JSON records in a local SQLite database (WAL mode), mirroring the
//! browser app's localStorage contract: the cart, the table selection, and
//! the order/tip snapshot used for receipt recovery. A corrupt record is
//! wiped and reported as absent, never surfaced as an error. A second,
//! session-scoped area lives in process memory and dies with the client
//! (the pending-payment order-id marker).

use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Record keys the engine depends on.
pub mod keys {
    /// Persisted cart lines (JSON array).
    pub const CART: &str = "cart";
    /// Table id + display number from the QR-scan flow.
    pub const TABLE_SELECTION: &str = "table_selection";
    /// Full order/tip snapshot for receipt recovery.
    pub const ORDER_SNAPSHOT: &str = "order_snapshot";
    /// Per-install client session id.
    pub const CLIENT_SESSION_ID: &str = "client_session_id";
    /// Session-scoped: order id of a payment that left for external checkout.
    pub const PENDING_PAYMENT_ORDER_ID: &str = "pending_payment_order_id";
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Durable + session storage for one client instance.
pub struct Storage {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
    session: Mutex<HashMap<String, String>>,
}

impl Storage {
    /// Initialize storage at `{data_dir}/tableside.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn init(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("create data dir: {e}")))?;

        let db_path = data_dir.join("tableside.db");
        info!("Opening storage at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!("Storage open failed ({first_err}), deleting and retrying once");
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    // Also remove WAL/SHM files if present
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)
                    .map_err(|e| Error::Storage(format!("open failed after retry: {e}")))?
            }
        };

        run_migrations(&conn)?;

        info!("Storage initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            session: Mutex::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Durable records
    // -----------------------------------------------------------------------

    /// Read a JSON record. A missing key returns `None`; a record that no
    /// longer parses as JSON is wiped and also returns `None`.
    pub fn get_record(&self, key: &str) -> Option<Value> {
        let raw = {
            let conn = match self.conn.lock() {
                Ok(c) => c,
                Err(e) => {
                    warn!(key, "storage lock poisoned: {e}");
                    return None;
                }
            };
            conn.query_row(
                "SELECT value FROM client_records WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .ok()
        };

        let raw = raw?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, "corrupt storage record, wiping: {e}");
                let _ = self.remove_record(key);
                None
            }
        }
    }

    /// Write a JSON record, replacing any previous value.
    pub fn set_record(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO client_records (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value.to_string()],
        )
        .map_err(|e| Error::Storage(format!("write record {key}: {e}")))?;
        Ok(())
    }

    /// Delete a record. Silently succeeds when the key does not exist.
    pub fn remove_record(&self, key: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute("DELETE FROM client_records WHERE key = ?1", params![key])
            .map_err(|e| Error::Storage(format!("remove record {key}: {e}")))?;
        Ok(())
    }

    /// Typed convenience: read and deserialize a record, treating a shape
    /// mismatch the same as corruption (wipe + `None`).
    pub fn get_typed<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_record(key)?;
        match serde_json::from_value::<T>(value) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(key, "storage record shape mismatch, wiping: {e}");
                let _ = self.remove_record(key);
                None
            }
        }
    }

    /// Typed convenience: serialize and write a record.
    pub fn set_typed<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::Storage(format!("serialize: {e}")))?;
        self.set_record(key, &value)
    }

    // -----------------------------------------------------------------------
    // Session-scoped records
    // -----------------------------------------------------------------------

    /// Read a session-scoped value (process lifetime only).
    pub fn session_get(&self, key: &str) -> Option<String> {
        self.session.lock().ok()?.get(key).cloned()
    }

    /// Write a session-scoped value.
    pub fn session_set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.session.lock() {
            map.insert(key.to_string(), value.to_string());
        }
    }

    /// Remove a session-scoped value.
    pub fn session_remove(&self, key: &str) {
        if let Ok(mut map) = self.session.lock() {
            map.remove(key);
        }
    }

    // -----------------------------------------------------------------------
    // Client session id
    // -----------------------------------------------------------------------

    /// Stable per-install session id, generated on first use.
    pub fn client_session_id(&self) -> String {
        if let Some(Value::String(id)) = self.get_record(keys::CLIENT_SESSION_ID) {
            if !id.trim().is_empty() {
                return id;
            }
        }
        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.set_record(keys::CLIENT_SESSION_ID, &Value::String(id.clone())) {
            warn!("failed to persist client session id: {e}");
        }
        id
    }
}

// ---------------------------------------------------------------------------
// Open + migrations
// ---------------------------------------------------------------------------

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> std::result::Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| Error::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating storage from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| Error::Storage(format!("record migration v{version}: {e}")))?;
    Ok(())
}

/// v1: keyed JSON records.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS client_records (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::Storage(format!("migrate v1: {e}")))?;
    record_migration(conn, 1)
}

/// v2: track record update time for diagnostics.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE client_records ADD COLUMN updated_at TEXT;")
        .map_err(|e| Error::Storage(format!("migrate v2: {e}")))?;
    record_migration(conn, 2)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::init(dir.path()).expect("init storage");
        (dir, storage)
    }

    #[test]
    fn test_record_roundtrip_and_remove() {
        let (_dir, storage) = test_storage();
        storage
            .set_record(keys::CART, &json!([{"menuItemId": "m-1"}]))
            .unwrap();
        let read = storage.get_record(keys::CART).unwrap();
        assert_eq!(read[0]["menuItemId"], "m-1");

        storage.remove_record(keys::CART).unwrap();
        assert!(storage.get_record(keys::CART).is_none());
        // Removing again is fine
        storage.remove_record(keys::CART).unwrap();
    }

    #[test]
    fn test_corrupt_record_is_wiped() {
        let (_dir, storage) = test_storage();
        {
            let conn = storage.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO client_records (key, value) VALUES (?1, ?2)",
                params![keys::CART, "{not json"],
            )
            .unwrap();
        }
        assert!(storage.get_record(keys::CART).is_none());
        // The corrupt row is gone, not just skipped
        let conn = storage.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM client_records WHERE key = ?1",
                params![keys::CART],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_corrupt_db_file_is_reset_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tableside.db");
        fs::write(&db_path, b"definitely not a sqlite file").unwrap();

        let storage = Storage::init(dir.path()).expect("init should self-heal");
        storage
            .set_record(keys::TABLE_SELECTION, &json!({"tableId": "t-1"}))
            .unwrap();
        assert!(storage.get_record(keys::TABLE_SELECTION).is_some());
    }

    #[test]
    fn test_session_scope_is_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::init(dir.path()).unwrap();
            storage.session_set(keys::PENDING_PAYMENT_ORDER_ID, "ord-9");
            assert_eq!(
                storage.session_get(keys::PENDING_PAYMENT_ORDER_ID).as_deref(),
                Some("ord-9")
            );
        }
        // A fresh instance over the same files sees no session records.
        let storage = Storage::init(dir.path()).unwrap();
        assert!(storage.session_get(keys::PENDING_PAYMENT_ORDER_ID).is_none());
    }

    #[test]
    fn test_client_session_id_is_stable() {
        let (_dir, storage) = test_storage();
        let first = storage.client_session_id();
        let second = storage.client_session_id();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
