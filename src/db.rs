//! Local SQLite database layer for the sync engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! connection handle that the mutation log, version cursors and checkpoint
//! all go through.

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// Shared database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// How long a connection waits on another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the database at `path`.
///
/// Creates the parent directory if needed, sets pragmas and runs pending
/// migrations. A file SQLite reports as corrupt or not a database is moved
/// aside to `<name>.corrupt-<timestamp>` and a fresh database is created in
/// its place. Every other failure (a busy lock included) is returned and the
/// file is left untouched.
pub fn init(path: &Path) -> Result<DbState> {
    init_with_busy_timeout(path, BUSY_TIMEOUT)
}

fn init_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<DbState> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!("failed to create data dir {}: {e}", parent.display()))
            })?;
        }
    }

    info!("Opening sync database at {}", path.display());

    let conn = match open_and_migrate(path, busy_timeout) {
        Ok(c) => c,
        Err(SyncError::Storage(e)) if is_corruption(&e) => {
            let moved_to = quarantine(path)?;
            error!(
                "Sync database is corrupt ({e}); moved to {} and starting fresh",
                moved_to.display()
            );
            open_and_migrate(path, busy_timeout)?
        }
        Err(e) => return Err(e),
    };

    info!("Sync database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: path.to_path_buf(),
    })
}

fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the database and its WAL/SHM companions out of the way. Returns
/// the new path of the main file.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    let moved_to = sidecar(path, &format!(".{suffix}"));
    fs::rename(path, &moved_to).map_err(|e| {
        SyncError::Config(format!("failed to move corrupt database {}: {e}", path.display()))
    })?;
    for ext in ["-wal", "-shm"] {
        let companion = sidecar(path, ext);
        if companion.exists() {
            if let Err(e) = fs::rename(&companion, sidecar(&moved_to, ext)) {
                warn!("Failed to move {}: {e}", companion.display());
            }
        }
    }
    Ok(moved_to)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_migrate(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // Before any pragma that needs a lock.
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

impl DbState {
    /// Run `f` inside one IMMEDIATE transaction. Commits on `Ok`, rolls back
    /// on `Err`. The lock is released before returning, so `f` must not
    /// await anything.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only closure against the connection.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock()?;
        f(&conn)
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Sync database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating sync database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: outbox, version cursors, checkpoint.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mutation_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
            payload TEXT,
            local_version INTEGER NOT NULL,
            base_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_flight', 'settled', 'failed', 'conflicted')),
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error TEXT,
            next_retry_at TEXT,
            settled_at TEXT,
            UNIQUE(entity_type, entity_id, local_version)
        );
        CREATE INDEX IF NOT EXISTS idx_mutation_log_status
            ON mutation_log(status, id);
        CREATE INDEX IF NOT EXISTS idx_mutation_log_entity
            ON mutation_log(entity_type, entity_id, status);

        CREATE TABLE IF NOT EXISTS entity_versions (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_version INTEGER NOT NULL DEFAULT 0,
            remote_version INTEGER NOT NULL DEFAULT 0,
            remote_snapshot TEXT,
            remote_deleted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS sync_checkpoint (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_full_sync_at TEXT,
            last_seen_cursor TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::from(e)
    })?;

    info!("Applied migration v1 (mutation_log, entity_versions, sync_checkpoint)");
    Ok(())
}

/// Migration v2: conflict audit trail and deferred remote changes.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conflict_records (
            id TEXT PRIMARY KEY,
            mutation_id INTEGER NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_operation TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            local_base_version INTEGER NOT NULL,
            local_payload TEXT,
            remote_operation TEXT NOT NULL,
            remote_version INTEGER NOT NULL,
            remote_base_version INTEGER NOT NULL,
            remote_payload TEXT,
            resolution TEXT NOT NULL,
            resolved_payload TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflict_records_entity
            ON conflict_records(entity_type, entity_id, created_at);

        -- conflict_records is an audit table: rows are never rewritten
        CREATE TRIGGER IF NOT EXISTS conflict_records_no_update
            BEFORE UPDATE ON conflict_records
            BEGIN SELECT RAISE(ABORT, 'conflict_records is append-only'); END;

        CREATE TABLE IF NOT EXISTS deferred_changes (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            version INTEGER NOT NULL,
            base_version INTEGER NOT NULL,
            payload TEXT,
            received_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::from(e)
    })?;

    info!("Applied migration v2 (conflict_records, deferred_changes)");
    Ok(())
}

/// Migration v3: coalescing link and the default local entity sink.
fn migrate_v3(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "mutation_log", "coalesced_into")? {
        conn.execute(
            "ALTER TABLE mutation_log ADD COLUMN coalesced_into INTEGER",
            [],
        )?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_mutation_log_coalesced
            ON mutation_log(coalesced_into);

        CREATE TABLE IF NOT EXISTS synced_entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            remote_version INTEGER NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (entity_type, entity_id)
        );

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        SyncError::from(e)
    })?;

    info!("Applied migration v3 (coalesced_into, synced_entities)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

// ===========================================================================
// Tests
// ===========================================================================
