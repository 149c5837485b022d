//! SQLite store for vmshare state
//!
//! Backs both the session registry and the per-user snapshot quota rows.
//! Every multi-key mutation runs inside one transaction; readers never see
//! a half-applied update.

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Expose the underlying connection for subsystems that manage their own
    /// statements within the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Primary session records, one row per live instance
            CREATE TABLE IF NOT EXISTS sessions (
                instance_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                os_profile TEXT NOT NULL,
                image_path TEXT NOT NULL,
                qmp_socket TEXT NOT NULL,
                vnc_socket TEXT NOT NULL,
                pid INTEGER NOT NULL,
                bridge_port INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT NOT NULL
            );

            -- Secondary indices, kept in step with sessions inside one
            -- transaction per registry operation
            CREATE TABLE IF NOT EXISTS sessions_active (
                instance_id TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS sessions_by_user (
                user_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, instance_id)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_by_user_created
                ON sessions_by_user(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS sessions_by_os (
                os_profile TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                PRIMARY KEY (os_profile, instance_id)
            );

            CREATE TABLE IF NOT EXISTS sessions_by_pid (
                pid INTEGER PRIMARY KEY,
                instance_id TEXT NOT NULL
            );

            -- Per-user snapshot quota accounting
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                capacity_mb INTEGER NOT NULL,
                stored_mb INTEGER NOT NULL DEFAULT 0,
                CHECK (capacity_mb >= 0),
                CHECK (stored_mb >= 0),
                CHECK (stored_mb <= capacity_mb)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

/// A user's snapshot quota standing, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserQuota {
    pub capacity_mb: u64,
    pub stored_mb: u64,
}

/// Snapshot quota rows. The relational user store proper (credentials,
/// roles) is an external collaborator; only the two storage counters are
/// consumed here, and `0 <= stored <= capacity` is a post-condition of
/// every commit.
#[derive(Clone)]
pub struct UserStore {
    db: Database,
    default_capacity_mb: u64,
}

impl UserStore {
    pub fn new(db: Database, default_capacity_mb: u64) -> Self {
        Self {
            db,
            default_capacity_mb,
        }
    }

    /// Read a user's quota, creating the row with the default capacity on
    /// first sight.
    pub fn quota(&self, user_id: &str) -> Result<UserQuota> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id, capacity_mb, stored_mb) VALUES (?1, ?2, 0)",
            params![user_id, self.default_capacity_mb as i64],
        )?;
        let quota = conn.query_row(
            "SELECT capacity_mb, stored_mb FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(UserQuota {
                    capacity_mb: row.get::<_, i64>(0)? as u64,
                    stored_mb: row.get::<_, i64>(1)? as u64,
                })
            },
        )?;
        Ok(quota)
    }

    /// Commit `bill_mb` of new snapshot storage. Fails with `QuotaExceeded`
    /// and leaves the row untouched when the bound would be violated.
    pub fn add_stored(&self, user_id: &str, bill_mb: u64) -> Result<u64> {
        let mut conn = self.db.conn.lock();
        let tx = conn.transaction()?;

        let quota = read_quota(&tx, user_id)?.unwrap_or(UserQuota {
            capacity_mb: self.default_capacity_mb,
            stored_mb: 0,
        });
        if quota.stored_mb + bill_mb > quota.capacity_mb {
            return Err(Error::QuotaExceeded {
                requested_mb: bill_mb,
                stored_mb: quota.stored_mb,
                capacity_mb: quota.capacity_mb,
            });
        }

        let new_stored = quota.stored_mb + bill_mb;
        tx.execute(
            "INSERT INTO users (user_id, capacity_mb, stored_mb) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET stored_mb = ?3",
            params![user_id, quota.capacity_mb as i64, new_stored as i64],
        )?;
        tx.commit()?;
        Ok(new_stored)
    }

    /// Release `freed_mb` of snapshot storage, flooring at zero.
    pub fn release_stored(&self, user_id: &str, freed_mb: u64) -> Result<u64> {
        let mut conn = self.db.conn.lock();
        let tx = conn.transaction()?;

        let quota = read_quota(&tx, user_id)?.unwrap_or(UserQuota {
            capacity_mb: self.default_capacity_mb,
            stored_mb: 0,
        });
        let new_stored = quota.stored_mb.saturating_sub(freed_mb);
        tx.execute(
            "INSERT INTO users (user_id, capacity_mb, stored_mb) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET stored_mb = ?3",
            params![user_id, quota.capacity_mb as i64, new_stored as i64],
        )?;
        tx.commit()?;
        Ok(new_stored)
    }

    /// Adjust a user's capacity. Operator path, also used by tests.
    pub fn set_capacity(&self, user_id: &str, capacity_mb: u64) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO users (user_id, capacity_mb, stored_mb) VALUES (?1, ?2, 0)
             ON CONFLICT(user_id) DO UPDATE SET capacity_mb = ?2",
            params![user_id, capacity_mb as i64],
        )?;
        Ok(())
    }
}

fn read_quota(conn: &Connection, user_id: &str) -> Result<Option<UserQuota>> {
    let quota = conn
        .query_row(
            "SELECT capacity_mb, stored_mb FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(UserQuota {
                    capacity_mb: row.get::<_, i64>(0)? as u64,
                    stored_mb: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()?;
    Ok(quota)
}
