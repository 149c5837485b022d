//! Durable session registry
//!
//! One primary record per instance plus four secondary indices: the active
//! set, the per-user list ordered by creation time, the by-OS set, and the
//! pid reverse index. Every operation applies its multi-key effect inside
//! a single transaction, so readers always observe the record and its
//! indices in agreement.

use crate::procs::pid_alive;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use vmshare_common::types::{RecordPatch, SessionRecord};
use vmshare_common::{Database, Result};

/// How many of a user's newest entries `get_running_by_user` scans.
const USER_SCAN_NEWEST: usize = 6;

/// Registry handle; cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

/// A record is live while its pid answers signal 0 and both per-instance
/// sockets still exist; anything less is dead and due for reclaim.
pub fn record_is_live(record: &SessionRecord) -> bool {
    pid_alive(record.pid)
        && Path::new(&record.qmp_socket).exists()
        && Path::new(&record.vnc_socket).exists()
}

impl SessionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert or replace a record. Visible in all four indices before this
    /// returns.
    pub fn put(&self, record: &SessionRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // A replaced record may have moved user/os/pid; clear its old
        // index rows first.
        if let Some(old) = read_record(&tx, &record.instance_id)? {
            delete_index_rows(&tx, &old)?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO sessions
             (instance_id, user_id, os_profile, image_path, qmp_socket, vnc_socket,
              pid, bridge_port, created_at, last_seen, state, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.instance_id,
                record.user_id,
                record.os_profile.as_str(),
                record.image_path,
                record.qmp_socket,
                record.vnc_socket,
                record.pid,
                record.bridge_port,
                record.created_at,
                record.last_seen,
                record.state,
                record.started_at,
            ],
        )?;
        insert_index_rows(&tx, record)?;

        tx.commit()?;
        debug!("Registered session {}", record.instance_id);
        Ok(())
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        read_record(&conn, instance_id)
    }

    /// Apply a partial update. A pid change re-keys the pid index in the
    /// same transaction. Returns false when the record does not exist.
    pub fn update(&self, instance_id: &str, patch: &RecordPatch) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(current) = read_record(&tx, instance_id)? else {
            return Ok(false);
        };

        let new_pid = patch.pid.unwrap_or(current.pid);
        if new_pid != current.pid {
            tx.execute(
                "DELETE FROM sessions_by_pid WHERE pid = ?1",
                params![current.pid],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO sessions_by_pid (pid, instance_id) VALUES (?1, ?2)",
                params![new_pid, instance_id],
            )?;
        }

        tx.execute(
            "UPDATE sessions SET pid = ?2, last_seen = ?3, state = ?4, image_path = ?5
             WHERE instance_id = ?1",
            params![
                instance_id,
                new_pid,
                patch.last_seen.unwrap_or(current.last_seen),
                patch.state.as_deref().unwrap_or(&current.state),
                patch.image_path.as_deref().unwrap_or(&current.image_path),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Remove a record and all its index rows. Idempotent.
    pub fn delete(&self, instance_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(record) = read_record(&tx, instance_id)? else {
            info!("Delete of unknown session {} is a no-op", instance_id);
            return Ok(false);
        };

        delete_index_rows(&tx, &record)?;
        tx.execute(
            "DELETE FROM sessions WHERE instance_id = ?1",
            params![instance_id],
        )?;

        tx.commit()?;
        debug!("Deleted session {}", instance_id);
        Ok(true)
    }

    /// All active records.
    pub fn items(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.instance_id, s.user_id, s.os_profile, s.image_path, s.qmp_socket,
                    s.vnc_socket, s.pid, s.bridge_port, s.created_at, s.last_seen,
                    s.state, s.started_at
             FROM sessions_active a JOIN sessions s ON s.instance_id = a.instance_id
             ORDER BY s.created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reverse lookup through the pid index.
    pub fn get_by_pid(&self, pid: u32) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT instance_id FROM sessions_by_pid WHERE pid = ?1",
                params![pid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// A user's instance ids, newest first.
    pub fn user_instances(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT instance_id FROM sessions_by_user
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// First live instance among the user's newest entries.
    pub fn get_running_by_user(&self, user_id: &str) -> Result<Option<SessionRecord>> {
        for instance_id in self.user_instances(user_id, USER_SCAN_NEWEST)? {
            if let Some(record) = self.get(&instance_id)? {
                if record.state == "running" && record_is_live(&record) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }
}

fn read_record(conn: &Connection, instance_id: &str) -> Result<Option<SessionRecord>> {
    let record = conn
        .query_row(
            "SELECT instance_id, user_id, os_profile, image_path, qmp_socket, vnc_socket,
                    pid, bridge_port, created_at, last_seen, state, started_at
             FROM sessions WHERE instance_id = ?1",
            params![instance_id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let os: String = row.get(2)?;
    Ok(SessionRecord {
        instance_id: row.get(0)?,
        user_id: row.get(1)?,
        os_profile: os.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown os profile: {os}").into(),
            )
        })?,
        image_path: row.get(3)?,
        qmp_socket: row.get(4)?,
        vnc_socket: row.get(5)?,
        pid: row.get::<_, i64>(6)? as u32,
        bridge_port: row.get::<_, i64>(7)? as u16,
        created_at: row.get(8)?,
        last_seen: row.get(9)?,
        state: row.get(10)?,
        started_at: row.get(11)?,
    })
}

fn insert_index_rows(conn: &Connection, record: &SessionRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sessions_active (instance_id) VALUES (?1)",
        params![record.instance_id],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO sessions_by_user (user_id, instance_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![record.user_id, record.instance_id, record.created_at],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO sessions_by_os (os_profile, instance_id) VALUES (?1, ?2)",
        params![record.os_profile.as_str(), record.instance_id],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO sessions_by_pid (pid, instance_id) VALUES (?1, ?2)",
        params![record.pid, record.instance_id],
    )?;
    Ok(())
}

fn delete_index_rows(conn: &Connection, record: &SessionRecord) -> Result<()> {
    conn.execute(
        "DELETE FROM sessions_active WHERE instance_id = ?1",
        params![record.instance_id],
    )?;
    conn.execute(
        "DELETE FROM sessions_by_user WHERE user_id = ?1 AND instance_id = ?2",
        params![record.user_id, record.instance_id],
    )?;
    conn.execute(
        "DELETE FROM sessions_by_os WHERE os_profile = ?1 AND instance_id = ?2",
        params![record.os_profile.as_str(), record.instance_id],
    )?;
    conn.execute(
        "DELETE FROM sessions_by_pid WHERE instance_id = ?1",
        params![record.instance_id],
    )?;
    Ok(())
}
