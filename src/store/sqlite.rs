//! SQLite state storage

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{later, Store};
use crate::models::{AuditEntry, InFlight, PoolKey, PoolRecord, WorkspaceInstance};
use crate::{Error, Result};

/// Database for engine state
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                template_id TEXT NOT NULL,
                os TEXT NOT NULL,
                owner TEXT,
                pool_origin INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pools (
                template_id TEXT NOT NULL,
                os TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (template_id, os)
            );

            CREATE TABLE IF NOT EXISTS audit_entries (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                result TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                details TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            );

            CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
            BEFORE UPDATE ON audit_entries
            BEGIN
                SELECT RAISE(ABORT, 'audit entries are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
            BEFORE DELETE ON audit_entries
            BEGIN
                SELECT RAISE(ABORT, 'audit entries are append-only');
            END;

            CREATE INDEX IF NOT EXISTS idx_workspaces_state ON workspaces(state);
            CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_entries(subject_id);
            CREATE INDEX IF NOT EXISTS idx_audit_correlation ON audit_entries(correlation_id);
            "#,
        )?;
        Ok(())
    }

    fn load_instance(conn: &Connection, id: &str) -> Result<Option<WorkspaceInstance>> {
        let body: Option<String> = conn
            .query_row("SELECT body FROM workspaces WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from)).transpose()
    }

    fn write_instance(conn: &Connection, ws: &WorkspaceInstance) -> Result<usize> {
        let changed = conn.execute(
            r#"UPDATE workspaces SET state = ?2, template_id = ?3, os = ?4, owner = ?5, pool_origin = ?6, body = ?7
               WHERE id = ?1"#,
            params![
                ws.id,
                ws.state.as_str(),
                ws.template_id,
                ws.os.as_str(),
                ws.owner,
                ws.pool_origin as i32,
                serde_json::to_string(ws)?,
            ],
        )?;
        Ok(changed)
    }
}

/// Raw audit row before parsing
struct AuditRow {
    seq: i64,
    id: String,
    timestamp: String,
    actor: String,
    action: String,
    subject_type: String,
    subject_id: String,
    result: String,
    correlation_id: String,
    details: String,
    previous_hash: String,
    hash: String,
}

const AUDIT_COLUMNS: &str = "seq, id, timestamp, actor, action, subject_type, subject_id, result, correlation_id, details, previous_hash, hash";

impl AuditRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            timestamp: row.get(2)?,
            actor: row.get(3)?,
            action: row.get(4)?,
            subject_type: row.get(5)?,
            subject_id: row.get(6)?,
            result: row.get(7)?,
            correlation_id: row.get(8)?,
            details: row.get(9)?,
            previous_hash: row.get(10)?,
            hash: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| Error::Config(format!("audit entry {}: bad timestamp: {e}", self.seq)))?
            .with_timezone(&Utc);
        Ok(AuditEntry {
            seq: self.seq as u64,
            id: self.id,
            timestamp,
            actor: self.actor,
            action: self.action,
            subject_type: self.subject_type,
            subject_id: self.subject_id,
            result: self.result.parse()?,
            correlation_id: self.correlation_id,
            details: serde_json::from_str(&self.details)?,
            previous_hash: self.previous_hash,
            hash: self.hash,
        })
    }
}

impl Store for SqliteStore {
    fn insert_instance(&self, ws: &WorkspaceInstance) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO workspaces (id, state, template_id, os, owner, pool_origin, body)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                ws.id,
                ws.state.as_str(),
                ws.template_id,
                ws.os.as_str(),
                ws.owner,
                ws.pool_origin as i32,
                serde_json::to_string(ws)?,
            ],
        )?;
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<WorkspaceInstance>> {
        let conn = self.conn.lock();
        Self::load_instance(&conn, id)
    }

    fn update_instance(&self, ws: &WorkspaceInstance) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = Self::load_instance(&tx, &ws.id)?.ok_or_else(|| Error::InstanceNotFound(ws.id.clone()))?;
        let mut next = ws.clone();
        next.last_connected_at = later(stored.last_connected_at, ws.last_connected_at);
        Self::write_instance(&tx, &next)?;
        tx.commit()?;
        Ok(())
    }

    fn list_instances(&self) -> Result<Vec<WorkspaceInstance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM workspaces")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut list = bodies
            .iter()
            .map(|b| serde_json::from_str::<WorkspaceInstance>(b).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    fn try_claim(&self, id: &str, action: &str, now: DateTime<Utc>) -> Result<Option<WorkspaceInstance>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ws = Self::load_instance(&tx, id)?.ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        if ws.in_flight.is_some() {
            return Ok(None);
        }
        ws.in_flight = Some(InFlight {
            action: action.to_string(),
            since: now,
        });
        Self::write_instance(&tx, &ws)?;
        tx.commit()?;
        Ok(Some(ws))
    }

    fn release_claim(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ws = Self::load_instance(&tx, id)?.ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        ws.in_flight = None;
        Self::write_instance(&tx, &ws)?;
        tx.commit()?;
        Ok(())
    }

    fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ws = Self::load_instance(&tx, id)?.ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        ws.last_connected_at = later(ws.last_connected_at, Some(at));
        Self::write_instance(&tx, &ws)?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_pool(&self, pool: &PoolRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO pools (template_id, os, body) VALUES (?1, ?2, ?3)
               ON CONFLICT(template_id, os) DO UPDATE SET body = excluded.body"#,
            params![pool.key.template_id, pool.key.os.as_str(), serde_json::to_string(pool)?],
        )?;
        Ok(())
    }

    fn get_pool(&self, key: &PoolKey) -> Result<Option<PoolRecord>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM pools WHERE template_id = ?1 AND os = ?2",
                params![key.template_id, key.os.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from)).transpose()
    }

    fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM pools ORDER BY template_id, os")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn append_audit(&self, e: &AuditEntry) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let len: i64 = tx.query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))?;
        if e.seq != len as u64 + 1 {
            return Err(Error::IntegrityViolation { first_tampered: e.seq });
        }
        tx.execute(
            &format!("INSERT INTO audit_entries ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                e.seq as i64,
                e.id,
                e.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                e.actor,
                e.action,
                e.subject_type,
                e.subject_id,
                e.result.as_str(),
                e.correlation_id,
                e.details.to_string(),
                e.previous_hash,
                e.hash,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn last_audit(&self) -> Result<Option<AuditEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_entries ORDER BY seq DESC LIMIT 1"),
                [],
                AuditRow::from_row,
            )
            .optional()?;
        row.map(AuditRow::into_entry).transpose()
    }

    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq"
        ))?;
        let to = to.min(i64::MAX as u64);
        let rows = stmt
            .query_map(params![from as i64, to as i64], AuditRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    fn audit_len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let len: i64 = conn.query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))?;
        Ok(len as u64)
    }

    fn audit_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE subject_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![subject_id], AuditRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    fn audit_open_transitions(&self) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {AUDIT_COLUMNS} FROM audit_entries i
               WHERE i.result = 'INITIATED'
                 AND NOT EXISTS (
                     SELECT 1 FROM audit_entries o
                     WHERE o.correlation_id = i.correlation_id AND o.seq > i.seq AND o.result != 'INITIATED'
                 )
               ORDER BY i.seq"#
        ))?;
        let rows = stmt
            .query_map([], AuditRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }
}
