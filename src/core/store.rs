//! Durable policy store and audit trail
//!
//! SQLite file with two tables, `policies` and `audit`. Ids come from
//! `AUTOINCREMENT` so they are never reused, even after deletes.
//!
//! All access goes through one `Connection` behind a `Mutex`: the interactive
//! path and a background apply task may both write, and every write is a
//! single transaction taken under that lock.

use crate::audit::{AuditAction, AuditEntry};
use crate::core::error::{Error, Result};
use crate::core::policy::{Policy, PolicyId, PolicySummary, compute_checksum};
use crate::validators;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    checksum TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    policy_id INTEGER,
    detail TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_policy ON audit(policy_id);
";

/// Versioned ruleset storage with an append-only audit trail
pub struct PolicyStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action: String = row.get(1)?;
    let action = action.parse::<AuditAction>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AuditEntry {
        id: row.get(0)?,
        action,
        policy_id: row.get(2)?,
        detail: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

fn insert_audit(
    conn: &Connection,
    action: AuditAction,
    policy_id: Option<PolicyId>,
    detail: &str,
    created_at: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO audit (action, policy_id, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![action.as_ref(), policy_id, detail, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

impl PolicyStore {
    /// Opens or creates the store at `path` and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL lets readers proceed while the single writer commits
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Policy database journal mode: {mode}");
        Self::init(conn)
    }

    /// Opens a private in-memory store (tests, throwaway sessions)
    ///
    /// # Errors
    ///
    /// Returns `Err` if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(Error::Internal(format!(
                "Policy database schema v{version} is newer than supported v{SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            info!("Migrating policy database schema v{version} -> v{SCHEMA_VERSION}");
            conn.execute_batch(SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("policy store lock poisoned".to_string()))
    }

    /// Saves a new policy version, recording one `save` audit entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for a bad name or content, `Error::Store`
    /// if the write fails (in which case nothing is written).
    pub fn save_policy(&self, name: &str, content: &str) -> Result<PolicyId> {
        let name = validators::validate_policy_name(name).map_err(Error::InvalidInput)?;
        self.record_snapshot(
            &name,
            content,
            AuditAction::Save,
            &format!("Saved policy '{name}'"),
        )
    }

    /// Inserts a policy and exactly one audit entry of `action` referencing it,
    /// atomically.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for empty or oversized content, `Error::Store`
    /// if the transaction fails.
    pub fn record_snapshot(
        &self,
        name: &str,
        content: &str,
        action: AuditAction,
        detail: &str,
    ) -> Result<PolicyId> {
        validators::validate_ruleset_text(content).map_err(Error::InvalidInput)?;
        let name = validators::sanitize_name(name);
        let checksum = compute_checksum(content);
        let now = now_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO policies (name, content, checksum, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, content, checksum, now],
        )?;
        let policy_id = tx.last_insert_rowid();
        insert_audit(&tx, action, Some(policy_id), detail, &now)?;
        tx.commit()?;

        info!("Stored policy #{policy_id} '{name}' ({action})");
        Ok(policy_id)
    }

    /// Newest-first listing, at most `limit` rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on query failure
    pub fn list_policies(&self, limit: usize) -> Result<Vec<PolicySummary>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, created_at FROM policies ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            Ok(PolicySummary {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: parse_timestamp(&row.get::<_, String>(2)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fetches a policy, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChecksumMismatch` if stored content was altered,
    /// `Error::Store` on query failure.
    pub fn get_policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        let conn = self.conn()?;
        let policy = conn
            .query_row(
                "SELECT id, name, content, checksum, created_at FROM policies WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Policy {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        content: row.get(2)?,
                        checksum: row.get(3)?,
                        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()?;

        if let Some(policy) = &policy {
            let actual = compute_checksum(&policy.content);
            if actual != policy.checksum {
                warn!("Checksum mismatch on policy #{id}");
                return Err(Error::ChecksumMismatch {
                    id,
                    expected: policy.checksum.clone(),
                    actual,
                });
            }
        }
        Ok(policy)
    }

    /// Deletes a policy and records a `delete` audit entry. Audit history
    /// referencing the policy is kept.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` (writing nothing) if the id does not exist.
    pub fn delete_policy(&self, id: PolicyId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let name: Option<String> = tx
            .query_row("SELECT name FROM policies WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(name) = name else {
            return Err(Error::PolicyNotFound(id));
        };

        tx.execute("DELETE FROM policies WHERE id = ?1", params![id])?;
        insert_audit(
            &tx,
            AuditAction::Delete,
            Some(id),
            &format!("Deleted policy '{name}'"),
            &now_rfc3339(),
        )?;
        tx.commit()?;

        info!("Deleted policy #{id}");
        Ok(())
    }

    /// Appends one audit entry and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the write fails; callers must not ignore it.
    pub fn log_audit(
        &self,
        action: AuditAction,
        policy_id: Option<PolicyId>,
        detail: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let id = insert_audit(&conn, action, policy_id, detail, &now_rfc3339())?;
        debug!("Audit #{id}: {action} policy={policy_id:?}");
        Ok(id)
    }

    /// Newest-first audit listing, at most `limit` rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on query failure
    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, action, policy_id, detail, created_at FROM audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], audit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Newest-first audit history of one policy, including after its deletion
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on query failure
    pub fn list_audit_for_policy(&self, id: PolicyId, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, action, policy_id, detail, created_at FROM audit \
             WHERE policy_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id, clamp_limit(limit)], audit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// # Errors
    ///
    /// Returns `Error::Store` on query failure
    pub fn policy_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM policies", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// # Errors
    ///
    /// Returns `Error::Store` on query failure
    pub fn audit_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
