//! Command execution history, persisted in an embedded SQLite file under the
//! server's data directory.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use eyre::{eyre, Result, WrapErr};
use rusqlite::{params, types::Value as SqlValue, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Prior releases kept the database under this directory; it is copied into
/// place on first run so history survives the rename.
const LEGACY_STATE_DIR: &str = ".etphonehome";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub client_uuid: String,
    pub command: String,
    pub cwd: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub user: String,
}

impl CommandRecord {
    /// Build a record for a finished (or failed) execution. Duration comes
    /// from the timestamps so transport failures still carry wall time.
    #[must_use]
    pub fn finished(
        client_uuid: impl Into<String>,
        command: impl Into<String>,
        cwd: Option<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        returncode: i32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_uuid: client_uuid.into(),
            command: command.into(),
            cwd,
            stdout: stdout.into(),
            stderr: stderr.into(),
            returncode,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            user: user.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusFilter {
    Success,
    Failed,
}

impl StatusFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryQuery {
    pub limit: usize,
    pub offset: usize,
    pub search: Option<String>,
    pub status: Option<StatusFilter>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            search: None,
            status: None,
        }
    }
}

/// SQLite-backed history. All access funnels through one connection behind a
/// lock; calls hop to the blocking pool so the async tasks never stall on
/// disk I/O.
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }

        migrate_legacy(path);

        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open history db at {}", path.display()))?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn add(&self, record: CommandRecord) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| eyre!("history lock poisoned"))?;
            conn.execute(
                "INSERT INTO command_history
                 (id, client_uuid, command, cwd, stdout, stderr, returncode,
                  started_at, completed_at, duration_ms, user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.client_uuid,
                    record.command,
                    record.cwd,
                    record.stdout,
                    record.stderr,
                    record.returncode,
                    record.started_at.to_rfc3339(),
                    record.completed_at.to_rfc3339(),
                    record.duration_ms,
                    record.user,
                ],
            )?;

            debug!(id = record.id, "recorded command");

            Ok(())
        })
        .await?
    }

    pub async fn get(&self, command_id: &str) -> Result<Option<CommandRecord>> {
        let conn = self.conn.clone();
        let command_id = command_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| eyre!("history lock poisoned"))?;
            let mut stmt = conn.prepare(
                "SELECT id, client_uuid, command, cwd, stdout, stderr, returncode,
                        started_at, completed_at, duration_ms, user
                 FROM command_history WHERE id = ?1",
            )?;

            let mut rows = stmt.query(params![command_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(record_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    /// Records for one client, `completed_at DESC`, with the optional
    /// substring and exit-status filters. Returns the page and the total
    /// matching count.
    pub async fn list_for_client(
        &self,
        client_uuid: &str,
        query: HistoryQuery,
    ) -> Result<(Vec<CommandRecord>, u64)> {
        let conn = self.conn.clone();
        let client_uuid = client_uuid.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| eyre!("history lock poisoned"))?;

            let mut clauses = vec!["client_uuid = ?".to_string()];
            let mut binds: Vec<SqlValue> = vec![SqlValue::Text(client_uuid)];

            if let Some(search) = &query.search {
                clauses.push("command LIKE ?".to_string());
                binds.push(SqlValue::Text(format!("%{search}%")));
            }

            match query.status {
                Some(StatusFilter::Success) => clauses.push("returncode = 0".to_string()),
                Some(StatusFilter::Failed) => clauses.push("returncode != 0".to_string()),
                None => {}
            }

            let where_clause = clauses.join(" AND ");

            let total: u64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM command_history WHERE {where_clause}"),
                rusqlite::params_from_iter(binds.iter()),
                |row| row.get(0),
            )?;

            binds.push(SqlValue::Integer(query.limit as i64));
            binds.push(SqlValue::Integer(query.offset as i64));

            let mut stmt = conn.prepare(&format!(
                "SELECT id, client_uuid, command, cwd, stdout, stderr, returncode,
                        started_at, completed_at, duration_ms, user
                 FROM command_history
                 WHERE {where_clause}
                 ORDER BY completed_at DESC
                 LIMIT ? OFFSET ?"
            ))?;

            let mut rows = stmt.query(rusqlite::params_from_iter(binds.iter()))?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(record_from_row(row)?);
            }

            Ok((records, total))
        })
        .await?
    }

    /// Retention purge: drop records older than `days`.
    pub async fn delete_old(&self, days: i64) -> Result<usize> {
        let conn = self.conn.clone();
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| eyre!("history lock poisoned"))?;
            let deleted = conn.execute(
                "DELETE FROM command_history WHERE completed_at < ?1",
                params![cutoff],
            )?;

            if deleted > 0 {
                info!(deleted, "purged old command history");
            }

            Ok(deleted)
        })
        .await?
    }

    /// Drop every record for one client, for decommissioned agents.
    pub async fn delete_for_client(&self, client_uuid: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let client_uuid = client_uuid.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| eyre!("history lock poisoned"))?;
            let deleted = conn.execute(
                "DELETE FROM command_history WHERE client_uuid = ?1",
                params![client_uuid],
            )?;

            info!(deleted, client = client_uuid, "dropped client history");

            Ok(deleted)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS command_history (
             id TEXT PRIMARY KEY,
             client_uuid TEXT NOT NULL,
             command TEXT NOT NULL,
             cwd TEXT,
             stdout TEXT NOT NULL,
             stderr TEXT NOT NULL,
             returncode INTEGER NOT NULL,
             started_at TEXT NOT NULL,
             completed_at TEXT NOT NULL,
             duration_ms INTEGER NOT NULL,
             user TEXT NOT NULL DEFAULT 'api',
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_client_uuid ON command_history(client_uuid);
         CREATE INDEX IF NOT EXISTS idx_completed_at ON command_history(completed_at DESC);
         CREATE INDEX IF NOT EXISTS idx_command ON command_history(command);",
    )?;

    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<CommandRecord> {
    let started_at: String = row.get(7)?;
    let completed_at: String = row.get(8)?;

    Ok(CommandRecord {
        id: row.get(0)?,
        client_uuid: row.get(1)?,
        command: row.get(2)?,
        cwd: row.get(3)?,
        stdout: row.get(4)?,
        stderr: row.get(5)?,
        returncode: row.get(6)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        completed_at: DateTime::parse_from_rfc3339(&completed_at)?.with_timezone(&Utc),
        duration_ms: row.get(9)?,
        user: row.get(10)?,
    })
}

fn migrate_legacy(path: &Path) {
    if path.exists() {
        return;
    }

    let Some(file_name) = path.file_name() else {
        return;
    };

    let Ok(home) = std::env::var("HOME") else {
        return;
    };

    let legacy = PathBuf::from(home).join(LEGACY_STATE_DIR).join(file_name);
    if !legacy.exists() {
        return;
    }

    match std::fs::copy(&legacy, path) {
        Ok(_) => info!(from = %legacy.display(), to = %path.display(), "migrated legacy history db"),
        Err(error) => debug!(%error, "legacy history migration skipped"),
    }
}
