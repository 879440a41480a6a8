//! Persistent record of which dataset artifacts are materialised locally.
//!
//! Every method opens its own connection so callers on different threads
//! never share one.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::errors::{EchoError, EchoResult};
use crate::models::{ArtifactStatus, DatasetArtifact};
use crate::store::schema;

/// One row of `sync_events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub dataset_id: String,
    pub level: String,
    pub event_type: String,
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    db_path: PathBuf,
}

fn parse_status(raw: &str) -> ArtifactStatus {
    match raw {
        "stale" => ArtifactStatus::Stale,
        _ => ArtifactStatus::Current,
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasetArtifact> {
    let local_path: String = row.get(1)?;
    let status: String = row.get(6)?;
    Ok(DatasetArtifact {
        dataset_id: row.get(0)?,
        local_path: PathBuf::from(local_path),
        version: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
        sha256: row.get(4)?,
        fetched_at_ms: row.get(5)?,
        status: parse_status(&status),
        source: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        expected_sha256: row.get(8)?,
    })
}

impl Manifest {
    /// Open (creating if needed) the manifest at `db_path` and migrate it.
    pub fn open(db_path: impl Into<PathBuf>) -> EchoResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manifest = Self { db_path };
        let conn = manifest.connect()?;
        schema::init_schema(&conn)?;
        Ok(manifest)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> EchoResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn get(&self, dataset_id: &str) -> EchoResult<Option<DatasetArtifact>> {
        let conn = self.connect()?;
        let artifact = conn
            .query_row(
                "SELECT dataset_id, local_path, version, size_bytes, sha256, fetched_at_ms, status, \
                        source, expected_sha256 \
                 FROM artifacts WHERE dataset_id = ?1;",
                params![dataset_id],
                row_to_artifact,
            )
            .optional()?;
        Ok(artifact)
    }

    pub fn list(&self) -> EchoResult<Vec<DatasetArtifact>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT dataset_id, local_path, version, size_bytes, sha256, fetched_at_ms, status, \
                    source, expected_sha256 \
             FROM artifacts ORDER BY dataset_id;",
        )?;
        let rows = stmt.query_map([], row_to_artifact)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(EchoError::from)
    }

    pub fn upsert(&self, artifact: &DatasetArtifact) -> EchoResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO artifacts(dataset_id, local_path, version, size_bytes, sha256, fetched_at_ms, status, \
                                   source, expected_sha256) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(dataset_id) DO UPDATE SET \
                local_path = excluded.local_path, \
                version = excluded.version, \
                size_bytes = excluded.size_bytes, \
                sha256 = excluded.sha256, \
                fetched_at_ms = excluded.fetched_at_ms, \
                status = excluded.status, \
                source = excluded.source, \
                expected_sha256 = excluded.expected_sha256, \
                updated_at = CURRENT_TIMESTAMP;",
            params![
                artifact.dataset_id,
                artifact.local_path.to_string_lossy(),
                artifact.version,
                artifact.size_bytes as i64,
                artifact.sha256,
                artifact.fetched_at_ms,
                artifact.status.as_str(),
                artifact.source,
                artifact.expected_sha256,
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, dataset_id: &str) -> EchoResult<bool> {
        let conn = self.connect()?;
        let n = conn.execute("DELETE FROM artifacts WHERE dataset_id = ?1;", params![dataset_id])?;
        Ok(n > 0)
    }

    pub fn record_event(
        &self,
        dataset_id: &str,
        level: &str,
        event_type: &str,
        detail: Option<&serde_json::Value>,
    ) -> EchoResult<()> {
        let detail_json = detail.map(serde_json::to_string).transpose()?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sync_events(dataset_id, level, event_type, detail_json) \
             VALUES (?1, ?2, ?3, ?4);",
            params![dataset_id, level, event_type, detail_json],
        )?;
        Ok(())
    }

    /// Most recent events first.
    pub fn recent_events(&self, dataset_id: Option<&str>, limit: usize) -> EchoResult<Vec<SyncEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT dataset_id, level, event_type, detail_json FROM sync_events \
             WHERE ?1 IS NULL OR dataset_id = ?1 \
             ORDER BY id DESC LIMIT ?2;",
        )?;
        let rows = stmt.query_map(params![dataset_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (dataset_id, level, event_type, detail_json) = row?;
            let detail = detail_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            events.push(SyncEvent {
                dataset_id,
                level,
                event_type,
                detail,
            });
        }
        Ok(events)
    }

    /// Copy the manifest to `destination` with the SQLite backup API.
    pub fn backup_to(&self, destination: &Path) -> EchoResult<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src = self.connect()?;
        let mut dst = Connection::open(destination)?;
        let backup = rusqlite::backup::Backup::new(&src, &mut dst)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }
}
