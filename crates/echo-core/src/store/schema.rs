//! SQLite DDL and stepwise migrations for the artifact manifest.

use rusqlite::Connection;

use crate::errors::EchoResult;

/// Version reached once every entry of `MIGRATIONS` has been applied.
pub const SCHEMA_VERSION: i32 = 3;

/// Baseline DDL, replayable on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS manifest_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS artifacts (
        dataset_id TEXT PRIMARY KEY,
        local_path TEXT NOT NULL,
        version TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        sha256 TEXT NOT NULL,
        fetched_at_ms INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'current',
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS sync_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dataset_id TEXT NOT NULL,
        level TEXT NOT NULL,
        event_type TEXT NOT NULL,
        detail_json TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

/// Create baseline tables and bring the schema up to [`SCHEMA_VERSION`].
pub fn init_schema(conn: &Connection) -> EchoResult<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    SCHEMA_STATEMENTS
        .iter()
        .try_for_each(|ddl| conn.execute_batch(ddl))?;
    migrate_schema(conn)
}

/// One upgrade step of the manifest schema.
struct Migration {
    version: i32,
    description: &'static str,
    apply: fn(&Connection) -> EchoResult<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline tables",
        apply: baseline,
    },
    Migration {
        version: 2,
        description: "index sync events by dataset",
        apply: index_sync_events,
    },
    Migration {
        version: 3,
        description: "record artifact source and pinned checksum",
        apply: artifact_provenance,
    },
];

/// Tables come from [`SCHEMA_STATEMENTS`].
fn baseline(_conn: &Connection) -> EchoResult<()> {
    Ok(())
}

fn index_sync_events(conn: &Connection) -> EchoResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_events_dataset ON sync_events(dataset_id, id);",
    )?;
    Ok(())
}

/// Rows written before this step keep NULL provenance and are refetched on
/// next use.
fn artifact_provenance(conn: &Connection) -> EchoResult<()> {
    for column in ["source", "expected_sha256"] {
        if !has_column(conn, "artifacts", column)? {
            conn.execute_batch(&format!("ALTER TABLE artifacts ADD COLUMN {column} TEXT;"))?;
        }
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> EchoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Apply every migration above the stored version, in order. Each step is
/// wrapped in its own SAVEPOINT; a failing step is rolled back, logged in
/// `migration_history` and returned.
pub fn migrate_schema(conn: &Connection) -> EchoResult<()> {
    let stored = get_schema_version(conn);
    for step in MIGRATIONS.iter().filter(|m| m.version > stored) {
        let from = step.version - 1;
        conn.execute_batch("SAVEPOINT manifest_migration;")?;
        let applied = (step.apply)(conn).and_then(|()| {
            conn.execute(
                "INSERT INTO manifest_meta(key, value) VALUES('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                [step.version.to_string()],
            )?;
            log_migration(conn, from, step.version, None)?;
            conn.execute_batch("RELEASE SAVEPOINT manifest_migration;")?;
            Ok(())
        });
        if let Err(err) = applied {
            let _ = conn.execute_batch(
                "ROLLBACK TO SAVEPOINT manifest_migration; RELEASE SAVEPOINT manifest_migration;",
            );
            let _ = log_migration(conn, from, step.version, Some(&err.to_string()));
            return Err(err);
        }
        tracing::debug!("manifest schema migrated to v{} ({})", step.version, step.description);
    }
    Ok(())
}

/// 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM manifest_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .ok();
    stored.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn log_migration(conn: &Connection, from: i32, to: i32, failure: Option<&str>) -> EchoResult<()> {
    let status = if failure.is_some() { "failed" } else { "success" };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from, to, status, failure],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_migrations_end_at_schema_version() {
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
        assert!(MIGRATIONS.windows(2).all(|w| w[1].version == w[0].version + 1));
    }

    #[test]
    fn test_version_two_database_gains_provenance_columns() {
        let conn = Connection::open_in_memory().unwrap();
        SCHEMA_STATEMENTS
            .iter()
            .for_each(|ddl| conn.execute_batch(ddl).unwrap());
        conn.execute_batch(
            "INSERT INTO manifest_meta(key, value) VALUES('schema_version', '2');
             INSERT INTO artifacts(dataset_id, local_path, version, size_bytes, sha256, fetched_at_ms)
             VALUES ('zones', '/data/zones.json', 'v1', 3, 'abc', 0);",
        )
        .unwrap();

        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 3);
        assert!(has_column(&conn, "artifacts", "source").unwrap());
        assert!(has_column(&conn, "artifacts", "expected_sha256").unwrap());
        let source: Option<String> = conn
            .query_row("SELECT source FROM artifacts WHERE dataset_id = 'zones';", [], |r| r.get(0))
            .unwrap();
        assert!(source.is_none());
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let steps: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_history;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }
}
