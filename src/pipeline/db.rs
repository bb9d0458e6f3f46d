//! SQLite connection handling and schema migrations
//!
//! The Queue Store, Settings Store, Credit Ledger and run history share one
//! connection behind a mutex. Guards are never held across an `.await`.
//! Other processes (the runtime and the CLI) open their own connection to the
//! same file.

use crate::pipeline::error::PipelineError;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a write waits on another process's lock before `SQLITE_BUSY`
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the pipeline database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database and apply every migration in `schema_dir`
    pub fn open(db_path: &str, schema_dir: &str) -> Result<Self, PipelineError> {
        let mut conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_schema_migrations(&mut conn, schema_dir)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the shared connection
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from the specified directory and executes them in
/// filename order. All SQL files must use "IF NOT EXISTS" clauses so that
/// re-running is a no-op.
///
/// Returns: Ok(()) if all migrations succeed, Err(...) on first failure
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), PipelineError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PipelineError::Config(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    // journal_mode returns a row, pragma_update handles that
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::debug!("📊 Enabled WAL mode for SQLite database");

    // Sort alphabetically so 00_, 01_, 02_ run in order
    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort();

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for path in sql_files {
        let filename = path.display().to_string();
        log::debug!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;

        log::debug!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Test helper: fresh migrated database in a temp file
#[cfg(test)]
pub(crate) fn test_database() -> (tempfile::NamedTempFile, Database) {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let db = Database::open(&db_path, "sql").unwrap();
    (temp_file, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let (_temp, db) = test_database();
        let conn = db.lock();

        for table in [
            "queue_entries",
            "queue_entry_history",
            "pipeline_settings",
            "credit_ledger",
            "pipeline_runs",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", table);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let (temp, _db) = test_database();
        let mut conn = Connection::open(temp.path()).unwrap();

        run_schema_migrations(&mut conn, "sql").unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_schema_migrations(&mut conn, "does/not/exist");
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
