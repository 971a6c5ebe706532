use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, error};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};

use crate::error_handling::types::StorageError;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS secrets (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        blob BLOB NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    );",
    "CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT NOT NULL,
        group_name TEXT
    );",
    "CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        group_name TEXT
    );",
    "CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        command BLOB NOT NULL,
        output BLOB NOT NULL,
        exit_code INTEGER,
        target_label TEXT NOT NULL,
        identity TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        timed_out BOOLEAN NOT NULL,
        truncated BOOLEAN NOT NULL
    );",
];

/// Opens (creating if missing) the SQLite database at `path` and ensures the
/// schema exists. The database file is restricted to its owner.
pub async fn connect(path: &Path) -> Result<DatabaseConnection, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| StorageError::WriteFailed)?;
    }

    let mut options = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
    options.max_connections(5).sqlx_logging(false);

    let db = Database::connect(options).await.map_err(|e| {
        error!("Cannot open database {}: {}", path.display(), e);
        StorageError::ConnectionFailed
    })?;

    for statement in SCHEMA {
        db.execute_unprepared(statement)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|_| StorageError::WriteFailed)?;

    debug!("Database ready at {}", path.display());
    Ok(db)
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_owner_only_file() {
        let (dir, _db) = temp_db().await;
        let path = dir.path().join("test.sqlite3");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (dir, db) = temp_db().await;
        drop(db);
        let again = connect(&dir.path().join("test.sqlite3")).await;
        assert!(again.is_ok());
    }
}
