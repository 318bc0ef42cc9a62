//! SQLite-backed operation history and content index.
//!
//! `backup_records` is an append-only log with one row per file operation
//! outcome. `file_metadata` maps local paths to content hashes and image
//! attributes; it backs duplicate detection. Derived views are computed on
//! every call.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

use imgbackup_common::{Error, Operation, RecordStatus, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    provider TEXT NOT NULL,
    file_path TEXT NOT NULL,
    remote_path TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_metadata (
    file_path TEXT PRIMARY KEY,
    file_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    format TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_provider ON backup_records(provider);
CREATE INDEX IF NOT EXISTS idx_records_operation ON backup_records(operation);
CREATE INDEX IF NOT EXISTS idx_file_hash ON file_metadata(file_hash);
"#;

const RECORD_COLUMNS: &str = "id, operation, provider, file_path, remote_path, file_hash, \
     file_size, status, message, metadata, created_at";

fn db_error(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// One operation outcome to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub operation: Operation,
    pub provider: String,
    pub file_path: String,
    pub remote_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub status: RecordStatus,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl NewRecord {
    pub fn new(operation: Operation, provider: impl Into<String>, status: RecordStatus) -> Self {
        Self {
            operation,
            provider: provider.into(),
            file_path: String::new(),
            remote_path: String::new(),
            file_hash: String::new(),
            file_size: 0,
            status,
            message: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn paths(mut self, local: impl AsRef<Path>, remote: impl Into<String>) -> Self {
        self.file_path = local.as_ref().to_string_lossy().into_owned();
        self.remote_path = remote.into();
        self
    }

    pub fn content(mut self, hash: impl Into<String>, size: u64) -> Self {
        self.file_hash = hash.into();
        self.file_size = size;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A persisted history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub operation: Operation,
    pub provider: String,
    pub file_path: String,
    pub remote_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub status: RecordStatus,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for history queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub operation: Option<Operation>,
    pub provider: Option<String>,
    pub status: Option<RecordStatus>,
    pub limit: Option<usize>,
}

/// Content index entry of one local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataEntry {
    pub file_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
}

/// Aggregate view over the history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_operations: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Distinct local paths with at least one successful record.
    pub total_files: u64,
    /// Sum of sizes of successful records.
    pub total_size: u64,
    pub operations_by_type: BTreeMap<String, u64>,
}

/// Operation history and content index.
///
/// The connection sits behind a mutex, so concurrent workers append one
/// record at a time.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open or create a store, creating parent directories.
    ///
    /// # Errors
    /// - Directory creation, database open or schema failure
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_error)?;
        let store = Self::with_connection(conn)?;
        info!("Metadata store opened at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_error)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record; failures are logged and swallowed.
    pub fn record(&self, record: NewRecord) {
        let file = record.file_path.clone();
        if let Err(e) = self.try_record(record) {
            error!("Failed to record operation for {}: {}", file, e);
        }
    }

    /// Append a record and return its id.
    pub fn try_record(&self, record: NewRecord) -> Result<i64> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO backup_records
            (operation, provider, file_path, remote_path, file_hash, file_size,
             status, message, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.operation.as_str(),
                record.provider,
                record.file_path,
                record.remote_path,
                record.file_hash,
                record.file_size as i64,
                record.status.as_str(),
                record.message,
                metadata,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_error)?;
        let id = conn.last_insert_rowid();
        debug!(
            "Recorded {} {} for {} ({})",
            record.operation, record.status, record.file_path, record.provider
        );
        Ok(id)
    }

    /// History entries matching `filter`, most recent first.
    pub fn get_records(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        let mut sql = format!("SELECT {} FROM backup_records", RECORD_COLUMNS);
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(operation) = filter.operation {
            conditions.push("operation = ?");
            values.push(SqlValue::Text(operation.as_str().to_string()));
        }
        if let Some(provider) = &filter.provider {
            conditions.push("provider = ?");
            values.push(SqlValue::Text(provider.clone()));
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(db_error)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_record)
            .map_err(db_error)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(db_error)?);
        }
        Ok(records)
    }

    /// Insert or replace the content index entry of a local path.
    pub fn update_file_metadata(&self, entry: &FileMetadataEntry) -> Result<()> {
        self.conn()
            .execute(
                r#"
                INSERT OR REPLACE INTO file_metadata
                (file_path, file_hash, file_size, width, height, format, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    entry.file_path,
                    entry.file_hash,
                    entry.file_size as i64,
                    entry.width,
                    entry.height,
                    entry.format,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_error)?;
        Ok(())
    }

    /// Most recently updated index entry with the given hash.
    pub fn file_metadata_by_hash(&self, hash: &str) -> Result<Option<FileMetadataEntry>> {
        self.conn()
            .query_row(
                r#"
                SELECT file_path, file_hash, file_size, width, height, format
                FROM file_metadata WHERE file_hash = ?1
                ORDER BY updated_at DESC LIMIT 1
                "#,
                [hash],
                |row| {
                    Ok(FileMetadataEntry {
                        file_path: row.get(0)?,
                        file_hash: row.get(1)?,
                        file_size: row.get::<_, i64>(2)? as u64,
                        width: row.get(3)?,
                        height: row.get(4)?,
                        format: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(db_error)
    }

    /// Aggregate counts over the whole history.
    pub fn statistics(&self) -> Result<Statistics> {
        let conn = self.conn();
        let mut stats = Statistics::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM backup_records GROUP BY status")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_error)?;
        for row in rows {
            let (status, count) = row.map_err(db_error)?;
            let count = count as u64;
            stats.total_operations += count;
            match status.parse::<RecordStatus>() {
                Ok(RecordStatus::Success) => stats.successful += count,
                Ok(RecordStatus::Failed) => stats.failed += count,
                Ok(RecordStatus::Skipped) => stats.skipped += count,
                Err(_) => debug!("Ignoring unknown status '{}'", status),
            }
        }

        let mut stmt = conn
            .prepare("SELECT operation, COUNT(*) FROM backup_records GROUP BY operation")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_error)?;
        for row in rows {
            let (operation, count) = row.map_err(db_error)?;
            stats.operations_by_type.insert(operation, count as u64);
        }

        let (files, size): (i64, i64) = conn
            .query_row(
                r#"
                SELECT COUNT(DISTINCT file_path), COALESCE(SUM(file_size), 0)
                FROM backup_records WHERE status = ?1
                "#,
                [RecordStatus::Success.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_error)?;
        stats.total_files = files as u64;
        stats.total_size = size as u64;

        Ok(stats)
    }

    /// Content hashes shared by two or more distinct local paths.
    pub fn find_duplicates(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT file_hash, file_path FROM file_metadata
                WHERE file_hash IN (
                    SELECT file_hash FROM file_metadata
                    WHERE file_hash != ''
                    GROUP BY file_hash HAVING COUNT(*) > 1
                )
                "#,
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_error)?;

        let mut duplicates: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            let (hash, path) = row.map_err(db_error)?;
            duplicates.entry(hash).or_default().insert(path);
        }
        Ok(duplicates)
    }
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

/// Decode one `backup_records` row selected with `RECORD_COLUMNS`.
fn read_record(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let operation: String = row.get(1)?;
    let status: String = row.get(7)?;
    let metadata: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(BackupRecord {
        id: row.get(0)?,
        operation: operation.parse().map_err(|e| conversion_error(1, e))?,
        provider: row.get(2)?,
        file_path: row.get(3)?,
        remote_path: row.get(4)?,
        file_hash: row.get(5)?,
        file_size: row.get::<_, i64>(6)? as u64,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        message: row.get(8)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(9, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| conversion_error(10, e))?
            .with_timezone(&Utc),
    })
}
