//! Persistent processing log using SQLite with sqlx.
//!
//! One row per input file tracks whether its retrieval succeeded, where the
//! output went, summary statistics of the primary target and the captured
//! log text of every processing attempt. A log opened without a database
//! path is disabled and all its operations are no-ops.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tiled_inference::RetrievalResults;
use tracing::{debug, info};

/// Variable whose statistics are recorded on success.
pub const PRIMARY_TARGET: &str = "tiwp";

const CREATE_FILES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS files (
        name TEXT PRIMARY KEY,
        date TEXT NOT NULL,
        input_date TEXT NOT NULL,
        success INTEGER NOT NULL DEFAULT 0,
        output_file TEXT NOT NULL DEFAULT '',
        stat_min REAL,
        stat_max REAL,
        stat_mean REAL,
        n_missing INTEGER NOT NULL DEFAULT -1,
        log_blob BLOB NOT NULL DEFAULT x''
    )
"#;

/// Processing state of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// No entry exists.
    Unseen,
    /// Processing started but never succeeded.
    Pending,
    /// Processing succeeded and statistics are recorded.
    Finalized,
}

/// A row of the processing log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub name: String,
    /// When the entry was created.
    pub date: DateTime<Utc>,
    /// Observation time of the input file.
    pub input_date: DateTime<Utc>,
    pub success: bool,
    pub output_file: String,
    pub stat_min: Option<f64>,
    pub stat_max: Option<f64>,
    pub stat_mean: Option<f64>,
    /// Number of missing pixels of the primary target, -1 if unknown.
    pub n_missing: i64,
    pub log: String,
}

impl LogEntry {
    pub fn state(&self) -> FileState {
        if self.success {
            FileState::Finalized
        } else {
            FileState::Pending
        }
    }
}

/// Counts of logged files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub total: u64,
    pub succeeded: u64,
    pub pending: u64,
}

/// Processing log backed by an optional SQLite database.
#[derive(Debug, Clone)]
pub struct ProcessingLog {
    pool: Option<SqlitePool>,
}

impl ProcessingLog {
    /// Open or create the log database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        sqlx::query(CREATE_FILES_TABLE).execute(&pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_success ON files(success)")
            .execute(&pool)
            .await?;

        info!(path = %path.display(), "Opened processing log");

        Ok(Self { pool: Some(pool) })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_FILES_TABLE).execute(&pool).await?;

        Ok(Self { pool: Some(pool) })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    /// Open the log at `path`, or a disabled log if no path is configured.
    pub async fn from_settings(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path).await,
            None => {
                debug!("No processing database configured");
                Ok(Self::disabled())
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Create the entry for `name`, observed at `input_date`, unless it
    /// exists. Existing entries, including their captured logs, are left
    /// untouched.
    pub async fn begin(&self, name: &str, input_date: DateTime<Utc>) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO files
                (name, date, input_date, success, output_file, n_missing, log_blob)
            VALUES (?, ?, ?, 0, '', -1, x'')
            "#,
        )
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(input_date.to_rfc3339())
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(file = %name, "Created processing log entry");
        }
        Ok(())
    }

    /// Append captured log text to the entry of `name`.
    pub async fn append_log(&self, name: &str, text: &str) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await?;
        let existing: Option<(Vec<u8>,)> = sqlx::query_as("SELECT log_blob FROM files WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some((mut log,)) = existing {
            log.extend_from_slice(text.as_bytes());
            sqlx::query("UPDATE files SET log_blob = ? WHERE name = ?")
                .bind(log)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Mark `name` as successfully processed and record statistics of the
    /// primary target if the results contain it.
    pub async fn finalize(
        &self,
        name: &str,
        results: &RetrievalResults,
        output_file: &str,
    ) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let summary = results.summarize(PRIMARY_TARGET);
        let finite = |v: f64| if v.is_finite() { Some(v) } else { None };
        let (stat_min, stat_max, stat_mean, n_missing) = match summary {
            Some(s) => (
                finite(s.min),
                finite(s.max),
                finite(s.mean),
                s.n_missing as i64,
            ),
            None => (None, None, None, -1),
        };

        sqlx::query(
            r#"
            UPDATE files
            SET success = 1, output_file = ?, stat_min = ?, stat_max = ?,
                stat_mean = ?, n_missing = ?
            WHERE name = ?
            "#,
        )
        .bind(output_file)
        .bind(stat_min)
        .bind(stat_max)
        .bind(stat_mean)
        .bind(n_missing)
        .bind(name)
        .execute(pool)
        .await?;

        debug!(file = %name, output = %output_file, "Finalized processing log entry");
        Ok(())
    }

    /// The entry of `name`, if any.
    pub async fn entry(&self, name: &str) -> Result<Option<LogEntry>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT name, date, input_date, success, output_file, stat_min,
                   stat_max, stat_mean, n_missing, log_blob
            FROM files WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    pub async fn state(&self, name: &str) -> Result<FileState> {
        Ok(self
            .entry(name)
            .await?
            .map_or(FileState::Unseen, |entry| entry.state()))
    }

    /// Entries of files that never succeeded, oldest first.
    pub async fn failed(&self) -> Result<Vec<LogEntry>> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT name, date, input_date, success, output_file, stat_min,
                   stat_max, stat_mean, n_missing, log_blob
            FROM files WHERE success = 0
            ORDER BY input_date ASC, name ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn stats(&self) -> Result<ProcessingStats> {
        let Some(pool) = &self.pool else {
            return Ok(ProcessingStats::default());
        };

        let (total, succeeded): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(success) FROM files")
                .fetch_one(pool)
                .await?;
        let succeeded = succeeded.unwrap_or(0);

        Ok(ProcessingStats {
            total: total as u64,
            succeeded: succeeded as u64,
            pending: (total - succeeded) as u64,
        })
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    let log: Vec<u8> = row.try_get("log_blob")?;
    Ok(LogEntry {
        name: row.try_get("name")?,
        date: parse_date(row.try_get("date")?)?,
        input_date: parse_date(row.try_get("input_date")?)?,
        success: row.try_get::<i64, _>("success")? != 0,
        output_file: row.try_get("output_file")?,
        stat_min: row.try_get("stat_min")?,
        stat_max: row.try_get("stat_max")?,
        stat_mean: row.try_get("stat_mean")?,
        n_missing: row.try_get("n_missing")?,
        log: String::from_utf8_lossy(&log).into_owned(),
    })
}

fn parse_date(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|d| d.with_timezone(&Utc))
        .with_context(|| format!("Invalid date in processing log: {value}"))
}
