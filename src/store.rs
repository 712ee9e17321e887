//! SQLite-backed quota ledger and report records.

use crate::models::QuotaState;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Unknown users read as the default ceiling with nothing processed.
    async fn get_limits(&self, user: &str) -> Result<QuotaState, StoreError>;
    /// Returns false when the user has no row.
    async fn increment(&self, user: &str, amount: usize) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredReport {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn save_report(&self, user: &str, path: &Path) -> Result<(), StoreError>;
    /// Newest first.
    async fn get_user_reports(&self, user: &str) -> Result<Vec<StoredReport>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, path.to_path_buf())?;
        info!(target = "appraisal.store", path = %path.display(), "database_initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts a quota row unless one exists. Returns true when inserted.
    pub async fn register_user(&self, username: &str, max_images: i64) -> Result<bool, StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (username, max_images, created_at)
                 VALUES (?1, ?2, ?3)",
                params![username, max_images, Utc::now().timestamp()],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            user_id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username         TEXT NOT NULL UNIQUE,
            email            TEXT,
            max_images       INTEGER NOT NULL DEFAULT 100,
            processed_images INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS reports (
            report_id   INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL,
            report_path TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reports_username ON reports(username);",
    )?;
    Ok(())
}

#[async_trait]
impl QuotaLedger for SqliteStore {
    async fn get_limits(&self, user: &str) -> Result<QuotaState, StoreError> {
        let user = user.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT processed_images, max_images FROM users WHERE username = ?1",
                    params![user],
                    |row| {
                        Ok(QuotaState {
                            processed_count: row.get(0)?,
                            max_allowed: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or_default())
        })
        .await
    }

    async fn increment(&self, user: &str, amount: usize) -> Result<bool, StoreError> {
        let owner = user.to_string();
        let amount = amount as i64;
        let updated = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE users SET processed_images = processed_images + ?1 WHERE username = ?2",
                    params![amount, owner],
                )?;
                Ok(changed > 0)
            })
            .await?;
        if !updated {
            warn!(target = "appraisal.store", user = %user, "quota_row_missing");
        }
        Ok(updated)
    }
}

#[async_trait]
impl ReportStore for SqliteStore {
    async fn save_report(&self, user: &str, path: &Path) -> Result<(), StoreError> {
        let user = user.to_string();
        let path = path.to_string_lossy().into_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO reports (username, report_path, created_at) VALUES (?1, ?2, ?3)",
                params![user, path, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_user_reports(&self, user: &str) -> Result<Vec<StoredReport>, StoreError> {
        let user = user.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT report_path, created_at FROM reports
                 WHERE username = ?1
                 ORDER BY created_at DESC, report_id DESC",
            )?;
            let rows = stmt.query_map(params![user], |row| {
                let path: String = row.get(0)?;
                let created: i64 = row.get(1)?;
                Ok((path, created))
            })?;
            let mut reports = Vec::new();
            for row in rows {
                let (path, created) = row?;
                reports.push(StoredReport {
                    path: PathBuf::from(path),
                    created_at: Utc.timestamp_opt(created, 0).single().unwrap_or_default(),
                });
            }
            Ok(reports)
        })
        .await
    }
}
