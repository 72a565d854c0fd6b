//! SQLite-backed local persistent store.
//!
//! Holds the offline outbox and the session-key history mirror as opaque
//! blobs behind an atomic put/get/delete surface. Each entry is independent;
//! no multi-entry transactions are offered or needed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

/// A stored entry together with its bookkeeping timestamp.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl LocalStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database exists per connection; a larger pool would
        // hand out connections that never saw the schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!(
            "sqlite://{}",
            base_dir.join("client_local_state.sqlite3").display()
        )
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_entries (
                entry_key  TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure local_entries table exists")?;
        Ok(())
    }

    /// Upserts one entry. Atomic: readers observe either the old or the new
    /// value, never a mix.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_entries (entry_key, value, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(entry_key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to put local entry '{key}'"))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM local_entries WHERE entry_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to get local entry '{key}'"))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_entries WHERE entry_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete local entry '{key}'"))?;
        Ok(())
    }

    /// Returns all entries whose key starts with `prefix`, ordered by key.
    /// Outbox keys embed a zero-padded sequence number, so key order is
    /// enqueue order.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<StoredEntry>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT entry_key, value, updated_at
             FROM local_entries
             WHERE entry_key LIKE ? ESCAPE '\\'
             ORDER BY entry_key ASC",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list local entries under '{prefix}'"))?;

        rows.into_iter()
            .map(|r| {
                let updated_at_raw = r.get::<String, _>(2);
                let updated_at = DateTime::parse_from_rfc3339(&updated_at_raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(StoredEntry {
                    key: r.get::<String, _>(0),
                    value: r.get::<Vec<u8>, _>(1),
                    updated_at,
                })
            })
            .collect()
    }

    pub async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", escape_like(prefix));
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM local_entries WHERE entry_key LIKE ? ESCAPE '\\'")
                .bind(pattern)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("failed to count local entries under '{prefix}'"))?;
        Ok(count as u64)
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
