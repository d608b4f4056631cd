//! Verified-files cache: an on-disk fingerprint -> verification-timestamp
//! mapping. Opened lazily on `InitForUploads`, closed on
//! controller shutdown. Reads are lock-free (shared pool connections);
//! writes are serialized by `INSERT OR REPLACE` through the pool.
//!
//! A pooled connection over a single local table, with no migration manifest
//! machinery beyond the one `CREATE TABLE IF NOT EXISTS` this cache needs
//! (see DESIGN.md).

use crate::model::FileFingerprint;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub struct VerifiedFilesCache {
    pool: SqlitePool,
}

impl VerifiedFilesCache {
    /// Open (creating if absent) the cache file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        debug!("[PHASE: cache] [STEP: open] opening verified-files cache (path={:?})", path);
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("invalid cache path {:?}", path))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open verified-files cache {:?}", path))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS verified_files (
                dataset_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                size INTEGER NOT NULL,
                digest TEXT NOT NULL,
                verified_at TEXT NOT NULL,
                PRIMARY KEY (dataset_id, file_name, size, digest)
            )",
        )
        .execute(&pool)
        .await
        .context("failed to create verified_files table")?;

        Ok(VerifiedFilesCache { pool })
    }

    /// Look up a fingerprint. A row whose timestamp fails to parse is treated
    /// as absent and silently dropped.
    pub async fn lookup(&self, fp: &FileFingerprint) -> Option<DateTime<Utc>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT verified_at FROM verified_files
             WHERE dataset_id = ? AND file_name = ? AND size = ? AND digest = ?",
        )
        .bind(fp.dataset_id)
        .bind(&fp.file_name)
        .bind(fp.size as i64)
        .bind(&fp.digest)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or(None);

        match row {
            Some((raw,)) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(_) => {
                    warn!(
                        "[PHASE: cache] [STEP: lookup] dropping corrupt cache entry (dataset_id={}, file_name={})",
                        fp.dataset_id, fp.file_name
                    );
                    None
                }
            },
            None => None,
        }
    }

    /// Record that a fingerprint has just been verified.
    pub async fn insert(&self, fp: &FileFingerprint, verified_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO verified_files
                (dataset_id, file_name, size, digest, verified_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fp.dataset_id)
        .bind(&fp.file_name)
        .bind(fp.size as i64)
        .bind(&fp.digest)
        .bind(verified_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert verified-files cache entry")?;
        Ok(())
    }

    pub async fn close(self) {
        debug!("[PHASE: cache] [STEP: close] closing verified-files cache");
        self.pool.close().await;
    }
}
