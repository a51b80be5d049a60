//! Embedded relational persistence of `StoredRecord` rows, keyed by
//! physical location `(nasHost, folderPath, timestamp)` rather than by scan
//! identity.

mod migrations;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dirsize_common::{
    Error, Result, ScanResult, ScanResultItem, ScanStatus, StoredRecord, SENTINEL_FOLDER_PATH,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

const DEFAULT_MAX_HISTORY: usize = 1000;
const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Default)]
pub struct FolderFilter {
    pub nas_host: Option<String>,
    pub folder_path: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub rows_affected: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_rows: i64,
    pub distinct_slugs: i64,
    pub distinct_folders: i64,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
}

/// Embedded store backed by SQLite in WAL mode.
pub struct HistoryStore {
    pool: SqlitePool,
    max_history: usize,
}

impl HistoryStore {
    pub async fn connect(database_url: &str, max_history: usize) -> Result<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::StorageError(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageError(format!("failed to open database: {e}")))?;

        migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            max_history: max_history.max(1),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("health check failed: {e}")))?;
        Ok(())
    }

    /// Inserts one row per successful item, or one sentinel row if the
    /// scan had zero successful items. Idempotent on the `(nasHost,
    /// folderPath, timestamp)` unique key. Prunes to the most recent
    /// `maxHistory` distinct timestamps for the slug afterward.
    pub async fn add_result(&self, result: &ScanResult, nas_host: &str) -> Result<()> {
        if result.status == ScanStatus::Running {
            return Err(Error::StorageError(
                "refusing to persist a running ScanResult".into(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageError(format!("failed to start transaction: {e}")))?;

        let successes: Vec<&ScanResultItem> = result.items.iter().filter(|i| i.success).collect();

        if successes.is_empty() {
            let id = StoredRecord::derive_id(nas_host, SENTINEL_FOLDER_PATH, &result.timestamp);
            sqlx::query(
                "INSERT INTO scan_results
                    (id, nas_host, folder_path, slug, scan_name, timestamp, status, success,
                     num_dir, num_file, total_size_bytes, elapsed_ms, error, scan_error)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, NULL, NULL, NULL, ?)
                 ON CONFLICT(nas_host, folder_path, timestamp) DO UPDATE SET
                    status = excluded.status, scan_error = excluded.scan_error",
            )
            .bind(&id)
            .bind(nas_host)
            .bind(SENTINEL_FOLDER_PATH)
            .bind(&result.slug)
            .bind(&result.scan_name)
            .bind(result.timestamp.to_rfc3339())
            .bind(result.status.to_string())
            .bind(&result.error)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageError(format!("failed to insert sentinel row: {e}")))?;
        } else {
            for item in &successes {
                let id = StoredRecord::derive_id(nas_host, &item.folder_name, &result.timestamp);
                sqlx::query(
                    "INSERT INTO scan_results
                        (id, nas_host, folder_path, slug, scan_name, timestamp, status, success,
                         num_dir, num_file, total_size_bytes, elapsed_ms, error, scan_error)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(nas_host, folder_path, timestamp) DO UPDATE SET
                        status = excluded.status, success = excluded.success,
                        num_dir = excluded.num_dir, num_file = excluded.num_file,
                        total_size_bytes = excluded.total_size_bytes,
                        elapsed_ms = excluded.elapsed_ms, error = excluded.error,
                        scan_error = excluded.scan_error",
                )
                .bind(&id)
                .bind(nas_host)
                .bind(&item.folder_name)
                .bind(&result.slug)
                .bind(&result.scan_name)
                .bind(result.timestamp.to_rfc3339())
                .bind(result.status.to_string())
                .bind(item.success)
                .bind(item.num_dir.map(|v| v as i64))
                .bind(item.num_file.map(|v| v as i64))
                .bind(item.total_size_bytes.map(|v| v as i64))
                .bind(item.elapsed_ms.map(|v| v as i64))
                .bind(&item.error)
                .bind(&result.error)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::StorageError(format!("failed to insert result row: {e}")))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::StorageError(format!("failed to commit transaction: {e}")))?;

        self.prune_to_max_history(&result.slug).await?;
        Ok(())
    }

    async fn prune_to_max_history(&self, slug: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM scan_results WHERE slug = ? AND timestamp NOT IN (
                SELECT timestamp FROM (
                    SELECT DISTINCT timestamp FROM scan_results WHERE slug = ?
                    ORDER BY timestamp DESC LIMIT ?
                )
             )",
        )
        .bind(slug)
        .bind(slug)
        .bind(self.max_history as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("failed to prune history for {slug}: {e}")))?;
        Ok(())
    }

    fn row_to_item(row: &SqliteRow) -> Option<ScanResultItem> {
        let folder_path: String = row.get("folder_path");
        if folder_path == SENTINEL_FOLDER_PATH {
            return None;
        }
        Some(ScanResultItem {
            folder_name: folder_path,
            success: row.get::<i64, _>("success") != 0,
            num_dir: row.get::<Option<i64>, _>("num_dir").map(|v| v as u64),
            num_file: row.get::<Option<i64>, _>("num_file").map(|v| v as u64),
            total_size_bytes: row
                .get::<Option<i64>, _>("total_size_bytes")
                .map(|v| v as u64),
            elapsed_ms: row.get::<Option<i64>, _>("elapsed_ms").map(|v| v as u64),
            error: row.get("error"),
        })
    }

    fn rows_to_result(slug: &str, rows: &[SqliteRow]) -> Option<ScanResult> {
        let first = rows.first()?;
        let timestamp: String = first.get("timestamp");
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .ok()?
            .with_timezone(&Utc);
        let status_str: String = first.get("status");
        let status = match status_str.as_str() {
            "completed" => ScanStatus::Completed,
            "failed" => ScanStatus::Failed,
            _ => ScanStatus::Failed,
        };
        let scan_name: String = first.get("scan_name");
        let scan_error: Option<String> = first.get("scan_error");

        let items: Vec<ScanResultItem> = rows.iter().filter_map(Self::row_to_item).collect();

        Some(ScanResult {
            slug: slug.to_string(),
            scan_name,
            timestamp,
            status,
            items,
            error: scan_error,
        })
    }

    pub async fn get_latest_result(&self, slug: &str) -> Result<Option<ScanResult>> {
        let latest_ts: Option<String> = sqlx::query_scalar(
            "SELECT timestamp FROM scan_results WHERE slug = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("get_latest_result failed: {e}")))?;

        let Some(ts) = latest_ts else {
            return Ok(None);
        };

        let rows = sqlx::query("SELECT * FROM scan_results WHERE slug = ? AND timestamp = ?")
            .bind(slug)
            .bind(&ts)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_latest_result failed: {e}")))?;

        Ok(Self::rows_to_result(slug, &rows))
    }

    /// Newest timestamp whose status is `completed` and whose items
    /// include at least one success with nonzero size.
    pub async fn get_latest_completed_result(&self, slug: &str) -> Result<Option<ScanResult>> {
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT timestamp FROM scan_results
             WHERE slug = ? AND status = 'completed'
             ORDER BY timestamp DESC",
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("get_latest_completed_result failed: {e}")))?;

        for ts in candidates {
            let rows = sqlx::query("SELECT * FROM scan_results WHERE slug = ? AND timestamp = ?")
                .bind(slug)
                .bind(&ts)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::StorageError(format!("get_latest_completed_result failed: {e}")))?;

            if let Some(result) = Self::rows_to_result(slug, &rows) {
                let has_usable_size = result
                    .items
                    .iter()
                    .any(|i| i.success && i.total_size_bytes.unwrap_or(0) > 0);
                if has_usable_size {
                    return Ok(Some(result));
                }
            }
        }
        Ok(None)
    }

    pub async fn get_all_results(&self, slug: &str) -> Result<Vec<ScanResult>> {
        let timestamps: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT timestamp FROM scan_results WHERE slug = ? ORDER BY timestamp DESC",
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("get_all_results failed: {e}")))?;

        self.results_for_timestamps(slug, &timestamps).await
    }

    pub async fn get_results_since(&self, slug: &str, since: DateTime<Utc>) -> Result<Vec<ScanResult>> {
        let timestamps: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT timestamp FROM scan_results
             WHERE slug = ? AND timestamp >= ? ORDER BY timestamp DESC",
        )
        .bind(slug)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("get_results_since failed: {e}")))?;

        self.results_for_timestamps(slug, &timestamps).await
    }

    async fn results_for_timestamps(&self, slug: &str, timestamps: &[String]) -> Result<Vec<ScanResult>> {
        let mut out = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            let rows = sqlx::query("SELECT * FROM scan_results WHERE slug = ? AND timestamp = ?")
                .bind(slug)
                .bind(ts)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::StorageError(format!("query failed: {e}")))?;
            if let Some(result) = Self::rows_to_result(slug, &rows) {
                out.push(result);
            }
        }
        Ok(out)
    }

    pub async fn get_all_folders(&self, filter: &FolderFilter) -> Result<Vec<(String, String)>> {
        let mut sql = "SELECT DISTINCT nas_host, folder_path FROM scan_results WHERE folder_path != ?".to_string();
        let mut binds: Vec<String> = vec![SENTINEL_FOLDER_PATH.to_string()];
        if let Some(host) = &filter.nas_host {
            sql.push_str(" AND nas_host = ?");
            binds.push(host.clone());
        }
        if let Some(path) = &filter.folder_path {
            sql.push_str(" AND folder_path = ?");
            binds.push(path.clone());
        }
        if let Some(slug) = &filter.slug {
            sql.push_str(" AND slug = ?");
            binds.push(slug.clone());
        }

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("get_all_folders failed: {e}")))?;

        Ok(rows
            .iter()
            .map(|r| (r.get("nas_host"), r.get("folder_path")))
            .collect())
    }

    /// Deletes rows older than `now - days`. `dry_run = true` returns the
    /// would-be count without deleting.
    pub async fn cleanup_old_results(
        &self,
        days: Option<i64>,
        filter: &FolderFilter,
        dry_run: bool,
    ) -> Result<CleanupSummary> {
        let cutoff = Utc::now() - chrono::Duration::days(days.unwrap_or(DEFAULT_RETENTION_DAYS));
        let mut sql_where = "timestamp < ?".to_string();
        let mut binds: Vec<String> = vec![cutoff.to_rfc3339()];
        if let Some(host) = &filter.nas_host {
            sql_where.push_str(" AND nas_host = ?");
            binds.push(host.clone());
        }
        if let Some(path) = &filter.folder_path {
            sql_where.push_str(" AND folder_path = ?");
            binds.push(path.clone());
        }
        if let Some(slug) = &filter.slug {
            sql_where.push_str(" AND slug = ?");
            binds.push(slug.clone());
        }

        if dry_run {
            let sql = format!("SELECT COUNT(*) FROM scan_results WHERE {sql_where}");
            let mut query = sqlx::query_scalar(&sql);
            for b in &binds {
                query = query.bind(b);
            }
            let count: i64 = query
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::StorageError(format!("cleanup preview failed: {e}")))?;
            return Ok(CleanupSummary {
                rows_affected: count as u64,
                dry_run: true,
            });
        }

        let sql = format!("DELETE FROM scan_results WHERE {sql_where}");
        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let affected = query
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("cleanup failed: {e}")))?
            .rows_affected();

        if affected > 0 {
            sqlx::query("VACUUM")
                .execute(&self.pool)
                .await
                .map_err(|e| Error::StorageError(format!("post-cleanup VACUUM failed: {e}")))?;
        }

        info!(rows_affected = affected, "retention cleanup completed");
        Ok(CleanupSummary {
            rows_affected: affected,
            dry_run: false,
        })
    }

    pub async fn delete_folder_results(&self, filter: &FolderFilter) -> Result<u64> {
        let mut sql_where = "1 = 1".to_string();
        let mut binds: Vec<String> = Vec::new();
        if let Some(host) = &filter.nas_host {
            sql_where.push_str(" AND nas_host = ?");
            binds.push(host.clone());
        }
        if let Some(path) = &filter.folder_path {
            sql_where.push_str(" AND folder_path = ?");
            binds.push(path.clone());
        }
        if let Some(slug) = &filter.slug {
            sql_where.push_str(" AND slug = ?");
            binds.push(slug.clone());
        }
        if binds.is_empty() {
            warn!("delete_folder_results called with no filter; refusing to delete all rows implicitly");
            return Err(Error::ConfigError(
                "delete_folder_results requires at least one filter".into(),
            ));
        }

        let sql = format!("DELETE FROM scan_results WHERE {sql_where}");
        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let affected = query
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("delete_folder_results failed: {e}")))?
            .rows_affected();
        Ok(affected)
    }

    pub async fn clear_results(&self, slug: Option<&str>) -> Result<u64> {
        let affected = match slug {
            Some(slug) => sqlx::query("DELETE FROM scan_results WHERE slug = ?")
                .bind(slug)
                .execute(&self.pool)
                .await,
            None => sqlx::query("DELETE FROM scan_results").execute(&self.pool).await,
        }
        .map_err(|e| Error::StorageError(format!("clear_results failed: {e}")))?
        .rows_affected();
        Ok(affected)
    }

    pub async fn delete_all_results(&self) -> Result<u64> {
        self.clear_results(None).await
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) as total_rows,
                    COUNT(DISTINCT slug) as distinct_slugs,
                    COUNT(DISTINCT nas_host || ':' || folder_path) as distinct_folders,
                    MIN(timestamp) as oldest,
                    MAX(timestamp) as newest
             FROM scan_results WHERE folder_path != ?",
        )
        .bind(SENTINEL_FOLDER_PATH)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::StorageError(format!("storage_stats failed: {e}")))?;

        let oldest: Option<String> = row.get("oldest");
        let newest: Option<String> = row.get("newest");

        Ok(StorageStats {
            total_rows: row.get("total_rows"),
            distinct_slugs: row.get("distinct_slugs"),
            distinct_folders: row.get("distinct_folders"),
            oldest_timestamp: oldest.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            newest_timestamp: newest.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsize_common::{ScanResultItem, ScanStatus};

    async fn test_store() -> HistoryStore {
        HistoryStore::connect("sqlite::memory:", 3).await.unwrap()
    }

    fn completed_result(slug: &str, ts: DateTime<Utc>, size: u64) -> ScanResult {
        ScanResult {
            slug: slug.to_string(),
            scan_name: "Docs".to_string(),
            timestamp: ts,
            status: ScanStatus::Completed,
            items: vec![ScanResultItem::success("/homes/docs".into(), 3, 7, size, 120)],
            error: None,
        }
    }

    #[tokio::test]
    async fn add_result_then_get_latest_round_trips() {
        let store = test_store().await;
        let ts = Utc::now();
        store.add_result(&completed_result("docs", ts, 30000), "nas1").await.unwrap();

        let latest = store.get_latest_result("docs").await.unwrap().unwrap();
        assert_eq!(latest.status, ScanStatus::Completed);
        assert_eq!(latest.items.len(), 1);
        assert_eq!(latest.items[0].total_size_bytes, Some(30000));
    }

    #[tokio::test]
    async fn add_result_is_idempotent_on_primary_key() {
        let store = test_store().await;
        let ts = Utc::now();
        let result = completed_result("docs", ts, 30000);
        store.add_result(&result, "nas1").await.unwrap();
        store.add_result(&result, "nas1").await.unwrap();

        let stats = store.storage_stats().await.unwrap();
        assert_eq!(stats.total_rows, 1);
    }

    #[tokio::test]
    async fn all_failed_scan_writes_sentinel_row() {
        let store = test_store().await;
        let mut result = ScanResult::running("docs", "Docs");
        result.items.push(ScanResultItem::failure("/homes/docs".into(), "boom"));
        result.finalize();
        result.error = Some("boom".to_string());

        store.add_result(&result, "nas1").await.unwrap();

        let latest = store.get_latest_result("docs").await.unwrap().unwrap();
        assert_eq!(latest.status, ScanStatus::Failed);
        assert!(latest.items.is_empty());
        assert_eq!(latest.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retention_prunes_to_max_history_distinct_timestamps() {
        let store = test_store().await; // max_history = 3
        let base = Utc::now();
        for i in 0..5u32 {
            let ts = base + chrono::Duration::seconds(i as i64);
            store.add_result(&completed_result("docs", ts, 1000 + i as u64), "nas1").await.unwrap();
        }

        let all = store.get_all_results("docs").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn get_latest_completed_requires_nonzero_size() {
        let store = test_store().await;
        let mut result = completed_result("docs", Utc::now(), 0);
        result.items[0].total_size_bytes = Some(0);
        store.add_result(&result, "nas1").await.unwrap();

        assert!(store.get_latest_completed_result("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refuses_to_persist_running_status() {
        let store = test_store().await;
        let result = ScanResult::running("docs", "Docs");
        assert!(store.add_result(&result, "nas1").await.is_err());
    }

    #[tokio::test]
    async fn delete_folder_results_requires_a_filter() {
        let store = test_store().await;
        let filter = FolderFilter::default();
        assert!(store.delete_folder_results(&filter).await.is_err());
    }
}
