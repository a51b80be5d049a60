use dirsize_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::info;

const MIGRATION_001_CREATE_SCAN_RESULTS: &str = r#"
CREATE TABLE scan_results (
    id TEXT PRIMARY KEY,
    nas_host TEXT NOT NULL,
    folder_path TEXT NOT NULL,
    slug TEXT NOT NULL,
    scan_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    success INTEGER NOT NULL,
    num_dir INTEGER,
    num_file INTEGER,
    total_size_bytes INTEGER,
    elapsed_ms INTEGER,
    error TEXT,
    scan_error TEXT,
    UNIQUE(nas_host, folder_path, timestamp)
);
"#;

const MIGRATION_002_CREATE_INDEXES: &str = r#"
CREATE INDEX idx_scan_results_slug_timestamp ON scan_results(slug, timestamp DESC);
CREATE INDEX idx_scan_results_host_path ON scan_results(nas_host, folder_path);
CREATE INDEX idx_scan_results_folder_path ON scan_results(folder_path);
CREATE INDEX idx_scan_results_nas_host ON scan_results(nas_host);
CREATE INDEX idx_scan_results_timestamp ON scan_results(timestamp DESC);
CREATE INDEX idx_scan_results_status ON scan_results(status);
"#;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::StorageError(format!("failed to create migrations table: {e}")))?;

    run_migration(pool, "001_create_scan_results", MIGRATION_001_CREATE_SCAN_RESULTS).await?;
    run_migration(pool, "002_create_indexes", MIGRATION_002_CREATE_INDEXES).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::StorageError(format!("failed to check migration {name}: {e}")))?;

    if applied > 0 {
        return Ok(());
    }

    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::StorageError(format!("migration {name} failed: {e}")))?;
    }

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| Error::StorageError(format!("failed to record migration {name}: {e}")))?;

    info!(migration = name, "applied migration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
