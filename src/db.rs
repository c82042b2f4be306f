use crate::error::{AppError, AppResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

fn build_connect_options(database_url: &str) -> AppResult<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::configuration(format!("Invalid DATABASE_URL '{}': {}", database_url, e)))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    Ok(options.log_statements(log::LevelFilter::Debug))
}

pub async fn create_pool(database_url: &str) -> AppResult<Pool<Sqlite>> {
    if database_url.trim().is_empty() {
        return Err(AppError::configuration("Database URL is required"));
    }

    let options = build_connect_options(database_url)?;

    SqlitePoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| AppError::storage("create SQLite pool", e))
}

/// Single-connection in-memory database with the full schema applied.
pub async fn memory_pool() -> AppResult<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(build_connect_options("sqlite::memory:")?)
        .await
        .map_err(|e| AppError::storage("open in-memory database", e))?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Creates every table the core persists. Idempotent; skipped by the
/// composition root when `SKIP_DB_INIT=1`.
pub async fn init_schema(pool: &Pool<Sqlite>) -> AppResult<()> {
    let parts = [
        ("tasks", crate::task_manager::storage::SCHEMA),
        ("reminders", crate::reminder::storage::SCHEMA),
        ("secrets", crate::vault::storage::SCHEMA),
        ("recipients", crate::channels::directory::SCHEMA),
    ];

    for (name, ddl) in parts {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| AppError::storage(format!("init {} schema", name), e))?;
    }

    log::debug!("Database schema ensured");
    Ok(())
}

pub fn trim_to_option(input: String) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Lowercases, trims and de-duplicates tags while keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for tag in tags {
        let normalized = tag.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if out.iter().any(|existing| existing == &normalized) {
            continue;
        }
        out.push(normalized);
    }
    out
}

pub fn decode_tags(raw: &str) -> AppResult<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::internal(format!("Failed to decode tags column: {}", e)))
}

/// Converts 1-based page/page_size into LIMIT/OFFSET. Pages past the end of
/// the i64 range saturate, which simply yields an empty page.
pub fn page_bounds(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let size = page_size.unwrap_or(50).clamp(1, 500);
    let page = page.unwrap_or(1).max(1);
    (size, (page - 1).saturating_mul(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = memory_pool().await.expect("memory pool");
        init_schema(&pool).await.expect("second init");
    }

    #[test]
    fn tags_are_normalized() {
        let tags = vec![" Work ".to_string(), "work".to_string(), "".to_string(), "Home".to_string()];
        assert_eq!(normalize_tags(&tags), vec!["work", "home"]);
    }

    #[test]
    fn page_bounds_clamp() {
        assert_eq!(page_bounds(None, None), (50, 0));
        assert_eq!(page_bounds(Some(3), Some(10)), (10, 20));
        assert_eq!(page_bounds(Some(0), Some(10_000)), (500, 0));
    }

    #[test]
    fn page_bounds_saturate_on_huge_pages() {
        assert_eq!(page_bounds(Some(i64::MAX), Some(500)), (500, i64::MAX));
        assert_eq!(page_bounds(Some(i64::MAX), None), (50, i64::MAX));
        assert_eq!(page_bounds(Some(i64::MIN), Some(10)), (10, 0));
    }
}
