use crate::channels::RecipientProfile;
use crate::db::trim_to_option;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::RwLock;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS recipients (
    user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    email TEXT,
    webhook_url TEXT,
    im_handle TEXT,
    updated_at INTEGER NOT NULL
);
"#;

/// Resolves the creator of a reminder into deliverable contact details.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve(&self, user_id: &str) -> AppResult<Option<RecipientProfile>>;
}

#[derive(Clone)]
pub struct SqliteRecipientDirectory {
    pool: Pool<Sqlite>,
}

impl SqliteRecipientDirectory {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, profile: &RecipientProfile) -> AppResult<()> {
        if profile.user_id.trim().is_empty() {
            return Err(AppError::validation("Recipient user id cannot be empty"));
        }

        sqlx::query(
            r#"
            INSERT INTO recipients (user_id, username, email, webhook_url, im_handle, updated_at)
            VALUES (?, ?, ?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                email = excluded.email,
                webhook_url = excluded.webhook_url,
                im_handle = excluded.im_handle,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(profile.user_id.trim())
        .bind(&profile.username)
        .bind(profile.email.clone().and_then(trim_to_option))
        .bind(profile.webhook_url.clone().and_then(trim_to_option))
        .bind(profile.im_handle.clone().and_then(trim_to_option))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("save recipient '{}'", profile.user_id), e))?;

        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for SqliteRecipientDirectory {
    async fn resolve(&self, user_id: &str) -> AppResult<Option<RecipientProfile>> {
        let row = sqlx::query(
            "SELECT user_id, username, email, webhook_url, im_handle FROM recipients WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("fetch recipient '{}'", user_id), e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let map = |e: sqlx::Error| AppError::storage("decode recipient row", e);

        Ok(Some(RecipientProfile {
            user_id: row.try_get("user_id").map_err(map)?,
            username: row.try_get("username").map_err(map)?,
            email: row.try_get("email").map_err(map)?,
            webhook_url: row.try_get("webhook_url").map_err(map)?,
            im_handle: row.try_get("im_handle").map_err(map)?,
        }))
    }
}

/// In-process directory for tests and single-user deployments.
#[derive(Default)]
pub struct StaticRecipientDirectory {
    profiles: RwLock<HashMap<String, RecipientProfile>>,
}

impl StaticRecipientDirectory {
    pub fn new(profiles: impl IntoIterator<Item = RecipientProfile>) -> Self {
        let map = profiles
            .into_iter()
            .map(|p| (p.user_id.clone(), p))
            .collect();
        Self {
            profiles: RwLock::new(map),
        }
    }

    pub fn insert(&self, profile: RecipientProfile) {
        let mut guard = self
            .profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl RecipientDirectory for StaticRecipientDirectory {
    async fn resolve(&self, user_id: &str) -> AppResult<Option<RecipientProfile>> {
        let guard = self
            .profiles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(user_id: &str, email: Option<&str>) -> RecipientProfile {
        RecipientProfile {
            user_id: user_id.to_string(),
            username: format!("{}-name", user_id),
            email: email.map(str::to_string),
            webhook_url: None,
            im_handle: None,
        }
    }

    #[tokio::test]
    async fn sqlite_directory_upserts_and_blanks_become_null() {
        let pool = crate::db::memory_pool().await.expect("sqlite memory");
        let directory = SqliteRecipientDirectory::new(pool);

        directory
            .upsert(&profile("u1", Some("old@example.com")))
            .await
            .expect("insert");
        directory
            .upsert(&profile("u1", Some("   ")))
            .await
            .expect("update");

        let loaded = directory.resolve("u1").await.expect("resolve").expect("exists");
        assert_eq!(loaded.username, "u1-name");
        assert_eq!(loaded.email, None);
        assert!(directory.resolve("missing").await.expect("resolve").is_none());
    }

    #[tokio::test]
    async fn static_directory_resolves_inserted_profiles() {
        let directory = StaticRecipientDirectory::new([profile("a", Some("a@example.com"))]);
        directory.insert(profile("b", None));
        assert!(directory.resolve("a").await.expect("a").is_some());
        assert!(directory.resolve("b").await.expect("b").is_some());
        assert!(directory.resolve("c").await.expect("c").is_none());
    }
}
