use crate::clock::timestamp_to_datetime;
use crate::db::{page_bounds, trim_to_option};
use crate::error::{AppError, AppResult};
use crate::vault::keys::CUSTOM_KEK_VERSION;
use crate::vault::models::{
    EncryptedPayload, ListSecretsRequest, Secret, SecretVersion, StoredVersion, VersionStatus,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    id TEXT PRIMARY KEY,
    realm_id TEXT NOT NULL,
    name TEXT NOT NULL,
    group_name TEXT NOT NULL,
    description TEXT,
    path TEXT NOT NULL,
    cipher_alg TEXT NOT NULL,
    current_version INTEGER,
    previous_version INTEGER,
    max_version INTEGER NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(realm_id, name)
);

CREATE TABLE IF NOT EXISTS secret_versions (
    id TEXT PRIMARY KEY,
    secret_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    cipher_alg TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    nonce TEXT NOT NULL,
    auth_tag TEXT NOT NULL,
    wrapped_dek TEXT NOT NULL,
    kek_version INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(secret_id, version),
    FOREIGN KEY (secret_id) REFERENCES secrets(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_secrets_realm_group ON secrets(realm_id, group_name);
CREATE INDEX IF NOT EXISTS idx_secret_versions_status ON secret_versions(secret_id, status);
"#;

const SECRET_COLUMNS: &str = "id, realm_id, name, group_name, description, path, cipher_alg, \
    current_version, previous_version, max_version, created_by, created_at, updated_by, updated_at";

const VERSION_COLUMNS: &str = "id, secret_id, version, status, cipher_alg, ciphertext, nonce, \
    auth_tag, wrapped_dek, kek_version, created_by, created_at, updated_at";

/// New version row handed to the store; the version number is allocated
/// inside the write transaction.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub cipher_alg: String,
    pub payload: EncryptedPayload,
    pub kek_version: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SecretStore {
    pool: Pool<Sqlite>,
}

impl SecretStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Persists the secret and its first version (active) atomically.
    pub async fn insert_secret(&self, secret: &Secret, first: NewVersion) -> AppResult<SecretVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start secret transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO secrets (
                id, realm_id, name, group_name, description, path, cipher_alg, current_version,
                previous_version, max_version, created_by, created_at, updated_by, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&secret.id)
        .bind(&secret.realm_id)
        .bind(&secret.name)
        .bind(&secret.group)
        .bind(&secret.description)
        .bind(&secret.path)
        .bind(&secret.cipher_alg)
        .bind(&secret.created_by)
        .bind(secret.created_at.timestamp())
        .bind(&secret.updated_by)
        .bind(secret.updated_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("create secret '{}'", secret.name), e))?;

        let actor = first.created_by.clone();
        let now = first.created_at;
        let version = insert_version_in_tx(&mut tx, &secret.id, first).await?;
        activate_in_tx(&mut tx, &secret.id, version.version, &actor, now).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit secret creation", e))?;

        Ok(SecretVersion {
            status: VersionStatus::Active,
            ..version
        })
    }

    pub async fn get_secret(&self, realm_id: &str, secret_id: &str) -> AppResult<Option<Secret>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM secrets WHERE id = ? AND realm_id = ?",
            SECRET_COLUMNS
        ))
        .bind(secret_id)
        .bind(realm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::storage("fetch secret", e))?;

        row.as_ref().map(row_to_secret).transpose()
    }

    pub async fn list_secrets(
        &self,
        realm_id: &str,
        request: ListSecretsRequest,
    ) -> AppResult<Vec<Secret>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM secrets WHERE realm_id = ",
            SECRET_COLUMNS
        ));
        qb.push_bind(realm_id.to_string());

        if let Some(group) = request.group.and_then(trim_to_option) {
            qb.push(" AND group_name = ").push_bind(group);
        }
        if let Some(path) = request.path.and_then(trim_to_option) {
            qb.push(" AND path = ").push_bind(path);
        }
        if let Some(search) = request.search.and_then(trim_to_option) {
            let pattern = format!("%{}%", search.to_lowercase());
            qb.push(" AND (lower(name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(COALESCE(description, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }

        let (limit, offset) = page_bounds(request.page, request.page_size);
        qb.push(" ORDER BY name ASC LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::storage("list secrets", e))?;

        rows.iter().map(row_to_secret).collect()
    }

    pub async fn update_metadata(&self, secret: &Secret) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE secrets
            SET name = ?, group_name = ?, description = ?, path = ?, updated_by = ?, updated_at = ?
            WHERE id = ? AND realm_id = ?
            "#,
        )
        .bind(&secret.name)
        .bind(&secret.group)
        .bind(&secret.description)
        .bind(&secret.path)
        .bind(&secret.updated_by)
        .bind(secret.updated_at.timestamp())
        .bind(&secret.id)
        .bind(&secret.realm_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("update secret '{}'", secret.id), e))?;
        Ok(())
    }

    /// Metadata update plus a new version that becomes active, in one
    /// transaction.
    pub async fn update_with_rotation(&self, secret: &Secret, next: NewVersion) -> AppResult<SecretVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start secret rotation", e))?;

        sqlx::query(
            r#"
            UPDATE secrets
            SET name = ?, group_name = ?, description = ?, path = ?, updated_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&secret.name)
        .bind(&secret.group)
        .bind(&secret.description)
        .bind(&secret.path)
        .bind(&secret.updated_by)
        .bind(secret.updated_at.timestamp())
        .bind(&secret.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("update secret '{}'", secret.id), e))?;

        let actor = next.created_by.clone();
        let now = next.created_at;
        let version = insert_version_in_tx(&mut tx, &secret.id, next).await?;
        activate_in_tx(&mut tx, &secret.id, version.version, &actor, now).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit secret rotation", e))?;

        Ok(SecretVersion {
            status: VersionStatus::Active,
            ..version
        })
    }

    pub async fn insert_pending_version(&self, secret_id: &str, next: NewVersion) -> AppResult<SecretVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start version transaction", e))?;
        let version = insert_version_in_tx(&mut tx, secret_id, next).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit pending version", e))?;
        Ok(version)
    }

    pub async fn activate_version(
        &self,
        secret_id: &str,
        version: i64,
        actor: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start activation transaction", e))?;
        activate_in_tx(&mut tx, secret_id, version, actor, now).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit version activation", e))
    }

    /// Loads one version; `None` selects the secret's current version.
    pub async fn load_version(&self, secret: &Secret, version: Option<i64>) -> AppResult<StoredVersion> {
        let target = match version.or(secret.current_version) {
            Some(v) => v,
            None => {
                return Err(AppError::not_found(format!(
                    "Secret '{}' has no active version",
                    secret.id
                )))
            }
        };

        let row = sqlx::query(&format!(
            "SELECT {} FROM secret_versions WHERE secret_id = ? AND version = ?",
            VERSION_COLUMNS
        ))
        .bind(&secret.id)
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::storage("fetch secret version", e))?;

        match row {
            Some(row) => row_to_stored_version(&row),
            None => Err(AppError::not_found(format!(
                "Version {} of secret '{}' not found",
                target, secret.id
            ))),
        }
    }

    pub async fn list_versions(&self, secret_id: &str) -> AppResult<Vec<SecretVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM secret_versions WHERE secret_id = ? ORDER BY version ASC",
            VERSION_COLUMNS
        ))
        .bind(secret_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list secret versions", e))?;

        rows.iter()
            .map(|row| row_to_stored_version(row).map(|stored| stored.meta))
            .collect()
    }

    /// Soft delete. Refuses the active version; deleting twice is a no-op.
    pub async fn soft_delete_version(
        &self,
        secret_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start version delete", e))?;

        let status = fetch_version_status(&mut tx, secret_id, version).await?;
        match status {
            VersionStatus::Active => {
                return Err(AppError::validation(format!(
                    "Version {} is active and cannot be deleted",
                    version
                )))
            }
            VersionStatus::Deleted => return Ok(()),
            VersionStatus::Pending | VersionStatus::Deprecated => {}
        }

        sqlx::query(
            "UPDATE secret_versions SET status = 'deleted', updated_at = ? WHERE secret_id = ? AND version = ?",
        )
        .bind(now.timestamp())
        .bind(secret_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::storage(format!("delete version {}", version), e))?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit version delete", e))
    }

    /// Returns whether a row was removed.
    pub async fn delete_secret(&self, realm_id: &str, secret_id: &str) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::storage("start secret delete", e))?;

        let owned = sqlx::query("SELECT 1 FROM secrets WHERE id = ? AND realm_id = ?")
            .bind(secret_id)
            .bind(realm_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::storage("check secret ownership", e))?;
        if owned.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM secret_versions WHERE secret_id = ?")
            .bind(secret_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("delete versions of '{}'", secret_id), e))?;
        sqlx::query("DELETE FROM secrets WHERE id = ?")
            .bind(secret_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::storage(format!("delete secret '{}'", secret_id), e))?;

        tx.commit()
            .await
            .map_err(|e| AppError::storage("commit secret delete", e))?;
        Ok(true)
    }

    /// Live versions wrapped under a process KEK other than `active_kek`.
    pub async fn versions_needing_rewrap(&self, active_kek: u32) -> AppResult<Vec<StoredVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM secret_versions WHERE kek_version != ? AND kek_version != ? AND status != 'deleted' ORDER BY secret_id, version",
            VERSION_COLUMNS
        ))
        .bind(active_kek as i64)
        .bind(CUSTOM_KEK_VERSION as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::storage("list versions for rewrap", e))?;

        rows.iter().map(row_to_stored_version).collect()
    }

    /// Swaps the wrapped DEK only if the row still carries `from_kek`.
    pub async fn replace_wrapped_dek(
        &self,
        version_id: &str,
        from_kek: u32,
        to_kek: u32,
        wrapped_dek: &[u8],
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE secret_versions SET wrapped_dek = ?, kek_version = ?, updated_at = ? WHERE id = ? AND kek_version = ?",
        )
        .bind(BASE64.encode(wrapped_dek))
        .bind(to_kek as i64)
        .bind(now.timestamp())
        .bind(version_id)
        .bind(from_kek as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::storage(format!("rewrap version '{}'", version_id), e))?;
        Ok(result.rows_affected() == 1)
    }
}

async fn insert_version_in_tx(
    conn: &mut SqliteConnection,
    secret_id: &str,
    next: NewVersion,
) -> AppResult<SecretVersion> {
    let version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM secret_versions WHERE secret_id = ?",
    )
    .bind(secret_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::storage("allocate secret version", e))?;

    let meta = SecretVersion {
        id: uuid::Uuid::new_v4().to_string(),
        secret_id: secret_id.to_string(),
        version,
        status: VersionStatus::Pending,
        cipher_alg: next.cipher_alg,
        kek_version: next.kek_version,
        created_by: next.created_by,
        created_at: next.created_at,
        updated_at: next.created_at,
    };

    sqlx::query(
        r#"
        INSERT INTO secret_versions (
            id, secret_id, version, status, cipher_alg, ciphertext, nonce, auth_tag,
            wrapped_dek, kek_version, created_by, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&meta.id)
    .bind(&meta.secret_id)
    .bind(meta.version)
    .bind(meta.status.as_str())
    .bind(&meta.cipher_alg)
    .bind(BASE64.encode(&next.payload.ciphertext))
    .bind(BASE64.encode(&next.payload.nonce))
    .bind(BASE64.encode(&next.payload.auth_tag))
    .bind(BASE64.encode(&next.payload.wrapped_dek))
    .bind(meta.kek_version as i64)
    .bind(&meta.created_by)
    .bind(meta.created_at.timestamp())
    .bind(meta.updated_at.timestamp())
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage(format!("insert version {} of '{}'", version, secret_id), e))?;

    let updated = sqlx::query(
        "UPDATE secrets SET max_version = ?, updated_by = ?, updated_at = ? WHERE id = ?",
    )
    .bind(version)
    .bind(&meta.created_by)
    .bind(meta.created_at.timestamp())
    .bind(secret_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage("bump secret max version", e))?;
    if updated.rows_affected() == 0 {
        return Err(AppError::not_found(format!("Secret '{}' not found", secret_id)));
    }

    Ok(meta)
}

async fn fetch_version_status(
    conn: &mut SqliteConnection,
    secret_id: &str,
    version: i64,
) -> AppResult<VersionStatus> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM secret_versions WHERE secret_id = ? AND version = ?",
    )
    .bind(secret_id)
    .bind(version)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::storage("fetch version status", e))?;

    match status {
        Some(status) => VersionStatus::from_db(&status),
        None => Err(AppError::not_found(format!(
            "Version {} of secret '{}' not found",
            version, secret_id
        ))),
    }
}

/// Deprecates the current active version and promotes `version`. Callers
/// own the transaction, so readers see either the old or the new pair.
async fn activate_in_tx(
    conn: &mut SqliteConnection,
    secret_id: &str,
    version: i64,
    actor: &str,
    now: DateTime<Utc>,
) -> AppResult<()> {
    match fetch_version_status(&mut *conn, secret_id, version).await? {
        VersionStatus::Active => return Ok(()),
        VersionStatus::Deleted => {
            return Err(AppError::validation(format!(
                "Version {} is deleted and cannot be activated",
                version
            )))
        }
        VersionStatus::Pending | VersionStatus::Deprecated => {}
    }

    let previous: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM secret_versions WHERE secret_id = ? AND status = 'active'",
    )
    .bind(secret_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::storage("fetch active version", e))?;

    sqlx::query(
        "UPDATE secret_versions SET status = 'deprecated', updated_at = ? WHERE secret_id = ? AND status = 'active'",
    )
    .bind(now.timestamp())
    .bind(secret_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage("deprecate active version", e))?;

    sqlx::query(
        "UPDATE secret_versions SET status = 'active', updated_at = ? WHERE secret_id = ? AND version = ?",
    )
    .bind(now.timestamp())
    .bind(secret_id)
    .bind(version)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage(format!("activate version {}", version), e))?;

    sqlx::query(
        r#"
        UPDATE secrets
        SET previous_version = COALESCE(?, previous_version), current_version = ?, updated_by = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(previous)
    .bind(version)
    .bind(actor)
    .bind(now.timestamp())
    .bind(secret_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::storage("update secret version pointers", e))?;

    Ok(())
}

fn row_to_secret(row: &SqliteRow) -> AppResult<Secret> {
    let map = |e: sqlx::Error| AppError::storage("decode secret row", e);
    Ok(Secret {
        id: row.try_get("id").map_err(map)?,
        realm_id: row.try_get("realm_id").map_err(map)?,
        name: row.try_get("name").map_err(map)?,
        group: row.try_get("group_name").map_err(map)?,
        description: row.try_get("description").map_err(map)?,
        path: row.try_get("path").map_err(map)?,
        cipher_alg: row.try_get("cipher_alg").map_err(map)?,
        current_version: row.try_get("current_version").map_err(map)?,
        previous_version: row.try_get("previous_version").map_err(map)?,
        max_version: row.try_get("max_version").map_err(map)?,
        created_by: row.try_get("created_by").map_err(map)?,
        created_at: timestamp_to_datetime(row.try_get("created_at").map_err(map)?),
        updated_by: row.try_get("updated_by").map_err(map)?,
        updated_at: timestamp_to_datetime(row.try_get("updated_at").map_err(map)?),
    })
}

fn row_to_stored_version(row: &SqliteRow) -> AppResult<StoredVersion> {
    let map = |e: sqlx::Error| AppError::storage("decode secret version row", e);
    let decode = |column: &str| -> AppResult<Vec<u8>> {
        let raw: String = row.try_get(column).map_err(map)?;
        BASE64
            .decode(raw)
            .map_err(|_| AppError::integrity(format!("Column {} is not valid base64", column)))
    };
    let kek_version: i64 = row.try_get("kek_version").map_err(map)?;
    let status: String = row.try_get("status").map_err(map)?;

    Ok(StoredVersion {
        meta: SecretVersion {
            id: row.try_get("id").map_err(map)?,
            secret_id: row.try_get("secret_id").map_err(map)?,
            version: row.try_get("version").map_err(map)?,
            status: VersionStatus::from_db(&status)?,
            cipher_alg: row.try_get("cipher_alg").map_err(map)?,
            kek_version: u32::try_from(kek_version)
                .map_err(|_| AppError::integrity(format!("Invalid kek_version {}", kek_version)))?,
            created_by: row.try_get("created_by").map_err(map)?,
            created_at: timestamp_to_datetime(row.try_get("created_at").map_err(map)?),
            updated_at: timestamp_to_datetime(row.try_get("updated_at").map_err(map)?),
        },
        payload: EncryptedPayload {
            ciphertext: decode("ciphertext")?,
            nonce: decode("nonce")?,
            auth_tag: decode("auth_tag")?,
            wrapped_dek: decode("wrapped_dek")?,
        },
    })
}
