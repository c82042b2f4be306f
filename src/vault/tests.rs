use super::*;
use crate::clock::{Clock, ManualClock};
use crate::error::AppError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{TimeZone, Utc};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

const REALM: &str = "realm-a";
const ADMIN: &str = "admin-1";

async fn test_vault_with(keys: KeyRing) -> (SecretVault, Pool<Sqlite>) {
    let pool = crate::db::memory_pool().await.expect("memory pool");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    ));
    let vault = SecretVault::new(SecretStore::new(pool.clone()), Arc::new(keys), clock);
    (vault, pool)
}

async fn test_vault() -> (SecretVault, Pool<Sqlite>) {
    test_vault_with(KeyRing::new(1, [7u8; 32]).expect("ring")).await
}

fn create_request(name: &str, value: &str) -> CreateSecretRequest {
    CreateSecretRequest {
        name: name.to_string(),
        group: "infra".to_string(),
        description: Some("database password".to_string()),
        path: "/prod/db".to_string(),
        value: value.to_string(),
        custom_kek: None,
    }
}

async fn flip_first_byte(pool: &Pool<Sqlite>, secret_id: &str, column: &str) {
    let raw: String = sqlx::query_scalar(&format!(
        "SELECT {} FROM secret_versions WHERE secret_id = ? AND version = 1",
        column
    ))
    .bind(secret_id)
    .fetch_one(pool)
    .await
    .expect("read column");
    let mut bytes = BASE64.decode(raw).expect("base64");
    bytes[0] ^= 0x80;
    sqlx::query(&format!(
        "UPDATE secret_versions SET {} = ? WHERE secret_id = ? AND version = 1",
        column
    ))
    .bind(BASE64.encode(bytes))
    .bind(secret_id)
    .execute(pool)
    .await
    .expect("tamper column");
}

#[tokio::test]
async fn create_then_decrypt_roundtrip() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("db-password", "s3cr3t!"))
        .await
        .expect("create");

    assert_eq!(secret.current_version, Some(1));
    assert_eq!(secret.previous_version, None);
    assert_eq!(secret.cipher_alg, "aes-256-gcm");

    let plain = vault
        .decrypt(REALM, &secret.id, None, None)
        .await
        .expect("decrypt");
    assert_eq!(plain.as_str(), "s3cr3t!");

    let versions = vault.list_versions(REALM, &secret.id).await.expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, VersionStatus::Active);
    assert_eq!(versions[0].kek_version, 1);
}

#[tokio::test]
async fn large_plaintext_roundtrip_and_limit() {
    let (vault, _pool) = test_vault().await;
    let big = "x".repeat(MAX_SECRET_BYTES);
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("big", &big))
        .await
        .expect("create big");
    let plain = vault.decrypt(REALM, &secret.id, None, None).await.expect("decrypt");
    assert_eq!(plain.len(), MAX_SECRET_BYTES);

    let too_big = "x".repeat(MAX_SECRET_BYTES + 1);
    let err = vault
        .create_secret(REALM, ADMIN, create_request("too-big", &too_big))
        .await
        .expect_err("over limit");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn tampering_any_field_is_an_integrity_error() {
    for column in ["ciphertext", "nonce", "auth_tag", "wrapped_dek"] {
        let (vault, pool) = test_vault().await;
        let secret = vault
            .create_secret(REALM, ADMIN, create_request("tampered", "value"))
            .await
            .expect("create");
        flip_first_byte(&pool, &secret.id, column).await;

        let err = vault
            .decrypt(REALM, &secret.id, None, None)
            .await
            .expect_err("tampered decrypt must fail");
        assert!(
            matches!(err, AppError::Integrity(_)),
            "column {} produced {:?}",
            column,
            err
        );
    }
}

#[tokio::test]
async fn activation_deprecates_previous_atomically() {
    let (vault, pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("api-token", "v1"))
        .await
        .expect("create");
    let pending = vault
        .add_pending_version(REALM, &secret.id, ADMIN, "v2", None)
        .await
        .expect("pending");
    assert_eq!(pending.version, 2);
    assert_eq!(pending.status, VersionStatus::Pending);

    let before = vault.get_secret(REALM, &secret.id).await.expect("get");
    assert_eq!(before.current_version, Some(1));
    assert_eq!(
        vault.decrypt(REALM, &secret.id, None, None).await.expect("v1").as_str(),
        "v1"
    );

    let after = vault
        .activate_version(REALM, &secret.id, 2, ADMIN)
        .await
        .expect("activate");
    assert_eq!(after.current_version, Some(2));
    assert_eq!(after.previous_version, Some(1));

    let versions = vault.list_versions(REALM, &secret.id).await.expect("versions");
    assert_eq!(versions[0].status, VersionStatus::Deprecated);
    assert_eq!(versions[1].status, VersionStatus::Active);

    let active_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM secret_versions WHERE secret_id = ? AND status = 'active'",
    )
    .bind(&secret.id)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(active_count, 1);

    assert_eq!(
        vault.decrypt(REALM, &secret.id, None, None).await.expect("v2").as_str(),
        "v2"
    );
    assert_eq!(
        vault.decrypt(REALM, &secret.id, Some(1), None).await.expect("old").as_str(),
        "v1"
    );
}

#[tokio::test]
async fn version_numbers_are_gap_free() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("rotating", "v1"))
        .await
        .expect("create");
    for expected in 2..=5 {
        let version = vault
            .add_pending_version(REALM, &secret.id, ADMIN, &format!("v{}", expected), None)
            .await
            .expect("pending");
        assert_eq!(version.version, expected);
    }
    vault.delete_version(REALM, &secret.id, 5).await.expect("delete v5");
    let next = vault
        .add_pending_version(REALM, &secret.id, ADMIN, "v6", None)
        .await
        .expect("pending after delete");
    assert_eq!(next.version, 6);
}

#[tokio::test]
async fn deleting_active_version_is_refused() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("guarded", "v1"))
        .await
        .expect("create");
    let err = vault
        .delete_version(REALM, &secret.id, 1)
        .await
        .expect_err("active delete");
    assert!(matches!(err, AppError::Validation(_)));

    vault
        .add_pending_version(REALM, &secret.id, ADMIN, "v2", None)
        .await
        .expect("pending");
    vault.delete_version(REALM, &secret.id, 2).await.expect("delete pending");
    vault.delete_version(REALM, &secret.id, 2).await.expect("delete twice");

    let err = vault
        .decrypt(REALM, &secret.id, Some(2), None)
        .await
        .expect_err("deleted version");
    assert!(matches!(err, AppError::NotFound(_)));
    let err = vault
        .activate_version(REALM, &secret.id, 2, ADMIN)
        .await
        .expect_err("activate deleted");
    assert!(matches!(err, AppError::Validation(_)));
    let err = vault
        .decrypt(REALM, &secret.id, Some(42), None)
        .await
        .expect_err("unknown version");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn missing_kek_is_configuration_error() {
    let (vault, _pool) = test_vault_with(KeyRing::empty()).await;
    let err = vault
        .create_secret(REALM, ADMIN, create_request("no-kek", "value"))
        .await
        .expect_err("no kek");
    assert!(matches!(err, AppError::Configuration(_)));
}

#[tokio::test]
async fn duplicate_name_in_realm_conflicts() {
    let (vault, _pool) = test_vault().await;
    vault
        .create_secret(REALM, ADMIN, create_request("dup", "a"))
        .await
        .expect("first");
    let err = vault
        .create_secret(REALM, ADMIN, create_request("dup", "b"))
        .await
        .expect_err("second");
    assert!(matches!(err, AppError::Conflict(_)));
    vault
        .create_secret("realm-b", ADMIN, create_request("dup", "c"))
        .await
        .expect("other realm is independent");
}

#[tokio::test]
async fn secrets_are_realm_scoped() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("scoped", "v"))
        .await
        .expect("create");
    let err = vault
        .decrypt("other", &secret.id, None, None)
        .await
        .expect_err("foreign realm");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn custom_kek_versions_need_the_passphrase() {
    let (vault, _pool) = test_vault().await;
    let mut request = create_request("personal", "mine");
    request.custom_kek = Some("open sesame".to_string());
    let secret = vault.create_secret(REALM, ADMIN, request).await.expect("create");

    let versions = vault.list_versions(REALM, &secret.id).await.expect("versions");
    assert_eq!(versions[0].kek_version, CUSTOM_KEK_VERSION);

    assert!(matches!(
        vault.decrypt(REALM, &secret.id, None, None).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        vault.decrypt(REALM, &secret.id, None, Some("wrong")).await,
        Err(AppError::Integrity(_))
    ));
    assert_eq!(
        vault
            .decrypt(REALM, &secret.id, None, Some("open sesame"))
            .await
            .expect("decrypt")
            .as_str(),
        "mine"
    );
}

#[tokio::test]
async fn update_rotates_value_after_verifying_current() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("smtp", "old-pass"))
        .await
        .expect("create");

    let err = vault
        .update_secret(
            REALM,
            &secret.id,
            ADMIN,
            UpdateSecretRequest {
                value: Some("new-pass".to_string()),
                current_value: Some("guess".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect_err("wrong current value");
    assert!(matches!(err, AppError::Validation(_)));

    let updated = vault
        .update_secret(
            REALM,
            &secret.id,
            ADMIN,
            UpdateSecretRequest {
                description: Some("rotated".to_string()),
                value: Some("new-pass".to_string()),
                current_value: Some("old-pass".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("rotate");
    assert_eq!(updated.current_version, Some(2));
    assert_eq!(updated.previous_version, Some(1));
    assert_eq!(updated.description.as_deref(), Some("rotated"));
    assert_eq!(
        vault.decrypt(REALM, &secret.id, None, None).await.expect("new").as_str(),
        "new-pass"
    );
}

#[tokio::test]
async fn rewrap_moves_versions_to_active_kek() {
    let pool = crate::db::memory_pool().await.expect("memory pool");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    ));
    let old_ring = KeyRing::new(1, [1u8; 32]).expect("old ring");
    let old_vault = SecretVault::new(SecretStore::new(pool.clone()), Arc::new(old_ring), clock.clone());
    let secret = old_vault
        .create_secret(REALM, ADMIN, create_request("rotate-kek", "payload"))
        .await
        .expect("create");

    let new_ring = KeyRing::new(2, [2u8; 32])
        .and_then(|ring| ring.with_historical(1, [1u8; 32]))
        .expect("new ring");
    let vault = SecretVault::new(SecretStore::new(pool.clone()), Arc::new(new_ring), clock);

    assert_eq!(vault.rewrap_all().await.expect("rewrap"), 1);
    assert_eq!(vault.rewrap_all().await.expect("second rewrap"), 0);

    let versions = vault.list_versions(REALM, &secret.id).await.expect("versions");
    assert_eq!(versions[0].kek_version, 2);

    let only_new = KeyRing::new(2, [2u8; 32]).expect("only new");
    let fresh = SecretVault::new(
        SecretStore::new(pool),
        Arc::new(only_new),
        Arc::new(ManualClock::new(Utc::now())),
    );
    assert_eq!(
        fresh.decrypt(REALM, &secret.id, None, None).await.expect("decrypt").as_str(),
        "payload"
    );
}

#[tokio::test]
async fn delete_secret_is_idempotent() {
    let (vault, _pool) = test_vault().await;
    let secret = vault
        .create_secret(REALM, ADMIN, create_request("temp", "v"))
        .await
        .expect("create");
    vault.delete_secret(REALM, &secret.id).await.expect("delete");
    vault.delete_secret(REALM, &secret.id).await.expect("delete again");
    assert!(matches!(
        vault.get_secret(REALM, &secret.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn create_requires_name_group_and_path() {
    let (vault, _pool) = test_vault().await;
    let mut request = create_request("", "v");
    assert!(matches!(
        vault.create_secret(REALM, ADMIN, request.clone()).await,
        Err(AppError::Validation(_))
    ));
    request.name = "ok".to_string();
    request.group = " ".to_string();
    assert!(matches!(
        vault.create_secret(REALM, ADMIN, request.clone()).await,
        Err(AppError::Validation(_))
    ));
    request.group = "g".to_string();
    request.path = String::new();
    assert!(matches!(
        vault.create_secret(REALM, ADMIN, request).await,
        Err(AppError::Validation(_))
    ));
}
