use crate::clock::{to_storage_precision, Clock};
use crate::db::trim_to_option;
use crate::error::{AppError, AppResult};
use crate::vault::crypto::{open, seal, unwrap_key, wrap_key, generate_key, CIPHER_ALG};
use crate::vault::keys::{Kek, KeyProvider, CUSTOM_KEK_VERSION};
use crate::vault::models::{
    validate_value, CreateSecretRequest, EncryptedPayload, ListSecretsRequest, Secret,
    SecretVersion, StoredVersion, UpdateSecretRequest,
};
use crate::vault::storage::{NewVersion, SecretStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Envelope encryption over AES-256-GCM with an explicit version lifecycle.
///
/// Every version has its own random DEK; the DEK is wrapped with a KEK from
/// the [`KeyProvider`] (or a caller supplied key, recorded as version 999).
/// Plaintext DEKs live only inside the synchronous encrypt/decrypt helpers
/// and are zeroized when they drop.
#[derive(Clone)]
pub struct SecretVault {
    store: SecretStore,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
}

impl SecretVault {
    pub fn new(store: SecretStore, keys: Arc<dyn KeyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        to_storage_precision(self.clock.now())
    }

    pub async fn create_secret(
        &self,
        realm_id: &str,
        actor: &str,
        request: CreateSecretRequest,
    ) -> AppResult<Secret> {
        request.validate()?;

        let now = self.now();
        let (payload, kek_version) = self.encrypt(&request.value, request.custom_kek.as_deref())?;
        let secret = Secret {
            id: uuid::Uuid::new_v4().to_string(),
            realm_id: realm_id.to_string(),
            name: request.name.trim().to_string(),
            group: request.group.trim().to_string(),
            description: request.description.and_then(trim_to_option),
            path: request.path.trim().to_string(),
            cipher_alg: CIPHER_ALG.to_string(),
            current_version: None,
            previous_version: None,
            max_version: 0,
            created_by: actor.to_string(),
            created_at: now,
            updated_by: actor.to_string(),
            updated_at: now,
        };

        let first = self
            .store
            .insert_secret(
                &secret,
                NewVersion {
                    cipher_alg: CIPHER_ALG.to_string(),
                    payload,
                    kek_version,
                    created_by: actor.to_string(),
                    created_at: now,
                },
            )
            .await?;

        log::info!(
            "Secret '{}' created in realm '{}' (version {}, kek {})",
            secret.name,
            realm_id,
            first.version,
            kek_version
        );

        Ok(Secret {
            current_version: Some(first.version),
            max_version: first.version,
            ..secret
        })
    }

    pub async fn get_secret(&self, realm_id: &str, secret_id: &str) -> AppResult<Secret> {
        self.store
            .get_secret(realm_id, secret_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Secret '{}' not found", secret_id)))
    }

    pub async fn search_secrets(
        &self,
        realm_id: &str,
        request: ListSecretsRequest,
    ) -> AppResult<Vec<Secret>> {
        self.store.list_secrets(realm_id, request).await
    }

    pub async fn list_versions(&self, realm_id: &str, secret_id: &str) -> AppResult<Vec<SecretVersion>> {
        let secret = self.get_secret(realm_id, secret_id).await?;
        self.store.list_versions(&secret.id).await
    }

    /// Stores a new version as pending. The current version is untouched.
    pub async fn add_pending_version(
        &self,
        realm_id: &str,
        secret_id: &str,
        actor: &str,
        value: &str,
        custom_kek: Option<&str>,
    ) -> AppResult<SecretVersion> {
        validate_value(value)?;
        let secret = self.get_secret(realm_id, secret_id).await?;
        let (payload, kek_version) = self.encrypt(value, custom_kek)?;

        let version = self
            .store
            .insert_pending_version(
                &secret.id,
                NewVersion {
                    cipher_alg: secret.cipher_alg.clone(),
                    payload,
                    kek_version,
                    created_by: actor.to_string(),
                    created_at: self.now(),
                },
            )
            .await?;

        log::info!(
            "Pending version {} added to secret '{}'",
            version.version,
            secret.id
        );
        Ok(version)
    }

    pub async fn activate_version(
        &self,
        realm_id: &str,
        secret_id: &str,
        version: i64,
        actor: &str,
    ) -> AppResult<Secret> {
        let secret = self.get_secret(realm_id, secret_id).await?;
        self.store
            .activate_version(&secret.id, version, actor, self.now())
            .await?;
        log::info!("Secret '{}' now serves version {}", secret.id, version);
        self.get_secret(realm_id, secret_id).await
    }

    /// Decrypts `version`, or the active version when `None`.
    pub async fn decrypt(
        &self,
        realm_id: &str,
        secret_id: &str,
        version: Option<i64>,
        custom_kek: Option<&str>,
    ) -> AppResult<Zeroizing<String>> {
        let secret = self.get_secret(realm_id, secret_id).await?;
        let stored = self.store.load_version(&secret, version).await?;
        if stored.meta.status == crate::vault::models::VersionStatus::Deleted {
            return Err(AppError::not_found(format!(
                "Version {} of secret '{}' not found",
                stored.meta.version, secret.id
            )));
        }
        self.open_version(&stored, custom_kek)
    }

    pub async fn delete_version(
        &self,
        realm_id: &str,
        secret_id: &str,
        version: i64,
    ) -> AppResult<()> {
        let secret = self.get_secret(realm_id, secret_id).await?;
        self.store
            .soft_delete_version(&secret.id, version, self.now())
            .await?;
        log::info!("Version {} of secret '{}' deleted", version, secret.id);
        Ok(())
    }

    /// Updates metadata; when a new value is supplied the caller must prove
    /// knowledge of the current one and a new active version is created.
    pub async fn update_secret(
        &self,
        realm_id: &str,
        secret_id: &str,
        actor: &str,
        request: UpdateSecretRequest,
    ) -> AppResult<Secret> {
        request.validate()?;
        let mut secret = self.get_secret(realm_id, secret_id).await?;

        if let Some(name) = request.name {
            secret.name = name.trim().to_string();
        }
        if let Some(group) = request.group {
            secret.group = group.trim().to_string();
        }
        if let Some(description) = request.description {
            secret.description = trim_to_option(description);
        }
        if let Some(path) = request.path {
            secret.path = path.trim().to_string();
        }
        secret.updated_by = actor.to_string();
        secret.updated_at = self.now();

        let Some(new_value) = request.value else {
            self.store.update_metadata(&secret).await?;
            return Ok(secret);
        };

        let current_value = request.current_value.unwrap_or_default();
        let current = self.store.load_version(&secret, None).await?;
        let actual = self.open_version(&current, request.custom_kek.as_deref())?;
        if actual.as_str() != current_value {
            return Err(AppError::validation("Current value does not match"));
        }
        drop(actual);

        let (payload, kek_version) = self.encrypt(&new_value, request.custom_kek.as_deref())?;
        let version = self
            .store
            .update_with_rotation(
                &secret,
                NewVersion {
                    cipher_alg: secret.cipher_alg.clone(),
                    payload,
                    kek_version,
                    created_by: actor.to_string(),
                    created_at: secret.updated_at,
                },
            )
            .await?;

        log::info!(
            "Secret '{}' rotated to version {}",
            secret.id,
            version.version
        );
        self.get_secret(realm_id, secret_id).await
    }

    /// Idempotent: deleting a missing secret succeeds.
    pub async fn delete_secret(&self, realm_id: &str, secret_id: &str) -> AppResult<()> {
        if self.store.delete_secret(realm_id, secret_id).await? {
            log::info!("Secret '{}' deleted from realm '{}'", secret_id, realm_id);
        }
        Ok(())
    }

    /// Rewraps every live version whose DEK is wrapped under an older
    /// process KEK so it is wrapped under the active one. Returns the
    /// number of rewrapped versions.
    pub async fn rewrap_all(&self) -> AppResult<usize> {
        let active = self.keys.active()?;
        let candidates = self.store.versions_needing_rewrap(active.version).await?;
        let mut rewrapped = 0usize;

        for stored in candidates {
            let wrapped = match self.rewrap_one(&stored, &active) {
                Ok(wrapped) => wrapped,
                Err(err) => {
                    log::error!(
                        "Failed to rewrap version {} of secret '{}': {}",
                        stored.meta.version,
                        stored.meta.secret_id,
                        err
                    );
                    continue;
                }
            };
            if self
                .store
                .replace_wrapped_dek(
                    &stored.meta.id,
                    stored.meta.kek_version,
                    active.version,
                    &wrapped,
                    self.now(),
                )
                .await?
            {
                rewrapped += 1;
            }
        }

        if rewrapped > 0 {
            log::info!("Rewrapped {} secret versions under KEK {}", rewrapped, active.version);
        }
        Ok(rewrapped)
    }

    fn rewrap_one(&self, stored: &StoredVersion, active: &Kek) -> AppResult<Vec<u8>> {
        let old = self.keys.resolve(stored.meta.kek_version)?;
        let dek = unwrap_key(old.key.as_slice(), &stored.payload.wrapped_dek)?;
        wrap_key(active.key.as_slice(), dek.as_slice())
    }

    fn encrypt(&self, plaintext: &str, custom_kek: Option<&str>) -> AppResult<(EncryptedPayload, u32)> {
        let kek = match custom_kek.filter(|k| !k.is_empty()) {
            Some(passphrase) => Kek::custom(passphrase),
            None => self.keys.active()?,
        };
        let dek = generate_key();
        let sealed = seal(dek.as_slice(), plaintext.as_bytes())?;
        let wrapped_dek = wrap_key(kek.key.as_slice(), dek.as_slice())?;

        Ok((
            EncryptedPayload {
                ciphertext: sealed.ciphertext,
                nonce: sealed.nonce.to_vec(),
                auth_tag: sealed.tag.to_vec(),
                wrapped_dek,
            },
            kek.version,
        ))
    }

    fn open_version(&self, stored: &StoredVersion, custom_kek: Option<&str>) -> AppResult<Zeroizing<String>> {
        let kek = if stored.meta.kek_version == CUSTOM_KEK_VERSION {
            match custom_kek.filter(|k| !k.is_empty()) {
                Some(passphrase) => Kek::custom(passphrase),
                None => {
                    return Err(AppError::validation(
                        "This version was encrypted with a custom key; supply it to decrypt",
                    ))
                }
            }
        } else {
            self.keys.resolve(stored.meta.kek_version)?
        };

        let dek = unwrap_key(kek.key.as_slice(), &stored.payload.wrapped_dek)?;
        let plaintext = open(
            dek.as_slice(),
            &stored.payload.nonce,
            &stored.payload.ciphertext,
            &stored.payload.auth_tag,
        )?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| AppError::integrity("Decrypted secret is not valid UTF-8"))?;
        Ok(Zeroizing::new(text.to_string()))
    }
}
