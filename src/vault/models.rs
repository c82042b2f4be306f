use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_SECRET_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    #[default]
    Pending,
    Active,
    Deprecated,
    Deleted,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_db(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            "deleted" => Ok(Self::Deleted),
            _ => Err(AppError::internal(format!(
                "Invalid secret version status in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub id: String,
    pub realm_id: String,
    pub name: String,
    pub group: String,
    pub description: Option<String>,
    pub path: String,
    pub cipher_alg: String,
    pub current_version: Option<i64>,
    pub previous_version: Option<i64>,
    pub max_version: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Version metadata. The encrypted material never leaves the vault.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretVersion {
    pub id: String,
    pub secret_id: String,
    pub version: i64,
    pub status: VersionStatus,
    pub cipher_alg: String,
    pub kek_version: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub wrapped_dek: Vec<u8>,
}

impl std::fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub meta: SecretVersion,
    pub payload: EncryptedPayload,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    pub name: String,
    pub group: String,
    pub description: Option<String>,
    pub path: String,
    pub value: String,
    pub custom_kek: Option<String>,
}

impl CreateSecretRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("Secret name is required"));
        }
        if self.group.trim().is_empty() {
            return Err(AppError::validation("Secret group is required"));
        }
        if self.path.trim().is_empty() {
            return Err(AppError::validation("Secret path is required"));
        }
        validate_value(&self.value)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecretRequest {
    pub name: Option<String>,
    pub group: Option<String>,
    pub description: Option<String>,
    pub path: Option<String>,
    /// New plaintext; requires `current_value` to match the active version.
    pub value: Option<String>,
    pub current_value: Option<String>,
    pub custom_kek: Option<String>,
}

impl UpdateSecretRequest {
    pub fn validate(&self) -> AppResult<()> {
        for (label, field) in [("name", &self.name), ("group", &self.group), ("path", &self.path)] {
            if matches!(field, Some(v) if v.trim().is_empty()) {
                return Err(AppError::validation(format!("Secret {} cannot be empty", label)));
            }
        }
        if let Some(value) = &self.value {
            validate_value(value)?;
            if self.current_value.is_none() {
                return Err(AppError::validation(
                    "Current value is required to change the secret value",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AddVersionRequest {
    pub value: String,
    pub custom_kek: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub custom_kek: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListSecretsRequest {
    pub search: Option<String>,
    pub group: Option<String>,
    pub path: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub fn validate_value(value: &str) -> AppResult<()> {
    if value.is_empty() {
        return Err(AppError::validation("Secret value is required"));
    }
    if value.len() > MAX_SECRET_BYTES {
        return Err(AppError::validation(format!(
            "Secret value exceeds {} bytes",
            MAX_SECRET_BYTES
        )));
    }
    Ok(())
}
