use crate::error::{AppError, AppResult};
use crate::vault::crypto::{derive_custom_key, key_from_slice, KeyBytes, KEY_LEN};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::BTreeMap;
use std::env;
use std::fmt;

/// Version recorded on secret versions whose DEK is wrapped with a caller
/// supplied key instead of the process KEK.
pub const CUSTOM_KEK_VERSION: u32 = 999;
pub const DEFAULT_KEK_VERSION: u32 = 1;

/// A key-encryption key and the version it is recorded under.
#[derive(Clone)]
pub struct Kek {
    pub version: u32,
    pub key: KeyBytes,
}

impl Kek {
    pub fn custom(passphrase: &str) -> Self {
        Self {
            version: CUSTOM_KEK_VERSION,
            key: derive_custom_key(passphrase),
        }
    }
}

impl fmt::Debug for Kek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kek")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub trait KeyProvider: Send + Sync {
    /// The KEK new versions are wrapped with.
    fn active(&self) -> AppResult<Kek>;

    /// Any KEK a stored version may reference.
    fn resolve(&self, version: u32) -> AppResult<Kek>;
}

/// In-process set of KEKs: one active version plus historical ones kept for
/// decrypting older rows.
#[derive(Clone, Default)]
pub struct KeyRing {
    active: Option<u32>,
    keys: BTreeMap<u32, KeyBytes>,
}

impl KeyRing {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(version: u32, key: [u8; KEY_LEN]) -> AppResult<Self> {
        validate_version(version)?;
        let mut keys = BTreeMap::new();
        keys.insert(version, key_from_slice(&key)?);
        Ok(Self {
            active: Some(version),
            keys,
        })
    }

    pub fn with_historical(mut self, version: u32, key: [u8; KEY_LEN]) -> AppResult<Self> {
        validate_version(version)?;
        self.keys.insert(version, key_from_slice(&key)?);
        Ok(self)
    }

    pub fn from_env() -> AppResult<Self> {
        Self::from_vars(env::vars())
    }

    /// Reads `KEK_BASE64`/`KEK` with `KEK_VERSION` for the active key and
    /// `KEK_BASE64_<n>`/`KEK_<n>` for historical ones. A missing active key
    /// is not an error here; it surfaces on first use.
    pub fn from_vars<I>(vars: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let mut ring = Self::empty();

        for (name, value) in &vars {
            let (version, encoded) = if let Some(rest) = name.strip_prefix("KEK_BASE64_") {
                (rest, true)
            } else if let Some(rest) = name.strip_prefix("KEK_") {
                (rest, false)
            } else {
                continue;
            };
            let Ok(version) = version.parse::<u32>() else {
                continue;
            };
            validate_version(version)?;
            if !encoded && ring.keys.contains_key(&version) {
                continue;
            }
            ring.keys.insert(version, parse_key_material(name, value, encoded)?);
        }

        let active_material = match (vars.get("KEK_BASE64"), vars.get("KEK")) {
            (Some(value), _) if !value.trim().is_empty() => {
                Some(parse_key_material("KEK_BASE64", value, true)?)
            }
            (_, Some(value)) if !value.is_empty() => Some(parse_key_material("KEK", value, false)?),
            _ => None,
        };

        if let Some(key) = active_material {
            let version = match vars.get("KEK_VERSION").map(|v| v.trim()) {
                Some(raw) if !raw.is_empty() => raw.parse::<u32>().map_err(|e| {
                    AppError::configuration(format!("Invalid KEK_VERSION '{}': {}", raw, e))
                })?,
                _ => DEFAULT_KEK_VERSION,
            };
            validate_version(version)?;
            ring.keys.insert(version, key);
            ring.active = Some(version);
        }

        log::info!(
            "Key ring loaded: active={:?}, versions={:?}",
            ring.active,
            ring.keys.keys().collect::<Vec<_>>()
        );
        Ok(ring)
    }
}

impl KeyProvider for KeyRing {
    fn active(&self) -> AppResult<Kek> {
        let version = self
            .active
            .ok_or_else(|| AppError::configuration("KEK not configured: set KEK_BASE64 or KEK"))?;
        self.resolve(version)
    }

    fn resolve(&self, version: u32) -> AppResult<Kek> {
        if version == CUSTOM_KEK_VERSION {
            return Err(AppError::configuration(
                "This version was encrypted with a custom key; supply it to decrypt",
            ));
        }
        self.keys
            .get(&version)
            .map(|key| Kek {
                version,
                key: key.clone(),
            })
            .ok_or_else(|| {
                AppError::configuration(format!(
                    "KEK version {} is not available: set KEK_BASE64_{} or KEK_{}",
                    version, version, version
                ))
            })
    }
}

fn validate_version(version: u32) -> AppResult<()> {
    if version == 0 {
        return Err(AppError::configuration("KEK version must be at least 1"));
    }
    if version == CUSTOM_KEK_VERSION {
        return Err(AppError::configuration(format!(
            "KEK version {} is reserved for custom keys",
            CUSTOM_KEK_VERSION
        )));
    }
    Ok(())
}

fn parse_key_material(name: &str, value: &str, encoded: bool) -> AppResult<KeyBytes> {
    if encoded {
        let decoded = zeroize::Zeroizing::new(
            BASE64
                .decode(value.trim())
                .map_err(|e| AppError::configuration(format!("{} is not valid base64: {}", name, e)))?,
        );
        key_from_slice(&decoded)
            .map_err(|_| AppError::configuration(format!("{} must decode to {} bytes", name, KEY_LEN)))
    } else {
        key_from_slice(value.as_bytes())
            .map_err(|_| AppError::configuration(format!("{} must be exactly {} bytes", name, KEY_LEN)))
    }
}
