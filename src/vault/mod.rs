pub mod crypto;
pub mod keys;
pub mod models;
mod service;
pub mod storage;

pub use keys::{KeyProvider, KeyRing, CUSTOM_KEK_VERSION};
pub use models::*;
pub use service::SecretVault;
pub use storage::SecretStore;

#[cfg(test)]
mod tests;
