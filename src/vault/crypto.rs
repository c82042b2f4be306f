use crate::error::{AppError, AppResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const CIPHER_ALG: &str = "aes-256-gcm";
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// wrap_nonce ‖ wrapped_key ‖ wrap_tag
pub const WRAPPED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;

pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// Output of one AES-256-GCM seal with the tag split off the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

pub fn generate_key() -> KeyBytes {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill(key.as_mut_slice());
    key
}

pub fn key_from_slice(bytes: &[u8]) -> AppResult<KeyBytes> {
    if bytes.len() != KEY_LEN {
        return Err(AppError::configuration(format!(
            "Key must be exactly {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(bytes);
    Ok(key)
}

/// Hashes a caller supplied passphrase into a 32-byte key.
pub fn derive_custom_key(passphrase: &str) -> KeyBytes {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

pub fn seal(key: &[u8], plaintext: &[u8]) -> AppResult<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::configuration(format!("Failed to create cipher: {}", e)))?;

    let mut rng = rand::thread_rng();
    let nonce_bytes: [u8; NONCE_LEN] = rng.gen();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| AppError::internal(format!("Encryption failed: {}", e)))?;

    if ciphertext.len() < TAG_LEN {
        return Err(AppError::internal("Encryption produced a truncated ciphertext"));
    }
    let tag_bytes = ciphertext.split_off(ciphertext.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
        tag,
    })
}

/// Reverses [`seal`]. Any authentication failure is an integrity error and
/// no partial plaintext is returned.
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], tag: &[u8]) -> AppResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(AppError::integrity("Invalid nonce length"));
    }
    if tag.len() != TAG_LEN {
        return Err(AppError::integrity("Invalid authentication tag length"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::configuration(format!("Failed to create cipher: {}", e)))?;

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), combined.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| AppError::integrity("Decryption failed: authentication tag mismatch"))
}

pub fn wrap_key(kek: &[u8], dek: &[u8]) -> AppResult<Vec<u8>> {
    let sealed = seal(kek, dek)?;
    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(&sealed.nonce);
    wrapped.extend_from_slice(&sealed.ciphertext);
    wrapped.extend_from_slice(&sealed.tag);
    Ok(wrapped)
}

pub fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> AppResult<KeyBytes> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(AppError::integrity(format!(
            "Wrapped key must be {} bytes, got {}",
            WRAPPED_KEY_LEN,
            wrapped.len()
        )));
    }
    let (nonce, rest) = wrapped.split_at(NONCE_LEN);
    let (body, tag) = rest.split_at(KEY_LEN);
    let dek = open(kek, nonce, body, tag)?;
    key_from_slice(&dek).map_err(|_| AppError::integrity("Unwrapped key has the wrong length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_roundtrip() {
        let key = generate_key();
        let sealed = seal(key.as_slice(), b"hunter2").expect("seal");
        assert_eq!(sealed.ciphertext.len(), 7);
        let plain = open(key.as_slice(), &sealed.nonce, &sealed.ciphertext, &sealed.tag).expect("open");
        assert_eq!(plain.as_slice(), b"hunter2");
    }

    #[test]
    fn wrong_key_is_integrity_error() {
        let sealed = seal(generate_key().as_slice(), b"payload").expect("seal");
        let err = open(generate_key().as_slice(), &sealed.nonce, &sealed.ciphertext, &sealed.tag)
            .expect_err("must fail");
        assert!(matches!(err, AppError::Integrity(_)));
    }

    #[test]
    fn wrapped_key_layout_and_unwrap() {
        let kek = generate_key();
        let dek = generate_key();
        let wrapped = wrap_key(kek.as_slice(), dek.as_slice()).expect("wrap");
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);
        let unwrapped = unwrap_key(kek.as_slice(), &wrapped).expect("unwrap");
        assert_eq!(unwrapped.as_slice(), dek.as_slice());

        let mut tampered = wrapped.clone();
        tampered[NONCE_LEN + 3] ^= 0x01;
        assert!(matches!(
            unwrap_key(kek.as_slice(), &tampered),
            Err(AppError::Integrity(_))
        ));
        assert!(matches!(
            unwrap_key(kek.as_slice(), &wrapped[..40]),
            Err(AppError::Integrity(_))
        ));
    }

    #[test]
    fn custom_key_is_sha256_of_passphrase() {
        let a = derive_custom_key("correct horse");
        let b = derive_custom_key("correct horse");
        let c = derive_custom_key("battery staple");
        assert_eq!(a.as_slice(), b.as_slice());
        assert_ne!(a.as_slice(), c.as_slice());
    }

    #[test]
    fn key_from_slice_rejects_bad_length() {
        assert!(key_from_slice(&[0u8; 31]).is_err());
        assert!(key_from_slice(&[7u8; 32]).is_ok());
    }
}
