use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::config::STORAGE_PREFIX;
use crate::errors::{AuthError, Result};
use crate::scope::ScopeFingerprint;
use crate::store::StorageKey;

const AAD_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;

/// AES-256 key (32 bytes)
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Fresh key from the OS random source
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key)
            .map_err(|e| AuthError::Crypto(format!("OS random source unavailable: {}", e)))?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Raw key bytes (sensitive)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Nonce and ciphertext of one sealed refresh token
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedBlob {
    /// Base64url nonce (12 bytes)
    pub nonce: String,
    /// Base64url ciphertext with the GCM tag appended
    pub ciphertext: String,
    pub aad_version: String,
}

/// `loopauth|v1|{storage key}|{scope fingerprint}`
fn associated_data(version: &str, key: &StorageKey, fingerprint: &ScopeFingerprint) -> String {
    format!(
        "{}|{}|{}|{}",
        STORAGE_PREFIX,
        version,
        key.as_str(),
        fingerprint.as_str()
    )
}

/// Seal `plaintext` with AES-256-GCM, binding it to the entry it belongs to
pub fn encrypt(
    key: &EncryptionKey,
    plaintext: &[u8],
    storage_key: &StorageKey,
    fingerprint: &ScopeFingerprint,
) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes)
        .map_err(|e| AuthError::Crypto(format!("OS random source unavailable: {}", e)))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = associated_data(AAD_VERSION, storage_key, fingerprint);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| AuthError::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedBlob {
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        aad_version: AAD_VERSION.to_string(),
    })
}

/// Open a blob sealed by [`encrypt`]
///
/// Any mismatch of key, entry or fingerprint yields `CorruptedStore`.
pub fn decrypt(
    key: &EncryptionKey,
    blob: &EncryptedBlob,
    storage_key: &StorageKey,
    fingerprint: &ScopeFingerprint,
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&blob.nonce)
        .map_err(|_| AuthError::CorruptedStore)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(AuthError::CorruptedStore);
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = URL_SAFE_NO_PAD
        .decode(&blob.ciphertext)
        .map_err(|_| AuthError::CorruptedStore)?;

    let aad = associated_data(&blob.aad_version, storage_key, fingerprint);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| AuthError::CorruptedStore)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (StorageKey, ScopeFingerprint) {
        (
            StorageKey::for_user("client", "https://idp.example.com", "alice"),
            ScopeFingerprint::new("openid offline_access"),
        )
    }

    #[test]
    fn test_seal_and_open() {
        let key = EncryptionKey::generate().unwrap();
        let (storage_key, fp) = entry();

        let blob = encrypt(&key, b"RT1", &storage_key, &fp).unwrap();
        let opened = decrypt(&key, &blob, &storage_key, &fp).unwrap();
        assert_eq!(opened.as_slice(), b"RT1");
    }

    #[test]
    fn test_wrong_key_fails() {
        let (storage_key, fp) = entry();
        let blob = encrypt(&EncryptionKey::generate().unwrap(), b"RT1", &storage_key, &fp).unwrap();

        let result = decrypt(&EncryptionKey::generate().unwrap(), &blob, &storage_key, &fp);
        assert!(matches!(result, Err(AuthError::CorruptedStore)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate().unwrap();
        let (storage_key, fp) = entry();
        let mut blob = encrypt(&key, b"RT1", &storage_key, &fp).unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&blob.ciphertext).unwrap();
        bytes[0] ^= 0xFF;
        blob.ciphertext = URL_SAFE_NO_PAD.encode(bytes);

        assert!(matches!(
            decrypt(&key, &blob, &storage_key, &fp),
            Err(AuthError::CorruptedStore)
        ));
    }

    #[test]
    fn test_swapped_fingerprint_fails() {
        let key = EncryptionKey::generate().unwrap();
        let (storage_key, fp) = entry();
        let blob = encrypt(&key, b"RT1", &storage_key, &fp).unwrap();

        let result = decrypt(&key, &blob, &storage_key, &ScopeFingerprint::new("openid"));
        assert!(matches!(result, Err(AuthError::CorruptedStore)));
    }

    #[test]
    fn test_other_entry_fails() {
        let key = EncryptionKey::generate().unwrap();
        let (storage_key, fp) = entry();
        let blob = encrypt(&key, b"RT1", &storage_key, &fp).unwrap();

        let other = StorageKey::for_user("client", "https://idp.example.com", "bob");
        assert!(matches!(
            decrypt(&key, &blob, &other, &fp),
            Err(AuthError::CorruptedStore)
        ));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", key), "EncryptionKey([REDACTED])");
    }
}
