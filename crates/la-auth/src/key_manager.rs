use std::path::Path;
use std::sync::Arc;

use argon2::{Argon2, Params};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::crypto::EncryptionKey;
use crate::errors::{AuthError, Result};
use crate::secret::SecretProvider;

const SALT_LEN: usize = 32;
const META_FILE: &str = "meta.json";

#[cfg(feature = "keyring-support")]
const KEYRING_SERVICE: &str = "loopauth";
#[cfg(feature = "keyring-support")]
const KEYRING_ACCOUNT: &str = "file-store-key:v1";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // m=64MB, t=3, p=1
        Self {
            m_cost: 65536,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

/// Where the file store key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// OS keyring, falling back to a passphrase when the keyring is unusable
    #[cfg(feature = "keyring-support")]
    Keyring,
    /// Always derive from a passphrase
    Passphrase,
}

impl Default for KeySource {
    fn default() -> Self {
        #[cfg(feature = "keyring-support")]
        {
            Self::Keyring
        }
        #[cfg(not(feature = "keyring-support"))]
        {
            Self::Passphrase
        }
    }
}

/// Persisted alongside the entries; holds no secrets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Base64 salt for Argon2id, present once a passphrase key was derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_salt: Option<String>,
    #[serde(default)]
    pub kdf: KdfParams,
}

impl KeyMeta {
    fn new(kdf: KdfParams) -> Self {
        Self {
            version: 1,
            created_at: chrono::Utc::now(),
            passphrase_salt: None,
            kdf,
        }
    }
}

/// Holds the key protecting the file store
pub struct KeyManager {
    meta: KeyMeta,
    key: EncryptionKey,
}

impl KeyManager {
    /// Load or create the store key
    ///
    /// `kdf` only applies when no `meta.json` exists yet; afterwards the stored
    /// parameters win so the same passphrase keeps yielding the same key.
    pub async fn open(
        storage_dir: &Path,
        source: KeySource,
        secret_provider: Arc<dyn SecretProvider>,
        kdf: KdfParams,
    ) -> Result<Self> {
        let meta_path = storage_dir.join(META_FILE);

        let mut meta = if fs::try_exists(&meta_path).await? {
            let content = fs::read_to_string(&meta_path).await?;
            serde_json::from_str(&content).map_err(|_| AuthError::CorruptedStore)?
        } else {
            KeyMeta::new(kdf)
        };

        let key = match source {
            #[cfg(feature = "keyring-support")]
            KeySource::Keyring => match Self::load_or_create_in_keyring() {
                Ok(key) => {
                    debug!("Loaded token store key from OS keyring");
                    key
                }
                Err(e) => {
                    warn!("Keyring unavailable ({}), using passphrase fallback", e);
                    Self::derive_from_passphrase(&mut meta, secret_provider.as_ref()).await?
                }
            },
            KeySource::Passphrase => {
                Self::derive_from_passphrase(&mut meta, secret_provider.as_ref()).await?
            }
        };

        let meta_json = serde_json::to_string_pretty(&meta)?;
        fs::write(&meta_path, meta_json).await?;

        Ok(Self { meta, key })
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn meta(&self) -> &KeyMeta {
        &self.meta
    }

    #[cfg(feature = "keyring-support")]
    fn load_or_create_in_keyring() -> Result<EncryptionKey> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|e| AuthError::Keyring(format!("Failed to access keyring: {}", e)))?;

        match entry.get_password() {
            Ok(key_b64) => {
                let key_bytes = base64::engine::general_purpose::STANDARD
                    .decode(key_b64)
                    .map_err(|_| AuthError::CorruptedStore)?;
                let key: [u8; 32] = key_bytes
                    .try_into()
                    .map_err(|_| AuthError::CorruptedStore)?;
                Ok(EncryptionKey::from_bytes(key))
            }
            Err(keyring::Error::NoEntry) => {
                let key = EncryptionKey::generate()?;
                let key_b64 = base64::engine::general_purpose::STANDARD.encode(key.as_bytes());
                entry
                    .set_password(&key_b64)
                    .map_err(|e| AuthError::Keyring(format!("Failed to write to keyring: {}", e)))?;
                debug!("Created new token store key in OS keyring");
                Ok(key)
            }
            Err(e) => Err(AuthError::Keyring(format!(
                "Failed to read from keyring: {}",
                e
            ))),
        }
    }

    async fn derive_from_passphrase(
        meta: &mut KeyMeta,
        secret_provider: &dyn SecretProvider,
    ) -> Result<EncryptionKey> {
        let salt = match meta.passphrase_salt {
            Some(ref salt_b64) => base64::engine::general_purpose::STANDARD
                .decode(salt_b64)
                .map_err(|_| AuthError::CorruptedStore)?,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                getrandom::fill(&mut salt).map_err(|e| {
                    AuthError::Crypto(format!("OS random source unavailable: {}", e))
                })?;
                meta.passphrase_salt =
                    Some(base64::engine::general_purpose::STANDARD.encode(&salt));
                salt
            }
        };

        let passphrase = secret_provider
            .get_passphrase("Enter passphrase for token storage")
            .await
            .ok_or_else(|| {
                AuthError::Storage("No passphrase available for the token store".to_string())
            })?;

        let kdf = meta.kdf;
        tokio::task::spawn_blocking(move || derive_key(passphrase.as_bytes(), &salt, kdf))
            .await
            .map_err(|e| AuthError::Crypto(format!("Key derivation task failed: {}", e)))?
    }
}

fn derive_key(passphrase: &[u8], salt: &[u8], kdf: KdfParams) -> Result<EncryptionKey> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| AuthError::Crypto(format!("Invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| AuthError::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(EncryptionKey::from_bytes(key))
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("meta", &self.meta)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{NoSecretProvider, StaticSecretProvider};
    use tempfile::TempDir;

    fn light() -> KdfParams {
        KdfParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[tokio::test]
    async fn test_same_passphrase_same_key() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticSecretProvider::new("correct horse"));

        let first = KeyManager::open(dir.path(), KeySource::Passphrase, provider.clone(), light())
            .await
            .unwrap();
        let second = KeyManager::open(dir.path(), KeySource::Passphrase, provider, light())
            .await
            .unwrap();

        assert_eq!(first.key().as_bytes(), second.key().as_bytes());
        assert!(dir.path().join(META_FILE).exists());
    }

    #[tokio::test]
    async fn test_different_passphrase_different_key() {
        let dir = TempDir::new().unwrap();
        let a = KeyManager::open(
            dir.path(),
            KeySource::Passphrase,
            Arc::new(StaticSecretProvider::new("one")),
            light(),
        )
        .await
        .unwrap();
        let b = KeyManager::open(
            dir.path(),
            KeySource::Passphrase,
            Arc::new(StaticSecretProvider::new("two")),
            light(),
        )
        .await
        .unwrap();

        assert_ne!(a.key().as_bytes(), b.key().as_bytes());
    }

    #[tokio::test]
    async fn test_missing_passphrase_fails() {
        let dir = TempDir::new().unwrap();
        let result = KeyManager::open(
            dir.path(),
            KeySource::Passphrase,
            Arc::new(NoSecretProvider),
            light(),
        )
        .await;

        assert!(matches!(result, Err(AuthError::Storage(_))));
    }

    #[tokio::test]
    async fn test_stored_kdf_params_win() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticSecretProvider::new("pw"));
        let first = KeyManager::open(dir.path(), KeySource::Passphrase, provider.clone(), light())
            .await
            .unwrap();

        let heavier = KdfParams {
            m_cost: 512,
            ..light()
        };
        let second = KeyManager::open(dir.path(), KeySource::Passphrase, provider, heavier)
            .await
            .unwrap();

        assert_eq!(second.meta().kdf, light());
        assert_eq!(first.key().as_bytes(), second.key().as_bytes());
    }
}
