use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptedBlob};
use crate::errors::{AuthError, Result};
use crate::key_manager::{KdfParams, KeyManager, KeySource};
use crate::scope::ScopeFingerprint;
use crate::secret::SecretProvider;
use crate::store::{RefreshTokenStore, StorageKey};

const LOCK_ATTEMPTS: u32 = 40;
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// On-disk form of one persisted refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    version: u32,
    scope_fingerprint: ScopeFingerprint,
    refresh_token: EncryptedBlob,
}

/// Encrypted refresh token store on the local file system
///
/// # Directory Structure
/// ```text
/// ~/.local/share/loopauth/tokens/
/// ├── meta.json              # Key derivation metadata
/// ├── lock                   # Advisory lock file
/// └── entries/
///     └── <storage key>.json # Encrypted token + scope fingerprint
/// ```
#[derive(Debug)]
pub struct FileTokenStore {
    entries_dir: PathBuf,
    lock_file: PathBuf,
    key_manager: KeyManager,
}

impl FileTokenStore {
    /// Open the store with the OS keyring as key source (when compiled in)
    pub async fn open(
        storage_dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self> {
        Self::open_with(
            storage_dir,
            KeySource::default(),
            secret_provider,
            KdfParams::default(),
        )
        .await
    }

    pub async fn open_with(
        storage_dir: impl AsRef<Path>,
        source: KeySource,
        secret_provider: Arc<dyn SecretProvider>,
        kdf: KdfParams,
    ) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let entries_dir = storage_dir.join("entries");
        let lock_file = storage_dir.join("lock");

        fs::create_dir_all(&entries_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&storage_dir, perms.clone())?;
            std::fs::set_permissions(&entries_dir, perms)?;
        }

        let key_manager = KeyManager::open(&storage_dir, source, secret_provider, kdf).await?;

        Ok(Self {
            entries_dir,
            lock_file,
            key_manager,
        })
    }

    /// Platform data directory for the store
    pub fn default_storage_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "loopauth").ok_or_else(|| {
            AuthError::Storage("Could not determine data directory".to_string())
        })?;

        Ok(project_dirs.data_local_dir().join("tokens"))
    }

    fn entry_path(&self, key: &StorageKey) -> PathBuf {
        self.entries_dir.join(format!("{}.json", key.as_str()))
    }

    /// Exclusive advisory lock shared with other processes using the directory
    async fn acquire_lock(&self) -> Result<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        for _ in 0..LOCK_ATTEMPTS {
            if lock_file.try_lock_exclusive().is_ok() {
                return Ok(lock_file);
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }

        Err(AuthError::LockTimeout)
    }

    async fn read_entry(&self, key: &StorageKey) -> Result<Option<PersistedEntry>> {
        let path = self.entry_path(key);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let entry = serde_json::from_str(&content).map_err(|_| AuthError::CorruptedStore)?;
        Ok(Some(entry))
    }

    async fn load_entry(
        &self,
        key: &StorageKey,
        fingerprint: Option<&ScopeFingerprint>,
    ) -> Result<Option<Zeroizing<String>>> {
        let Some(entry) = self.read_entry(key).await? else {
            return Ok(None);
        };

        if let Some(requested) = fingerprint
            && *requested != entry.scope_fingerprint
        {
            debug!("Stored refresh token was issued for different scopes");
            return Ok(None);
        }

        let plaintext = crypto::decrypt(
            self.key_manager.key(),
            &entry.refresh_token,
            key,
            &entry.scope_fingerprint,
        )?;
        let token = String::from_utf8(plaintext.to_vec()).map_err(|_| AuthError::CorruptedStore)?;

        Ok(Some(Zeroizing::new(token)))
    }

    async fn write_entry(&self, key: &StorageKey, entry: &PersistedEntry) -> Result<()> {
        let path = self.entry_path(key);
        let json = serde_json::to_string_pretty(entry)?;

        // Write to a temp file, then rename over the entry
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let file = std::fs::File::open(&temp_path)?;
        file.sync_all()?;

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RefreshTokenStore for FileTokenStore {
    #[instrument(skip(self, key, refresh_token), fields(key = %key))]
    async fn save(
        &self,
        key: &StorageKey,
        refresh_token: &str,
        fingerprint: &ScopeFingerprint,
    ) -> Result<()> {
        let _lock = self.acquire_lock().await?;

        let blob = crypto::encrypt(
            self.key_manager.key(),
            refresh_token.as_bytes(),
            key,
            fingerprint,
        )?;
        let entry = PersistedEntry {
            version: 1,
            scope_fingerprint: fingerprint.clone(),
            refresh_token: blob,
        };

        self.write_entry(key, &entry).await?;
        debug!("Persisted refresh token");
        Ok(())
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn load(
        &self,
        key: &StorageKey,
        fingerprint: Option<&ScopeFingerprint>,
    ) -> Option<Zeroizing<String>> {
        match self.load_entry(key, fingerprint).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to load refresh token, treating as absent: {}", e);
                None
            }
        }
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<()> {
        let _lock = self.acquire_lock().await?;

        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Deleted refresh token"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::StaticSecretProvider;
    use tempfile::TempDir;

    fn light() -> KdfParams {
        KdfParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    async fn open_store(dir: &Path, passphrase: &str) -> FileTokenStore {
        FileTokenStore::open_with(
            dir,
            KeySource::Passphrase,
            Arc::new(StaticSecretProvider::new(passphrase)),
            light(),
        )
        .await
        .unwrap()
    }

    fn key() -> StorageKey {
        StorageKey::for_user("client", "https://idp.example.com", "alice")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        let fp = ScopeFingerprint::new("openid offline_access");

        store.save(&key(), "RT1", &fp).await.unwrap();

        assert_eq!(store.load(&key(), Some(&fp)).await.unwrap().as_str(), "RT1");
        assert_eq!(store.load(&key(), None).await.unwrap().as_str(), "RT1");
        assert!(
            store
                .load(&key(), Some(&ScopeFingerprint::new("openid")))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_token_is_not_stored_in_clear() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        store
            .save(&key(), "very-secret-refresh-token", &ScopeFingerprint::new("a"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.entry_path(&key())).unwrap();
        assert!(!raw.contains("very-secret-refresh-token"));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let fp = ScopeFingerprint::new("a b");
        open_store(temp.path(), "pw")
            .await
            .save(&key(), "RT1", &fp)
            .await
            .unwrap();

        let reopened = open_store(temp.path(), "pw").await;
        assert_eq!(reopened.load(&key(), Some(&fp)).await.unwrap().as_str(), "RT1");
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_cache_miss() {
        let temp = TempDir::new().unwrap();
        open_store(temp.path(), "right")
            .await
            .save(&key(), "RT1", &ScopeFingerprint::new("a"))
            .await
            .unwrap();

        let store = open_store(temp.path(), "wrong").await;
        assert!(store.load(&key(), None).await.is_none());
    }

    #[tokio::test]
    async fn test_edited_fingerprint_is_cache_miss() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        store
            .save(&key(), "RT1", &ScopeFingerprint::new("openid"))
            .await
            .unwrap();

        let path = store.entry_path(&key());
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("\"openid\"", "\"admin\"")).unwrap();

        assert!(
            store
                .load(&key(), Some(&ScopeFingerprint::new("admin")))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_corrupted_file_is_cache_miss() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        std::fs::write(store.entry_path(&key()), "not json").unwrap();

        assert!(store.load(&key(), None).await.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        store.save(&key(), "RT1", &ScopeFingerprint::new("a")).await.unwrap();

        store.delete(&key()).await.unwrap();
        assert!(store.load(&key(), None).await.is_none());
        store.delete(&key()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_entry_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pw").await;
        store.save(&key(), "RT1", &ScopeFingerprint::new("a")).await.unwrap();

        let mode = std::fs::metadata(store.entry_path(&key()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
