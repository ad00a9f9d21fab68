use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use zeroize::Zeroizing;

use crate::config::STORAGE_PREFIX;
use crate::errors::{AuthError, Result};
use crate::scope::ScopeFingerprint;

/// Identifies one persisted entry: (client, issuer, OS user)
///
/// The components are percent-encoded so the key is safe to use as a file
/// name or keyring account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Key for the current OS user
    pub fn new(client_id: &str, issuer: &str) -> Self {
        Self::for_user(client_id, issuer, &current_os_user())
    }

    pub fn for_user(client_id: &str, issuer: &str, user: &str) -> Self {
        Self(format!(
            "{}.{}.{}.{}",
            STORAGE_PREFIX,
            encode_component(client_id),
            encode_component(issuer),
            encode_component(user)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `.` is the key separator, so it is encoded along with everything but `-` and `_`
const KEY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

pub(crate) fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, KEY_COMPONENT).to_string()
}

fn current_os_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Durable home of refresh tokens across process restarts
///
/// Implementations never store access tokens or ID tokens. `load` treats
/// every failure as a cache miss.
#[async_trait::async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist `refresh_token` together with the scopes it was issued for
    async fn save(
        &self,
        key: &StorageKey,
        refresh_token: &str,
        fingerprint: &ScopeFingerprint,
    ) -> Result<()>;

    /// Stored token, if any, and only if `fingerprint` is `None` or matches the
    /// stored fingerprint exactly
    async fn load(
        &self,
        key: &StorageKey,
        fingerprint: Option<&ScopeFingerprint>,
    ) -> Option<Zeroizing<String>>;

    /// Remove the token and its fingerprint
    async fn delete(&self, key: &StorageKey) -> Result<()>;
}

#[derive(Clone)]
struct MemoryEntry {
    refresh_token: Zeroizing<String>,
    fingerprint: ScopeFingerprint,
}

/// In-memory store for tests and processes that must not touch the disk
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    entries: Arc<RwLock<HashMap<StorageKey, MemoryEntry>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenStore")
            .field("entries", &self.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl RefreshTokenStore for MemoryTokenStore {
    async fn save(
        &self,
        key: &StorageKey,
        refresh_token: &str,
        fingerprint: &ScopeFingerprint,
    ) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| AuthError::Storage("Lock poisoned".to_string()))?
            .insert(
                key.clone(),
                MemoryEntry {
                    refresh_token: Zeroizing::new(refresh_token.to_string()),
                    fingerprint: fingerprint.clone(),
                },
            );
        Ok(())
    }

    async fn load(
        &self,
        key: &StorageKey,
        fingerprint: Option<&ScopeFingerprint>,
    ) -> Option<Zeroizing<String>> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        match fingerprint {
            Some(requested) if *requested != entry.fingerprint => None,
            _ => Some(entry.refresh_token.clone()),
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| AuthError::Storage("Lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}
