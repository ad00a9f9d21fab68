//! OAuth 2.0 / OpenID Connect sign-in for native applications
//!
//! This crate implements the authorization code flow with PKCE for desktop and
//! command-line clients, plus the client-credentials grant for services.
//!
//! # Sign-in Flow
//!
//! 1. Provider metadata is discovered from `{issuer}/.well-known/openid-configuration`
//! 2. A loopback listener is started on the first free redirect URI
//! 3. The browser is sent to the authorization endpoint with a PKCE challenge and a state nonce
//! 4. The redirect is matched to the waiting attempt by its state
//! 5. The code is exchanged for tokens; the refresh token is persisted
//!
//! Later calls to [`AuthorizationOrchestrator::get_access_token`] serve the
//! cached token and refresh it shortly before it expires. Concurrent callers
//! share a single refresh.
//!
//! # Example
//!
//! ```no_run
//! use la_auth::{AuthConfig, AuthorizationOrchestrator, FileTokenStore, NoSecretProvider};
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AuthConfig::interactive(
//!     "desktop-app",
//!     Url::parse("https://idp.example.com")?,
//!     "openid profile",
//!     vec![Url::parse("http://127.0.0.1:53682/callback")?],
//! );
//!
//! let store = FileTokenStore::open(
//!     FileTokenStore::default_storage_dir()?,
//!     Arc::new(NoSecretProvider),
//! )
//! .await?;
//!
//! let auth = AuthorizationOrchestrator::builder(config)
//!     .store(Arc::new(store))
//!     .build()?;
//!
//! // Opens the browser unless a stored refresh token still works
//! let bearer = auth.sign_in().await?;
//! println!("Authorization: {}", bearer);
//!
//! // Refreshed transparently once inside the expiry buffer
//! let bearer = auth.get_access_token().await?;
//! # let _ = bearer;
//! # Ok(())
//! # }
//! ```
//!
//! # Token Storage
//!
//! Only refresh tokens are persisted. [`MemoryTokenStore`] keeps them for the
//! lifetime of the process:
//!
//! ```
//! use la_auth::{MemoryTokenStore, RefreshTokenStore, ScopeFingerprint, StorageKey};
//!
//! # async fn example() -> la_auth::Result<()> {
//! let store = MemoryTokenStore::new();
//! let key = StorageKey::for_user("desktop-app", "https://idp.example.com", "alice");
//! let scopes = ScopeFingerprint::new("openid offline_access");
//!
//! store.save(&key, "refresh-token", &scopes).await?;
//! assert!(store.load(&key, Some(&scopes)).await.is_some());
//!
//! // Tokens issued for other scopes are never handed out
//! assert!(store.load(&key, Some(&ScopeFingerprint::new("openid"))).await.is_none());
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`FileTokenStore`] encrypts each entry with AES-256-GCM. The key lives in
//! the OS keyring, or is derived from a passphrase with Argon2id when no
//! keyring is available.
//!
//! # Important Notes
//!
//! - Redirect URIs must be `http` loopback URIs with an explicit port
//! - `offline_access` is always requested by interactive flows
//! - Tokens are never logged; `Debug` output redacts them

pub mod browser;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod crypto;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod file_store;
pub mod ipc;
pub mod key_manager;
pub mod loopback;
pub mod models;
pub mod orchestrator;
pub mod pkce;
pub mod scope;
pub mod secret;
pub mod store;

// Re-export main types
pub use browser::{BrowserLauncher, PrintUrl, SystemBrowser};
pub use client::{HttpTokenClient, TokenExchange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, HttpTimeouts, Prompt};
pub use discovery::{HttpMetadataResolver, MetadataResolver, StaticMetadata};
pub use errors::{AuthError, ProtocolError, Result};
pub use events::{TokenEvent, TokenEvents};
pub use file_store::FileTokenStore;
pub use ipc::{ChannelNames, IpcBackend, IpcClient, IpcMethod};
pub use key_manager::{KdfParams, KeySource};
pub use loopback::LoopbackPool;
pub use models::ProviderMetadata;
pub use orchestrator::{
    AuthState, AuthorizationOrchestrator, OrchestratorBuilder, RedirectReceiver, Transport,
};
pub use scope::ScopeFingerprint;
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use store::{MemoryTokenStore, RefreshTokenStore, StorageKey};
