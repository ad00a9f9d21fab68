//! Sign-in state machine.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated <-> Refreshing
//!        ^                                   |              |
//!        +-------- sign_out / failure -------+--------------+
//! ```
//!
//! One [`AuthorizationOrchestrator`] serves one client identity. The
//! [`Transport`] decides how a fresh grant is obtained; caching, refreshing,
//! persistence and notifications are shared by all transports.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot, OnceCell};
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::browser::{BrowserLauncher, SystemBrowser};
use crate::cache::{TokenCache, TokenRecord};
use crate::client::{build_authorize_url, http_client, AuthorizeParams, HttpTokenClient, TokenExchange};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::correlation::{CallbackOutcome, CallbackParams, CorrelationRegistry};
use crate::discovery::{HttpMetadataResolver, MetadataResolver};
use crate::errors::{AuthError, ProtocolError, Result};
use crate::events::{TokenEvent, TokenEvents};
use crate::loopback::{LoopbackLease, LoopbackPool};
use crate::models::{ProviderMetadata, TokenResponse};
use crate::pkce::{random_token, PkcePair};
use crate::scope::ScopeFingerprint;
use crate::store::{MemoryTokenStore, RefreshTokenStore, StorageKey};

/// Where an orchestrator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Hands the user the authorization URL and returns the URL the browser was
/// redirected to, for environments without a loopback listener
#[async_trait::async_trait]
pub trait RedirectReceiver: Send + Sync {
    async fn receive(&self, authorize_url: &Url) -> Result<Url>;
}

/// How a new grant is obtained
#[derive(Clone)]
pub enum Transport {
    /// Browser redirect caught by a loopback listener
    Loopback,
    /// Browser redirect pasted back by the user
    ManualRedirect(Arc<dyn RedirectReceiver>),
    /// `client_credentials` grant with the configured secret
    ClientCredentials,
}

impl Transport {
    fn is_interactive(&self) -> bool {
        !matches!(self, Self::ClientCredentials)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => f.write_str("Loopback"),
            Self::ManualRedirect(_) => f.write_str("ManualRedirect"),
            Self::ClientCredentials => f.write_str("ClientCredentials"),
        }
    }
}

struct Inner {
    state: AuthState,
    cache: TokenCache,
}

/// Cancels the pending correlation if the attempt ends without a redirect
struct PendingState<'a> {
    registry: &'a CorrelationRegistry,
    state: String,
}

impl Drop for PendingState<'_> {
    fn drop(&mut self) {
        self.registry.cancel(&self.state);
    }
}

/// Builder for [`AuthorizationOrchestrator`]
pub struct OrchestratorBuilder {
    config: AuthConfig,
    transport: Transport,
    resolver: Option<Arc<dyn MetadataResolver>>,
    exchange: Option<Arc<dyn TokenExchange>>,
    store: Option<Arc<dyn RefreshTokenStore>>,
    browser: Option<Arc<dyn BrowserLauncher>>,
    clock: Option<Arc<dyn Clock>>,
    loopback: Option<Arc<LoopbackPool>>,
}

impl OrchestratorBuilder {
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn token_exchange(mut self, exchange: Arc<dyn TokenExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn store(mut self, store: Arc<dyn RefreshTokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a private listener pool instead of the process-wide one
    pub fn loopback_pool(mut self, pool: Arc<LoopbackPool>) -> Self {
        self.loopback = Some(pool);
        self
    }

    /// Validate the configuration for the chosen transport and assemble the orchestrator
    pub fn build(self) -> Result<AuthorizationOrchestrator> {
        match &self.transport {
            Transport::Loopback => self.config.validate_interactive()?,
            Transport::ManualRedirect(_) => {
                self.config.validate()?;
                if self.config.redirect_uris.is_empty() {
                    return Err(AuthError::Configuration(
                        "a redirect URI is required".to_string(),
                    ));
                }
            }
            Transport::ClientCredentials => self.config.validate_service()?,
        }

        let (resolver, exchange) = match (self.resolver, self.exchange) {
            (Some(resolver), Some(exchange)) => (resolver, exchange),
            (resolver, exchange) => {
                let http = http_client(&self.config)?;
                (
                    resolver.unwrap_or_else(|| Arc::new(HttpMetadataResolver::new(http.clone()))),
                    exchange.unwrap_or_else(|| Arc::new(HttpTokenClient::new(&self.config, http))),
                )
            }
        };

        let fingerprint = if self.transport.is_interactive() {
            self.config.scope_fingerprint()
        } else {
            ScopeFingerprint::new(&self.config.scopes)
        };
        let storage_key = StorageKey::new(&self.config.client_id, self.config.issuer());

        Ok(AuthorizationOrchestrator {
            inner: Mutex::new(Inner {
                state: AuthState::Unauthenticated,
                cache: TokenCache::new(self.config.expiry_buffer),
            }),
            transport: self.transport,
            storage_key,
            fingerprint,
            resolver,
            exchange,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryTokenStore::new())),
            browser: self.browser.unwrap_or_else(|| Arc::new(SystemBrowser)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            loopback: self.loopback.unwrap_or_else(LoopbackPool::shared),
            registry: Arc::new(CorrelationRegistry::new()),
            metadata: OnceCell::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            events: TokenEvents::new(),
            config: self.config,
        })
    }
}

/// Drives sign-in, token refresh and sign-out for one client identity
pub struct AuthorizationOrchestrator {
    config: AuthConfig,
    transport: Transport,
    storage_key: StorageKey,
    fingerprint: ScopeFingerprint,
    resolver: Arc<dyn MetadataResolver>,
    exchange: Arc<dyn TokenExchange>,
    store: Arc<dyn RefreshTokenStore>,
    browser: Arc<dyn BrowserLauncher>,
    clock: Arc<dyn Clock>,
    loopback: Arc<LoopbackPool>,
    registry: Arc<CorrelationRegistry>,
    metadata: OnceCell<ProviderMetadata>,
    inner: Mutex<Inner>,
    /// Serializes refreshes and grants so concurrent callers share one
    refresh_lock: tokio::sync::Mutex<()>,
    events: TokenEvents,
}

impl AuthorizationOrchestrator {
    /// Loopback transport with HTTP discovery, system browser and in-memory store
    pub fn builder(config: AuthConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transport: Transport::Loopback,
            resolver: None,
            exchange: None,
            store: None,
            browser: None,
            clock: None,
            loopback: None,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    /// Expiry of the cached access token
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().cache.expires_at()
    }

    /// Token change notifications; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &TokenEvents {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: AuthState) {
        self.lock().state = state;
    }

    fn cached_bearer(&self) -> Option<String> {
        self.lock().cache.valid_bearer(self.clock.now())
    }

    fn requested_scopes(&self) -> String {
        if self.transport.is_interactive() {
            self.config.interactive_scopes()
        } else {
            self.config.scopes.clone()
        }
    }

    /// Provider metadata, discovered on first use
    pub async fn metadata(&self) -> Result<&ProviderMetadata> {
        self.metadata
            .get_or_try_init(|| self.resolver.resolve(self.config.issuer()))
            .await
    }

    /// Sign in, silently from a stored refresh token when possible
    ///
    /// Returns the bearer token (`"{token_type} {access_token}"`).
    #[instrument(skip(self), fields(client_id = %self.config.client_id, transport = ?self.transport))]
    pub async fn sign_in(&self) -> Result<String> {
        if !self.transport.is_interactive() {
            let _guard = self.refresh_lock.lock().await;
            return self.grant().await;
        }

        {
            let _guard = self.refresh_lock.lock().await;
            self.set_state(AuthState::Authenticating);
            if let Some(bearer) = self.try_silent().await {
                info!("Signed in with stored refresh token");
                return Ok(bearer);
            }
        }

        // Not holding the refresh lock here: the browser round trip can take minutes

        match self.interactive().await {
            Ok(bearer) => {
                info!("Signed in interactively");
                Ok(bearer)
            }
            Err(e) => {
                warn!("Interactive sign-in failed: {}", e);
                self.clear_tokens();
                Err(e)
            }
        }
    }

    /// Sign in only if a stored refresh token still works; never opens a browser
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn sign_in_silent(&self) -> bool {
        let _guard = self.refresh_lock.lock().await;

        if !self.transport.is_interactive() {
            return match self.grant().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Client-credentials grant failed: {}", e);
                    false
                }
            };
        }

        let previous = self.state();
        self.set_state(AuthState::Authenticating);
        match self.try_silent().await {
            Some(_) => true,
            None => {
                self.set_state(previous);
                false
            }
        }
    }

    /// Current bearer token, refreshed first if it is inside the expiry buffer
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn get_access_token(&self) -> Result<String> {
        if let Some(bearer) = self.cached_bearer() {
            return Ok(bearer);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(bearer) = self.cached_bearer() {
            debug!("Token refreshed by a concurrent caller");
            return Ok(bearer);
        }

        self.renew().await
    }

    /// Refresh now, regardless of expiry
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn refresh_access_token(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.renew().await
    }

    /// Revoke and forget every token, then announce the signed-out state
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn sign_out(&self) {
        let _guard = self.refresh_lock.lock().await;

        if self.transport.is_interactive() {
            let cached = self.lock().cache.refresh_token();
            let refresh_token = match cached {
                Some(token) => Some(token),
                None => self.store.load(&self.storage_key, None).await,
            };

            if let Some(refresh_token) = refresh_token {
                match self.metadata().await {
                    Ok(metadata) => {
                        if let Err(e) = self.exchange.revoke(metadata, &refresh_token).await {
                            warn!("Failed to revoke refresh token: {}", e);
                        }
                    }
                    Err(e) => warn!("Skipping revocation, provider metadata unavailable: {}", e),
                }
            }

            if let Err(e) = self.store.delete(&self.storage_key).await {
                warn!("Failed to delete stored refresh token: {}", e);
            }
        }

        self.clear_tokens();
        info!("Signed out");

        if self.config.end_session_on_sign_out {
            self.open_end_session().await;
        }
    }

    async fn open_end_session(&self) {
        let endpoint = match self.metadata().await {
            Ok(metadata) => metadata.end_session_endpoint.clone(),
            Err(_) => None,
        };
        let Some(mut url) = endpoint else {
            return;
        };
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id);
        if let Err(e) = self.browser.open(&url).await {
            warn!("Failed to open end-session page: {}", e);
        }
    }

    /// Replace an expired or unwanted access token; caller holds `refresh_lock`
    async fn renew(&self) -> Result<String> {
        if !self.transport.is_interactive() {
            return self.grant().await;
        }

        let Some(refresh_token) = self.lock().cache.refresh_token() else {
            return Err(AuthError::NotAuthenticated);
        };

        self.set_state(AuthState::Refreshing);
        match self.refresh_with(&refresh_token).await {
            Ok(response) => self.apply_tokens(response, Some(refresh_token)).await,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                if matches!(e, AuthError::OAuthInvalidGrant)
                    && let Err(e) = self.store.delete(&self.storage_key).await
                {
                    warn!("Failed to delete rejected refresh token: {}", e);
                }
                self.clear_tokens();
                Err(e)
            }
        }
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<TokenResponse> {
        let metadata = self.metadata().await?;
        self.exchange
            .refresh(metadata, refresh_token, &self.requested_scopes())
            .await
    }

    /// Stored refresh token path; failures are logged and reported as `None`
    async fn try_silent(&self) -> Option<String> {
        let refresh_token = self
            .store
            .load(&self.storage_key, Some(&self.fingerprint))
            .await?;

        match self.refresh_with(&refresh_token).await {
            Ok(response) => match self.apply_tokens(response, Some(refresh_token)).await {
                Ok(bearer) => Some(bearer),
                Err(e) => {
                    warn!("Failed to cache refreshed tokens: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Silent sign-in failed: {}", e);
                if matches!(e, AuthError::OAuthInvalidGrant)
                    && let Err(e) = self.store.delete(&self.storage_key).await
                {
                    warn!("Failed to delete rejected refresh token: {}", e);
                }
                None
            }
        }
    }

    async fn grant(&self) -> Result<String> {
        self.set_state(AuthState::Authenticating);
        let result = async {
            let metadata = self.metadata().await?;
            self.exchange
                .client_credentials(metadata, &self.config.scopes)
                .await
        }
        .await;

        match result {
            Ok(response) => self.apply_tokens(response, None).await,
            Err(e) => {
                warn!("Client-credentials grant failed: {}", e);
                self.clear_tokens();
                Err(e)
            }
        }
    }

    async fn interactive(&self) -> Result<String> {
        let metadata = self.metadata().await?;
        let pkce = PkcePair::generate()?;
        let state = random_token(32)?;
        let scope = self.config.interactive_scopes();

        let (tx, rx) = oneshot::channel::<CallbackOutcome>();
        self.registry.add(
            &state,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        let _pending = PendingState {
            registry: &self.registry,
            state: state.clone(),
        };

        let (code, redirect_uri) = match &self.transport {
            Transport::Loopback => {
                let lease = self.bind_redirect().await?;
                let redirect_uri = lease.redirect_uri().clone();
                let url = self.authorize_url(metadata, &redirect_uri, &scope, &state, &pkce);
                self.browser.open(&url).await?;
                let outcome = self.with_timeout(async {
                    rx.await.map_err(|_| AuthError::SignInAbandoned)
                });
                let code = outcome.await??;
                drop(lease);
                (code, redirect_uri)
            }
            Transport::ManualRedirect(receiver) => {
                let redirect_uri = self.config.redirect_uris.first().cloned().ok_or_else(|| {
                    AuthError::Configuration("a redirect URI is required".to_string())
                })?;
                let url = self.authorize_url(metadata, &redirect_uri, &scope, &state, &pkce);
                self.browser.open(&url).await?;
                let pasted = self.with_timeout(receiver.receive(&url)).await?;

                let params = CallbackParams::from_url(&pasted);
                let returned_state = params.state.clone().unwrap_or_default();
                if !self.registry.resolve(&returned_state, params.into_outcome()) {
                    return Err(ProtocolError::StateMismatch.into());
                }
                let code = rx.await.map_err(|_| AuthError::SignInAbandoned)??;
                (code, redirect_uri)
            }
            Transport::ClientCredentials => {
                return Err(AuthError::Configuration(
                    "client-credentials transport has no interactive flow".to_string(),
                ));
            }
        };

        if code.state != state {
            return Err(ProtocolError::StateMismatch.into());
        }

        debug!("Authorization code received");
        let response = self
            .exchange
            .exchange_code(metadata, &code.code, &pkce.verifier, &redirect_uri)
            .await?;
        self.apply_tokens(response, None).await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.config.interactive_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| AuthError::SignInTimedOut)?,
            None => fut.await,
        }
    }

    /// First candidate redirect URI whose listener can be started
    async fn bind_redirect(&self) -> Result<LoopbackLease> {
        for uri in &self.config.redirect_uris {
            match self.loopback.start(uri, self.registry.clone()).await {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_address_in_use() => {
                    warn!(redirect_uri = %uri, "Redirect URI port is taken, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AuthError::NoRedirectUriAvailable {
            uris: self
                .config
                .redirect_uris
                .iter()
                .map(Url::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    fn authorize_url(
        &self,
        metadata: &ProviderMetadata,
        redirect_uri: &Url,
        scope: &str,
        state: &str,
        pkce: &PkcePair,
    ) -> Url {
        build_authorize_url(
            metadata,
            &AuthorizeParams {
                client_id: &self.config.client_id,
                redirect_uri,
                scope,
                state,
                code_challenge: &pkce.challenge,
                prompt: self.config.prompt,
                extra: &self.config.extra_authorize_params,
            },
        )
    }

    /// Cache a token response, persist its refresh token and notify subscribers
    ///
    /// `used_refresh_token` is kept when the provider does not rotate it.
    async fn apply_tokens(
        &self,
        mut response: TokenResponse,
        used_refresh_token: Option<Zeroizing<String>>,
    ) -> Result<String> {
        if response.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "token response has an empty access_token".to_string(),
            ));
        }

        let rotated = response.refresh_token.is_some();
        if !rotated && let Some(used) = used_refresh_token {
            response.refresh_token = Some(used.to_string());
        }

        let record = TokenRecord::from_response(response, self.clock.now(), self.fingerprint.clone());
        let new_refresh_token = rotated.then(|| record.refresh_token.clone()).flatten();
        let bearer = record.bearer();
        let expires_at = record.expires_at();

        {
            let mut inner = self.lock();
            inner.cache.store(record);
            inner.state = AuthState::Authenticated;
        }

        if self.transport.is_interactive()
            && let Some(refresh_token) = new_refresh_token
            && let Err(e) = self
                .store
                .save(&self.storage_key, &refresh_token, &self.fingerprint)
                .await
        {
            warn!("Failed to persist refresh token: {}", e);
        }

        debug!(%expires_at, "Access token cached");
        self.events.token_stored(bearer.clone(), expires_at);
        Ok(bearer)
    }

    fn clear_tokens(&self) {
        {
            let mut inner = self.lock();
            inner.cache.clear();
            inner.state = AuthState::Unauthenticated;
        }
        self.events.token_cleared();
    }
}

impl std::fmt::Debug for AuthorizationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationOrchestrator")
            .field("client_id", &self.config.client_id)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::discovery::StaticMetadata;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn metadata() -> ProviderMetadata {
        ProviderMetadata {
            issuer: Some("https://idp.example.com".to_string()),
            authorization_endpoint: Url::parse("https://idp.example.com/authorize").unwrap(),
            token_endpoint: Url::parse("https://idp.example.com/token").unwrap(),
            revocation_endpoint: Some(Url::parse("https://idp.example.com/revoke").unwrap()),
            end_session_endpoint: Some(Url::parse("https://idp.example.com/logout").unwrap()),
            code_challenge_methods_supported: vec!["S256".to_string()],
        }
    }

    fn tokens(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3600),
            scope: None,
            id_token: None,
        }
    }

    /// Token endpoint double that counts calls
    #[derive(Default)]
    struct FakeExchange {
        codes: AtomicUsize,
        refreshes: AtomicUsize,
        grants: AtomicUsize,
        revokes: AtomicUsize,
        reject_refresh: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TokenExchange for FakeExchange {
        async fn exchange_code(
            &self,
            _metadata: &ProviderMetadata,
            code: &str,
            _verifier: &str,
            _redirect_uri: &Url,
        ) -> Result<TokenResponse> {
            self.codes.fetch_add(1, Ordering::SeqCst);
            Ok(tokens(&format!("AT-{code}"), Some("RT-code")))
        }

        async fn refresh(
            &self,
            _metadata: &ProviderMetadata,
            _refresh_token: &str,
            _scope: &str,
        ) -> Result<TokenResponse> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_refresh.load(Ordering::SeqCst) {
                return Err(AuthError::OAuthInvalidGrant);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(tokens(&format!("AT-refresh-{n}"), None))
        }

        async fn client_credentials(
            &self,
            _metadata: &ProviderMetadata,
            _scope: &str,
        ) -> Result<TokenResponse> {
            let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(tokens(&format!("SVC-{n}"), None))
        }

        async fn revoke(&self, _metadata: &ProviderMetadata, _refresh_token: &str) -> Result<()> {
            self.revokes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PastedRedirect(String);

    #[async_trait::async_trait]
    impl RedirectReceiver for PastedRedirect {
        async fn receive(&self, authorize_url: &Url) -> Result<Url> {
            let state = authorize_url
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let state = if self.0 == "echo" { state } else { self.0.clone() };
            Ok(Url::parse(&format!(
                "http://127.0.0.1:1/cb?state={state}&code=pasted"
            ))?)
        }
    }

    struct NoBrowser;

    #[async_trait::async_trait]
    impl BrowserLauncher for NoBrowser {
        async fn open(&self, _url: &Url) -> Result<()> {
            Ok(())
        }
    }

    fn interactive_config() -> AuthConfig {
        AuthConfig::interactive(
            "desktop-app",
            Url::parse("https://idp.example.com").unwrap(),
            "openid",
            vec![Url::parse("http://127.0.0.1:1/cb").unwrap()],
        )
    }

    fn build(
        config: AuthConfig,
        transport: Transport,
        exchange: Arc<FakeExchange>,
        store: Arc<MemoryTokenStore>,
        clock: Arc<ManualClock>,
    ) -> AuthorizationOrchestrator {
        AuthorizationOrchestrator::builder(config)
            .transport(transport)
            .resolver(Arc::new(StaticMetadata(metadata())))
            .token_exchange(exchange)
            .store(store)
            .browser(Arc::new(NoBrowser))
            .clock(clock)
            .loopback_pool(Arc::new(LoopbackPool::new()))
            .build()
            .unwrap()
    }

    async fn seed(store: &MemoryTokenStore, config: &AuthConfig) {
        let key = StorageKey::new(&config.client_id, config.issuer());
        store
            .save(&key, "RT-stored", &config.scope_fingerprint())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_sign_in_uses_stored_token() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            exchange.clone(),
            store,
            Arc::new(ManualClock::default()),
        );

        assert!(orchestrator.sign_in_silent().await);
        assert_eq!(orchestrator.state(), AuthState::Authenticated);
        assert_eq!(
            orchestrator.get_access_token().await.unwrap(),
            "Bearer AT-refresh-1"
        );
        assert_eq!(exchange.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_sign_in_without_token() {
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            Arc::new(FakeExchange::default()),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(ManualClock::default()),
        );

        assert!(!orchestrator.sign_in_silent().await);
        assert_eq!(orchestrator.state(), AuthState::Unauthenticated);
        assert!(matches!(
            orchestrator.get_access_token().await,
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_rejected_stored_token_is_deleted() {
        let exchange = Arc::new(FakeExchange::default());
        exchange.reject_refresh.store(true, Ordering::SeqCst);
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            exchange,
            store.clone(),
            Arc::new(ManualClock::default()),
        );

        assert!(!orchestrator.sign_in_silent().await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_manual_redirect_sign_in() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        let orchestrator = build(
            interactive_config(),
            Transport::ManualRedirect(Arc::new(PastedRedirect("echo".to_string()))),
            exchange.clone(),
            store.clone(),
            Arc::new(ManualClock::default()),
        );
        let mut events = orchestrator.subscribe();

        let bearer = orchestrator.sign_in().await.unwrap();
        assert_eq!(bearer, "Bearer AT-pasted");
        assert_eq!(exchange.codes.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            TokenEvent::AccessTokenChanged("Bearer AT-pasted".to_string())
        );

        let key = orchestrator.storage_key().clone();
        let stored = store
            .load(&key, Some(&interactive_config().scope_fingerprint()))
            .await
            .unwrap();
        assert_eq!(stored.as_str(), "RT-code");
    }

    #[tokio::test]
    async fn test_manual_redirect_state_mismatch() {
        let orchestrator = build(
            interactive_config(),
            Transport::ManualRedirect(Arc::new(PastedRedirect("forged".to_string()))),
            Arc::new(FakeExchange::default()),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(ManualClock::default()),
        );

        let err = orchestrator.sign_in().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Protocol(ProtocolError::StateMismatch)
        ));
        assert_eq!(orchestrator.state(), AuthState::Unauthenticated);
        assert_eq!(orchestrator.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Arc::new(build(
            interactive_config(),
            Transport::Loopback,
            exchange.clone(),
            store,
            clock.clone(),
        ));
        assert!(orchestrator.sign_in_silent().await);

        clock.advance(chrono::Duration::seconds(3600));
        let calls: Vec<_> = (0..5)
            .map(|_| {
                let o = orchestrator.clone();
                tokio::spawn(async move { o.get_access_token().await })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), "Bearer AT-refresh-2");
        }

        assert_eq!(exchange.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_state() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let clock = Arc::new(ManualClock::default());
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            exchange.clone(),
            store.clone(),
            clock.clone(),
        );
        assert!(orchestrator.sign_in_silent().await);
        let mut events = orchestrator.subscribe();

        exchange.reject_refresh.store(true, Ordering::SeqCst);
        clock.advance(chrono::Duration::seconds(3600));

        assert!(matches!(
            orchestrator.get_access_token().await,
            Err(AuthError::OAuthInvalidGrant)
        ));
        assert_eq!(orchestrator.state(), AuthState::Unauthenticated);
        assert!(events.recv().await.unwrap().is_signed_out());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_forced_refresh() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            exchange.clone(),
            store,
            Arc::new(ManualClock::default()),
        );

        assert!(matches!(
            orchestrator.refresh_access_token().await,
            Err(AuthError::NotAuthenticated)
        ));

        assert!(orchestrator.sign_in_silent().await);
        assert_eq!(
            orchestrator.refresh_access_token().await.unwrap(),
            "Bearer AT-refresh-2"
        );
        assert_eq!(exchange.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sign_out_revokes_and_forgets() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        seed(&store, &interactive_config()).await;
        let orchestrator = build(
            interactive_config(),
            Transport::Loopback,
            exchange.clone(),
            store.clone(),
            Arc::new(ManualClock::default()),
        );
        assert!(orchestrator.sign_in_silent().await);

        orchestrator.sign_out().await;

        assert_eq!(exchange.revokes.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
        assert_eq!(orchestrator.state(), AuthState::Unauthenticated);
        assert!(orchestrator.expires_at().is_none());
        assert!(matches!(
            orchestrator.get_access_token().await,
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_regrants_on_expiry() {
        let exchange = Arc::new(FakeExchange::default());
        let store = Arc::new(MemoryTokenStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = AuthConfig::service(
            "svc",
            "s3cret",
            Url::parse("https://idp.example.com").unwrap(),
            "api.read",
        );
        let orchestrator = build(
            config,
            Transport::ClientCredentials,
            exchange.clone(),
            store.clone(),
            clock.clone(),
        );

        assert_eq!(orchestrator.get_access_token().await.unwrap(), "Bearer SVC-1");
        assert_eq!(orchestrator.get_access_token().await.unwrap(), "Bearer SVC-1");

        clock.advance(chrono::Duration::seconds(3600));
        assert_eq!(orchestrator.get_access_token().await.unwrap(), "Bearer SVC-2");
        assert_eq!(exchange.grants.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_service_config_rejects_user_scopes() {
        let config = AuthConfig::service(
            "svc",
            "s3cret",
            Url::parse("https://idp.example.com").unwrap(),
            "openid api.read",
        );
        let result = AuthorizationOrchestrator::builder(config)
            .transport(Transport::ClientCredentials)
            .resolver(Arc::new(StaticMetadata(metadata())))
            .token_exchange(Arc::new(FakeExchange::default()))
            .build();
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }

    #[test]
    fn test_loopback_requires_explicit_port() {
        let config = AuthConfig::interactive(
            "desktop-app",
            Url::parse("https://idp.example.com").unwrap(),
            "openid",
            vec![Url::parse("http://localhost/cb").unwrap()],
        );
        assert!(matches!(
            AuthorizationOrchestrator::builder(config).build(),
            Err(AuthError::Configuration(_))
        ));
    }
}
