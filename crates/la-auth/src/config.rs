use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::errors::{AuthError, Result};
use crate::scope::ScopeFingerprint;

/// Refresh tokens 10 minutes before real expiration time
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(600);

/// Scope that asks the identity provider for a refresh token
pub const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

/// Scopes a client-credentials client is not allowed to request
pub const USER_ONLY_SCOPES: &[&str] = &["openid", "email", "profile", "organization"];

/// Prefix used when building storage keys and IPC channel names
pub const STORAGE_PREFIX: &str = "loopauth";

/// Value of the `prompt` authorization parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Login => "login",
            Self::Consent => "consent",
            Self::SelectAccount => "select_account",
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration for an authorization client
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Client identifier as registered with the identity provider
    pub client_id: String,

    /// Issuer (authority) URL, used for discovery and storage keys
    pub issuer_url: Url,

    /// Space separated scopes
    pub scopes: String,

    /// Candidate redirect URIs, tried in order until a loopback listener binds
    pub redirect_uris: Vec<Url>,

    /// A token is treated as expired this long before its real expiry
    pub expiry_buffer: Duration,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    /// `prompt` parameter sent with every authorization request
    pub prompt: Option<Prompt>,

    /// Extra query parameters sent with every authorization request
    pub extra_authorize_params: BTreeMap<String, String>,

    /// Give up on an interactive sign-in after this long. `None` waits forever.
    pub interactive_timeout: Option<Duration>,

    /// Client secret, required by the client-credentials grant only
    pub client_secret: Option<String>,

    /// Open the provider's end-session page in the browser on sign-out
    pub end_session_on_sign_out: bool,
}

impl AuthConfig {
    /// Create config for an interactive desktop or CLI client
    pub fn interactive(
        client_id: impl Into<String>,
        issuer_url: Url,
        scopes: impl Into<String>,
        redirect_uris: Vec<Url>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            issuer_url,
            scopes: scopes.into(),
            redirect_uris,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("loopauth".to_string()),
            prompt: None,
            extra_authorize_params: BTreeMap::new(),
            interactive_timeout: None,
            client_secret: None,
            end_session_on_sign_out: false,
        }
    }

    /// Create config for a service using the client-credentials grant
    pub fn service(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        issuer_url: Url,
        scopes: impl Into<String>,
    ) -> Self {
        Self {
            client_secret: Some(client_secret.into()),
            expiry_buffer: Duration::from_secs(60),
            ..Self::interactive(client_id, issuer_url, scopes, Vec::new())
        }
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = Some(timeout);
        self
    }

    /// Checks shared by every transport
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id must not be empty".to_string()));
        }
        if self.scopes.split_whitespace().next().is_none() {
            return Err(AuthError::Configuration("scopes must not be empty".to_string()));
        }
        Ok(())
    }

    /// Checks for flows that receive a browser redirect
    pub fn validate_interactive(&self) -> Result<()> {
        self.validate()?;
        if self.redirect_uris.is_empty() {
            return Err(AuthError::Configuration(
                "at least one redirect URI is required".to_string(),
            ));
        }
        for uri in &self.redirect_uris {
            redirect_host_port(uri)?;
        }
        Ok(())
    }

    /// Checks for the client-credentials grant
    pub fn validate_service(&self) -> Result<()> {
        self.validate()?;
        if self.client_secret.as_deref().is_none_or(str::is_empty) {
            return Err(AuthError::Configuration(
                "client_secret is required for the client-credentials grant".to_string(),
            ));
        }
        if let Some(scope) = self
            .scopes
            .split_whitespace()
            .find(|s| USER_ONLY_SCOPES.contains(s))
        {
            return Err(AuthError::Configuration(format!(
                "scope '{scope}' cannot be requested by a service client"
            )));
        }
        Ok(())
    }

    /// Scopes sent to the provider by interactive flows, always including `offline_access`
    pub fn interactive_scopes(&self) -> String {
        if self
            .scopes
            .split_whitespace()
            .any(|s| s == OFFLINE_ACCESS_SCOPE)
        {
            self.scopes.clone()
        } else {
            format!("{} {}", self.scopes.trim(), OFFLINE_ACCESS_SCOPE)
        }
    }

    /// Issuer URL without a trailing slash
    pub fn issuer(&self) -> &str {
        self.issuer_url.as_str().trim_end_matches('/')
    }

    pub fn scope_fingerprint(&self) -> ScopeFingerprint {
        ScopeFingerprint::new(&self.interactive_scopes())
    }
}

/// Extract the exact host and port a loopback listener must bind to
pub fn redirect_host_port(uri: &Url) -> Result<(String, u16)> {
    if uri.scheme() != "http" {
        return Err(AuthError::Configuration(format!(
            "redirect URI {uri} must use the http scheme"
        )));
    }
    let host = uri
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AuthError::Configuration(format!("redirect URI {uri} has no host")))?;
    let port = uri.port().ok_or_else(|| {
        AuthError::Configuration(format!("redirect URI {uri} must declare an explicit port"))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, port))
}
