use std::net::SocketAddr;

use thiserror::Error;

/// Error types for the authorization engine
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Authorization protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Not signed in - call sign_in() first")]
    NotAuthenticated,

    #[error("Loopback address {addr} is already in use")]
    AddressInUse { addr: SocketAddr },

    #[error("No loopback listener could be started for any of [{uris}]")]
    NoRedirectUriAvailable { uris: String },

    #[error("State {0} is already registered or was used before")]
    DuplicateState(String),

    #[error("Interactive sign-in was not completed in time")]
    SignInTimedOut,

    #[error("Interactive sign-in was abandoned")]
    SignInAbandoned,

    #[error("OAuth invalid_grant - refresh token may be expired or revoked")]
    OAuthInvalidGrant,

    #[error("Storage is locked by another process")]
    LockTimeout,

    #[error("Stored data is corrupted or was encrypted with another key")]
    CorruptedStore,

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IPC error: {0}")]
    Ipc(String),
}

/// Failures reported through the authorization redirect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Identity provider returned {error}{}", describe(.description))]
    Provider {
        error: String,
        description: Option<String>,
        uri: Option<String>,
    },

    #[error("OAuth state mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("Authorization response is missing the code parameter")]
    MissingCode,
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl ProtocolError {
    /// `access_denied` means the user declined consent in the browser
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::Provider { error, .. } if error == "access_denied")
    }
}

impl AuthError {
    /// Whether a candidate redirect URI should be skipped in favour of the next one
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::AddressInUse { .. })
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProtocolError::Provider {
            error: "invalid_scope".to_string(),
            description: Some("unknown scope 'foo'".to_string()),
            uri: None,
        };
        assert_eq!(
            err.to_string(),
            "Identity provider returned invalid_scope: unknown scope 'foo'"
        );

        let bare = ProtocolError::Provider {
            error: "server_error".to_string(),
            description: None,
            uri: None,
        };
        assert_eq!(bare.to_string(), "Identity provider returned server_error");
    }

    #[test]
    fn test_access_denied_is_cancellation() {
        let err = ProtocolError::Provider {
            error: "access_denied".to_string(),
            description: None,
            uri: None,
        };
        assert!(err.is_user_cancelled());
        assert!(!ProtocolError::MissingCode.is_user_cancelled());
    }
}
