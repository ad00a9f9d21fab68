use std::time::Duration;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::models::TokenResponse;
use crate::scope::ScopeFingerprint;

/// Tokens issued by the last successful exchange or refresh
#[derive(Clone)]
pub struct TokenRecord {
    pub access_token: Zeroizing<String>,
    pub token_type: String,
    pub refresh_token: Option<Zeroizing<String>>,
    pub issued_at: DateTime<Utc>,
    pub expires_in: u64,
    pub scope_fingerprint: ScopeFingerprint,
}

impl TokenRecord {
    pub fn from_response(
        response: TokenResponse,
        issued_at: DateTime<Utc>,
        scope_fingerprint: ScopeFingerprint,
    ) -> Self {
        Self {
            access_token: Zeroizing::new(response.access_token),
            token_type: response.token_type,
            refresh_token: response.refresh_token.map(Zeroizing::new),
            issued_at,
            expires_in: response.expires_in.unwrap_or(0),
            scope_fingerprint,
        }
    }

    /// Lifetimes past chrono's range saturate to the latest representable instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True from `buffer` before the real expiry onwards
    pub fn has_expired(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
        match self.expires_at().checked_sub_signed(buffer) {
            Some(threshold) => now >= threshold,
            None => true,
        }
    }

    /// Value for an `Authorization` header, e.g. `Bearer eyJ...`
    pub fn bearer(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.as_str())
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .field("scope_fingerprint", &self.scope_fingerprint)
            .finish()
    }
}

/// In-memory token state of one orchestrator
#[derive(Debug)]
pub struct TokenCache {
    record: Option<TokenRecord>,
    expiry_buffer: Duration,
}

impl TokenCache {
    pub fn new(expiry_buffer: Duration) -> Self {
        Self {
            record: None,
            expiry_buffer,
        }
    }

    /// An empty cache counts as expired
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.record
            .as_ref()
            .is_none_or(|r| r.has_expired(now, self.expiry_buffer))
    }

    /// Cached bearer token if it is still outside the expiry buffer
    pub fn valid_bearer(&self, now: DateTime<Utc>) -> Option<String> {
        self.record
            .as_ref()
            .filter(|r| !r.has_expired(now, self.expiry_buffer))
            .map(TokenRecord::bearer)
    }

    pub fn refresh_token(&self) -> Option<Zeroizing<String>> {
        self.record.as_ref().and_then(|r| r.refresh_token.clone())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.record.as_ref().map(TokenRecord::expires_at)
    }

    pub fn record(&self) -> Option<&TokenRecord> {
        self.record.as_ref()
    }

    /// Replace the cached tokens, keeping the old refresh token if the provider
    /// did not rotate it
    pub fn store(&mut self, mut record: TokenRecord) {
        if record.refresh_token.is_none() {
            record.refresh_token = self.refresh_token();
        }
        self.record = Some(record);
    }

    pub fn clear(&mut self) {
        self.record = None;
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }
}
