use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;
use zeroize::Zeroizing;

use crate::errors::{AuthError, ProtocolError, Result};

/// Authorization code delivered through a redirect
pub struct AuthorizationCode {
    pub code: Zeroizing<String>,
    pub state: String,
}

impl std::fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCode")
            .field("code", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

/// What a pending correlation is completed with
pub type CallbackOutcome = std::result::Result<AuthorizationCode, ProtocolError>;

/// Completion handler invoked at most once per state
pub type CallbackHandler = Box<dyn FnOnce(CallbackOutcome) + Send + 'static>;

/// Query parameters of an authorization redirect
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub error_uri: Option<String>,
}

impl CallbackParams {
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "state" => &mut params.state,
                "code" => &mut params.code,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                "error_uri" => &mut params.error_uri,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    /// Treat empty parameters as absent
    pub fn normalized(self) -> Self {
        let present = |v: Option<String>| v.filter(|v| !v.is_empty());
        Self {
            state: present(self.state),
            code: present(self.code),
            error: present(self.error),
            error_description: present(self.error_description),
            error_uri: present(self.error_uri),
        }
    }

    /// Turn the redirect into a code or the error the provider reported
    pub fn into_outcome(self) -> CallbackOutcome {
        let state = self.state.unwrap_or_default();
        if let Some(error) = self.error {
            return Err(ProtocolError::Provider {
                error,
                description: self.error_description,
                uri: self.error_uri,
            });
        }
        match self.code {
            Some(code) => Ok(AuthorizationCode {
                code: Zeroizing::new(code),
                state,
            }),
            None => Err(ProtocolError::MissingCode),
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, CallbackHandler>,
    retired: HashSet<String>,
}

/// Map from an outstanding state nonce to the sign-in attempt waiting on it
///
/// Each orchestrator owns one registry. A state is accepted once: after it is
/// resolved or cancelled it can never be registered again.
#[derive(Default)]
pub struct CorrelationRegistry {
    inner: Mutex<Inner>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the handler for `state`
    ///
    /// Registering a state twice is a programming error and is rejected.
    pub fn add(&self, state: &str, handler: CallbackHandler) -> Result<()> {
        let mut inner = self.lock();
        if inner.pending.contains_key(state) || inner.retired.contains(state) {
            return Err(AuthError::DuplicateState(state.to_string()));
        }
        inner.pending.insert(state.to_string(), handler);
        trace!(pending = inner.pending.len(), "Registered authorization state");
        Ok(())
    }

    /// Complete the attempt waiting on `state`
    ///
    /// Returns `false` for states nobody is waiting on, which happens for stray
    /// browser requests and is not an error.
    pub fn resolve(&self, state: &str, outcome: CallbackOutcome) -> bool {
        let handler = {
            let mut inner = self.lock();
            let handler = inner.pending.remove(state);
            if handler.is_some() {
                inner.retired.insert(state.to_string());
            }
            handler
        };

        match handler {
            Some(handler) => {
                debug!(success = outcome.is_ok(), "Resolving authorization state");
                handler(outcome);
                true
            }
            None => {
                trace!("Ignoring redirect for unknown state");
                false
            }
        }
    }

    /// Drop the attempt waiting on `state` without notifying it
    pub fn cancel(&self, state: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.pending.remove(state).is_some();
        if removed {
            inner.retired.insert(state.to_string());
            debug!("Cancelled authorization state");
        }
        removed
    }

    pub fn is_pending(&self, state: &str) -> bool {
        self.lock().pending.contains_key(state)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending_count())
            .finish()
    }
}
