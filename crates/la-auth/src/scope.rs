use std::fmt;

use serde::{Deserialize, Serialize};

/// Order-independent representation of a requested scope set
///
/// Two fingerprints are equal when they name the same scopes, regardless of
/// ordering or whitespace between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeFingerprint(String);

impl ScopeFingerprint {
    pub fn new(scopes: &str) -> Self {
        let mut parts: Vec<&str> = scopes.split_whitespace().collect();
        parts.sort_unstable();
        Self(parts.join(" "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ScopeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeFingerprint {
    fn from(scopes: &str) -> Self {
        Self::new(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_whitespace_independent() {
        let a = ScopeFingerprint::new("openid profile offline_access");
        let b = ScopeFingerprint::new("  offline_access\topenid   profile ");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "offline_access openid profile");
    }

    #[test]
    fn test_different_sets_differ() {
        let a = ScopeFingerprint::new("openid profile");
        let b = ScopeFingerprint::new("openid profile email");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty() {
        assert!(ScopeFingerprint::new("   ").is_empty());
    }
}
