use std::collections::BTreeMap;
use std::time::Duration;

use la_auth::{AuthConfig, HttpTimeouts, Prompt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::manager::ConfigError;

/// Which grant a profile signs in with
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    #[default]
    AuthorizationCode,
    ClientCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSetting {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl From<PromptSetting> for Prompt {
    fn from(value: PromptSetting) -> Self {
        match value {
            PromptSetting::None => Prompt::None,
            PromptSetting::Login => Prompt::Login,
            PromptSetting::Consent => Prompt::Consent,
            PromptSetting::SelectAccount => Prompt::SelectAccount,
        }
    }
}

/// One `[profile.<name>]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub client_id: String,
    pub issuer: Url,
    pub scopes: String,
    #[serde(default)]
    pub grant: GrantKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<Url>,
    /// Environment variable holding the client secret; secrets never live in the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_buffer_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptSetting>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_authorize_params: BTreeMap<String, String>,
    #[serde(default)]
    pub end_session_on_sign_out: bool,
}

impl Profile {
    /// Starter profile written by `config init`
    pub fn example() -> Result<Self, url::ParseError> {
        Ok(Self {
            client_id: "my-desktop-app".to_string(),
            issuer: Url::parse("https://login.example.com")?,
            scopes: "openid profile".to_string(),
            grant: GrantKind::AuthorizationCode,
            redirect_uris: vec![
                Url::parse("http://127.0.0.1:53682/callback")?,
                Url::parse("http://127.0.0.1:53683/callback")?,
            ],
            client_secret_env: None,
            expiry_buffer_secs: None,
            interactive_timeout_secs: Some(300),
            connect_timeout_secs: None,
            request_timeout_secs: None,
            prompt: None,
            extra_authorize_params: BTreeMap::new(),
            end_session_on_sign_out: false,
        })
    }

    /// Build the engine configuration, reading the client secret from the environment
    pub fn to_auth_config(&self, name: &str) -> Result<AuthConfig, ConfigError> {
        let mut config = match self.grant {
            GrantKind::AuthorizationCode => AuthConfig::interactive(
                self.client_id.clone(),
                self.issuer.clone(),
                self.scopes.clone(),
                self.redirect_uris.clone(),
            ),
            GrantKind::ClientCredentials => {
                let var = self.client_secret_env.clone().ok_or_else(|| {
                    ConfigError::MissingSecret {
                        profile: name.to_string(),
                        var: None,
                    }
                })?;
                let secret = std::env::var(&var).map_err(|_| ConfigError::MissingSecret {
                    profile: name.to_string(),
                    var: Some(var.clone()),
                })?;
                AuthConfig::service(
                    self.client_id.clone(),
                    secret,
                    self.issuer.clone(),
                    self.scopes.clone(),
                )
            }
        };

        if let Some(secs) = self.expiry_buffer_secs {
            config.expiry_buffer = Duration::from_secs(secs);
        }
        config.interactive_timeout = self.interactive_timeout_secs.map(Duration::from_secs);

        let defaults = HttpTimeouts::default();
        config.http_timeouts = HttpTimeouts {
            connect: self
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect),
            request: self
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.request),
        };
        config.prompt = self.prompt.map(Prompt::from);
        config.extra_authorize_params = self.extra_authorize_params.clone();
        config.end_session_on_sign_out = self.end_session_on_sign_out;

        let validated = match self.grant {
            GrantKind::AuthorizationCode => config.validate_interactive(),
            GrantKind::ClientCredentials => config.validate_service(),
        };
        validated.map_err(|source| ConfigError::InvalidProfile {
            profile: name.to_string(),
            source,
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_profile_converts() {
        let config = Profile::example().unwrap().to_auth_config("default").unwrap();
        assert_eq!(config.client_id, "my-desktop-app");
        assert_eq!(config.redirect_uris.len(), 2);
        assert_eq!(config.interactive_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.expiry_buffer, Duration::from_secs(600));
    }

    #[test]
    fn test_profile_overrides_apply() {
        let mut profile = Profile::example().unwrap();
        profile.expiry_buffer_secs = Some(120);
        profile.request_timeout_secs = Some(5);
        profile.prompt = Some(PromptSetting::SelectAccount);

        let config = profile.to_auth_config("default").unwrap();
        assert_eq!(config.expiry_buffer, Duration::from_secs(120));
        assert_eq!(config.http_timeouts.request, Duration::from_secs(5));
        assert_eq!(config.http_timeouts.connect, Duration::from_secs(15));
        assert_eq!(config.prompt, Some(Prompt::SelectAccount));
    }

    #[test]
    fn test_redirect_uri_without_port_is_rejected() {
        let mut profile = Profile::example().unwrap();
        profile.redirect_uris = vec![Url::parse("http://127.0.0.1/callback").unwrap()];

        assert!(matches!(
            profile.to_auth_config("desktop"),
            Err(ConfigError::InvalidProfile { ref profile, .. }) if profile == "desktop"
        ));
    }

    #[test]
    fn test_service_profile_requires_secret_variable() {
        let mut profile = Profile::example().unwrap();
        profile.grant = GrantKind::ClientCredentials;
        profile.scopes = "api.read".to_string();

        assert!(matches!(
            profile.to_auth_config("svc"),
            Err(ConfigError::MissingSecret { var: None, .. })
        ));

        profile.client_secret_env = Some("LA_CONFIG_TEST_UNSET_SECRET".to_string());
        assert!(matches!(
            profile.to_auth_config("svc"),
            Err(ConfigError::MissingSecret { var: Some(_), .. })
        ));
    }
}
