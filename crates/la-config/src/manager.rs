use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use la_auth::AuthError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::profile::Profile;

pub const CONFIG_FILE_NAME: &str = "loopauth.toml";

/// Profile used when none is named on the command line
pub const DEFAULT_PROFILE: &str = "default";

/// Contents of `loopauth.toml`
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    #[serde(default, rename = "profile")]
    profiles: BTreeMap<String, Profile>,
}

impl ConfigFile {
    #[instrument(level = "debug")]
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = ProjectDirs::from("", "", "loopauth").ok_or_else(|| {
            error!("Failed to determine project directories - this usually indicates an unsupported OS or missing home directory");
            ConfigError::ProjectDirectoriesUnavailable
        })?;

        let path = proj_dirs.config_dir().join(CONFIG_FILE_NAME);
        debug!("Config file resolved to: {}", path.display());
        Ok(path)
    }

    #[instrument(level = "debug")]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if (tokio::fs::metadata(path).await).is_err() {
            warn!("Config file does not exist: {}", path.display());
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = tokio::fs::read(path)
            .await
            .context("Failed to read config file")
            .map_err(|e| {
                error!("Failed to read config file {}: {}", path.display(), e);
                ConfigError::FileReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        let file: ConfigFile = toml::from_slice(&content)
            .context("Failed to parse config file")
            .map_err(|e| {
                error!("Failed to parse config file {}: {}", path.display(), e);
                ConfigError::ParsingFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        info!(
            "Loaded {} profile(s) from {}",
            file.profiles.len(),
            path.display()
        );
        Ok(file)
    }

    /// Like [`ConfigFile::load`], but a missing file is an empty configuration
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path).await {
            Err(ConfigError::FileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent()
            && (tokio::fs::metadata(dir).await).is_err()
        {
            info!("Config directory doesn't exist, creating: {}", dir.display());
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create config directory")
                .map_err(|e| {
                    error!("Failed to create config directory {}: {}", dir.display(), e);
                    ConfigError::DirectoryCreationFailed {
                        path: dir.to_path_buf(),
                        source: e,
                    }
                })?;
        }

        let toml = toml::to_string_pretty(self)
            .context("Failed to serialize config to TOML")
            .map_err(|e| {
                error!("Failed to serialize config: {}", e);
                ConfigError::SerializationFailed { source: e }
            })?;

        tokio::fs::write(path, toml)
            .await
            .context("Failed to write config file")
            .map_err(|e| {
                error!("Failed to write config file {}: {}", path.display(), e);
                ConfigError::FileWriteFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Profile by name; `None` picks `default_profile`, then `"default"`
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or(DEFAULT_PROFILE);

        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::ProfileNotFound {
                profile: name.to_string(),
                available: self.profile_names().join(", "),
            })
    }

    /// Add or replace a profile, returning the previous one
    pub fn insert_profile(&mut self, name: impl Into<String>, profile: Profile) -> Option<Profile> {
        self.profiles.insert(name.into(), profile)
    }

    pub fn remove_profile(&mut self, name: &str) -> Option<Profile> {
        self.profiles.remove(name)
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Failed to create directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Config file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read config file '{path}': {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to serialize config: {source}")]
    SerializationFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Profile '{profile}' doesn't exist, available profiles: [{available}]")]
    ProfileNotFound { profile: String, available: String },

    #[error("Profile '{profile}' is invalid: {source}")]
    InvalidProfile {
        profile: String,
        #[source]
        source: AuthError,
    },

    #[error("Profile '{profile}' needs a client secret{}", secret_hint(.var))]
    MissingSecret {
        profile: String,
        var: Option<String>,
    },
}

fn secret_hint(var: &Option<String>) -> String {
    match var {
        Some(var) => format!(" in the {var} environment variable"),
        None => ", set client_secret_env".to_string(),
    }
}
