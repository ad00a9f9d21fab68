//! `loopauth.toml` profile handling
//!
//! ```toml
//! default_profile = "work"
//!
//! [profile.work]
//! client_id = "desktop-app"
//! issuer = "https://login.example.com"
//! scopes = "openid profile"
//! redirect_uris = ["http://127.0.0.1:53682/callback"]
//! ```

mod manager;
pub mod profile;

pub use manager::{CONFIG_FILE_NAME, ConfigError, ConfigFile, DEFAULT_PROFILE};
pub use profile::{GrantKind, Profile, PromptSetting};
