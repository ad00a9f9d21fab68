use tracing::{debug, info};
use url::Url;

use crate::errors::{AuthError, Result};

/// Presents an authorization or end-session URL to the user
#[async_trait::async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &Url) -> Result<()>;
}

/// The platform's default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

#[async_trait::async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &Url) -> Result<()> {
        debug!(host = url.host_str().unwrap_or(""), "Opening system browser");
        open::that_detached(url.as_str())
            .map_err(|e| AuthError::Configuration(format!("Failed to open browser: {}", e)))
    }
}

/// For headless machines: log the URL and let the user open it elsewhere
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintUrl;

#[async_trait::async_trait]
impl BrowserLauncher for PrintUrl {
    async fn open(&self, url: &Url) -> Result<()> {
        info!("Open this URL in a browser to continue: {}", url);
        eprintln!("Open this URL in a browser to continue:\n\n    {}\n", url);
        Ok(())
    }
}
