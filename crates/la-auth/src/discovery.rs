use reqwest::Client;
use tracing::{debug, instrument};

use crate::errors::{AuthError, Result};
use crate::models::ProviderMetadata;

const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

/// Looks up the endpoints of an identity provider
#[async_trait::async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, issuer: &str) -> Result<ProviderMetadata>;
}

/// OpenID Connect discovery over HTTP
#[derive(Debug, Clone)]
pub struct HttpMetadataResolver {
    http: Client,
}

impl HttpMetadataResolver {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub fn discovery_url(issuer: &str) -> String {
        format!("{}/{}", issuer.trim_end_matches('/'), WELL_KNOWN_PATH)
    }
}

#[async_trait::async_trait]
impl MetadataResolver for HttpMetadataResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, issuer: &str) -> Result<ProviderMetadata> {
        let url = Self::discovery_url(issuer);
        debug!("Fetching provider metadata");

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Invalid discovery document: {}", e)))?;

        if !metadata.supports_s256() {
            return Err(AuthError::Configuration(
                "identity provider does not support the S256 code challenge method".to_string(),
            ));
        }

        Ok(metadata)
    }
}

/// Fixed endpoints for providers without a discovery document
#[derive(Debug, Clone)]
pub struct StaticMetadata(pub ProviderMetadata);

#[async_trait::async_trait]
impl MetadataResolver for StaticMetadata {
    async fn resolve(&self, _issuer: &str) -> Result<ProviderMetadata> {
        Ok(self.0.clone())
    }
}
