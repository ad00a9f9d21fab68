use reqwest::{Client, Response};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{AuthConfig, Prompt};
use crate::errors::{AuthError, Result};
use crate::models::{OAuthErrorResponse, ProviderMetadata, TokenResponse};

/// Header carrying a fresh id per token endpoint request
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Build the HTTP client shared by discovery and token exchange
pub fn http_client(config: &AuthConfig) -> Result<Client> {
    let http = Client::builder()
        .connect_timeout(config.http_timeouts.connect)
        .timeout(config.http_timeouts.request)
        .user_agent(config.user_agent.as_deref().unwrap_or("loopauth"))
        .build()?;
    Ok(http)
}

/// Parameters of one authorization request
#[derive(Debug, Clone)]
pub struct AuthorizeParams<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a Url,
    pub scope: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub prompt: Option<Prompt>,
    pub extra: &'a std::collections::BTreeMap<String, String>,
}

/// URL the user is sent to in the browser
pub fn build_authorize_url(metadata: &ProviderMetadata, params: &AuthorizeParams<'_>) -> Url {
    let mut url = metadata.authorization_endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", params.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", params.redirect_uri.as_str())
            .append_pair("scope", params.scope)
            .append_pair("state", params.state)
            .append_pair("code_challenge", params.code_challenge)
            .append_pair("code_challenge_method", "S256");

        if let Some(prompt) = params.prompt {
            query.append_pair("prompt", prompt.as_str());
        }
        for (key, value) in params.extra {
            query.append_pair(key, value);
        }
    }
    url
}

/// Calls against the token and revocation endpoints
#[async_trait::async_trait]
pub trait TokenExchange: Send + Sync {
    /// `grant_type=authorization_code` with the PKCE verifier
    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        verifier: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse>;

    /// `grant_type=refresh_token`
    async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        refresh_token: &str,
        scope: &str,
    ) -> Result<TokenResponse>;

    /// `grant_type=client_credentials`
    async fn client_credentials(
        &self,
        metadata: &ProviderMetadata,
        scope: &str,
    ) -> Result<TokenResponse>;

    /// RFC 7009 revocation of a refresh token
    async fn revoke(&self, metadata: &ProviderMetadata, refresh_token: &str) -> Result<()>;
}

/// Token endpoint client speaking form-encoded OAuth 2.0
#[derive(Clone)]
pub struct HttpTokenClient {
    client_id: String,
    client_secret: Option<Zeroizing<String>>,
    http: Client,
}

impl HttpTokenClient {
    pub fn new(config: &AuthConfig, http: Client) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone().map(Zeroizing::new),
            http,
        }
    }

    async fn post_form(&self, endpoint: &Url, form: &[(&str, &str)]) -> Result<Response> {
        let mut body: Vec<(&str, &str)> = vec![("client_id", self.client_id.as_str())];
        if let Some(secret) = &self.client_secret {
            body.push(("client_secret", secret.as_str()));
        }
        body.extend_from_slice(form);

        let correlation_id = Uuid::new_v4().to_string();
        debug!(%correlation_id, endpoint = %endpoint, "Calling token endpoint");

        let response = self
            .http
            .post(endpoint.clone())
            .header("Accept", "application/json")
            .header(CORRELATION_HEADER, &correlation_id)
            .form(&body)
            .send()
            .await?;
        Ok(response)
    }

    async fn token_response(response: Response) -> Result<TokenResponse> {
        let response = Self::check_status(response).await?;
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Invalid token response: {}", e)))?;
        Ok(tokens)
    }

    async fn check_status(response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if let Ok(error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
            if error.error == "invalid_grant" {
                return Err(AuthError::OAuthInvalidGrant);
            }
            warn!(
                error = %error.error,
                description = error.error_description.as_deref().unwrap_or(""),
                "Token endpoint rejected request"
            );
        }

        Err(AuthError::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        })
    }
}

impl std::fmt::Debug for HttpTokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait::async_trait]
impl TokenExchange for HttpTokenClient {
    #[instrument(skip(self, metadata, code, verifier))]
    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        verifier: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse> {
        debug!("Exchanging authorization code for tokens");
        let response = self
            .post_form(
                &metadata.token_endpoint,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("code_verifier", verifier),
                    ("redirect_uri", redirect_uri.as_str()),
                ],
            )
            .await?;
        Self::token_response(response).await
    }

    #[instrument(skip(self, metadata, refresh_token))]
    async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        refresh_token: &str,
        scope: &str,
    ) -> Result<TokenResponse> {
        debug!("Refreshing access token");
        let response = self
            .post_form(
                &metadata.token_endpoint,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("scope", scope),
                ],
            )
            .await?;
        Self::token_response(response).await
    }

    #[instrument(skip(self, metadata))]
    async fn client_credentials(
        &self,
        metadata: &ProviderMetadata,
        scope: &str,
    ) -> Result<TokenResponse> {
        if self.client_secret.is_none() {
            return Err(AuthError::Configuration(
                "client_secret is required for the client-credentials grant".to_string(),
            ));
        }
        debug!("Requesting client-credentials token");
        let response = self
            .post_form(
                &metadata.token_endpoint,
                &[("grant_type", "client_credentials"), ("scope", scope)],
            )
            .await?;
        Self::token_response(response).await
    }

    #[instrument(skip(self, metadata, refresh_token))]
    async fn revoke(&self, metadata: &ProviderMetadata, refresh_token: &str) -> Result<()> {
        let Some(endpoint) = &metadata.revocation_endpoint else {
            debug!("Provider has no revocation endpoint");
            return Ok(());
        };

        let response = self
            .post_form(
                endpoint,
                &[
                    ("token", refresh_token),
                    ("token_type_hint", "refresh_token"),
                ],
            )
            .await?;
        Self::check_status(response).await?;
        debug!("Refresh token revoked");
        Ok(())
    }
}
