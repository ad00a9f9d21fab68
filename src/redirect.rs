use la_auth::{AuthError, RedirectReceiver};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

/// Asks the user to paste the URL the browser was redirected to
pub struct StdinRedirect;

#[async_trait::async_trait]
impl RedirectReceiver for StdinRedirect {
    async fn receive(&self, _authorize_url: &Url) -> la_auth::Result<Url> {
        eprintln!("After signing in, paste the full URL from the browser's address bar:");

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Err(AuthError::SignInAbandoned);
        }

        Ok(Url::parse(line.trim())?)
    }
}
