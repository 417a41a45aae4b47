//! Bearer tokens for the Google APIs the relay writes to.

use crate::config::AuthConfig;
use crate::errors::AuthError;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

// Refresh this long before the metadata server says the token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

pub enum TokenSource {
    None,
    Static(String),
    Metadata(MetadataTokenSource),
}

impl TokenSource {
    pub fn from_config(config: &AuthConfig, client: reqwest::Client) -> Self {
        match config {
            AuthConfig::None => TokenSource::None,
            AuthConfig::Static { token } => TokenSource::Static(token.clone()),
            AuthConfig::Metadata { url } => {
                TokenSource::Metadata(MetadataTokenSource::new(client, url.clone()))
            }
        }
    }

    /// Returns the token to send, or `None` when requests go unauthenticated.
    pub async fn bearer(&self) -> Result<Option<String>, AuthError> {
        match self {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata(source) => source.token().await.map(Some),
        }
    }

    /// Adds the Authorization header to `request` if this source has a token.
    pub async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, AuthError> {
        Ok(match self.bearer().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Fetches access tokens from the instance metadata server and caches them.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    // Held across the refresh so concurrent requests share one fetch.
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenSource {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        MetadataTokenSource {
            client,
            url,
            timeout: METADATA_TIMEOUT,
            cached: Mutex::new(None),
        }
    }

    /// Bounds each metadata server request. Defaults to five seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;

        if let Some(entry) = cached.as_ref()
            && Instant::now() < entry.refresh_at
        {
            return Ok(entry.token.clone());
        }

        let response = self
            .client
            .get(self.url.clone())
            .header("Metadata-Flavor", "Google")
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Status(response.status()));
        }

        let body = response.json::<MetadataTokenResponse>().await?;
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(EXPIRY_MARGIN);
        tracing::debug!(expires_in = body.expires_in, "fetched access token from metadata server");

        *cached = Some(CachedToken {
            token: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(body.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockServer, SilentServer};
    use hyper::StatusCode;

    #[tokio::test]
    async fn test_static_and_none() {
        let client = reqwest::Client::new();
        let source = TokenSource::from_config(
            &AuthConfig::Static {
                token: "abc".into(),
            },
            client.clone(),
        );
        assert_eq!(source.bearer().await.unwrap().as_deref(), Some("abc"));

        let source = TokenSource::from_config(&AuthConfig::None, client);
        assert_eq!(source.bearer().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metadata_token_is_cached() {
        let server = MockServer::start(|_| {
            (
                StatusCode::OK,
                r#"{"access_token":"ya29.token","expires_in":3599,"token_type":"Bearer"}"#.into(),
            )
        })
        .await;

        let source = TokenSource::from_config(
            &AuthConfig::Metadata {
                url: server.url.join("/token").unwrap(),
            },
            reqwest::Client::new(),
        );

        assert_eq!(source.bearer().await.unwrap().as_deref(), Some("ya29.token"));
        assert_eq!(source.bearer().await.unwrap().as_deref(), Some("ya29.token"));

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/token");
        assert_eq!(
            requests[0].headers.get("metadata-flavor").unwrap(),
            "Google"
        );
    }

    #[tokio::test]
    async fn test_metadata_token_expired_is_refetched() {
        // Lifetime shorter than the margin, so every call refreshes.
        let server = MockServer::start(|_| {
            (
                StatusCode::OK,
                r#"{"access_token":"short","expires_in":10}"#.into(),
            )
        })
        .await;

        let source = MetadataTokenSource::new(reqwest::Client::new(), server.url.clone());
        source.token().await.unwrap();
        source.token().await.unwrap();
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_metadata_server_times_out() {
        let server = SilentServer::start().await;
        let source = MetadataTokenSource::new(reqwest::Client::new(), server.url.clone())
            .with_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(Duration::from_secs(5), source.token())
            .await
            .expect("token fetch must give up on its own");
        assert!(matches!(result, Err(AuthError::Transport(e)) if e.is_timeout()));
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_metadata_error_status() {
        let server = MockServer::start(|_| (StatusCode::NOT_FOUND, String::new())).await;
        let source = MetadataTokenSource::new(reqwest::Client::new(), server.url.clone());
        assert!(matches!(
            source.token().await.unwrap_err(),
            AuthError::Status(StatusCode::NOT_FOUND)
        ));
    }
}
