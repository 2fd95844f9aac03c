//! OAuth2 access tokens for the Google APIs.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// Refresh this long before the metadata server says the token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata server returned {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Fetches tokens for the default service account from the instance metadata
/// server and caches them until shortly before they expire.
pub struct MetadataServer {
    client: reqwest::Client,
    url: String,
    cache: RwLock<Option<CachedToken>>,
}

impl MetadataServer {
    pub fn new() -> Self {
        Self::with_url(METADATA_TOKEN_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        MetadataServer {
            client: reqwest::Client::new(),
            url: url.into(),
            cache: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, TokenError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.expires_at > Instant::now()
            {
                return Ok(cached.token.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.token.clone());
        }

        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TokenError::Status(response.status()));
        }

        let token = response.json::<MetadataToken>().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        tracing::debug!(lifetime_secs = lifetime.as_secs(), "refreshed access token");

        *cache = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

impl Default for MetadataServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Where API calls get their bearer token from.
#[derive(Clone)]
pub enum TokenSource {
    /// A fixed token, e.g. from `gcloud auth print-access-token`.
    Static(Arc<str>),
    MetadataServer(Arc<MetadataServer>),
}

impl TokenSource {
    pub async fn access_token(&self) -> Result<String, TokenError> {
        match self {
            TokenSource::Static(token) => Ok(token.to_string()),
            TokenSource::MetadataServer(server) => server.access_token().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_token() {
        let source = TokenSource::Static("abc".into());
        assert_eq!(source.access_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_metadata_token_is_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = Router::new().route(
            "/token",
            get(move |headers: HeaderMap| {
                let hits = hits_clone.clone();
                async move {
                    assert_eq!(headers.get("metadata-flavor").unwrap(), "Google");
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(serde_json::json!({
                        "access_token": "token-1",
                        "expires_in": 3599,
                        "token_type": "Bearer",
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let server = MetadataServer::with_url(format!("http://127.0.0.1:{port}/token"));
        let source = TokenSource::MetadataServer(Arc::new(server));

        assert_eq!(source.access_token().await.unwrap(), "token-1");
        assert_eq!(source.access_token().await.unwrap(), "token-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
