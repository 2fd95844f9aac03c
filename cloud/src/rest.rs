use crate::auth::{TokenError, TokenSource};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

/// Failure talking to a Google REST endpoint.
#[derive(thiserror::Error, Debug)]
pub enum RestError {
    #[error("credentials error: {0}")]
    Token(#[from] TokenError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },
}

impl RestError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }
}

// Google APIs wrap failures as {"error": {"code": 404, "message": "..."}}.
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Authenticated HTTP client shared by the REST-backed capabilities.
#[derive(Clone)]
pub(crate) struct RestClient {
    http: reqwest::Client,
    tokens: TokenSource,
}

impl RestClient {
    pub fn new(http: reqwest::Client, tokens: TokenSource) -> Self {
        RestClient { http, tokens }
    }

    pub async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, RestError> {
        let token = self.tokens.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Sends the request and turns any non-2xx status into `RestError::Status`.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, RestError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or(body);

        Err(RestError::Status { status, message })
    }
}

/// Appends percent-encoded path segments to an endpoint base URL.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
