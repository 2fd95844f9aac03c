//! Identity resolution.
//!
//! One strategy is configured per deployment. Resolution never fails loudly:
//! anything that prevents establishing a principal is logged at debug level
//! and yields `None`, which the HTTP layer turns into a 401.

use crate::config::IdentityConfig;
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const ANONYMOUS: &str = "anonymous";

/// The authenticated caller, usually an email address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Principal(id.into())
    }

    /// Sentinel principal used when authentication is disabled.
    pub fn anonymous() -> Self {
        Principal(ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of a request a strategy may read credentials from.
#[derive(Clone, Copy)]
pub struct RequestCredentials<'a> {
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    /// Value of the token form field, when it was read from the body.
    pub form: Option<&'a str>,
}

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error("token endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token rejected with status {0}")]
    Rejected(reqwest::StatusCode),
    #[error("token audience {0:?} does not match")]
    AudienceMismatch(Option<String>),
    #[error("token carries neither email nor sub")]
    NoSubject,
}

/// Claims of a verified identity token.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Claims {
    pub email: Option<String>,
    pub sub: Option<String>,
    pub aud: Option<String>,
}

/// Checks an identity token with whoever issued it.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError>;
}

/// Verifies tokens against an OAuth2 token-info endpoint.
pub struct TokenInfoVerifier {
    client: reqwest::Client,
    url: String,
    audience: Option<String>,
}

impl TokenInfoVerifier {
    pub fn new(client: reqwest::Client, url: String, audience: Option<String>) -> Self {
        TokenInfoVerifier {
            client,
            url,
            audience,
        }
    }
}

#[async_trait]
impl TokenVerifier for TokenInfoVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("id_token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VerifyError::Rejected(response.status()));
        }

        let claims: Claims = response.json().await?;
        if let Some(audience) = &self.audience
            && claims.aud.as_deref() != Some(audience.as_str())
        {
            return Err(VerifyError::AudienceMismatch(claims.aud));
        }

        Ok(claims)
    }
}

pub enum IdentityResolver {
    ProxyHeader {
        header: String,
        prefix: String,
    },
    BearerToken {
        verifier: Arc<dyn TokenVerifier>,
        query_param: String,
        form_field: String,
    },
    None,
}

impl IdentityResolver {
    pub fn from_config(config: &IdentityConfig, client: reqwest::Client) -> Self {
        match config {
            IdentityConfig::ProxyHeader { header, prefix } => IdentityResolver::ProxyHeader {
                header: header.clone(),
                prefix: prefix.clone(),
            },
            IdentityConfig::BearerToken {
                tokeninfo_url,
                audience,
                query_param,
                form_field,
            } => IdentityResolver::BearerToken {
                verifier: Arc::new(TokenInfoVerifier::new(
                    client,
                    tokeninfo_url.clone(),
                    audience.clone(),
                )),
                query_param: query_param.clone(),
                form_field: form_field.clone(),
            },
            IdentityConfig::None => IdentityResolver::None,
        }
    }

    /// Token presented in the `Authorization` header or the query string.
    pub fn presented_token(&self, headers: &HeaderMap, query: Option<&str>) -> Option<String> {
        match self {
            IdentityResolver::BearerToken { query_param, .. } => bearer_token(headers)
                .or_else(|| query.and_then(|q| form_value(q.as_bytes(), query_param))),
            _ => None,
        }
    }

    pub fn form_field(&self) -> Option<&str> {
        match self {
            IdentityResolver::BearerToken { form_field, .. } => Some(form_field.as_str()),
            _ => None,
        }
    }

    /// Name of the body field to read when the token has to come from a
    /// form, i.e. it is neither in the header nor in the query string.
    pub fn body_token_field(&self, headers: &HeaderMap, query: Option<&str>) -> Option<&str> {
        match self {
            IdentityResolver::BearerToken { form_field, .. }
                if self.presented_token(headers, query).is_none() =>
            {
                Some(form_field.as_str())
            }
            _ => None,
        }
    }

    pub async fn resolve(&self, credentials: &RequestCredentials<'_>) -> Option<Principal> {
        match self {
            IdentityResolver::ProxyHeader { header, prefix } => {
                let value = credentials.headers.get(header.as_str())?.to_str().ok()?;
                let Some(id) = value.strip_prefix(prefix.as_str()) else {
                    tracing::debug!(header = %header, "identity header without expected prefix");
                    return None;
                };
                let id = id.trim();
                (!id.is_empty()).then(|| Principal::new(id))
            }
            IdentityResolver::BearerToken { verifier, .. } => {
                let token = self
                    .presented_token(credentials.headers, credentials.query)
                    .or_else(|| {
                        credentials
                            .form
                            .filter(|value| !value.is_empty())
                            .map(str::to_string)
                    })?;

                match verifier.verify(&token).await {
                    Ok(claims) => match claims.email.or(claims.sub).filter(|id| !id.is_empty()) {
                        Some(id) => Some(Principal::new(id)),
                        None => {
                            tracing::debug!(error = %VerifyError::NoSubject, "token verification failed");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "token verification failed");
                        None
                    }
                }
            }
            IdentityResolver::None => Some(Principal::anonymous()),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

pub(crate) fn form_value(encoded: &[u8], name: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
