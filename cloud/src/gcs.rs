//! Cloud Storage JSON API client.

use crate::auth::TokenSource;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::rest::{RestClient, endpoint_url};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

pub struct GcsObjectStore {
    rest: RestClient,
    endpoint: Url,
    bucket: String,
}

impl GcsObjectStore {
    pub fn new(http: reqwest::Client, tokens: TokenSource, endpoint: Url, bucket: String) -> Self {
        GcsObjectStore {
            rest: RestClient::new(http, tokens),
            endpoint,
            bucket,
        }
    }

    fn object_url(&self, key: &str) -> Url {
        endpoint_url(&self.endpoint, &["storage", "v1", "b", &self.bucket, "o", key])
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let request = self.rest.request(Method::GET, self.object_url(key)).await?;
        match self.rest.send(request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let mut url = endpoint_url(
            &self.endpoint,
            &["upload", "storage", "v1", "b", &self.bucket, "o"],
        );
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);

        let size = data.len();
        let request = self
            .rest
            .request(Method::POST, url)
            .await?
            .header(CONTENT_TYPE, content_type)
            .body(data);
        self.rest.send(request).await?;

        tracing::debug!(bucket = %self.bucket, key, size, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let mut url = self.object_url(key);
        url.query_pairs_mut().append_pair("alt", "media");

        let request = self.rest.request(Method::GET, url).await?;
        match self.rest.send(request).await {
            Ok(response) => Ok(response
                .bytes()
                .await
                .map_err(|e| ObjectStoreError::Rest(e.into()))?),
            Err(e) if e.is_not_found() => Err(ObjectStoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
