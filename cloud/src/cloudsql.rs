//! Cloud SQL Admin API: importing SQL dumps from object storage.

use crate::RestError;
use crate::auth::TokenSource;
use crate::rest::{RestClient, endpoint_url};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://sqladmin.googleapis.com";

#[derive(thiserror::Error, Debug)]
pub enum SqlImportError {
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("sql import request failed: {0}")]
    Rest(#[from] RestError),
}

/// Replays a SQL dump stored at an object URI into a relational database.
#[async_trait]
pub trait SqlImporter: Send + Sync {
    /// Starts the import and returns the id of the long-running operation.
    async fn import_sql(&self, uri: &str) -> Result<String, SqlImportError>;
}

#[derive(Deserialize)]
struct Operation {
    name: String,
}

pub struct CloudSqlAdmin {
    rest: RestClient,
    endpoint: Url,
    project: String,
    instance: String,
    database: String,
}

impl CloudSqlAdmin {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenSource,
        endpoint: Url,
        project: String,
        instance: String,
        database: String,
    ) -> Self {
        CloudSqlAdmin {
            rest: RestClient::new(http, tokens),
            endpoint,
            project,
            instance,
            database,
        }
    }
}

#[async_trait]
impl SqlImporter for CloudSqlAdmin {
    async fn import_sql(&self, uri: &str) -> Result<String, SqlImportError> {
        let url = endpoint_url(
            &self.endpoint,
            &[
                "v1",
                "projects",
                &self.project,
                "instances",
                &self.instance,
                "import",
            ],
        );
        let body = json!({
            "importContext": {
                "fileType": "SQL",
                "uri": uri,
                "database": self.database,
            }
        });

        let request = self.rest.request(Method::POST, url).await?.json(&body);
        let operation: Operation = self
            .rest
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| SqlImportError::InvalidResponse(e.to_string()))?;

        tracing::info!(
            instance = %self.instance,
            database = %self.database,
            uri,
            operation = %operation.name,
            "started sql import"
        );
        Ok(operation.name)
    }
}
