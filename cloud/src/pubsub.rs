use crate::RestError;
use crate::auth::TokenSource;
use crate::metrics_defs::MESSAGES_PUBLISHED;
use crate::rest::{RestClient, endpoint_url};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use shared::counter;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("publish returned no message id")]
    NoMessageId,
    #[error("publish request failed: {0}")]
    Rest(#[from] RestError),
}

/// Fire-and-forget delivery of opaque payloads to a fixed topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    fn topic(&self) -> &str;

    /// Publishes `data` and returns the broker-assigned message id.
    async fn publish(&self, data: &[u8]) -> Result<String, PublishError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

pub struct PubSubPublisher {
    rest: RestClient,
    endpoint: Url,
    project: String,
    topic: String,
}

impl PubSubPublisher {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenSource,
        endpoint: Url,
        project: String,
        topic: String,
    ) -> Self {
        PubSubPublisher {
            rest: RestClient::new(http, tokens),
            endpoint,
            project,
            topic,
        }
    }
}

#[async_trait]
impl MessagePublisher for PubSubPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, data: &[u8]) -> Result<String, PublishError> {
        let topic_segment = format!("{}:publish", self.topic);
        let url = endpoint_url(
            &self.endpoint,
            &["v1", "projects", &self.project, "topics", &topic_segment],
        );
        let body = json!({
            "messages": [{ "data": STANDARD.encode(data) }],
        });

        let request = self.rest.request(Method::POST, url).await?.json(&body);
        let response: PublishResponse = self
            .rest
            .send(request)
            .await?
            .json()
            .await
            .map_err(RestError::from)?;

        let message_id = response
            .message_ids
            .into_iter()
            .next()
            .ok_or(PublishError::NoMessageId)?;

        counter!(MESSAGES_PUBLISHED).increment(1);
        tracing::info!(topic = %self.topic, %message_id, "published message");
        Ok(message_id)
    }
}
