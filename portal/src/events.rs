//! Handlers for object-finalize notifications and SQL import requests
//! delivered by push subscriptions.

use crate::analysis::RESULTS_PREFIX;
use crate::errors::{PortalError, Result};
use crate::ingest::{Ingestor, UploadFormat};
use crate::table_name::{TableName, extension};
use crate::tables::TableResolver;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cloud::cloudsql::SqlImporter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Object-finalize notification: which object landed in which bucket.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageEvent {
    pub name: String,
    pub bucket: String,
}

/// Pub/Sub push delivery. `message.data` is base64 of a JSON `StorageEvent`.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub data: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EventOutcome {
    Loaded {
        table: String,
        rows_loaded: Option<u64>,
    },
    ImportRequested {
        message_id: String,
    },
    ImportStarted {
        operation: String,
    },
    Skipped {
        reason: String,
    },
}

pub struct EventHandler {
    bucket: String,
    tables: Arc<TableResolver>,
    ingestor: Arc<Ingestor>,
    importer: Option<Arc<dyn SqlImporter>>,
}

impl EventHandler {
    pub fn new(
        bucket: String,
        tables: Arc<TableResolver>,
        ingestor: Arc<Ingestor>,
        importer: Option<Arc<dyn SqlImporter>>,
    ) -> Self {
        EventHandler {
            bucket,
            tables,
            ingestor,
            importer,
        }
    }

    /// Loads finalized `.csv`/`.json` objects into the table named after the
    /// object and forwards `.sql` dumps to the import topic.
    pub async fn handle_storage_event(&self, event: &StorageEvent) -> Result<EventOutcome> {
        if event.bucket != self.bucket {
            return Err(PortalError::BucketMismatch {
                got: event.bucket.clone(),
                expected: self.bucket.clone(),
            });
        }

        // Preview output lands in the same bucket and must not be ingested.
        if event.name.starts_with(RESULTS_PREFIX) {
            tracing::debug!(name = %event.name, "ignoring preview output");
            return Ok(EventOutcome::Skipped {
                reason: format!("{} is preview output", event.name),
            });
        }

        let format = match extension(&event.name).as_deref() {
            Some("csv") => UploadFormat::Csv,
            Some("json") => UploadFormat::Json,
            Some("sql") => {
                let message_id = self.ingestor.publish_sql_import(&event.name).await?;
                return Ok(EventOutcome::ImportRequested { message_id });
            }
            _ => {
                tracing::debug!(name = %event.name, "ignoring object");
                return Ok(EventOutcome::Skipped {
                    reason: format!("{} is not a csv, json or sql object", event.name),
                });
            }
        };

        let table = TableName::from_filename(&event.name)?;
        let Some(options) = format.load_options() else {
            return Err(PortalError::UnsupportedFormat(event.name.clone()));
        };

        let outcome = self.tables.load(&table, &event.name, options).await?;
        tracing::info!(
            %table,
            name = %event.name,
            rows = ?outcome.rows_loaded,
            "loaded object from storage event"
        );
        Ok(EventOutcome::Loaded {
            table: table.to_string(),
            rows_loaded: outcome.rows_loaded,
        })
    }

    /// Starts a relational import for a pushed `.sql` object notification.
    pub async fn handle_sql_import(&self, envelope: &PushEnvelope) -> Result<EventOutcome> {
        let importer = self
            .importer
            .as_ref()
            .ok_or(PortalError::NotConfigured("cloud_sql"))?;

        let data = STANDARD
            .decode(envelope.message.data.as_bytes())
            .map_err(|e| PortalError::InvalidRequest(format!("message data is not base64: {e}")))?;
        let event: StorageEvent = serde_json::from_slice(&data)
            .map_err(|e| PortalError::InvalidRequest(format!("message data is not an object event: {e}")))?;

        if extension(&event.name).as_deref() != Some("sql") {
            tracing::debug!(name = %event.name, "skipping non-SQL object");
            return Ok(EventOutcome::Skipped {
                reason: format!("{} is not a sql object", event.name),
            });
        }

        let uri = format!("gs://{}/{}", event.bucket, event.name);
        let operation = importer.import_sql(&uri).await?;
        tracing::info!(
            %uri,
            %operation,
            message_id = ?envelope.message.message_id,
            "sql import started"
        );
        Ok(EventOutcome::ImportStarted { operation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePolicy;
    use cloud::testutils::{MemoryObjectStore, MemoryPublisher, MemorySqlImporter, MemoryWarehouse};
    use cloud::warehouse::TableRef;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
        publisher: Arc<MemoryPublisher>,
        importer: Arc<MemorySqlImporter>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryObjectStore::new("bucket"));
            Fixture {
                warehouse: Arc::new(MemoryWarehouse::new("proj", store.clone())),
                publisher: Arc::new(MemoryPublisher::new("sql-import-topic")),
                importer: Arc::new(MemorySqlImporter::new()),
                store,
            }
        }

        fn handler(&self, with_importer: bool) -> EventHandler {
            let tables = Arc::new(TableResolver::new(
                self.warehouse.clone(),
                self.store.clone(),
                "ds".into(),
                "US".into(),
                SourcePolicy::BaseFirst,
            ));
            let ingestor = Arc::new(Ingestor::new(
                self.store.clone(),
                tables.clone(),
                self.publisher.clone(),
            ));
            let importer: Option<Arc<dyn SqlImporter>> = if with_importer {
                Some(self.importer.clone())
            } else {
                None
            };
            EventHandler::new("bucket".into(), tables, ingestor, importer)
        }
    }

    fn event(name: &str, bucket: &str) -> StorageEvent {
        StorageEvent {
            name: name.into(),
            bucket: bucket.into(),
        }
    }

    fn envelope(event: &StorageEvent) -> PushEnvelope {
        PushEnvelope {
            message: PushMessage {
                data: STANDARD.encode(serde_json::to_vec(event).unwrap()),
                message_id: Some("1".into()),
            },
            subscription: None,
        }
    }

    #[tokio::test]
    async fn test_storage_event_loads_csv() {
        let f = Fixture::new();
        f.store.insert("exports/Orders.csv", "id,total\n1,9.5\n2,3\n");

        let outcome = f
            .handler(false)
            .handle_storage_event(&event("exports/Orders.csv", "bucket"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Loaded {
                table: "orders".into(),
                rows_loaded: Some(2),
            }
        );
        assert!(f.warehouse.table(&TableRef::new("proj", "ds", "orders")).is_some());
    }

    #[tokio::test]
    async fn test_storage_event_routing() {
        let f = Fixture::new();
        let handler = f.handler(false);

        let err = handler
            .handle_storage_event(&event("a.csv", "someone-else"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::BucketMismatch { .. }));

        let outcome = handler
            .handle_storage_event(&event("analysis_results/a.txt", "bucket"))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));

        let outcome = handler
            .handle_storage_event(&event("dump.sql", "bucket"))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::ImportRequested { .. }));
        assert_eq!(f.publisher.calls(), 1);
        assert_eq!(f.warehouse.calls(), 0);
    }

    #[tokio::test]
    async fn test_storage_event_skips_preview_output() {
        let f = Fixture::new();
        f.store
            .insert("analysis_results/sales_results.csv", "name\nalice\n");

        let outcome = f
            .handler(false)
            .handle_storage_event(&event("analysis_results/sales_results.csv", "bucket"))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
        assert!(
            f.warehouse
                .table(&TableRef::new("proj", "ds", "sales_results"))
                .is_none()
        );
        assert_eq!(f.warehouse.calls(), 0);
    }

    #[tokio::test]
    async fn test_sql_import() {
        let f = Fixture::new();
        let handler = f.handler(true);

        let outcome = handler
            .handle_sql_import(&envelope(&event("uploads/dump.sql", "bucket")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EventOutcome::ImportStarted {
                operation: "operation-1".into()
            }
        );
        assert_eq!(f.importer.imports(), vec!["gs://bucket/uploads/dump.sql"]);

        let outcome = handler
            .handle_sql_import(&envelope(&event("uploads/data.csv", "bucket")))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
        assert_eq!(f.importer.calls(), 1);

        let bad = PushEnvelope {
            message: PushMessage {
                data: "%%%".into(),
                message_id: None,
            },
            subscription: None,
        };
        assert!(matches!(
            handler.handle_sql_import(&bad).await.unwrap_err(),
            PortalError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_sql_import_not_configured() {
        let f = Fixture::new();
        let err = f
            .handler(false)
            .handle_sql_import(&envelope(&event("dump.sql", "bucket")))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::NotConfigured("cloud_sql")));
    }
}
