pub mod analysis;
pub mod api;
pub mod config;
pub mod csv_export;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ingest;
pub mod metrics_defs;
pub mod reports;
pub mod table_name;
pub mod tables;

use crate::analysis::{AnalysisClient, AnalysisRunner};
use crate::config::{Config, Credentials};
use crate::events::EventHandler;
use crate::identity::IdentityResolver;
use crate::ingest::Ingestor;
use crate::reports::ReportPublisher;
use crate::tables::TableResolver;
use cloud::auth::{MetadataServer, TokenSource};
use cloud::bigquery::{self, BigQueryClient, JobWait};
use cloud::cloudsql::{self, CloudSqlAdmin, SqlImporter};
use cloud::gcs::{self, GcsObjectStore};
use cloud::object_store::ObjectStore;
use cloud::pubsub::{self, MessagePublisher, PubSubPublisher};
use cloud::warehouse::Warehouse;
use std::sync::Arc;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("invalid {service} endpoint: {source}")]
    Endpoint {
        service: &'static str,
        source: url::ParseError,
    },
    #[error("could not build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Serve(#[from] shared::http::ServeError),
}

/// Handles to the external services the portal talks to.
pub struct Clients {
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub importer: Option<Arc<dyn SqlImporter>>,
}

fn endpoint(
    configured: &Option<Url>,
    default: &str,
    service: &'static str,
) -> Result<Url, RunError> {
    match configured {
        Some(url) => Ok(url.clone()),
        None => Url::parse(default).map_err(|source| RunError::Endpoint { service, source }),
    }
}

/// Builds the Google API clients described by `config`.
pub fn build_clients(config: &Config, http: reqwest::Client) -> Result<Clients, RunError> {
    let gcp = &config.gcp;
    let tokens = match &gcp.credentials {
        Credentials::MetadataServer => TokenSource::MetadataServer(Arc::new(MetadataServer::new())),
        Credentials::Static { token } => TokenSource::Static(token.as_str().into()),
    };

    let store = GcsObjectStore::new(
        http.clone(),
        tokens.clone(),
        endpoint(&gcp.endpoints.storage, gcs::DEFAULT_ENDPOINT, "storage")?,
        gcp.bucket.clone(),
    );
    let warehouse = BigQueryClient::new(
        http.clone(),
        tokens.clone(),
        endpoint(&gcp.endpoints.bigquery, bigquery::DEFAULT_ENDPOINT, "bigquery")?,
        gcp.project.clone(),
        gcp.dataset_location.clone(),
        JobWait {
            timeout: config.warehouse.job_timeout(),
            poll_interval: config.warehouse.poll_interval(),
        },
    );
    let publisher = PubSubPublisher::new(
        http.clone(),
        tokens.clone(),
        endpoint(&gcp.endpoints.pubsub, pubsub::DEFAULT_ENDPOINT, "pubsub")?,
        gcp.project.clone(),
        gcp.sql_import_topic.clone(),
    );
    let importer = match &config.cloud_sql {
        Some(sql) => {
            let admin = CloudSqlAdmin::new(
                http,
                tokens,
                endpoint(&gcp.endpoints.sqladmin, cloudsql::DEFAULT_ENDPOINT, "sqladmin")?,
                gcp.project.clone(),
                sql.instance.clone(),
                sql.database.clone(),
            );
            Some(Arc::new(admin) as Arc<dyn SqlImporter>)
        }
        None => None,
    };

    Ok(Clients {
        store: Arc::new(store),
        warehouse: Arc::new(warehouse),
        publisher: Arc::new(publisher),
        importer,
    })
}

/// Everything the request handlers share.
pub struct Portal {
    pub identity: IdentityResolver,
    pub store: Arc<dyn ObjectStore>,
    pub ingestor: Arc<Ingestor>,
    pub analysis: AnalysisClient,
    pub runner: Arc<AnalysisRunner>,
    pub reports: ReportPublisher,
    pub events: EventHandler,
    pub max_upload_bytes: usize,
}

impl Portal {
    pub fn new(config: &Config, clients: Clients, http: reqwest::Client) -> Self {
        let tables = Arc::new(TableResolver::new(
            clients.warehouse,
            clients.store.clone(),
            config.gcp.dataset.clone(),
            config.gcp.dataset_location.clone(),
            config.analysis.source_policy,
        ));
        let ingestor = Arc::new(Ingestor::new(
            clients.store.clone(),
            tables.clone(),
            clients.publisher,
        ));
        let runner = Arc::new(AnalysisRunner::new(tables.clone(), clients.store.clone()));
        let analysis = match &config.analysis.service_url {
            Some(url) => AnalysisClient::remote(http.clone(), url.clone()),
            None => AnalysisClient::in_process(runner.clone()),
        };

        Portal {
            identity: IdentityResolver::from_config(&config.identity, http),
            events: EventHandler::new(
                config.gcp.bucket.clone(),
                tables.clone(),
                ingestor.clone(),
                clients.importer,
            ),
            reports: ReportPublisher::new(tables),
            store: clients.store,
            ingestor,
            analysis,
            runner,
            max_upload_bytes: config.upload.max_upload_bytes,
        }
    }
}

pub async fn run(config: Config) -> Result<(), RunError> {
    let http = reqwest::Client::builder().build()?;
    let clients = build_clients(&config, http.clone())?;
    let portal = Arc::new(Portal::new(&config, clients, http));

    tracing::info!(
        project = %config.gcp.project,
        dataset = %config.gcp.dataset,
        bucket = %config.gcp.bucket,
        "starting portal"
    );
    shared::http::run_http_service(
        &config.listener.host,
        config.listener.port,
        api::router(portal),
    )
    .await?;
    Ok(())
}
