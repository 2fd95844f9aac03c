//! BigQuery v2 REST client.
//!
//! Every statement runs as a job: the job is inserted, polled until its state
//! is `DONE`, and (for queries) its results are read page by page. The polling
//! loop is bounded by `JobWait::timeout`; an expired wait surfaces as
//! `WarehouseError::Timeout` and leaves the job running server side.

use crate::auth::TokenSource;
use crate::metrics_defs::{WAREHOUSE_JOB_DURATION, WAREHOUSE_JOB_FAILURES};
use crate::rest::{RestClient, endpoint_url};
use crate::warehouse::{
    LoadOptions, LoadOutcome, ResultSet, SourceFormat, TableRef, Warehouse, WarehouseError,
};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shared::{counter, histogram};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// How long to wait for a job and how often to ask about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for JobWait {
    fn default() -> Self {
        JobWait {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorProto {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: JobStatistics,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsPage {
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

pub struct BigQueryClient {
    rest: RestClient,
    endpoint: Url,
    project: String,
    location: String,
    wait: JobWait,
}

impl BigQueryClient {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenSource,
        endpoint: Url,
        project: String,
        location: String,
        wait: JobWait,
    ) -> Self {
        BigQueryClient {
            rest: RestClient::new(http, tokens),
            endpoint,
            project,
            location,
            wait,
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut all = vec!["projects", self.project.as_str()];
        all.extend_from_slice(segments);
        endpoint_url(&self.endpoint, &all)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, WarehouseError> {
        let request = self.rest.request(Method::GET, url).await?;
        let response = self.rest.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| WarehouseError::InvalidResponse(e.to_string()))
    }

    async fn exists(&self, url: Url) -> Result<bool, WarehouseError> {
        let request = self.rest.request(Method::GET, url).await?;
        match self.rest.send(request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts a job and waits for it to finish.
    async fn run_job(&self, configuration: Value) -> Result<Job, WarehouseError> {
        let started = Instant::now();

        let body = json!({
            "jobReference": {
                "projectId": self.project,
                "location": self.location,
            },
            "configuration": configuration,
        });
        let request = self
            .rest
            .request(Method::POST, self.url(&["jobs"]))
            .await?
            .json(&body);
        let job: Job = self
            .rest
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| WarehouseError::InvalidResponse(e.to_string()))?;

        let job_id = job.job_reference.job_id.clone();
        tracing::debug!(%job_id, "inserted job");

        let result = timeout(self.wait.timeout, self.poll_until_done(job))
            .await
            .map_err(|_| WarehouseError::Timeout(job_id.clone()))
            .and_then(|result| result);

        histogram!(WAREHOUSE_JOB_DURATION).record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            counter!(WAREHOUSE_JOB_FAILURES).increment(1);
            tracing::warn!(%job_id, error = %e, "job did not succeed");
        }

        result
    }

    async fn poll_until_done(&self, mut job: Job) -> Result<Job, WarehouseError> {
        loop {
            if job.status.state == "DONE" {
                return match job.status.error_result {
                    Some(error) => Err(WarehouseError::JobFailed {
                        job_id: job.job_reference.job_id,
                        message: error.message,
                    }),
                    None => Ok(job),
                };
            }

            sleep(self.wait.poll_interval).await;

            let mut url = self.url(&["jobs", &job.job_reference.job_id]);
            if let Some(location) = &job.job_reference.location {
                url.query_pairs_mut().append_pair("location", location);
            }
            job = self.get_json(url).await?;
        }
    }

    async fn fetch_results(
        &self,
        job: &JobReference,
        max_rows: Option<usize>,
    ) -> Result<ResultSet, WarehouseError> {
        let mut columns = None;
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["queries", &job.job_id]);
            {
                let mut query = url.query_pairs_mut();
                if let Some(location) = &job.location {
                    query.append_pair("location", location);
                }
                if let Some(max) = max_rows {
                    let remaining = max.saturating_sub(rows.len());
                    query.append_pair("maxResults", &remaining.to_string());
                }
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let page: QueryResultsPage = self.get_json(url).await?;
            if !page.job_complete {
                return Err(WarehouseError::InvalidResponse(format!(
                    "results for job {} requested before completion",
                    job.job_id
                )));
            }

            if columns.is_none() {
                columns = Some(column_names(page.schema));
            }
            rows.extend(decode_rows(page.rows));

            if let Some(max) = max_rows
                && rows.len() >= max
            {
                rows.truncate(max);
                break;
            }

            match page.page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ResultSet {
            columns: columns.unwrap_or_default(),
            rows,
        })
    }
}

fn table_reference(table: &TableRef) -> Value {
    json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table.table,
    })
}

fn column_names(schema: Option<TableSchema>) -> Vec<String> {
    schema
        .map(|schema| schema.fields.into_iter().map(|field| field.name).collect())
        .unwrap_or_default()
}

fn decode_rows(rows: Vec<TableRow>) -> Vec<Vec<Value>> {
    rows.into_iter()
        .map(|row| row.f.into_iter().map(|cell| cell.v).collect())
        .collect()
}

fn load_configuration(table: &TableRef, uri: &str, options: LoadOptions) -> Value {
    let mut load = json!({
        "sourceUris": [uri],
        "destinationTable": table_reference(table),
        "sourceFormat": options.format.as_api_str(),
        "autodetect": true,
        "createDisposition": "CREATE_IF_NEEDED",
        "writeDisposition": "WRITE_TRUNCATE",
    });
    if options.format == SourceFormat::Csv {
        load["skipLeadingRows"] = json!(options.skip_leading_rows);
    }
    json!({ "load": load })
}

fn query_configuration(sql: &str, destination: Option<&TableRef>) -> Value {
    let mut query = json!({
        "query": sql,
        "useLegacySql": false,
    });
    if let Some(destination) = destination {
        query["destinationTable"] = table_reference(destination);
        query["createDisposition"] = json!("CREATE_IF_NEEDED");
        query["writeDisposition"] = json!("WRITE_TRUNCATE");
    }
    json!({ "query": query })
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn project(&self) -> &str {
        &self.project
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        self.exists(self.url(&["datasets", dataset])).await
    }

    async fn create_dataset(&self, dataset: &str, location: &str) -> Result<(), WarehouseError> {
        let body = json!({
            "datasetReference": {
                "projectId": self.project,
                "datasetId": dataset,
            },
            "location": location,
        });
        let request = self
            .rest
            .request(Method::POST, self.url(&["datasets"]))
            .await?
            .json(&body);

        match self.rest.send(request).await {
            Ok(_) => {
                tracing::info!(dataset, location, "created dataset");
                Ok(())
            }
            Err(e) if e.is_conflict() => Err(WarehouseError::AlreadyExists(dataset.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.exists(self.url(&["datasets", &table.dataset, "tables", &table.table]))
            .await
    }

    async fn load_from_uri(
        &self,
        table: &TableRef,
        uri: &str,
        options: LoadOptions,
    ) -> Result<LoadOutcome, WarehouseError> {
        let job = self.run_job(load_configuration(table, uri, options)).await?;

        let rows_loaded = job
            .statistics
            .load
            .and_then(|load| load.output_rows)
            .and_then(|rows| rows.parse().ok());

        tracing::info!(%table, uri, ?rows_loaded, "load job finished");
        Ok(LoadOutcome { rows_loaded })
    }

    async fn query(&self, sql: &str, max_rows: Option<usize>) -> Result<ResultSet, WarehouseError> {
        let job = self.run_job(query_configuration(sql, None)).await?;
        self.fetch_results(&job.job_reference, max_rows).await
    }

    async fn query_into(&self, sql: &str, destination: &TableRef) -> Result<(), WarehouseError> {
        self.run_job(query_configuration(sql, Some(destination)))
            .await?;
        Ok(())
    }

    async fn create_or_replace_view(
        &self,
        view: &TableRef,
        sql: &str,
    ) -> Result<(), WarehouseError> {
        let ddl = format!("CREATE OR REPLACE VIEW {} AS\n{}", view.sql(), sql);
        self.run_job(query_configuration(&ddl, None)).await?;
        Ok(())
    }
}
