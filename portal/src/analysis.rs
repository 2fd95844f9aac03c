//! The preview workflow: a fixed-size query over the resolved source table,
//! published both as a CSV object and as the `<table>_analysis` table.

use crate::csv_export::to_csv;
use crate::errors::{PortalError, Result};
use crate::metrics_defs::PREVIEW_RUNS;
use crate::table_name::TableName;
use crate::tables::TableResolver;
use bytes::Bytes;
use cloud::object_store::ObjectStore;
use reqwest::StatusCode;
use shared::counter;
use std::sync::Arc;
use url::Url;

pub const PREVIEW_ROWS: usize = 10;
pub const RESULTS_PREFIX: &str = "analysis_results/";

/// Object key of the preview CSV for `table`.
pub fn results_key(table: &TableName) -> String {
    format!("{RESULTS_PREFIX}{table}_results.csv")
}

pub struct AnalysisRunner {
    tables: Arc<TableResolver>,
    store: Arc<dyn ObjectStore>,
}

impl AnalysisRunner {
    pub fn new(tables: Arc<TableResolver>, store: Arc<dyn ObjectStore>) -> Self {
        AnalysisRunner { tables, store }
    }

    /// Runs the preview for `table` and returns the same name. Steps run in
    /// order and the first failure aborts the rest.
    pub async fn run_preview(&self, table: &TableName) -> Result<TableName> {
        let result = self.preview(table).await;
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        counter!(PREVIEW_RUNS, "outcome" => outcome).increment(1);
        result.map(|()| table.clone())
    }

    async fn preview(&self, table: &TableName) -> Result<()> {
        self.tables.ensure_dataset().await?;
        let source = self.tables.resolve_query_source(table).await?;

        let sql = format!("SELECT * FROM {} LIMIT {PREVIEW_ROWS}", source.sql());
        let warehouse = self.tables.warehouse();
        let results = warehouse.query(&sql, None).await?;

        let key = results_key(table);
        let csv = to_csv(&results)?;
        self.store.put(&key, Bytes::from(csv), "text/csv").await?;

        let destination = self.tables.table_ref(&table.analysis());
        if let Err(e) = warehouse.query_into(&sql, &destination).await {
            tracing::warn!(
                %table,
                %key,
                error = %e,
                "preview csv written but analysis table not updated"
            );
            return Err(e.into());
        }

        tracing::info!(%table, %source, rows = results.rows.len(), "preview complete");
        Ok(())
    }

    /// Refreshes the preview, then returns the whole analysis table as CSV.
    pub async fn export_analysis_csv(&self, table: &TableName) -> Result<Vec<u8>> {
        self.run_preview(table).await?;
        let analysis = self.tables.table_ref(&table.analysis());
        let results = self
            .tables
            .warehouse()
            .query(&format!("SELECT * FROM {}", analysis.sql()), None)
            .await?;
        Ok(to_csv(&results)?)
    }
}

/// Runs previews either in this process or on a remote portal's
/// `/run_analysis` endpoint.
#[derive(Clone)]
pub struct AnalysisClient(AnalysisInner);

#[derive(Clone)]
enum AnalysisInner {
    InProcess(Arc<AnalysisRunner>),
    Remote(RemoteAnalysis),
}

impl AnalysisClient {
    pub fn in_process(runner: Arc<AnalysisRunner>) -> Self {
        AnalysisClient(AnalysisInner::InProcess(runner))
    }

    pub fn remote(client: reqwest::Client, url: Url) -> Self {
        AnalysisClient(AnalysisInner::Remote(RemoteAnalysis { client, url }))
    }

    pub async fn run_preview(&self, table: &TableName) -> Result<()> {
        match &self.0 {
            AnalysisInner::InProcess(runner) => runner.run_preview(table).await.map(|_| ()),
            AnalysisInner::Remote(remote) => remote.run_preview(table).await,
        }
    }
}

#[derive(Clone)]
struct RemoteAnalysis {
    client: reqwest::Client,
    url: Url,
}

impl RemoteAnalysis {
    async fn run_preview(&self, table: &TableName) -> Result<()> {
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("table", table.as_str())])
            .send()
            .await
            .map_err(|e| PortalError::AnalysisService(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PortalError::TableNotFound(table.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(PortalError::AnalysisService(format!("{status}: {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePolicy;
    use cloud::testutils::{MemoryObjectStore, MemoryWarehouse};
    use cloud::warehouse::TableRef;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
        runner: AnalysisRunner,
    }

    fn fixture(policy: SourcePolicy) -> Fixture {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let warehouse = Arc::new(MemoryWarehouse::new("proj", store.clone()));
        let tables = Arc::new(TableResolver::new(
            warehouse.clone(),
            store.clone(),
            "ds".into(),
            "US".into(),
            policy,
        ));
        let runner = AnalysisRunner::new(tables, store.clone());
        Fixture {
            store,
            warehouse,
            runner,
        }
    }

    fn sales() -> TableName {
        TableName::parse("sales").unwrap()
    }

    fn many_rows(n: usize) -> Vec<Vec<String>> {
        (0..n).map(|i| vec![format!("item{i}"), i.to_string()]).collect()
    }

    fn seed(warehouse: &MemoryWarehouse, table: &TableRef, rows: &[Vec<String>]) {
        let rows: Vec<Vec<&str>> = rows
            .iter()
            .map(|row| row.iter().map(String::as_str).collect())
            .collect();
        let rows: Vec<&[&str]> = rows.iter().map(Vec::as_slice).collect();
        warehouse.insert_table(table, &["item", "qty"], &rows);
    }

    #[test]
    fn test_results_key() {
        assert_eq!(results_key(&sales()), "analysis_results/sales_results.csv");
    }

    #[tokio::test]
    async fn test_preview_is_repeatable() {
        let f = fixture(SourcePolicy::BaseFirst);
        let base = TableRef::new("proj", "ds", "sales");
        seed(&f.warehouse, &base, &many_rows(25));

        assert_eq!(f.runner.run_preview(&sales()).await.unwrap(), sales());
        let first = f.store.object("analysis_results/sales_results.csv").unwrap();

        f.runner.run_preview(&sales()).await.unwrap();
        let second = f.store.object("analysis_results/sales_results.csv").unwrap();
        assert_eq!(first, second);

        let csv = String::from_utf8(first.to_vec()).unwrap();
        assert_eq!(csv.lines().count(), PREVIEW_ROWS + 1);
        assert!(csv.starts_with("item,qty\nitem0,0\n"));

        let analysis = f
            .warehouse
            .table(&TableRef::new("proj", "ds", "sales_analysis"))
            .unwrap();
        assert_eq!(analysis.rows.len(), PREVIEW_ROWS);
    }

    #[tokio::test]
    async fn test_preview_falls_back_to_analysis_table() {
        let f = fixture(SourcePolicy::BaseFirst);
        let analysis = TableRef::new("proj", "ds", "sales_analysis");
        seed(&f.warehouse, &analysis, &many_rows(3));

        f.runner.run_preview(&sales()).await.unwrap();
        assert_eq!(f.warehouse.table(&analysis).unwrap().rows.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_table() {
        let f = fixture(SourcePolicy::BaseFirst);
        let err = f.runner.run_preview(&sales()).await.unwrap_err();
        assert!(matches!(err, PortalError::TableNotFound(_)));
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_export_analysis_csv() {
        let f = fixture(SourcePolicy::BaseFirst);
        seed(
            &f.warehouse,
            &TableRef::new("proj", "ds", "sales"),
            &many_rows(12),
        );

        let csv = f.runner.export_analysis_csv(&sales()).await.unwrap();
        let csv = String::from_utf8(csv).unwrap();
        assert_eq!(csv.lines().count(), PREVIEW_ROWS + 1);
        assert_eq!(
            csv.as_bytes(),
            f.store
                .object("analysis_results/sales_results.csv")
                .unwrap()
                .as_ref()
        );
    }

    #[tokio::test]
    async fn test_remote_analysis() {
        use axum::Router;
        use axum::extract::Query;
        use axum::http::StatusCode as AxumStatus;
        use axum::routing::get;
        use std::collections::HashMap;

        let app = Router::new().route(
            "/run_analysis",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("table").map(String::as_str) {
                    Some("sales") => (AxumStatus::OK, "Analysis completed for table 'sales'."),
                    Some("broken") => (AxumStatus::INTERNAL_SERVER_ERROR, "boom"),
                    _ => (AxumStatus::NOT_FOUND, "not found"),
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let url = Url::parse(&format!("http://127.0.0.1:{port}/run_analysis")).unwrap();
        let client = AnalysisClient::remote(reqwest::Client::new(), url);

        client.run_preview(&sales()).await.unwrap();
        assert!(matches!(
            client
                .run_preview(&TableName::parse("orders").unwrap())
                .await
                .unwrap_err(),
            PortalError::TableNotFound(_)
        ));
        let err = client
            .run_preview(&TableName::parse("broken").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::AnalysisService(ref m) if m.contains("boom")));
    }
}
