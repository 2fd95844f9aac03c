use crate::RestError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Fully qualified warehouse table or view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        TableRef {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Backtick-quoted identifier for use inside standard SQL.
    pub fn sql(&self) -> String {
        format!("`{self}`")
    }

    /// Parses `project.dataset.table`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let mut parts = qualified.splitn(3, '.');
        let project = parts.next().filter(|s| !s.is_empty())?;
        let dataset = parts.next().filter(|s| !s.is_empty())?;
        let table = parts.next().filter(|s| !s.is_empty())?;
        Some(TableRef::new(project, dataset, table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    NewlineDelimitedJson,
    Parquet,
}

impl SourceFormat {
    pub const fn as_api_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "CSV",
            SourceFormat::NewlineDelimitedJson => "NEWLINE_DELIMITED_JSON",
            SourceFormat::Parquet => "PARQUET",
        }
    }
}

/// Bulk load parameters. Loads always autodetect the schema and replace the
/// table contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    pub format: SourceFormat,
    pub skip_leading_rows: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_loaded: Option<u64>,
}

/// Rows returned by a query, with column names in schema order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(thiserror::Error, Debug)]
pub enum WarehouseError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("timed out waiting for job {0}")]
    Timeout(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("warehouse request failed: {0}")]
    Rest(#[from] RestError),
}

impl WarehouseError {
    /// Only an expired wait is worth retrying; the job may still finish.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WarehouseError::Timeout(_))
    }
}

/// A SQL-queryable analytical table store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn project(&self) -> &str;

    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError>;

    /// Returns `WarehouseError::AlreadyExists` if another caller won the race.
    async fn create_dataset(&self, dataset: &str, location: &str) -> Result<(), WarehouseError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    /// Loads `uri` into `table`, replacing its contents. A failed load does
    /// not touch the existing table.
    async fn load_from_uri(
        &self,
        table: &TableRef,
        uri: &str,
        options: LoadOptions,
    ) -> Result<LoadOutcome, WarehouseError>;

    /// Runs `sql` to completion and returns at most `max_rows` rows.
    async fn query(&self, sql: &str, max_rows: Option<usize>) -> Result<ResultSet, WarehouseError>;

    /// Runs `sql` and replaces `destination` with its result.
    async fn query_into(&self, sql: &str, destination: &TableRef) -> Result<(), WarehouseError>;

    async fn create_or_replace_view(&self, view: &TableRef, sql: &str)
    -> Result<(), WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref() {
        let table = TableRef::new("proj", "analysis_dataset", "sales");
        assert_eq!(table.to_string(), "proj.analysis_dataset.sales");
        assert_eq!(table.sql(), "`proj.analysis_dataset.sales`");
        assert_eq!(TableRef::parse("proj.analysis_dataset.sales"), Some(table));
        assert_eq!(TableRef::parse("proj.sales"), None);
        assert_eq!(TableRef::parse("proj..sales"), None);
    }

    #[test]
    fn test_retryable() {
        assert!(WarehouseError::Timeout("job_1".into()).is_retryable());
        assert!(!WarehouseError::NotFound("t".into()).is_retryable());
    }
}
