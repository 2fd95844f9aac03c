//! Upload ingestion: the file extension decides how the bytes are normalized,
//! staged and loaded.

use crate::errors::{PortalError, Result};
use crate::metrics_defs::UPLOADS;
use crate::table_name::{TableName, base_name, extension};
use crate::tables::{CSV_WITH_HEADER, TableResolver};
use bytes::Bytes;
use calamine::{Reader, open_workbook_auto_from_rs};
use cloud::object_store::ObjectStore;
use cloud::pubsub::MessagePublisher;
use cloud::warehouse::{LoadOptions, SourceFormat};
use serde::Serialize;
use shared::counter;
use std::io::Cursor;
use std::sync::Arc;

pub const UPLOAD_PREFIX: &str = "uploads/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFormat {
    Csv,
    Excel,
    Json,
    Parquet,
    Sql,
}

impl UploadFormat {
    /// Maps a file name to its format by (case-insensitive) extension.
    pub fn from_filename(filename: &str) -> Result<Self> {
        match extension(filename).as_deref() {
            Some("csv") => Ok(UploadFormat::Csv),
            Some("xls" | "xlsx") => Ok(UploadFormat::Excel),
            Some("json") => Ok(UploadFormat::Json),
            Some("parquet") => Ok(UploadFormat::Parquet),
            Some("sql") => Ok(UploadFormat::Sql),
            _ => Err(PortalError::UnsupportedFormat(filename.to_string())),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            UploadFormat::Csv => "csv",
            UploadFormat::Excel => "excel",
            UploadFormat::Json => "json",
            UploadFormat::Parquet => "parquet",
            UploadFormat::Sql => "sql",
        }
    }

    /// How the staged object is loaded, or `None` for formats that are not
    /// loaded into the warehouse.
    pub const fn load_options(&self) -> Option<LoadOptions> {
        match self {
            UploadFormat::Csv | UploadFormat::Excel => Some(CSV_WITH_HEADER),
            UploadFormat::Json => Some(LoadOptions {
                format: SourceFormat::NewlineDelimitedJson,
                skip_leading_rows: 0,
            }),
            UploadFormat::Parquet => Some(LoadOptions {
                format: SourceFormat::Parquet,
                skip_leading_rows: 0,
            }),
            UploadFormat::Sql => None,
        }
    }

    /// Extension of the object the warehouse loads, `None` when nothing is
    /// loaded.
    const fn staged_extension(&self) -> Option<&'static str> {
        match self {
            UploadFormat::Csv | UploadFormat::Excel => Some("csv"),
            UploadFormat::Json => Some("json"),
            UploadFormat::Parquet => Some("parquet"),
            UploadFormat::Sql => None,
        }
    }

    fn content_type(&self, filename: &str) -> &'static str {
        match self {
            UploadFormat::Csv => "text/csv",
            UploadFormat::Excel if extension(filename).as_deref() == Some("xls") => {
                "application/vnd.ms-excel"
            }
            UploadFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            UploadFormat::Json => "application/json",
            UploadFormat::Parquet => "application/octet-stream",
            UploadFormat::Sql => "application/sql",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub format: UploadFormat,
    /// Object the warehouse loaded from, or the forwarded dump for SQL.
    pub staged_key: String,
    pub rows_loaded: Option<u64>,
}

/// Message asking the importer to replay a staged SQL dump.
#[derive(Serialize)]
pub struct SqlImportRequest<'a> {
    pub name: &'a str,
    pub bucket: &'a str,
}

pub struct Ingestor {
    store: Arc<dyn ObjectStore>,
    tables: Arc<TableResolver>,
    publisher: Arc<dyn MessagePublisher>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tables: Arc<TableResolver>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Ingestor {
            store,
            tables,
            publisher,
        }
    }

    /// Stages `raw` under `uploads/` and loads it into `table`, replacing its
    /// contents. SQL dumps are forwarded to the import topic instead.
    ///
    /// The raw bytes keep the uploaded file name. The object the warehouse
    /// loads is keyed by table name (`uploads/<table>.<ext>`) so it can be
    /// found again by [`TableResolver::ensure_table_from_upload`].
    pub async fn ingest(&self, raw: Bytes, filename: &str, table: &TableName) -> Result<IngestOutcome> {
        let filename = base_name(filename);
        let format = UploadFormat::from_filename(filename)?;

        // Convert before anything is written so a bad workbook leaves no trace.
        let converted = match format {
            UploadFormat::Excel => Some(Bytes::from(excel_to_csv(&raw)?)),
            _ => None,
        };

        let raw_key = format!("{UPLOAD_PREFIX}{filename}");
        self.store
            .put(&raw_key, raw.clone(), format.content_type(filename))
            .await?;
        counter!(UPLOADS, "format" => format.as_str()).increment(1);

        let staged_key = match format.staged_extension() {
            Some(ext) => format!("{UPLOAD_PREFIX}{table}.{ext}"),
            None => raw_key.clone(),
        };
        if staged_key != raw_key {
            let (data, content_type) = match converted {
                Some(csv) => (csv, "text/csv"),
                None => (raw, format.content_type(filename)),
            };
            self.store.put(&staged_key, data, content_type).await?;
        }

        let Some(options) = format.load_options() else {
            self.publish_sql_import(&staged_key).await?;
            return Ok(IngestOutcome {
                format,
                staged_key,
                rows_loaded: None,
            });
        };

        let outcome = self.tables.load(table, &staged_key, options).await?;
        tracing::info!(
            %table,
            format = format.as_str(),
            key = %staged_key,
            rows = ?outcome.rows_loaded,
            "upload loaded"
        );

        Ok(IngestOutcome {
            format,
            staged_key,
            rows_loaded: outcome.rows_loaded,
        })
    }

    /// Asks the importer to replay the dump at `key` in the portal's bucket.
    pub async fn publish_sql_import(&self, key: &str) -> Result<String> {
        let message = serde_json::to_vec(&SqlImportRequest {
            name: key,
            bucket: self.store.bucket(),
        })
        .map_err(|e| PortalError::InvalidRequest(e.to_string()))?;

        let message_id = self.publisher.publish(&message).await?;
        tracing::info!(%key, topic = self.publisher.topic(), %message_id, "sql import requested");
        Ok(message_id)
    }
}

/// Converts the first worksheet of an `.xls`/`.xlsx` workbook to CSV.
pub fn excel_to_csv(raw: &[u8]) -> Result<Vec<u8>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(raw))
        .map_err(|e| PortalError::Spreadsheet(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| PortalError::Spreadsheet("workbook has no worksheets".into()))?
        .map_err(|e| PortalError::Spreadsheet(e.to_string()))?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in range.rows() {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| PortalError::Spreadsheet(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePolicy;
    use cloud::testutils::{MemoryObjectStore, MemoryPublisher, MemoryWarehouse};
    use cloud::warehouse::TableRef;
    use serde_json::Value;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
        publisher: Arc<MemoryPublisher>,
        ingestor: Ingestor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let warehouse = Arc::new(MemoryWarehouse::new("proj", store.clone()));
        let publisher = Arc::new(MemoryPublisher::new("sql-import-topic"));
        let tables = Arc::new(TableResolver::new(
            warehouse.clone(),
            store.clone(),
            "ds".into(),
            "US".into(),
            SourcePolicy::BaseFirst,
        ));
        let ingestor = Ingestor::new(store.clone(), tables, publisher.clone());
        Fixture {
            store,
            warehouse,
            publisher,
            ingestor,
        }
    }

    fn table(name: &str) -> TableName {
        TableName::parse(name).unwrap()
    }

    fn xlsx(rows: &[(&str, f64)]) -> Vec<u8> {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "item").unwrap();
        sheet.write_string(0, 1, "qty").unwrap();
        for (i, (item, qty)) in rows.iter().enumerate() {
            let row = i as u32 + 1;
            sheet.write_string(row, 0, *item).unwrap();
            sheet.write_number(row, 1, *qty).unwrap();
        }
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn test_format_dispatch() {
        let cases = [
            ("a.csv", UploadFormat::Csv),
            ("a.CSV", UploadFormat::Csv),
            ("a.xls", UploadFormat::Excel),
            ("a.XLSX", UploadFormat::Excel),
            ("a.json", UploadFormat::Json),
            ("a.parquet", UploadFormat::Parquet),
            ("dump.sql", UploadFormat::Sql),
        ];
        for (filename, expected) in cases {
            assert_eq!(UploadFormat::from_filename(filename).unwrap(), expected);
        }
        for filename in ["a.txt", "a", "a.csv.bak"] {
            assert!(matches!(
                UploadFormat::from_filename(filename).unwrap_err(),
                PortalError::UnsupportedFormat(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_unsupported_touches_nothing() {
        let f = fixture();
        let err = f
            .ingestor
            .ingest(Bytes::from_static(b"hello"), "notes.txt", &table("notes"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::UnsupportedFormat(_)));
        assert_eq!(f.store.calls(), 0);
        assert_eq!(f.warehouse.calls(), 0);
    }

    #[tokio::test]
    async fn test_csv_is_staged_then_loaded() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(
                Bytes::from_static(b"name,qty\nwidget,3\n"),
                "C:\\Users\\me\\sales.csv",
                &table("sales"),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            IngestOutcome {
                format: UploadFormat::Csv,
                staged_key: "uploads/sales.csv".into(),
                rows_loaded: Some(1),
            }
        );
        assert_eq!(
            f.store.object("uploads/sales.csv").unwrap(),
            Bytes::from_static(b"name,qty\nwidget,3\n")
        );
        let loaded = f.warehouse.table(&TableRef::new("proj", "ds", "sales")).unwrap();
        assert_eq!(loaded.columns, vec!["name", "qty"]);
    }

    #[tokio::test]
    async fn test_excel_replaces_earlier_csv() {
        let f = fixture();
        let sales = table("sales");
        f.ingestor
            .ingest(Bytes::from_static(b"item,qty\nold,1\nolder,2\n"), "sales.csv", &sales)
            .await
            .unwrap();

        let outcome = f
            .ingestor
            .ingest(Bytes::from(xlsx(&[("new", 5.0)])), "sales.xlsx", &sales)
            .await
            .unwrap();
        assert_eq!(outcome.format, UploadFormat::Excel);
        assert_eq!(outcome.staged_key, "uploads/sales.csv");
        assert!(f.store.object("uploads/sales.xlsx").is_some());
        assert_eq!(
            f.store.object("uploads/sales.csv").unwrap(),
            Bytes::from_static(b"item,qty\nnew,5\n")
        );

        let loaded = f.warehouse.table(&TableRef::new("proj", "ds", "sales")).unwrap();
        assert_eq!(loaded.rows, vec![vec![Value::from("new"), Value::from("5")]]);
    }

    #[tokio::test]
    async fn test_staged_copy_is_keyed_by_table() {
        let f = fixture();
        let q1 = TableName::from_filename("Q1 Report.CSV").unwrap();
        let outcome = f
            .ingestor
            .ingest(Bytes::from_static(b"a\n1\n"), "Q1 Report.CSV", &q1)
            .await
            .unwrap();

        assert_eq!(outcome.staged_key, "uploads/q1_report.csv");
        assert!(f.store.object("uploads/Q1 Report.CSV").is_some());
        assert_eq!(
            f.store.object("uploads/q1_report.csv").unwrap(),
            Bytes::from_static(b"a\n1\n")
        );
    }

    #[tokio::test]
    async fn test_excel_keeps_other_raw_csv() {
        let f = fixture();
        f.store.insert("uploads/Sales.csv", "keep,me\n");

        let outcome = f
            .ingestor
            .ingest(Bytes::from(xlsx(&[("new", 5.0)])), "Sales.xlsx", &table("sales"))
            .await
            .unwrap();
        assert_eq!(outcome.staged_key, "uploads/sales.csv");
        assert_eq!(
            f.store.object("uploads/Sales.csv").unwrap(),
            Bytes::from_static(b"keep,me\n")
        );
    }

    #[tokio::test]
    async fn test_bad_workbook_is_rejected_before_staging() {
        let f = fixture();
        let err = f
            .ingestor
            .ingest(Bytes::from_static(b"not a workbook"), "sales.xlsx", &table("sales"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Spreadsheet(_)));
        assert_eq!(f.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_table() {
        let f = fixture();
        let sales = table("sales");
        f.ingestor
            .ingest(Bytes::from_static(b"a,b\n1,2\n"), "sales.csv", &sales)
            .await
            .unwrap();

        let err = f
            .ingestor
            .ingest(Bytes::from_static(b"a,b\n1\n"), "sales.csv", &sales)
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Warehouse(_)));

        let loaded = f.warehouse.table(&TableRef::new("proj", "ds", "sales")).unwrap();
        assert_eq!(loaded.rows, vec![vec![Value::from("1"), Value::from("2")]]);
    }

    #[tokio::test]
    async fn test_sql_is_forwarded() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(Bytes::from_static(b"CREATE TABLE t (a INT);"), "dump.sql", &table("dump"))
            .await
            .unwrap();

        assert_eq!(outcome.format, UploadFormat::Sql);
        assert_eq!(outcome.rows_loaded, None);
        assert_eq!(f.warehouse.calls(), 0);

        let messages = f.publisher.messages();
        assert_eq!(messages.len(), 1);
        let message: Value = serde_json::from_slice(&messages[0]).unwrap();
        assert_eq!(
            message,
            serde_json::json!({"name": "uploads/dump.sql", "bucket": "bucket"})
        );
    }
}
