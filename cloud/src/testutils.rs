//! In-memory fakes of every capability, with call counters so tests can
//! assert that nothing external was touched.
//!
//! `MemoryWarehouse` understands just enough SQL for the statements the portal
//! issues: `SELECT * ... [LIMIT n]`, `SELECT COUNT(*) AS c ...` and
//! `SELECT col, COUNT(*) AS c ... GROUP BY col [ORDER BY c DESC]`, each against a
//! single backtick-quoted table. Like the real service it returns every cell
//! as a JSON string (or null).

use crate::cloudsql::{SqlImportError, SqlImporter};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::pubsub::{MessagePublisher, PublishError};
use crate::warehouse::{
    LoadOptions, LoadOutcome, ResultSet, SourceFormat, TableRef, Warehouse, WarehouseError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const FAKE_JOB_ID: &str = "memory_job";

pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Bytes>>,
    calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        MemoryObjectStore {
            bucket: bucket.into(),
            objects: Mutex::default(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Seeds an object without counting a call.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.lock().insert(key.to_string(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.record_call();
        Ok(self.objects.lock().contains_key(key))
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<(), ObjectStoreError> {
        self.record_call();
        self.objects.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.record_call();
        self.object(key)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}

#[derive(Clone, Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct WarehouseState {
    datasets: BTreeSet<String>,
    tables: BTreeMap<TableRef, Table>,
    views: BTreeMap<TableRef, String>,
}

/// Warehouse fake that loads `gs://` URIs out of a `MemoryObjectStore`.
pub struct MemoryWarehouse {
    project: String,
    store: Arc<MemoryObjectStore>,
    state: Mutex<WarehouseState>,
    calls: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new(project: impl Into<String>, store: Arc<MemoryObjectStore>) -> Self {
        MemoryWarehouse {
            project: project.into(),
            store,
            state: Mutex::default(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Seeds a table (and its dataset) without counting a call. Cells are
    /// stored as strings.
    pub fn insert_table(&self, table: &TableRef, columns: &[&str], rows: &[&[&str]]) {
        let mut state = self.state.lock();
        state.datasets.insert(table.dataset.clone());
        state.tables.insert(
            table.clone(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(|v| Value::String(v.to_string())).collect())
                    .collect(),
            },
        );
    }

    pub fn table(&self, table: &TableRef) -> Option<ResultSet> {
        self.state.lock().tables.get(table).map(|t| ResultSet {
            columns: t.columns.clone(),
            rows: t.rows.clone(),
        })
    }

    pub fn view_sql(&self, view: &TableRef) -> Option<String> {
        self.state.lock().views.get(view).cloned()
    }

    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.state.lock().datasets.contains(dataset)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn require_dataset(&self, table: &TableRef) -> Result<(), WarehouseError> {
        if self.state.lock().datasets.contains(&table.dataset) {
            Ok(())
        } else {
            Err(WarehouseError::NotFound(format!(
                "Dataset {}:{}",
                table.project, table.dataset
            )))
        }
    }

    fn read_uri(&self, uri: &str) -> Result<Bytes, WarehouseError> {
        let not_found = || WarehouseError::NotFound(format!("URI {uri}"));
        let (bucket, key) = uri
            .strip_prefix("gs://")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(not_found)?;
        if bucket != self.store.bucket() {
            return Err(not_found());
        }
        self.store.object(key).ok_or_else(not_found)
    }

    fn evaluate(&self, sql: &str) -> Result<Table, WarehouseError> {
        let query = ParsedQuery::parse(sql)?;
        let source = TableRef::parse(&query.table)
            .ok_or_else(|| job_failed(format!("Invalid table name: {}", query.table)))?;

        let state = self.state.lock();
        let table = state
            .tables
            .get(&source)
            .ok_or_else(|| WarehouseError::NotFound(format!("Table {source}")))?;

        let mut result = match &query.projection {
            Projection::All => table.clone(),
            Projection::Count { alias } => Table {
                columns: vec![alias.clone()],
                rows: vec![vec![Value::String(table.rows.len().to_string())]],
            },
            Projection::GroupCount {
                column,
                alias,
                descending,
            } => {
                let index = table
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .ok_or_else(|| job_failed(format!("Unrecognized name: {column}")))?;

                let mut groups: Vec<(Value, usize)> = Vec::new();
                for row in &table.rows {
                    let key = row.get(index).cloned().unwrap_or(Value::Null);
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, n)) => *n += 1,
                        None => groups.push((key, 1)),
                    }
                }
                if *descending {
                    groups.sort_by(|a, b| b.1.cmp(&a.1));
                }

                Table {
                    columns: vec![column.clone(), alias.clone()],
                    rows: groups
                        .into_iter()
                        .map(|(key, n)| vec![key, Value::String(n.to_string())])
                        .collect(),
                }
            }
        };

        if let Some(limit) = query.limit {
            result.rows.truncate(limit);
        }
        Ok(result)
    }
}

fn job_failed(message: String) -> WarehouseError {
    WarehouseError::JobFailed {
        job_id: FAKE_JOB_ID.to_string(),
        message,
    }
}

enum Projection {
    All,
    Count {
        alias: String,
    },
    GroupCount {
        column: String,
        alias: String,
        descending: bool,
    },
}

struct ParsedQuery {
    projection: Projection,
    table: String,
    limit: Option<usize>,
}

impl ParsedQuery {
    fn parse(sql: &str) -> Result<Self, WarehouseError> {
        let unsupported = || job_failed(format!("Unsupported query: {sql}"));

        let sql = sql.trim();
        let body = sql.strip_prefix("SELECT ").ok_or_else(unsupported)?;
        let (select, rest) = body.split_once(" FROM `").ok_or_else(unsupported)?;
        let (table, tail) = rest.split_once('`').ok_or_else(unsupported)?;
        let tail = tail.trim();

        let limit = match tail.split_once("LIMIT ") {
            Some((_, n)) => Some(n.trim().parse().map_err(|_| unsupported())?),
            None => None,
        };

        let select = select.trim();
        let projection = if select == "*" {
            Projection::All
        } else if let Some(alias) = select.strip_prefix("COUNT(*) AS ") {
            Projection::Count {
                alias: alias.trim().to_string(),
            }
        } else if let Some((column, count)) = select.split_once(", COUNT(*) AS ") {
            let column = column.trim().to_string();
            if !tail.starts_with(&format!("GROUP BY {column}")) {
                return Err(unsupported());
            }
            Projection::GroupCount {
                alias: count.trim().to_string(),
                descending: tail.contains(" DESC"),
                column,
            }
        } else {
            return Err(unsupported());
        };

        Ok(ParsedQuery {
            projection,
            table: table.to_string(),
            limit,
        })
    }
}

fn parse_csv(data: &[u8], skip_leading_rows: u32) -> Result<Table, WarehouseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(data);

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record.map_err(|e| job_failed(format!("Error while reading data: {e}")))?);
    }

    let skip = skip_leading_rows as usize;
    let columns = match (skip, records.first()) {
        (0, Some(first)) => (0..first.len()).map(|i| format!("string_field_{i}")).collect(),
        (_, Some(header)) => header.iter().map(|name| name.trim().to_string()).collect(),
        (_, None) => Vec::new(),
    };

    let rows = records
        .iter()
        .skip(skip)
        .map(|record| {
            record
                .iter()
                .map(|cell| {
                    if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    }
                })
                .collect()
        })
        .collect();

    Ok(Table { columns, rows })
}

fn parse_ndjson(data: &[u8]) -> Result<Table, WarehouseError> {
    let text = std::str::from_utf8(data).map_err(|e| job_failed(e.to_string()))?;

    let mut objects = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let Value::Object(object) = serde_json::from_str::<Value>(line)
            .map_err(|e| job_failed(format!("Error while reading data: {e}")))?
        else {
            return Err(job_failed(format!("Expected a JSON object: {line}")));
        };
        for key in object.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
        objects.push(object);
    }

    let rows = objects
        .into_iter()
        .map(|object| {
            columns
                .iter()
                .map(|column| match object.get(column) {
                    None | Some(Value::Null) => Value::Null,
                    Some(Value::String(s)) => Value::String(s.clone()),
                    Some(v @ (Value::Bool(_) | Value::Number(_))) => Value::String(v.to_string()),
                    Some(nested) => nested.clone(),
                })
                .collect()
        })
        .collect();

    Ok(Table { columns, rows })
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn project(&self) -> &str {
        &self.project
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        self.record_call();
        Ok(self.state.lock().datasets.contains(dataset))
    }

    async fn create_dataset(&self, dataset: &str, _location: &str) -> Result<(), WarehouseError> {
        self.record_call();
        if self.state.lock().datasets.insert(dataset.to_string()) {
            Ok(())
        } else {
            Err(WarehouseError::AlreadyExists(dataset.to_string()))
        }
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.record_call();
        Ok(self.state.lock().tables.contains_key(table))
    }

    async fn load_from_uri(
        &self,
        table: &TableRef,
        uri: &str,
        options: LoadOptions,
    ) -> Result<LoadOutcome, WarehouseError> {
        self.record_call();
        self.require_dataset(table)?;

        let data = self.read_uri(uri)?;
        let loaded = match options.format {
            SourceFormat::Csv => parse_csv(&data, options.skip_leading_rows)?,
            SourceFormat::NewlineDelimitedJson => parse_ndjson(&data)?,
            SourceFormat::Parquet => {
                return Err(job_failed("Parquet is not supported in memory".into()));
            }
        };

        let rows_loaded = loaded.rows.len() as u64;
        self.state.lock().tables.insert(table.clone(), loaded);
        Ok(LoadOutcome {
            rows_loaded: Some(rows_loaded),
        })
    }

    async fn query(&self, sql: &str, max_rows: Option<usize>) -> Result<ResultSet, WarehouseError> {
        self.record_call();
        let mut result = self.evaluate(sql)?;
        if let Some(max) = max_rows {
            result.rows.truncate(max);
        }
        Ok(ResultSet {
            columns: result.columns,
            rows: result.rows,
        })
    }

    async fn query_into(&self, sql: &str, destination: &TableRef) -> Result<(), WarehouseError> {
        self.record_call();
        self.require_dataset(destination)?;
        let result = self.evaluate(sql)?;
        self.state.lock().tables.insert(destination.clone(), result);
        Ok(())
    }

    async fn create_or_replace_view(
        &self,
        view: &TableRef,
        sql: &str,
    ) -> Result<(), WarehouseError> {
        self.record_call();
        self.require_dataset(view)?;
        // Views are validated against their source like the real service does.
        self.evaluate(sql)?;
        self.state.lock().views.insert(view.clone(), sql.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPublisher {
    topic: String,
    messages: Mutex<Vec<Vec<u8>>>,
    calls: AtomicUsize,
}

impl MemoryPublisher {
    pub fn new(topic: impl Into<String>) -> Self {
        MemoryPublisher {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, data: &[u8]) -> Result<String, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut messages = self.messages.lock();
        messages.push(data.to_vec());
        Ok(messages.len().to_string())
    }
}

#[derive(Default)]
pub struct MemorySqlImporter {
    imports: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MemorySqlImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn imports(&self) -> Vec<String> {
        self.imports.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlImporter for MemorySqlImporter {
    async fn import_sql(&self, uri: &str) -> Result<String, SqlImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut imports = self.imports.lock();
        imports.push(uri.to_string());
        Ok(format!("operation-{}", imports.len()))
    }
}
