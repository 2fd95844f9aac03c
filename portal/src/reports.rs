use crate::csv_export::to_csv;
use crate::errors::{PortalError, Result};
use crate::table_name::TableName;
use crate::tables::TableResolver;
use cloud::warehouse::{ResultSet, TableRef};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_ROW_LIMIT: u64 = 100;
pub const MAX_ROW_LIMIT: u64 = 10_000;

/// A canned aggregate query. `{table}` is replaced by the quoted base table.
#[derive(Debug)]
pub struct ReportDef {
    pub id: &'static str,
    pub label: &'static str,
    pub sql: &'static str,
}

impl ReportDef {
    pub fn render(&self, table: &TableRef) -> String {
        self.sql.replace("{table}", &table.sql())
    }
}

pub const CATALOG: &[ReportDef] = &[
    ReportDef {
        id: "row_count",
        label: "Total rows",
        sql: "SELECT COUNT(*) AS row_count FROM {table}",
    },
    ReportDef {
        id: "dept_totals",
        label: "Rows per department",
        sql: "SELECT department, COUNT(*) AS row_count FROM {table} GROUP BY department ORDER BY row_count DESC",
    },
    ReportDef {
        id: "sample_rows",
        label: "First 100 rows",
        sql: "SELECT * FROM {table} LIMIT 100",
    },
];

pub fn find_report(id: &str) -> Result<&'static ReportDef> {
    CATALOG
        .iter()
        .find(|report| report.id == id)
        .ok_or_else(|| PortalError::UnknownReport(id.to_string()))
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub id: &'static str,
    pub label: &'static str,
}

pub struct ReportPublisher {
    tables: Arc<TableResolver>,
}

impl ReportPublisher {
    pub fn new(tables: Arc<TableResolver>) -> Self {
        ReportPublisher { tables }
    }

    pub fn list_reports(&self) -> Vec<ReportSummary> {
        CATALOG
            .iter()
            .map(|report| ReportSummary {
                id: report.id,
                label: report.label,
            })
            .collect()
    }

    /// Runs a catalog report over the base table, returning at most
    /// `row_limit` rows (default 100).
    pub async fn run_report(
        &self,
        report_id: &str,
        table: &TableName,
        row_limit: Option<u64>,
    ) -> Result<ResultSet> {
        let limit = row_limit.unwrap_or(DEFAULT_ROW_LIMIT);
        if !(1..=MAX_ROW_LIMIT).contains(&limit) {
            return Err(PortalError::InvalidRowLimit {
                got: limit,
                max: MAX_ROW_LIMIT,
            });
        }
        let report = find_report(report_id)?;
        let base = self.existing_base(table).await?;

        let results = self
            .tables
            .warehouse()
            .query(&report.render(&base), Some(limit as usize))
            .await?;
        tracing::debug!(%table, report = report.id, rows = results.rows.len(), "report run");
        Ok(results)
    }

    /// Same as [`run_report`](Self::run_report) without a row limit, rendered
    /// as CSV.
    pub async fn download_report_csv(&self, report_id: &str, table: &TableName) -> Result<Vec<u8>> {
        let report = find_report(report_id)?;
        let base = self.existing_base(table).await?;
        let results = self
            .tables
            .warehouse()
            .query(&report.render(&base), None)
            .await?;
        Ok(to_csv(&results)?)
    }

    /// Publishes every catalog report over `table` as a view named
    /// `<table>__<report>_v`, creating the base table from a staged upload if
    /// needed. Returns the fully qualified view ids by report id.
    pub async fn publish_views(&self, table: &TableName) -> Result<BTreeMap<String, String>> {
        self.tables.ensure_dataset().await?;
        let base = self.tables.ensure_table_from_upload(table).await?;

        let mut views = BTreeMap::new();
        for report in CATALOG {
            let view = self.tables.table_ref(&table.view(report.id));
            self.tables
                .warehouse()
                .create_or_replace_view(&view, &report.render(&base))
                .await?;
            views.insert(report.id.to_string(), view.to_string());
        }

        tracing::info!(%table, count = views.len(), "views published");
        Ok(views)
    }

    async fn existing_base(&self, table: &TableName) -> Result<TableRef> {
        let base = self.tables.table_ref(table);
        if self.tables.warehouse().table_exists(&base).await? {
            Ok(base)
        } else {
            Err(PortalError::TableNotFound(table.to_string()))
        }
    }
}
