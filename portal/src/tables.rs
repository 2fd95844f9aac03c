use crate::config::SourcePolicy;
use crate::errors::{PortalError, Result};
use crate::table_name::TableName;
use cloud::object_store::ObjectStore;
use cloud::warehouse::{LoadOptions, LoadOutcome, SourceFormat, TableRef, Warehouse, WarehouseError};
use std::sync::Arc;

/// Prefixes searched, in order, for a staged `<table>.csv`.
const UPLOAD_PREFIXES: [&str; 4] = ["", "uploads/", "data/", "raw/"];

pub const CSV_WITH_HEADER: LoadOptions = LoadOptions {
    format: SourceFormat::Csv,
    skip_leading_rows: 1,
};

/// Existence checks, query-source precedence and table creation for the
/// portal's dataset.
pub struct TableResolver {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn ObjectStore>,
    dataset: String,
    location: String,
    policy: SourcePolicy,
}

impl TableResolver {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn ObjectStore>,
        dataset: String,
        location: String,
        policy: SourcePolicy,
    ) -> Self {
        TableResolver {
            warehouse,
            store,
            dataset,
            location,
            policy,
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn table_ref(&self, table: &TableName) -> TableRef {
        TableRef::new(self.warehouse.project(), &self.dataset, table.as_str())
    }

    /// Creates the dataset unless it exists. Losing a creation race to
    /// another request counts as success.
    pub async fn ensure_dataset(&self) -> Result<()> {
        if self.warehouse.dataset_exists(&self.dataset).await? {
            return Ok(());
        }

        match self
            .warehouse
            .create_dataset(&self.dataset, &self.location)
            .await
        {
            Ok(()) => {
                tracing::info!(dataset = %self.dataset, location = %self.location, "dataset created");
                Ok(())
            }
            Err(WarehouseError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Picks the table a preview should read, following the configured
    /// precedence between the base and analysis tables.
    pub async fn resolve_query_source(&self, table: &TableName) -> Result<TableRef> {
        let base = self.table_ref(table);
        let analysis = self.table_ref(&table.analysis());
        let candidates = match self.policy {
            SourcePolicy::BaseFirst => [base, analysis],
            SourcePolicy::AnalysisFirst => [analysis, base],
        };

        for candidate in candidates {
            if self.warehouse.table_exists(&candidate).await? {
                tracing::debug!(%table, source = %candidate, "resolved query source");
                return Ok(candidate);
            }
        }

        Err(PortalError::TableNotFound(table.to_string()))
    }

    /// Returns the base table, loading it from a staged `<table>.csv` first if
    /// it does not exist yet.
    pub async fn ensure_table_from_upload(&self, table: &TableName) -> Result<TableRef> {
        let base = self.table_ref(table);
        if self.warehouse.table_exists(&base).await? {
            return Ok(base);
        }

        for prefix in UPLOAD_PREFIXES {
            let key = format!("{prefix}{table}.csv");
            if self.store.exists(&key).await? {
                tracing::info!(%table, %key, "creating table from staged upload");
                self.load(table, &key, CSV_WITH_HEADER).await?;
                return Ok(base);
            }
        }

        Err(PortalError::NoSourceData(table.to_string()))
    }

    /// Replaces the base table with the staged object at `key`.
    pub async fn load(
        &self,
        table: &TableName,
        key: &str,
        options: LoadOptions,
    ) -> Result<LoadOutcome> {
        self.ensure_dataset().await?;
        let uri = self.store.uri(key);
        let outcome = self
            .warehouse
            .load_from_uri(&self.table_ref(table), &uri, options)
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud::testutils::{MemoryObjectStore, MemoryWarehouse};

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryObjectStore::new("bucket"));
            let warehouse = Arc::new(MemoryWarehouse::new("proj", store.clone()));
            Fixture { store, warehouse }
        }

        fn resolver(&self, policy: SourcePolicy) -> TableResolver {
            TableResolver::new(
                self.warehouse.clone(),
                self.store.clone(),
                "ds".into(),
                "US".into(),
                policy,
            )
        }
    }

    fn sales() -> TableName {
        TableName::parse("sales").unwrap()
    }

    #[tokio::test]
    async fn test_ensure_dataset_is_idempotent() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver(SourcePolicy::BaseFirst);

        resolver.ensure_dataset().await.unwrap();
        resolver.ensure_dataset().await.unwrap();
        assert!(fixture.warehouse.has_dataset("ds"));
    }

    /// Sees no dataset, then loses the creation race to another caller.
    struct LostRace(Arc<MemoryWarehouse>);

    #[async_trait::async_trait]
    impl Warehouse for LostRace {
        fn project(&self) -> &str {
            self.0.project()
        }

        async fn dataset_exists(&self, _dataset: &str) -> std::result::Result<bool, WarehouseError> {
            Ok(false)
        }

        async fn create_dataset(
            &self,
            dataset: &str,
            _location: &str,
        ) -> std::result::Result<(), WarehouseError> {
            Err(WarehouseError::AlreadyExists(dataset.to_string()))
        }

        async fn table_exists(&self, table: &TableRef) -> std::result::Result<bool, WarehouseError> {
            self.0.table_exists(table).await
        }

        async fn load_from_uri(
            &self,
            table: &TableRef,
            uri: &str,
            options: LoadOptions,
        ) -> std::result::Result<LoadOutcome, WarehouseError> {
            self.0.load_from_uri(table, uri, options).await
        }

        async fn query(
            &self,
            sql: &str,
            max_rows: Option<usize>,
        ) -> std::result::Result<cloud::warehouse::ResultSet, WarehouseError> {
            self.0.query(sql, max_rows).await
        }

        async fn query_into(
            &self,
            sql: &str,
            destination: &TableRef,
        ) -> std::result::Result<(), WarehouseError> {
            self.0.query_into(sql, destination).await
        }

        async fn create_or_replace_view(
            &self,
            view: &TableRef,
            sql: &str,
        ) -> std::result::Result<(), WarehouseError> {
            self.0.create_or_replace_view(view, sql).await
        }
    }

    #[tokio::test]
    async fn test_ensure_dataset_lost_race() {
        let fixture = Fixture::new();
        let resolver = TableResolver::new(
            Arc::new(LostRace(fixture.warehouse.clone())),
            fixture.store.clone(),
            "ds".into(),
            "US".into(),
            SourcePolicy::BaseFirst,
        );
        assert!(resolver.ensure_dataset().await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_query_source_precedence() {
        let fixture = Fixture::new();
        let base = TableRef::new("proj", "ds", "sales");
        let analysis = TableRef::new("proj", "ds", "sales_analysis");

        let base_first = fixture.resolver(SourcePolicy::BaseFirst);
        let analysis_first = fixture.resolver(SourcePolicy::AnalysisFirst);

        assert!(matches!(
            base_first.resolve_query_source(&sales()).await.unwrap_err(),
            PortalError::TableNotFound(_)
        ));

        fixture.warehouse.insert_table(&analysis, &["a"], &[&["1"]]);
        assert_eq!(base_first.resolve_query_source(&sales()).await.unwrap(), analysis);

        fixture.warehouse.insert_table(&base, &["a"], &[&["1"]]);
        assert_eq!(base_first.resolve_query_source(&sales()).await.unwrap(), base);
        assert_eq!(
            analysis_first.resolve_query_source(&sales()).await.unwrap(),
            analysis
        );
    }

    #[tokio::test]
    async fn test_ensure_table_from_upload() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver(SourcePolicy::BaseFirst);

        assert!(matches!(
            resolver.ensure_table_from_upload(&sales()).await.unwrap_err(),
            PortalError::NoSourceData(_)
        ));

        // The earliest prefix wins.
        fixture.store.insert("raw/sales.csv", "region\nraw\n");
        fixture.store.insert("uploads/sales.csv", "region\nuploads\n");
        let table = resolver.ensure_table_from_upload(&sales()).await.unwrap();
        assert_eq!(table, TableRef::new("proj", "ds", "sales"));
        assert_eq!(
            fixture.warehouse.table(&table).unwrap().rows,
            vec![vec![serde_json::Value::from("uploads")]]
        );

        // An existing table is left alone.
        fixture.store.insert("sales.csv", "region\nroot\n");
        resolver.ensure_table_from_upload(&sales()).await.unwrap();
        assert_eq!(
            fixture.warehouse.table(&table).unwrap().rows,
            vec![vec![serde_json::Value::from("uploads")]]
        );
    }
}
