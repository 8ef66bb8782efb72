use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{DataTable, Field, NewDataTable, Table};
use crate::cutover::{ActivationUpdates, CutoverController, CutoverPlan};
use crate::database::{DatabaseManager, FieldSpec};
use crate::error::EngineError;
use crate::extensions::{ExtensionRegistry, TableExtension};
use crate::lifecycle::LifecycleManager;
use crate::query::TableQuery;
use crate::registry::DynamicTableRegistry;
use crate::settings::EngineConfig;
use crate::synth::{synthesize, TableDefinition};
use crate::value::Row;

/// Owns the catalog connection pool, the definition cache and the lifecycle
/// and cutover components, and exposes the table operations on top of them.
#[derive(Clone)]
pub struct TableEngine {
    config: EngineConfig,
    database: DatabaseManager,
    registry: Arc<DynamicTableRegistry>,
    lifecycle: LifecycleManager,
    cutover: CutoverController,
    extensions: Arc<ExtensionRegistry>,
}

impl TableEngine {
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        info!("Initializing table engine");
        info!("  Database URL: {}", config.masked_database_url());
        info!("  Search configuration: {}", config.search_config);

        let database = DatabaseManager::new(&config.database_url, config.run_migrations).await?;
        let engine = Self::with_database(config, database);

        info!("Table engine initialized successfully");
        Ok(engine)
    }

    pub fn with_database(config: EngineConfig, database: DatabaseManager) -> Self {
        let registry = Arc::new(DynamicTableRegistry::new(config.registry_capacity));
        let lifecycle = LifecycleManager::new(database.clone(), config.import_batch_size);
        let cutover = CutoverController::new(database.clone(), lifecycle.clone(), registry.clone());

        Self {
            config,
            database,
            registry,
            lifecycle,
            cutover,
            extensions: Arc::new(ExtensionRegistry::with_defaults()),
        }
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn registry(&self) -> &DynamicTableRegistry {
        &self.registry
    }

    pub async fn get_table(&self, dataset_slug: &str, table_name: &str) -> Result<Table, EngineError> {
        self.database.find_table(dataset_slug, table_name, true).await
    }

    pub async fn add_field(&self, table: &Table, spec: &FieldSpec) -> Result<Field, EngineError> {
        let field = self.database.create_field(table, spec).await?;
        self.registry.invalidate(table.id);
        Ok(field)
    }

    pub async fn update_table_settings(
        &self,
        table: &Table,
        ordering: Vec<String>,
        filtering: Vec<String>,
        search: Vec<String>,
    ) -> Result<Table, EngineError> {
        let fields = self.database.fields_for_table(table).await?;
        let updated = Table {
            ordering,
            filtering,
            search,
            ..table.clone()
        };
        updated.validate_settings(&fields)?;

        self.database
            .update_table_settings(updated.id, &updated.ordering, &updated.filtering, &updated.search)
            .await?;
        self.registry.invalidate(table.id);
        info!("Updated settings of {}", updated.label());
        Ok(updated)
    }

    /// Synthesizes `table` against a physical name without consulting the
    /// registry.
    pub async fn definition_for(
        &self,
        table: &Table,
        db_table_name: &str,
    ) -> Result<TableDefinition, EngineError> {
        let fields = self.database.fields_for_table(table).await?;
        synthesize(table, &fields, db_table_name, &self.config.search_config)
    }

    /// Resolves `table` to its definition, bound to `data_table` or to the
    /// active generation.
    pub async fn get_model(
        &self,
        table: &Table,
        cache: bool,
        data_table: Option<&DataTable>,
    ) -> Result<Arc<TableDefinition>, EngineError> {
        let db_table_name = match data_table {
            Some(data_table) => data_table.db_table_name.clone(),
            None => self
                .database
                .active_data_table(table.id)
                .await?
                .ok_or_else(|| EngineError::NoActiveDataTable {
                    table: table.label(),
                })?
                .db_table_name,
        };

        if cache {
            if let Some(definition) = self.registry.get(table.id, &db_table_name) {
                return Ok(definition);
            }
        }

        let definition = self.definition_for(table, &db_table_name).await?;
        self.registry
            .get_or_build(table.id, &db_table_name, false, move || Ok(definition))
    }

    pub async fn create_table(
        &self,
        definition: &TableDefinition,
        create_indexes: bool,
    ) -> Result<(), EngineError> {
        self.lifecycle.create(definition, create_indexes).await
    }

    pub async fn delete_table(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        self.lifecycle.drop(definition).await?;
        self.registry.invalidate(definition.table_id);
        Ok(())
    }

    pub async fn create_triggers(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        self.lifecycle.create_search_trigger(definition).await
    }

    pub async fn create_indexes(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        self.lifecycle.create_indexes(definition).await
    }

    pub async fn analyse_table(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        self.lifecycle.analyse(definition).await
    }

    pub async fn update_search_index(&self, definition: &TableDefinition) -> Result<usize, EngineError> {
        self.lifecycle.update_search_index(definition).await
    }

    pub async fn insert_rows(
        &self,
        definition: &TableDefinition,
        rows: &[Row],
    ) -> Result<usize, EngineError> {
        self.lifecycle.insert_rows(definition, rows).await
    }

    /// A new, not yet persisted generation of `table`.
    pub fn new_data_table(&self, table: &Table) -> NewDataTable {
        DataTable::new_data_table(table, self.config.data_table_suffix_size)
    }

    pub async fn save_data_table(&self, new: &NewDataTable) -> Result<DataTable, EngineError> {
        self.database.insert_data_table(new).await
    }

    pub async fn activate(
        &self,
        data_table: &DataTable,
        drop_inactive: bool,
    ) -> Result<CutoverPlan, EngineError> {
        self.cutover.activate(data_table, drop_inactive).await
    }

    pub async fn activate_with(
        &self,
        data_table: &DataTable,
        drop_inactive: bool,
        updates: &ActivationUpdates,
    ) -> Result<CutoverPlan, EngineError> {
        self.cutover
            .activate_with(data_table, drop_inactive, updates)
            .await
    }

    pub async fn deactivate(
        &self,
        data_table: &DataTable,
        drop_table: bool,
        activate_most_recent: bool,
    ) -> Result<CutoverPlan, EngineError> {
        self.cutover
            .deactivate(data_table, drop_table, activate_most_recent)
            .await
    }

    pub async fn delete_data_table(&self, data_table: &DataTable) -> Result<(), EngineError> {
        self.cutover.delete(data_table).await
    }

    /// Removes every inactive generation, optionally only for some datasets.
    /// Returns the number of generations deleted.
    pub async fn delete_inactive_data_tables(&self, only: &[String]) -> Result<usize, EngineError> {
        let inactive = self.database.inactive_data_tables(only).await?;
        if inactive.is_empty() {
            info!("No inactive DataTables to delete");
            return Ok(0);
        }

        let mut deleted = 0;
        for (dataset_slug, data_table) in &inactive {
            match self.cutover.delete(data_table).await {
                Ok(()) => deleted += 1,
                // Activated or deleted since the listing.
                Err(EngineError::ActiveDataTableDeletion { db_table_name }) => {
                    warn!("Skipping {} ({}): now active", db_table_name, dataset_slug)
                }
                Err(EngineError::DataTableNotFound { id }) => {
                    warn!("Skipping DataTable {} ({}): already deleted", id, dataset_slug)
                }
                Err(e) => return Err(e),
            }
        }
        info!("Deleted {} inactive DataTables", deleted);
        Ok(deleted)
    }

    /// Distinct values of `field` in `data_table`, or in the active generation.
    pub async fn compute_choices(
        &self,
        table: &Table,
        field: &Field,
        data_table: Option<&DataTable>,
    ) -> Result<Vec<String>, EngineError> {
        let definition = self.get_model(table, true, data_table).await?;
        let mut conn = self.database.connection().await?;
        TableQuery::new(definition)
            .distinct_values(&mut conn, &field.name)
            .await
    }

    /// Recomputes and stores the cached choices of `field`.
    pub async fn update_choices(
        &self,
        table: &Table,
        field: &Field,
        data_table: Option<&DataTable>,
    ) -> Result<Vec<String>, EngineError> {
        let choices = self.compute_choices(table, field, data_table).await?;
        self.database.save_choices(field.id, &choices).await?;
        info!("Stored {} choices for {}.{}", choices.len(), table.label(), field.name);
        Ok(choices)
    }

    /// Query over the active generation of `table`.
    pub async fn query(&self, table: &Table) -> Result<TableQuery, EngineError> {
        Ok(TableQuery::new(self.get_model(table, true, None).await?))
    }

    pub async fn count(&self, query: &mut TableQuery) -> Result<i64, EngineError> {
        let mut conn = self.database.connection().await?;
        query.count(&mut conn).await
    }

    pub async fn fetch(
        &self,
        query: &TableQuery,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Row>, EngineError> {
        let mut conn = self.database.connection().await?;
        query.fetch(&mut conn, limit, offset).await
    }

    pub fn extension(&self, table: &Table) -> Option<Arc<dyn TableExtension>> {
        self.extensions.get(&table.dataset_slug, &table.name)
    }
}
