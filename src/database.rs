use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::catalog::{
    DataTable, Dataset, Field, FieldOptions, NewDataTable, Table, Version,
};
use crate::error::EngineError;
use crate::models::*;
use crate::schema::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Input for [`DatabaseManager::create_table`].
#[derive(Debug, Clone, Default)]
pub struct TableSpec {
    pub name: String,
    pub default: bool,
    pub hidden: bool,
    pub api_enabled: bool,
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
}

/// Input for [`DatabaseManager::create_field`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub title: String,
    pub type_name: String,
    pub null: bool,
    pub order: i32,
    pub options: FieldOptions,
    pub frontend_filter: bool,
    pub has_choices: bool,
    pub obfuscate: bool,
    pub show: bool,
    pub link_template: Option<String>,
}

impl FieldSpec {
    pub fn new(name: &str, type_name: &str, order: i32) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            type_name: type_name.to_string(),
            null: true,
            order,
            options: FieldOptions::default(),
            frontend_filter: false,
            has_choices: false,
            obfuscate: false,
            show: true,
            link_template: None,
        }
    }
}

pub type PooledConnection = Object<AsyncPgConnection>;

#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<AsyncPgConnection>,
}

impl DatabaseManager {
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, EngineError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(config)
            .build()
            .map_err(|e| EngineError::ConfigError {
                message: format!("Failed to create database pool: {}", e),
            })?;

        let manager = Self { pool };
        if run_migrations {
            manager.run_migrations(database_url).await?;
        }

        Ok(manager)
    }

    pub async fn run_migrations(&self, database_url: &str) -> Result<(), EngineError> {
        let database_url = database_url.to_string();

        // diesel_migrations only drives synchronous connections.
        tokio::task::spawn_blocking(move || {
            use diesel::Connection;
            use diesel::PgConnection;

            let mut connection = PgConnection::establish(&database_url)?;
            connection
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| EngineError::Migration {
                    message: format!("Failed to run migrations: {}", e),
                })?;
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|e| EngineError::Migration {
            message: format!("Migration task failed: {}", e),
        })??;

        info!("Catalog migrations are up to date");
        Ok(())
    }

    pub async fn connection(&self) -> Result<PooledConnection, EngineError> {
        self.pool.get().await.map_err(EngineError::pool)
    }

    pub async fn create_dataset(
        &self,
        slug: &str,
        name: &str,
        description: &str,
        show: bool,
    ) -> Result<Dataset, EngineError> {
        info!("Adding dataset {} to catalog", slug);
        let mut conn = self.connection().await?;

        let dataset = diesel::insert_into(datasets::table)
            .values(&NewDatasetModel {
                slug,
                name,
                description,
                show,
            })
            .returning(DatasetModel::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(dataset.into())
    }

    pub async fn get_dataset(&self, slug: &str) -> Result<Dataset, EngineError> {
        let mut conn = self.connection().await?;

        datasets::table
            .filter(datasets::slug.eq(slug))
            .select(DatasetModel::as_select())
            .get_result(&mut conn)
            .await
            .optional()?
            .map(Dataset::from)
            .ok_or_else(|| EngineError::DatasetNotFound {
                slug: slug.to_string(),
            })
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, EngineError> {
        let mut conn = self.connection().await?;

        let dataset_list = datasets::table
            .order(datasets::slug.asc())
            .select(DatasetModel::as_select())
            .get_results(&mut conn)
            .await?;

        Ok(dataset_list.into_iter().map(Dataset::from).collect())
    }

    pub async fn create_version(
        &self,
        dataset: &Dataset,
        name: &str,
        order: i32,
        collected_at: Option<NaiveDate>,
    ) -> Result<Version, EngineError> {
        let mut conn = self.connection().await?;

        let version = diesel::insert_into(versions::table)
            .values(&NewVersionModel {
                dataset_id: dataset.id,
                name,
                order_num: order,
                collected_at,
            })
            .returning(VersionModel::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(version.into())
    }

    pub async fn get_version(&self, version_id: i32) -> Result<Version, EngineError> {
        let mut conn = self.connection().await?;

        let version = versions::table
            .find(version_id)
            .select(VersionModel::as_select())
            .get_result(&mut conn)
            .await?;
        Ok(version.into())
    }

    pub async fn set_collected_at(
        &self,
        version_id: i32,
        collected_at: NaiveDate,
    ) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;
        set_collected_at(&mut conn, version_id, collected_at).await
    }

    pub async fn create_table(
        &self,
        dataset: &Dataset,
        version: &Version,
        spec: &TableSpec,
    ) -> Result<Table, EngineError> {
        info!("Adding table {}.{} to catalog", dataset.slug, spec.name);
        let mut conn = self.connection().await?;

        let table = diesel::insert_into(tables::table)
            .values(&NewTableModel {
                dataset_id: dataset.id,
                version_id: version.id,
                name: &spec.name,
                is_default: spec.default,
                hidden: spec.hidden,
                api_enabled: spec.api_enabled,
                ordering: &spec.ordering,
                filtering: &spec.filtering,
                search: &spec.search,
            })
            .returning(TableModel::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(table.into_table(dataset.slug.clone()))
    }

    pub async fn get_table(&self, table_id: i32) -> Result<Table, EngineError> {
        let mut conn = self.connection().await?;

        tables::table
            .inner_join(datasets::table)
            .filter(tables::id.eq(table_id))
            .select((TableModel::as_select(), datasets::slug))
            .get_result::<(TableModel, String)>(&mut conn)
            .await
            .optional()?
            .map(|(table, slug)| table.into_table(slug))
            .ok_or_else(|| EngineError::TableNotFound {
                name: format!("#{}", table_id),
            })
    }

    /// Resolves `dataset_slug.name`, preferring the default table of the most
    /// recent version. Hidden tables are only returned when asked for.
    pub async fn find_table(
        &self,
        dataset_slug: &str,
        name: &str,
        include_hidden: bool,
    ) -> Result<Table, EngineError> {
        let mut conn = self.connection().await?;

        let mut query = tables::table
            .inner_join(datasets::table)
            .inner_join(versions::table)
            .select((TableModel::as_select(), datasets::slug))
            .filter(datasets::slug.eq(dataset_slug))
            .filter(tables::name.eq(name))
            .into_boxed();
        if !include_hidden {
            query = query.filter(tables::hidden.eq(false));
        }

        query
            .order((versions::order_num.desc(), tables::is_default.desc()))
            .first::<(TableModel, String)>(&mut conn)
            .await
            .optional()?
            .map(|(table, slug)| table.into_table(slug))
            .ok_or_else(|| EngineError::TableNotFound {
                name: format!("{}.{}", dataset_slug, name),
            })
    }

    pub async fn list_tables(
        &self,
        dataset_slug: &str,
        include_hidden: bool,
    ) -> Result<Vec<Table>, EngineError> {
        let mut conn = self.connection().await?;

        let mut query = tables::table
            .inner_join(datasets::table)
            .select((TableModel::as_select(), datasets::slug))
            .filter(datasets::slug.eq(dataset_slug))
            .into_boxed();
        if !include_hidden {
            query = query.filter(tables::hidden.eq(false));
        }

        let rows = query
            .order(tables::name.asc())
            .get_results::<(TableModel, String)>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(table, slug)| table.into_table(slug))
            .collect())
    }

    pub async fn update_table_settings(
        &self,
        table_id: i32,
        ordering: &[String],
        filtering: &[String],
        search: &[String],
    ) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;

        diesel::update(tables::table.find(table_id))
            .set((
                tables::ordering.eq(ordering.to_vec()),
                tables::filtering.eq(filtering.to_vec()),
                tables::search.eq(search.to_vec()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn set_import_date(&self, table_id: i32) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;
        set_import_date(&mut conn, table_id, Utc::now()).await
    }

    pub async fn create_field(&self, table: &Table, spec: &FieldSpec) -> Result<Field, EngineError> {
        let mut conn = self.connection().await?;
        let options = serde_json::to_value(&spec.options)?;

        let field: Field = diesel::insert_into(fields::table)
            .values(&NewFieldModel {
                dataset_id: table.dataset_id,
                table_id: table.id,
                name: &spec.name,
                title: &spec.title,
                field_type: &spec.type_name,
                nullable: spec.null,
                order_num: spec.order,
                options: &options,
                frontend_filter: spec.frontend_filter,
                has_choices: spec.has_choices,
                obfuscate: spec.obfuscate,
                show: spec.show,
                link_template: spec.link_template.as_deref(),
            })
            .returning(FieldModel::as_returning())
            .get_result::<FieldModel>(&mut conn)
            .await?
            .try_into()?;

        field.check_consistency(table)?;
        Ok(field)
    }

    pub async fn fields_for_table(&self, table: &Table) -> Result<Vec<Field>, EngineError> {
        let mut conn = self.connection().await?;

        let rows = fields::table
            .filter(fields::table_id.eq(table.id))
            .order(fields::order_num.asc())
            .select(FieldModel::as_select())
            .get_results(&mut conn)
            .await?;

        let fields = rows
            .into_iter()
            .map(Field::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for field in &fields {
            field.check_consistency(table)?;
        }
        Ok(fields)
    }

    pub async fn get_field(&self, table: &Table, name: &str) -> Result<Field, EngineError> {
        let mut conn = self.connection().await?;

        fields::table
            .filter(fields::table_id.eq(table.id))
            .filter(fields::name.eq(name))
            .select(FieldModel::as_select())
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| EngineError::InvalidTableSettings {
                table: table.label(),
                message: format!("unknown field {}", name),
            })?
            .try_into()
    }

    pub async fn save_choices(&self, field_id: i32, choices: &[String]) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;
        save_choices(&mut conn, field_id, choices).await
    }

    pub async fn get_data_table(&self, data_table_id: i32) -> Result<DataTable, EngineError> {
        let mut conn = self.connection().await?;
        get_data_table(&mut conn, data_table_id).await
    }

    pub async fn active_data_table(&self, table_id: i32) -> Result<Option<DataTable>, EngineError> {
        let mut conn = self.connection().await?;

        let data_table = data_tables::table
            .filter(data_tables::table_id.eq(table_id))
            .filter(data_tables::active.eq(true))
            .select(DataTableModel::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(data_table.map(DataTable::from))
    }

    pub async fn data_tables_for_table(&self, table_id: i32) -> Result<Vec<DataTable>, EngineError> {
        let mut conn = self.connection().await?;
        generations(&mut conn, table_id).await
    }

    pub async fn insert_data_table(&self, new: &NewDataTable) -> Result<DataTable, EngineError> {
        let mut conn = self.connection().await?;
        insert_data_table(&mut conn, new).await
    }

    pub async fn delete_data_table_record(&self, data_table_id: i32) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;
        delete_data_table_record(&mut conn, data_table_id).await
    }

    /// Inactive generations, optionally restricted to some datasets.
    pub async fn inactive_data_tables(
        &self,
        dataset_slugs: &[String],
    ) -> Result<Vec<(String, DataTable)>, EngineError> {
        let mut conn = self.connection().await?;

        let mut query = data_tables::table
            .inner_join(tables::table.inner_join(datasets::table))
            .select((datasets::slug, DataTableModel::as_select()))
            .filter(data_tables::active.eq(false))
            .into_boxed();
        if !dataset_slugs.is_empty() {
            query = query.filter(datasets::slug.eq_any(dataset_slugs.to_vec()));
        }

        let rows = query
            .order((datasets::slug.asc(), data_tables::created_at.asc()))
            .get_results::<(String, DataTableModel)>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(slug, data_table)| (slug, data_table.into()))
            .collect())
    }
}

pub(crate) async fn get_data_table(
    conn: &mut AsyncPgConnection,
    data_table_id: i32,
) -> Result<DataTable, EngineError> {
    data_tables::table
        .find(data_table_id)
        .select(DataTableModel::as_select())
        .get_result(conn)
        .await
        .optional()?
        .map(DataTable::from)
        .ok_or(EngineError::DataTableNotFound { id: data_table_id })
}

/// Every generation of a table, most recent first.
pub(crate) async fn generations(
    conn: &mut AsyncPgConnection,
    table_id: i32,
) -> Result<Vec<DataTable>, EngineError> {
    let rows = data_tables::table
        .filter(data_tables::table_id.eq(table_id))
        .order((data_tables::created_at.desc(), data_tables::id.desc()))
        .select(DataTableModel::as_select())
        .get_results(conn)
        .await?;

    Ok(rows.into_iter().map(DataTable::from).collect())
}

pub(crate) async fn insert_data_table(
    conn: &mut AsyncPgConnection,
    new: &NewDataTable,
) -> Result<DataTable, EngineError> {
    let data_table = diesel::insert_into(data_tables::table)
        .values(&NewDataTableModel {
            table_id: new.table_id,
            db_table_name: &new.db_table_name,
            active: false,
            created_at: new.created_at,
        })
        .returning(DataTableModel::as_returning())
        .get_result(conn)
        .await?;

    Ok(data_table.into())
}

pub(crate) async fn set_active(
    conn: &mut AsyncPgConnection,
    data_table_ids: &[i32],
    active: bool,
) -> Result<(), EngineError> {
    if data_table_ids.is_empty() {
        return Ok(());
    }
    diesel::update(data_tables::table.filter(data_tables::id.eq_any(data_table_ids.to_vec())))
        .set(data_tables::active.eq(active))
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn delete_data_table_record(
    conn: &mut AsyncPgConnection,
    data_table_id: i32,
) -> Result<(), EngineError> {
    diesel::delete(data_tables::table.find(data_table_id))
        .execute(conn)
        .await?;
    Ok(())
}

/// Takes a row lock on the logical table so cutovers on it serialize.
pub(crate) async fn lock_table(conn: &mut AsyncPgConnection, table_id: i32) -> Result<(), EngineError> {
    tables::table
        .find(table_id)
        .select(tables::id)
        .for_update()
        .get_result::<i32>(conn)
        .await
        .optional()?
        .ok_or_else(|| EngineError::TableNotFound {
            name: format!("#{}", table_id),
        })?;
    Ok(())
}

pub(crate) async fn save_choices(
    conn: &mut AsyncPgConnection,
    field_id: i32,
    choices: &[String],
) -> Result<(), EngineError> {
    let value = serde_json::to_value(choices)?;
    diesel::update(fields::table.find(field_id))
        .set(fields::choices.eq(Some(value)))
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_import_date(
    conn: &mut AsyncPgConnection,
    table_id: i32,
    import_date: DateTime<Utc>,
) -> Result<(), EngineError> {
    diesel::update(tables::table.find(table_id))
        .set(tables::import_date.eq(Some(import_date)))
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_collected_at(
    conn: &mut AsyncPgConnection,
    version_id: i32,
    collected_at: NaiveDate,
) -> Result<(), EngineError> {
    diesel::update(versions::table.find(version_id))
        .set(versions::collected_at.eq(Some(collected_at)))
        .execute(conn)
        .await?;
    Ok(())
}
