use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;

use crate::catalog::{DataTable, Dataset, Field, FieldOptions, Table, Version};
use crate::error::EngineError;
use crate::schema::{data_tables, datasets, fields, tables, versions};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = datasets)]
pub struct DatasetModel {
    pub id: i32,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub show: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = datasets)]
pub struct NewDatasetModel<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    pub show: bool,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone)]
#[diesel(table_name = versions)]
#[diesel(belongs_to(DatasetModel, foreign_key = dataset_id))]
pub struct VersionModel {
    pub id: i32,
    pub dataset_id: i32,
    pub name: String,
    pub order_num: i32,
    pub collected_at: Option<NaiveDate>,
}

#[derive(Insertable)]
#[diesel(table_name = versions)]
pub struct NewVersionModel<'a> {
    pub dataset_id: i32,
    pub name: &'a str,
    pub order_num: i32,
    pub collected_at: Option<NaiveDate>,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone)]
#[diesel(table_name = tables)]
#[diesel(belongs_to(DatasetModel, foreign_key = dataset_id))]
pub struct TableModel {
    pub id: i32,
    pub dataset_id: i32,
    pub version_id: i32,
    pub name: String,
    pub is_default: bool,
    pub hidden: bool,
    pub api_enabled: bool,
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
    pub import_date: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = tables)]
pub struct NewTableModel<'a> {
    pub dataset_id: i32,
    pub version_id: i32,
    pub name: &'a str,
    pub is_default: bool,
    pub hidden: bool,
    pub api_enabled: bool,
    pub ordering: &'a Vec<String>,
    pub filtering: &'a Vec<String>,
    pub search: &'a Vec<String>,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone)]
#[diesel(table_name = fields)]
#[diesel(belongs_to(TableModel, foreign_key = table_id))]
pub struct FieldModel {
    pub id: i32,
    pub dataset_id: i32,
    pub table_id: i32,
    pub name: String,
    pub title: String,
    pub field_type: String,
    pub nullable: bool,
    pub order_num: i32,
    pub options: serde_json::Value,
    pub frontend_filter: bool,
    pub has_choices: bool,
    pub choices: Option<serde_json::Value>,
    pub obfuscate: bool,
    pub show: bool,
    pub link_template: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = fields)]
pub struct NewFieldModel<'a> {
    pub dataset_id: i32,
    pub table_id: i32,
    pub name: &'a str,
    pub title: &'a str,
    pub field_type: &'a str,
    pub nullable: bool,
    pub order_num: i32,
    pub options: &'a serde_json::Value,
    pub frontend_filter: bool,
    pub has_choices: bool,
    pub obfuscate: bool,
    pub show: bool,
    pub link_template: Option<&'a str>,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone)]
#[diesel(table_name = data_tables)]
#[diesel(belongs_to(TableModel, foreign_key = table_id))]
pub struct DataTableModel {
    pub id: i32,
    pub table_id: i32,
    pub db_table_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = data_tables)]
pub struct NewDataTableModel<'a> {
    pub table_id: i32,
    pub db_table_name: &'a str,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DatasetModel> for Dataset {
    fn from(dataset: DatasetModel) -> Self {
        Dataset {
            id: dataset.id,
            slug: dataset.slug,
            name: dataset.name,
            description: dataset.description,
            show: dataset.show,
        }
    }
}

impl From<VersionModel> for Version {
    fn from(version: VersionModel) -> Self {
        Version {
            id: version.id,
            dataset_id: version.dataset_id,
            name: version.name,
            order: version.order_num,
            collected_at: version.collected_at,
        }
    }
}

impl TableModel {
    pub fn into_table(self, dataset_slug: String) -> Table {
        Table {
            id: self.id,
            dataset_id: self.dataset_id,
            dataset_slug,
            version_id: self.version_id,
            name: self.name,
            default: self.is_default,
            hidden: self.hidden,
            api_enabled: self.api_enabled,
            ordering: self.ordering,
            filtering: self.filtering,
            search: self.search,
            import_date: self.import_date,
        }
    }
}

impl TryFrom<FieldModel> for Field {
    type Error = EngineError;

    /// Malformed `options` or `choices` JSON is a catalog error, never a default.
    fn try_from(field: FieldModel) -> Result<Self, Self::Error> {
        let options: FieldOptions =
            serde_json::from_value(field.options).map_err(|e| EngineError::InconsistentField {
                field: field.name.clone(),
                message: format!("invalid options: {}", e),
            })?;
        let choices: Option<Vec<String>> = field
            .choices
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::InconsistentField {
                field: field.name.clone(),
                message: format!("invalid choices: {}", e),
            })?;

        Ok(Field {
            id: field.id,
            dataset_id: field.dataset_id,
            table_id: field.table_id,
            name: field.name,
            title: field.title,
            type_name: field.field_type,
            null: field.nullable,
            order: field.order_num,
            options,
            frontend_filter: field.frontend_filter,
            has_choices: field.has_choices,
            choices,
            obfuscate: field.obfuscate,
            show: field.show,
            link_template: field.link_template,
        })
    }
}

impl From<DataTableModel> for DataTable {
    fn from(data_table: DataTableModel) -> Self {
        DataTable {
            id: data_table.id,
            table_id: data_table.table_id,
            db_table_name: data_table.db_table_name,
            active: data_table.active,
            created_at: data_table.created_at,
        }
    }
}
