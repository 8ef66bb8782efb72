use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EngineError;

/// Postgres truncates identifiers longer than this.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Binary,
    Boolean,
    Date,
    Datetime,
    Decimal,
    Email,
    Float,
    Integer,
    Json,
    String,
    Text,
}

impl FieldType {
    pub const ALL: [FieldType; 11] = [
        FieldType::Binary,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Decimal,
        FieldType::Email,
        FieldType::Float,
        FieldType::Integer,
        FieldType::Json,
        FieldType::String,
        FieldType::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Binary => "binary",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Decimal => "decimal",
            FieldType::Email => "email",
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Json => "json",
            FieldType::String => "string",
            FieldType::Text => "text",
        }
    }

    /// Whether the column holds text that can feed the search vector as-is.
    pub fn is_textual(&self) -> bool {
        matches!(self, FieldType::Email | FieldType::String | FieldType::Text)
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(FieldType::Binary),
            "bool" | "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "datetime" => Ok(FieldType::Datetime),
            "decimal" => Ok(FieldType::Decimal),
            "email" => Ok(FieldType::Email),
            "float" => Ok(FieldType::Float),
            "integer" => Ok(FieldType::Integer),
            "json" => Ok(FieldType::Json),
            "string" => Ok(FieldType::String),
            "text" => Ok(FieldType::Text),
            other => Err(format!("Unknown field type: {}", other)),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i32,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub show: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: i32,
    pub dataset_id: i32,
    pub name: String,
    pub order: i32,
    pub collected_at: Option<NaiveDate>,
}

/// Logical identity of one dataset's tabular data. Rows live in whichever
/// [`DataTable`] is currently active for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: i32,
    pub dataset_id: i32,
    pub dataset_slug: String,
    pub version_id: i32,
    pub name: String,
    pub default: bool,
    pub hidden: bool,
    pub api_enabled: bool,
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
    pub import_date: Option<DateTime<Utc>>,
}

impl Table {
    pub fn label(&self) -> String {
        format!("{}.{}", self.dataset_slug, self.name)
    }

    /// Checks that the ordering/filtering/search lists only name known fields.
    /// Only ordering entries may carry a `-` prefix.
    pub fn validate_settings(&self, fields: &[Field]) -> Result<(), EngineError> {
        let known = |name: &str| fields.iter().any(|f| f.name == name);
        let lists = [
            ("ordering", &self.ordering, true),
            ("filtering", &self.filtering, false),
            ("search", &self.search, false),
        ];
        for (kind, names, signed) in lists {
            for entry in names.iter() {
                let name = match entry.strip_prefix('-') {
                    Some(name) if signed => name,
                    _ => entry.as_str(),
                };
                if !known(name) {
                    return Err(EngineError::InvalidTableSettings {
                        table: self.label(),
                        message: format!("{} references unknown field {:?}", kind, entry),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_digits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: i32,
    pub dataset_id: i32,
    pub table_id: i32,
    pub name: String,
    pub title: String,
    /// Raw semantic type as stored; parsed at synthesis time.
    pub type_name: String,
    pub null: bool,
    pub order: i32,
    pub options: FieldOptions,
    pub frontend_filter: bool,
    pub has_choices: bool,
    pub choices: Option<Vec<String>>,
    pub obfuscate: bool,
    pub show: bool,
    pub link_template: Option<String>,
}

impl Field {
    pub fn field_type(&self) -> Result<FieldType, EngineError> {
        FieldType::from_str(&self.type_name).map_err(|_| EngineError::UnknownFieldType {
            field: self.name.clone(),
            field_type: self.type_name.clone(),
        })
    }

    pub fn check_consistency(&self, table: &Table) -> Result<(), EngineError> {
        if self.table_id != table.id {
            return Err(EngineError::InconsistentField {
                field: self.name.clone(),
                message: format!("belongs to table {} instead of {}", self.table_id, table.id),
            });
        }
        if self.dataset_id != table.dataset_id {
            return Err(EngineError::InconsistentField {
                field: self.name.clone(),
                message: format!(
                    "dataset {} differs from table dataset {}",
                    self.dataset_id, table.dataset_id
                ),
            });
        }
        Ok(())
    }
}

/// Ordered (field name, type) pairs used to parse raw import values.
pub fn table_schema(fields: &[Field]) -> Result<Vec<(String, FieldType)>, EngineError> {
    let mut sorted: Vec<&Field> = fields.iter().collect();
    sorted.sort_by_key(|f| f.order);
    sorted
        .into_iter()
        .map(|f| Ok((f.name.clone(), f.field_type()?)))
        .collect()
}

/// One physical generation of a [`Table`]'s storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTable {
    pub id: i32,
    pub table_id: i32,
    pub db_table_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A generation that exists only in memory until it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataTable {
    pub table_id: i32,
    pub db_table_name: String,
    pub created_at: DateTime<Utc>,
}

impl DataTable {
    pub fn new_data_table(table: &Table, suffix_size: usize) -> NewDataTable {
        NewDataTable {
            table_id: table.id,
            db_table_name: physical_table_name(
                &table.dataset_slug,
                &table.name,
                &random_suffix(suffix_size),
            ),
            created_at: Utc::now(),
        }
    }
}

fn random_suffix(size: usize) -> String {
    let mut rng = rand::rng();
    (0..size)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

/// `data_<slug without dashes>_<name without underscores>[_<suffix>]`, with the
/// base shortened so the whole name fits in a Postgres identifier.
pub fn physical_table_name(dataset_slug: &str, table_name: &str, suffix: &str) -> String {
    let mut base = format!(
        "data_{}_{}",
        dataset_slug.replace('-', ""),
        table_name.replace('_', "")
    )
    .to_lowercase();
    let reserved = if suffix.is_empty() { 0 } else { suffix.len() + 1 };
    let limit = MAX_IDENTIFIER_LENGTH.saturating_sub(reserved);
    if base.len() > limit {
        let mut cut = limit;
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        base.truncate(cut);
    }
    if suffix.is_empty() {
        base
    } else {
        format!("{}_{}", base, suffix)
    }
}
