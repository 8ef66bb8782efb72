//! Schema synthesis: turns catalog metadata into a [`TableDefinition`].
//!
//! Synthesis is pure. Nothing here touches the database; the lifecycle
//! module interprets the definition to issue DDL and the query module uses it
//! to validate client input.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::catalog::{Field, FieldType, Table, MAX_IDENTIFIER_LENGTH};
use crate::error::EngineError;

pub const ID_COLUMN: &str = "id";
pub const SEARCH_COLUMN: &str = "search_data";
const HASH_LENGTH: usize = 12;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

/// Names interpolated into generated SQL must pass this check.
pub fn validate_identifier(name: &str) -> Result<(), EngineError> {
    if IDENTIFIER.is_match(name) && name.len() <= MAX_IDENTIFIER_LENGTH {
        Ok(())
    } else {
        Err(EngineError::InvalidFieldName {
            name: name.to_string(),
        })
    }
}

/// Double-quoted identifier. Callers validate names first.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Field(FieldType),
    SearchVector,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub sql_type: String,
    pub nullable: bool,
    pub obfuscate: bool,
}

impl ColumnDef {
    pub fn field_type(&self) -> Option<FieldType> {
        match self.kind {
            ColumnKind::Field(field_type) => Some(field_type),
            ColumnKind::SearchVector => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ordering,
    Filter,
    FullText,
}

impl IndexKind {
    pub fn tag(&self) -> &'static str {
        match self {
            IndexKind::Ordering => "ord",
            IndexKind::Filter => "flt",
            IndexKind::FullText => "fts",
        }
    }

    /// Full-text indexes use an inverted index, everything else a b-tree.
    pub fn method(&self) -> &'static str {
        match self {
            IndexKind::FullText => "gin",
            IndexKind::Ordering | IndexKind::Filter => "btree",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<IndexColumn>,
}

/// Runtime description of one dynamic table bound to a physical generation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub table_id: i32,
    pub dataset_slug: String,
    pub table_name: String,
    pub db_table_name: String,
    /// User fields in catalog order followed by the search vector column.
    pub columns: Vec<ColumnDef>,
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
    pub indexes: Vec<IndexDef>,
    pub search_config: String,
    pub trigger_name: String,
    pub trigger_function: String,
}

impl TableDefinition {
    pub fn label(&self) -> String {
        format!("{}.{}", self.dataset_slug, self.table_name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn field_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| matches!(c.kind, ColumnKind::Field(_)))
    }

    pub fn has_search(&self) -> bool {
        !self.search.is_empty()
    }

    pub fn index(&self, kind: IndexKind) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(move |i| i.kind == kind)
    }
}

/// Deterministic, length-bounded object name derived from the physical table
/// name, a kind tag and the (sorted) list of fields involved.
pub fn object_name(db_table_name: &str, tag: &str, fields: &[String]) -> String {
    let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(db_table_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(tag.as_bytes());
    for field in &sorted {
        hasher.update([0u8]);
        hasher.update(field.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());

    let budget = MAX_IDENTIFIER_LENGTH - HASH_LENGTH - tag.len() - 2;
    let prefix: String = db_table_name.chars().take(budget).collect();
    format!("{}_{}_{}", prefix, &digest[..HASH_LENGTH], tag)
}

/// Trigger names only depend on the physical table so a generation can be
/// cleaned up from its name alone.
pub fn trigger_name(db_table_name: &str) -> String {
    object_name(db_table_name, "trg", &[])
}

pub fn trigger_function_name(db_table_name: &str) -> String {
    object_name(db_table_name, "fn", &[])
}

fn column_type(field: &Field, field_type: FieldType) -> String {
    match field_type {
        FieldType::Binary => "bytea".to_string(),
        FieldType::Boolean => "boolean".to_string(),
        FieldType::Date => "date".to_string(),
        FieldType::Datetime => "timestamp with time zone".to_string(),
        FieldType::Decimal => match (field.options.max_digits, field.options.decimal_places) {
            (Some(digits), Some(places)) => format!("numeric({}, {})", digits, places),
            (Some(digits), None) => format!("numeric({}, 0)", digits),
            _ => "numeric".to_string(),
        },
        FieldType::Email => format!("varchar({})", field.options.max_length.unwrap_or(254)),
        FieldType::String => format!("varchar({})", field.options.max_length.unwrap_or(255)),
        FieldType::Float => "double precision".to_string(),
        FieldType::Integer => "bigint".to_string(),
        FieldType::Json => "jsonb".to_string(),
        FieldType::Text => "text".to_string(),
    }
}

fn build_indexes(
    db_table_name: &str,
    ordering: &[String],
    filtering: &[String],
    search: &[String],
) -> Vec<IndexDef> {
    let mut indexes = Vec::new();

    if !ordering.is_empty() {
        indexes.push(IndexDef {
            name: object_name(db_table_name, IndexKind::Ordering.tag(), ordering),
            kind: IndexKind::Ordering,
            columns: ordering
                .iter()
                .map(|entry| IndexColumn {
                    name: entry.trim_start_matches('-').to_string(),
                    descending: entry.starts_with('-'),
                })
                .collect(),
        });
    }

    // A composite b-tree already serves lookups on its leading column.
    let leading = ordering.first().map(|entry| entry.trim_start_matches('-'));
    let mut seen: Vec<&str> = Vec::new();
    for field_name in filtering {
        if Some(field_name.as_str()) == leading || seen.contains(&field_name.as_str()) {
            continue;
        }
        seen.push(field_name);
        indexes.push(IndexDef {
            name: object_name(
                db_table_name,
                IndexKind::Filter.tag(),
                std::slice::from_ref(field_name),
            ),
            kind: IndexKind::Filter,
            columns: vec![IndexColumn {
                name: field_name.clone(),
                descending: false,
            }],
        });
    }

    if !search.is_empty() {
        indexes.push(IndexDef {
            name: object_name(
                db_table_name,
                IndexKind::FullText.tag(),
                &[SEARCH_COLUMN.to_string()],
            ),
            kind: IndexKind::FullText,
            columns: vec![IndexColumn {
                name: SEARCH_COLUMN.to_string(),
                descending: false,
            }],
        });
    }

    indexes
}

/// Builds the definition of `table` bound to the physical table `db_table_name`.
pub fn synthesize(
    table: &Table,
    fields: &[Field],
    db_table_name: &str,
    search_config: &str,
) -> Result<TableDefinition, EngineError> {
    validate_identifier(db_table_name)?;
    validate_identifier(search_config).map_err(|_| EngineError::ConfigError {
        message: format!("Invalid search configuration: {:?}", search_config),
    })?;

    let mut ordered: Vec<&Field> = fields.iter().collect();
    ordered.sort_by_key(|f| f.order);

    let mut columns = Vec::with_capacity(ordered.len() + 1);
    for field in ordered {
        validate_identifier(&field.name)?;
        if field.name == ID_COLUMN || field.name == SEARCH_COLUMN {
            return Err(EngineError::InvalidFieldName {
                name: field.name.clone(),
            });
        }
        if columns.iter().any(|c: &ColumnDef| c.name == field.name) {
            return Err(EngineError::InvalidTableSettings {
                table: table.label(),
                message: format!("duplicated field {}", field.name),
            });
        }
        let field_type = field.field_type()?;
        columns.push(ColumnDef {
            name: field.name.clone(),
            kind: ColumnKind::Field(field_type),
            sql_type: column_type(field, field_type),
            nullable: field.null,
            obfuscate: field.obfuscate,
        });
    }
    columns.push(ColumnDef {
        name: SEARCH_COLUMN.to_string(),
        kind: ColumnKind::SearchVector,
        sql_type: "tsvector".to_string(),
        nullable: true,
        obfuscate: false,
    });

    table.validate_settings(fields)?;
    for name in table.filtering.iter().chain(&table.search) {
        validate_identifier(name)?;
    }

    let indexes = build_indexes(db_table_name, &table.ordering, &table.filtering, &table.search);

    Ok(TableDefinition {
        table_id: table.id,
        dataset_slug: table.dataset_slug.clone(),
        table_name: table.name.clone(),
        db_table_name: db_table_name.to_string(),
        columns,
        ordering: table.ordering.clone(),
        filtering: table.filtering.clone(),
        search: table.search.clone(),
        indexes,
        search_config: search_config.to_string(),
        trigger_name: trigger_name(db_table_name),
        trigger_function: trigger_function_name(db_table_name),
    })
}
