//! Filtering, ordering and full-text search over any synthesized table.
//!
//! A [`TableQuery`] is a chainable builder. It only ever interpolates names
//! taken from its [`TableDefinition`]; every client-provided value travels as
//! a bind parameter. Unknown filter keys and order fields are ignored.

use diesel::pg::Pg;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::FieldType;
use crate::error::EngineError;
use crate::synth::{quote, ColumnDef, TableDefinition, ID_COLUMN, SEARCH_COLUMN};
use crate::value::{cast_placeholder, Row, Value};

const ALIAS: &str = "t";

/// A filter value after boolean coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Bool(bool),
    Raw(String),
}

impl FilterValue {
    /// Only the exact lowercase literals are booleans.
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "true" => FilterValue::Bool(true),
            "false" => FilterValue::Bool(false),
            other => FilterValue::Raw(other.to_string()),
        }
    }

    fn literal(&self) -> &str {
        match self {
            FilterValue::Bool(true) => "true",
            FilterValue::Bool(false) => "false",
            FilterValue::Raw(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals {
        column: String,
        field_type: FieldType,
        value: Value,
    },
    /// Masked value of an obfuscated column, `*` standing for one character.
    Like { column: String, pattern: String },
    /// The value cannot be stored in the column, so nothing matches.
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
}

impl OrderKey {
    fn parse(entry: &str) -> Self {
        OrderKey {
            column: entry.trim_start_matches('-').trim().to_string(),
            descending: entry.starts_with('-'),
        }
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.descending {
            write!(f, "-{}", self.column)
        } else {
            write!(f, "{}", self.column)
        }
    }
}

/// SQL text plus its positional text parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    pub sql: String,
    pub binds: Vec<Option<String>>,
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row: String,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct EstimateRow {
    #[diesel(sql_type = Nullable<BigInt>)]
    estimate: Option<i64>,
}

#[derive(QueryableByName)]
struct DistinctRow {
    #[diesel(sql_type = Text)]
    value: String,
}

fn column_ref(name: &str) -> String {
    format!("{}.{}", ALIAS, quote(name))
}

/// Escapes LIKE metacharacters so `text` only matches itself.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// LIKE pattern for a masked value, `*` matching exactly one character.
pub fn mask_pattern(masked: &str) -> String {
    escape_like(masked).replace('*', "_")
}

fn predicate_for(column: &ColumnDef, value: &FilterValue) -> Predicate {
    let Some(field_type) = column.field_type() else {
        return Predicate::Never;
    };

    if column.obfuscate && field_type.is_textual() {
        if let FilterValue::Raw(raw) = value {
            if raw.contains('*') {
                return Predicate::Like {
                    column: column.name.clone(),
                    pattern: mask_pattern(raw),
                };
            }
        }
    }

    let parsed = match (field_type, value) {
        (FieldType::Boolean, FilterValue::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldType::Boolean, FilterValue::Raw(_)) => Err(()),
        (other, value) => Value::parse(other, value.literal()).map_err(|_| ()),
    };
    match parsed {
        Ok(Value::Null) | Err(()) => Predicate::Never,
        Ok(value) => Predicate::Equals {
            column: column.name.clone(),
            field_type,
            value,
        },
    }
}

/// Whitespace separated terms in first-seen order, duplicates removed.
pub fn search_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split_whitespace()
        .filter(|term| seen.insert(term.to_string()))
        .map(str::to_string)
        .collect()
}

/// Filters, searches and orders the rows of `definition` in one call.
pub fn compose<I, K, V, S>(
    definition: Arc<TableDefinition>,
    filter_params: I,
    search_text: &str,
    order_fields: &[S],
) -> TableQuery
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
    S: AsRef<str>,
{
    TableQuery::new(definition)
        .apply_filters(filter_params)
        .search(search_text)
        .apply_ordering(order_fields)
}

#[derive(Debug, Clone)]
pub struct TableQuery {
    definition: Arc<TableDefinition>,
    filters: Vec<(String, FilterValue)>,
    predicates: Vec<Predicate>,
    ordering: Vec<OrderKey>,
    search_terms: Vec<String>,
    count: Option<i64>,
}

impl TableQuery {
    pub fn new(definition: Arc<TableDefinition>) -> Self {
        Self {
            definition,
            filters: Vec::new(),
            predicates: Vec::new(),
            ordering: Vec::new(),
            search_terms: Vec::new(),
            count: None,
        }
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    /// Applied filters in allowlist order, after boolean coercion.
    pub fn filters(&self) -> &[(String, FilterValue)] {
        &self.filters
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Explicit ordering in `-field` notation.
    pub fn ordering(&self) -> Vec<String> {
        self.ordering.iter().map(OrderKey::to_string).collect()
    }

    pub fn search_terms(&self) -> &[String] {
        &self.search_terms
    }

    pub fn is_filtered(&self) -> bool {
        !self.predicates.is_empty() || !self.search_terms.is_empty()
    }

    /// Keeps parameters named in the table's filtering list and drops the rest.
    pub fn apply_filters<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut given: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in params {
            given.insert(key.as_ref().to_string(), value.as_ref().to_string());
        }

        let definition = Arc::clone(&self.definition);
        for name in &definition.filtering {
            let Some(raw) = given.remove(name) else {
                continue;
            };
            let Some(column) = definition.column(name) else {
                continue;
            };
            let value = FilterValue::coerce(&raw);
            let predicate = predicate_for(column, &value);
            if predicate == Predicate::Never {
                debug!(
                    "Filter {}={:?} cannot match any {} value",
                    name, raw, column.sql_type
                );
            }
            self.filters.push((name.clone(), value));
            self.predicates.push(predicate);
        }

        if !given.is_empty() {
            debug!(
                "Ignoring filters on {}: {:?}",
                definition.label(),
                given.keys().collect::<Vec<_>>()
            );
        }
        self.count = None;
        self
    }

    fn field_column(&self, column: &str) -> Result<ColumnDef, EngineError> {
        self.definition
            .column(column)
            .filter(|c| c.field_type().is_some())
            .cloned()
            .ok_or_else(|| EngineError::InvalidFieldName {
                name: column.to_string(),
            })
    }

    /// Equality on any field, outside the filtering allowlist. Used by
    /// table extensions, never with client-chosen column names.
    pub fn filter_eq(mut self, column: &str, raw: &str) -> Result<Self, EngineError> {
        let column = self.field_column(column)?;
        let predicate = match column.field_type() {
            Some(field_type) => match Value::parse(field_type, raw) {
                Ok(Value::Null) | Err(_) => Predicate::Never,
                Ok(value) => Predicate::Equals {
                    column: column.name.clone(),
                    field_type,
                    value,
                },
            },
            None => Predicate::Never,
        };
        self.predicates.push(predicate);
        self.count = None;
        Ok(self)
    }

    /// Rows whose text value of `column` starts with `prefix`.
    pub fn filter_prefix(mut self, column: &str, prefix: &str) -> Result<Self, EngineError> {
        let column = self.field_column(column)?;
        self.predicates.push(Predicate::Like {
            column: column.name,
            pattern: format!("{}%", escape_like(prefix)),
        });
        self.count = None;
        Ok(self)
    }

    /// Keeps order fields allowed for ordering or filtering, compared without
    /// case or `-` prefix, falling back to the table's default ordering.
    pub fn apply_ordering<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        let definition = Arc::clone(&self.definition);
        let allowed: BTreeMap<String, String> = definition
            .ordering
            .iter()
            .chain(definition.filtering.iter())
            .map(|entry| {
                let name = OrderKey::parse(entry).column;
                (name.to_lowercase(), name)
            })
            .collect();

        let mut ordering: Vec<OrderKey> = Vec::new();
        for entry in fields {
            let requested = OrderKey::parse(entry.as_ref());
            match allowed.get(&requested.column.to_lowercase()) {
                Some(canonical) if !ordering.iter().any(|k| &k.column == canonical) => {
                    ordering.push(OrderKey {
                        column: canonical.clone(),
                        descending: requested.descending,
                    });
                }
                Some(_) => {}
                None => debug!("Ignoring order field {:?}", entry.as_ref()),
            }
        }

        if ordering.is_empty() {
            ordering = definition
                .ordering
                .iter()
                .map(|entry| OrderKey::parse(entry))
                .collect();
        }
        self.ordering = ordering;
        self
    }

    /// Restricts to rows matching every whitespace separated term and ranks
    /// them by relevance. Tables without search fields ignore this.
    pub fn search(mut self, text: &str) -> Self {
        if !self.definition.has_search() {
            if !text.trim().is_empty() {
                debug!("Table {} is not searchable", self.definition.label());
            }
            return self;
        }
        self.search_terms = search_terms(text);
        self.count = None;
        self
    }

    fn where_clause(&self, binds: &mut Vec<Option<String>>) -> (Option<String>, Option<String>) {
        let mut conditions = Vec::new();
        for predicate in &self.predicates {
            match predicate {
                Predicate::Equals {
                    column,
                    field_type,
                    value,
                } => {
                    binds.push(value.to_sql_text());
                    conditions.push(format!(
                        "{} = {}",
                        column_ref(column),
                        cast_placeholder(*field_type, binds.len())
                    ));
                }
                Predicate::Like { column, pattern } => {
                    binds.push(Some(pattern.clone()));
                    conditions.push(format!("{}::text LIKE ${}", column_ref(column), binds.len()));
                }
                Predicate::Never => conditions.push("FALSE".to_string()),
            }
        }

        let mut tsquery = None;
        if !self.search_terms.is_empty() {
            let parts: Vec<String> = self
                .search_terms
                .iter()
                .map(|term| {
                    binds.push(Some(term.clone()));
                    format!(
                        "plainto_tsquery('{}', ${})",
                        self.definition.search_config,
                        binds.len()
                    )
                })
                .collect();
            let expression = format!("({})", parts.join(" && "));
            conditions.push(format!("{} @@ {}", column_ref(SEARCH_COLUMN), expression));
            tsquery = Some(expression);
        }

        let clause = if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        };
        (clause, tsquery)
    }

    fn from_clause(&self) -> String {
        format!("{} AS {}", quote(&self.definition.db_table_name), ALIAS)
    }

    fn order_clause(&self, tsquery: Option<&str>) -> String {
        let mut keys: Vec<String> = self
            .ordering
            .iter()
            .map(|key| {
                format!(
                    "{} {}",
                    column_ref(&key.column),
                    if key.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        if let Some(expression) = tsquery {
            keys.push(format!(
                "ts_rank({}, {}) DESC",
                column_ref(SEARCH_COLUMN),
                expression
            ));
        }
        keys.push(format!("{} ASC", column_ref(ID_COLUMN)));
        keys.join(", ")
    }

    fn row_projection(&self) -> String {
        self.definition
            .field_columns()
            .map(|column| match column.field_type() {
                // Keeps the exact digits instead of a JSON number.
                Some(FieldType::Decimal) => {
                    format!("{}::text AS {}", column_ref(&column.name), quote(&column.name))
                }
                _ => format!("{} AS {}", column_ref(&column.name), quote(&column.name)),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn select_sql(&self, limit: Option<u64>, offset: u64) -> RenderedQuery {
        let mut binds = Vec::new();
        let (condition, tsquery) = self.where_clause(&mut binds);

        let mut sql = format!(
            "SELECT row_to_json(_r)::text AS row FROM {} CROSS JOIN LATERAL (SELECT {}) _r",
            self.from_clause(),
            self.row_projection()
        );
        if let Some(condition) = condition {
            sql.push_str(&format!(" WHERE {}", condition));
        }
        sql.push_str(&format!(" ORDER BY {}", self.order_clause(tsquery.as_deref())));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        RenderedQuery { sql, binds }
    }

    pub fn count_sql(&self) -> RenderedQuery {
        let mut binds = Vec::new();
        let (condition, _) = self.where_clause(&mut binds);
        let mut sql = format!("SELECT COUNT(*) AS count FROM {}", self.from_clause());
        if let Some(condition) = condition {
            sql.push_str(&format!(" WHERE {}", condition));
        }
        RenderedQuery { sql, binds }
    }

    pub fn estimate_sql(&self) -> RenderedQuery {
        RenderedQuery {
            sql: "SELECT reltuples::bigint AS estimate FROM pg_class \
                  WHERE relname = $1 AND relkind = 'r'"
                .to_string(),
            binds: vec![Some(self.definition.db_table_name.clone())],
        }
    }

    pub fn distinct_sql(&self, column: &str) -> Result<RenderedQuery, EngineError> {
        if self.definition.column(column).and_then(ColumnDef::field_type).is_none() {
            return Err(EngineError::InvalidFieldName {
                name: column.to_string(),
            });
        }
        let mut binds = Vec::new();
        let (condition, _) = self.where_clause(&mut binds);
        let mut conditions = vec![format!("{} IS NOT NULL", column_ref(column))];
        conditions.extend(condition);
        Ok(RenderedQuery {
            sql: format!(
                "SELECT DISTINCT {}::text AS value FROM {} WHERE {} ORDER BY 1",
                column_ref(column),
                self.from_clause(),
                conditions.join(" AND ")
            ),
            binds,
        })
    }

    /// Row count. Unfiltered queries use the planner estimate and fall back
    /// to an exact count when it is missing or fails. Cached until the query
    /// changes.
    pub async fn count(&mut self, conn: &mut AsyncPgConnection) -> Result<i64, EngineError> {
        if let Some(count) = self.count {
            return Ok(count);
        }

        let mut count = None;
        if !self.is_filtered() {
            match boxed(self.estimate_sql()).load::<EstimateRow>(conn).await {
                Ok(rows) => {
                    count = rows.into_iter().next().and_then(|r| r.estimate).filter(|n| *n >= 0)
                }
                Err(e) => warn!(
                    "Row estimate for {} failed, counting: {}",
                    self.definition.db_table_name, e
                ),
            }
        }

        let count = match count {
            Some(count) => count,
            None => {
                let rows: Vec<CountRow> = boxed(self.count_sql()).load(conn).await?;
                rows.into_iter().next().map(|r| r.count).unwrap_or(0)
            }
        };
        self.count = Some(count);
        Ok(count)
    }

    pub async fn fetch(
        &self,
        conn: &mut AsyncPgConnection,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Row>, EngineError> {
        let rendered = self.select_sql(limit, offset);
        debug!("Fetching from {}: {}", self.definition.db_table_name, rendered.sql);
        let rows: Vec<JsonRow> = boxed(rendered).load(conn).await?;
        rows.iter().map(|r| self.decode(&r.row)).collect()
    }

    /// Distinct non-null values of `column` as text, sorted.
    pub async fn distinct_values(
        &self,
        conn: &mut AsyncPgConnection,
        column: &str,
    ) -> Result<Vec<String>, EngineError> {
        let rows: Vec<DistinctRow> = boxed(self.distinct_sql(column)?).load(conn).await?;
        Ok(rows.into_iter().map(|r| r.value).collect())
    }

    fn decode(&self, text: &str) -> Result<Row, EngineError> {
        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut row = Row::new();
        for column in self.definition.field_columns() {
            let Some(field_type) = column.field_type() else {
                continue;
            };
            let json = document.get(&column.name).unwrap_or(&serde_json::Value::Null);
            let value = Value::from_json(field_type, json).map_err(|_| EngineError::InvalidValue {
                field: column.name.clone(),
                field_type: field_type.to_string(),
                value: json.to_string(),
            })?;
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }
}

fn boxed(
    rendered: RenderedQuery,
) -> diesel::query_builder::BoxedSqlQuery<'static, Pg, diesel::query_builder::SqlQuery> {
    let mut query = diesel::sql_query(rendered.sql).into_boxed::<Pg>();
    for bind in rendered.binds {
        query = query.bind::<Nullable<Text>, _>(bind);
    }
    query
}
