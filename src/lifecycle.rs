use diesel::pg::Pg;
use diesel::sql_types::{Nullable, Text};
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::database::DatabaseManager;
use crate::error::EngineError;
use crate::synth::{
    quote, trigger_function_name, IndexDef, TableDefinition, ID_COLUMN, SEARCH_COLUMN,
};
use crate::value::{cast_placeholder, Row, Value};

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMETERS: usize = 65_535;

pub fn create_table_sql(definition: &TableDefinition) -> String {
    let mut columns = vec![format!("{} bigserial PRIMARY KEY", quote(ID_COLUMN))];
    for column in &definition.columns {
        columns.push(format!(
            "{} {} {}",
            quote(&column.name),
            column.sql_type,
            if column.nullable { "NULL" } else { "NOT NULL" }
        ));
    }
    format!(
        "CREATE TABLE {} ({})",
        quote(&definition.db_table_name),
        columns.join(", ")
    )
}

/// Index build that does not block reads or writes on the table. Cannot run
/// inside a transaction block.
pub fn create_index_sql(definition: &TableDefinition, index: &IndexDef) -> String {
    let columns: Vec<String> = index
        .columns
        .iter()
        .map(|column| {
            if column.descending {
                format!("{} DESC", quote(&column.name))
            } else {
                quote(&column.name)
            }
        })
        .collect();
    format!(
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} USING {} ({})",
        quote(&index.name),
        quote(&definition.db_table_name),
        index.kind.method(),
        columns.join(", ")
    )
}

/// Indexes of a table left INVALID by an interrupted concurrent build.
pub const INVALID_INDEXES_SQL: &str = "SELECT c.relname::text AS name FROM pg_index i \
     JOIN pg_class c ON c.oid = i.indexrelid \
     JOIN pg_class t ON t.oid = i.indrelid \
     WHERE t.relname = $1 AND NOT i.indisvalid";

pub fn drop_index_sql(index_name: &str) -> String {
    format!("DROP INDEX CONCURRENTLY IF EXISTS {}", quote(index_name))
}

#[derive(QueryableByName)]
struct IndexName {
    #[diesel(sql_type = Text)]
    name: String,
}

async fn invalid_indexes(
    conn: &mut AsyncPgConnection,
    db_table_name: &str,
) -> Result<Vec<String>, EngineError> {
    let rows = diesel::sql_query(INVALID_INDEXES_SQL)
        .bind::<Text, _>(db_table_name.to_string())
        .load::<IndexName>(conn)
        .await?;
    Ok(rows.into_iter().map(|row| row.name).collect())
}

/// `to_tsvector` over the search fields, each column prefixed by `prefix`
/// (`NEW.` inside the trigger body).
pub fn search_vector_sql(definition: &TableDefinition, prefix: &str) -> String {
    let parts: Vec<String> = definition
        .search
        .iter()
        .map(|name| format!("{}{}::text", prefix, quote(name)))
        .collect();
    format!(
        "to_tsvector('{}', concat_ws(' ', {}))",
        definition.search_config,
        parts.join(", ")
    )
}

pub fn search_trigger_sql(definition: &TableDefinition) -> Vec<String> {
    let function = quote(&definition.trigger_function);
    vec![
        format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $$\n\
             BEGIN\n    NEW.{} := {};\n    RETURN NEW;\nEND\n$$ LANGUAGE plpgsql",
            function,
            quote(SEARCH_COLUMN),
            search_vector_sql(definition, "NEW.")
        ),
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote(&definition.trigger_name),
            quote(&definition.db_table_name)
        ),
        format!(
            "CREATE TRIGGER {} BEFORE INSERT OR UPDATE ON {} FOR EACH ROW EXECUTE PROCEDURE {}()",
            quote(&definition.trigger_name),
            quote(&definition.db_table_name),
            function
        ),
    ]
}

/// Dropping an absent table is a no-op.
pub fn drop_table_sql(db_table_name: &str) -> Vec<String> {
    vec![
        format!("DROP TABLE IF EXISTS {}", quote(db_table_name)),
        format!(
            "DROP FUNCTION IF EXISTS {}()",
            quote(&trigger_function_name(db_table_name))
        ),
    ]
}

pub fn update_search_index_sql(definition: &TableDefinition) -> String {
    format!(
        "UPDATE {} SET {} = {}",
        quote(&definition.db_table_name),
        quote(SEARCH_COLUMN),
        search_vector_sql(definition, "")
    )
}

/// Multi-row INSERT for `row_count` rows over the definition's user fields.
pub fn insert_sql(definition: &TableDefinition, row_count: usize) -> String {
    let columns: Vec<_> = definition.field_columns().collect();
    let names: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();

    let mut placeholder = 0;
    let mut tuples = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let values: Vec<String> = columns
            .iter()
            .filter_map(|column| {
                placeholder += 1;
                column
                    .field_type()
                    .map(|field_type| cast_placeholder(field_type, placeholder))
            })
            .collect();
        tuples.push(format!("({})", values.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote(&definition.db_table_name),
        names.join(", "),
        tuples.join(", ")
    )
}

fn map_create_error(err: diesel::result::Error, db_table_name: &str) -> EngineError {
    if let diesel::result::Error::DatabaseError(_, info) = &err {
        if info.message().contains("already exists") {
            return EngineError::TableAlreadyExists {
                db_table_name: db_table_name.to_string(),
            };
        }
    }
    EngineError::Database(err)
}

pub(crate) async fn execute(conn: &mut AsyncPgConnection, sql: &str) -> Result<usize, EngineError> {
    debug!("Executing: {}", sql);
    Ok(diesel::sql_query(sql).execute(conn).await?)
}

/// Creates, indexes, maintains and drops the physical tables behind
/// synthesized definitions.
///
/// Every statement runs on its own pooled connection in autocommit mode, never
/// inside the metadata transactions of the cutover controller.
#[derive(Clone)]
pub struct LifecycleManager {
    database: DatabaseManager,
    batch_size: usize,
}

impl LifecycleManager {
    pub fn new(database: DatabaseManager, batch_size: usize) -> Self {
        Self {
            database,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn create(
        &self,
        definition: &TableDefinition,
        with_indexes: bool,
    ) -> Result<(), EngineError> {
        info!("Creating table {}", definition.db_table_name);
        let mut conn = self.database.connection().await?;

        execute(&mut conn, &create_table_sql(definition))
            .await
            .map_err(|err| match err {
                EngineError::Database(db_err) => {
                    map_create_error(db_err, &definition.db_table_name)
                }
                other => other,
            })?;
        drop(conn);

        if with_indexes {
            self.create_indexes(definition).await?;
        }
        Ok(())
    }

    /// Builds the missing indexes. An index left invalid by an earlier
    /// interrupted build is dropped and built again.
    pub async fn create_indexes(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        let mut conn = self.database.connection().await?;
        let invalid = invalid_indexes(&mut conn, &definition.db_table_name).await?;
        for index in &definition.indexes {
            if invalid.contains(&index.name) {
                warn!(
                    "Index {} on {} is invalid, rebuilding it",
                    index.name, definition.db_table_name
                );
                execute(&mut conn, &drop_index_sql(&index.name)).await?;
            }
            let start = Instant::now();
            execute(&mut conn, &create_index_sql(definition, index)).await?;
            info!(
                "Index {} ({}) on {} done in {:.3}s",
                index.name,
                index.kind.method(),
                definition.db_table_name,
                start.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    pub async fn create_search_trigger(
        &self,
        definition: &TableDefinition,
    ) -> Result<(), EngineError> {
        if !definition.has_search() {
            debug!(
                "Table {} has no search fields, skipping trigger",
                definition.label()
            );
            return Ok(());
        }

        let mut conn = self.database.connection().await?;
        for statement in search_trigger_sql(definition) {
            execute(&mut conn, &statement).await?;
        }
        info!(
            "Installed search trigger {} on {}",
            definition.trigger_name, definition.db_table_name
        );
        Ok(())
    }

    pub async fn drop(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        self.drop_by_name(&definition.db_table_name).await
    }

    pub async fn drop_by_name(&self, db_table_name: &str) -> Result<(), EngineError> {
        let mut conn = self.database.connection().await?;
        for statement in drop_table_sql(db_table_name) {
            execute(&mut conn, &statement).await?;
        }
        info!("Dropped table {}", db_table_name);
        Ok(())
    }

    /// Refreshes planner statistics so the estimated row count is usable.
    pub async fn analyse(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        let start = Instant::now();
        let mut conn = self.database.connection().await?;
        execute(
            &mut conn,
            &format!("VACUUM ANALYZE {}", quote(&definition.db_table_name)),
        )
        .await?;
        info!(
            "VACUUM ANALYZE {} done in {:.3}s",
            definition.db_table_name,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    pub async fn update_search_index(
        &self,
        definition: &TableDefinition,
    ) -> Result<usize, EngineError> {
        if !definition.has_search() {
            warn!("Table {} has no search fields", definition.label());
            return Ok(0);
        }
        let mut conn = self.database.connection().await?;
        let updated = execute(&mut conn, &update_search_index_sql(definition)).await?;
        info!(
            "Recomputed search data for {} rows of {}",
            updated, definition.db_table_name
        );
        Ok(updated)
    }

    /// Inserts rows in batches. Missing columns are stored as NULL.
    pub async fn insert_rows(
        &self,
        definition: &TableDefinition,
        rows: &[Row],
    ) -> Result<usize, EngineError> {
        let column_count = definition.field_columns().count().max(1);
        let per_statement = self.batch_size.min(MAX_BIND_PARAMETERS / column_count).max(1);

        let mut conn = self.database.connection().await?;
        let mut inserted = 0;
        for batch in rows.chunks(per_statement) {
            inserted += insert_batch(&mut conn, definition, batch).await?;
        }
        Ok(inserted)
    }
}

async fn insert_batch(
    conn: &mut AsyncPgConnection,
    definition: &TableDefinition,
    rows: &[Row],
) -> Result<usize, EngineError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut query = diesel::sql_query(insert_sql(definition, rows.len())).into_boxed::<Pg>();
    for row in rows {
        for column in definition.field_columns() {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            query = query.bind::<Nullable<Text>, _>(value.to_sql_text());
        }
    }
    Ok(query.execute(conn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::synthesize;
    use crate::test_support::{field, table};

    fn definition() -> TableDefinition {
        let mut nome = field("nome", "string");
        nome.null = false;
        nome.order = 1;
        let mut ano = field("ano", "integer");
        ano.order = 2;
        let mut dados = field("dados", "binary");
        dados.order = 3;
        synthesize(
            &table(&["-ano", "nome"], &["nome", "ano"], &["nome"]),
            &[nome, ano, dados],
            "data_sociosbrasil_empresas_abc",
            "portuguese",
        )
        .unwrap()
    }

    #[test]
    fn create_table_statement() {
        assert_eq!(
            create_table_sql(&definition()),
            "CREATE TABLE \"data_sociosbrasil_empresas_abc\" (\"id\" bigserial PRIMARY KEY, \
             \"nome\" varchar(255) NOT NULL, \"ano\" bigint NULL, \"dados\" bytea NULL, \
             \"search_data\" tsvector NULL)"
        );
    }

    #[test]
    fn index_statements_are_concurrent() {
        let def = definition();
        let statements: Vec<String> = def
            .indexes
            .iter()
            .map(|index| create_index_sql(&def, index))
            .collect();
        assert_eq!(statements.len(), 3);
        assert!(statements
            .iter()
            .all(|s| s.starts_with("CREATE INDEX CONCURRENTLY IF NOT EXISTS")));
        assert!(statements[0].ends_with("USING btree (\"ano\" DESC, \"nome\")"));
        assert!(statements[1].ends_with("USING btree (\"nome\")"));
        assert!(statements[2].ends_with("USING gin (\"search_data\")"));
    }

    #[test]
    fn invalid_indexes_are_dropped_concurrently() {
        let def = definition();
        assert_eq!(
            drop_index_sql(&def.indexes[0].name),
            format!("DROP INDEX CONCURRENTLY IF EXISTS \"{}\"", def.indexes[0].name)
        );
        assert!(INVALID_INDEXES_SQL.contains("NOT i.indisvalid"));
        assert!(INVALID_INDEXES_SQL.contains("t.relname = $1"));
    }

    #[test]
    fn trigger_recomputes_search_vector() {
        let def = definition();
        let statements = search_trigger_sql(&def);
        assert!(statements[0].contains(
            "NEW.\"search_data\" := to_tsvector('portuguese', concat_ws(' ', NEW.\"nome\"::text))"
        ));
        assert!(statements[2].contains("BEFORE INSERT OR UPDATE"));
        assert!(statements[2].contains(&def.trigger_name));
        assert_eq!(
            update_search_index_sql(&def),
            "UPDATE \"data_sociosbrasil_empresas_abc\" SET \"search_data\" = \
             to_tsvector('portuguese', concat_ws(' ', \"nome\"::text))"
        );
    }

    #[test]
    fn drop_is_idempotent_and_cleans_trigger_function() {
        let def = definition();
        let statements = drop_table_sql(&def.db_table_name);
        assert_eq!(
            statements[0],
            "DROP TABLE IF EXISTS \"data_sociosbrasil_empresas_abc\""
        );
        assert!(statements[1].contains(&def.trigger_function));
    }

    #[test]
    fn insert_numbers_placeholders_per_row() {
        let sql = insert_sql(&definition(), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"data_sociosbrasil_empresas_abc\" (\"nome\", \"ano\", \"dados\") VALUES \
             (CAST($1 AS text), CAST($2 AS bigint), decode($3, 'hex')), \
             (CAST($4 AS text), CAST($5 AS bigint), decode($6, 'hex'))"
        );
    }
}
