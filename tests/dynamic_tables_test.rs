use chrono::{NaiveDate, TimeZone, Utc};
use datatable_engine::catalog::{DataTable, FieldOptions, Table};
use datatable_engine::database::{FieldSpec, TableSpec};
use datatable_engine::import::{ImportJob, ImportOptions};
use datatable_engine::query::TableQuery;
use datatable_engine::synth::IndexKind;
use datatable_engine::value::{Row, Value};
use datatable_engine::{EngineConfig, EngineError, TableEngine};
use diesel::sql_types::Text;
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();
static MIGRATED: Lazy<tokio::sync::Mutex<bool>> = Lazy::new(|| tokio::sync::Mutex::new(false));

fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

async fn test_engine() -> Option<TableEngine> {
    init_test_logging();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping database test");
        return None;
    };
    let mut config = EngineConfig::from_toml(&format!("database_url = {:?}", database_url))
        .expect("Failed to build test configuration");

    // Tests run in parallel; only the first one migrates the catalog.
    let mut migrated = MIGRATED.lock().await;
    config.run_migrations = !*migrated;
    let engine = TableEngine::new(config)
        .await
        .expect("Failed to create table engine");
    *migrated = true;
    Some(engine)
}

/// A fresh dataset with one table and the given fields.
async fn create_table(
    engine: &TableEngine,
    spec: TableSpec,
    fields: Vec<FieldSpec>,
) -> Table {
    let slug = format!("test-{}", &Uuid::new_v4().simple().to_string()[..12]);
    let database = engine.database();
    let dataset = database
        .create_dataset(&slug, "Test dataset", "Created by the integration tests", true)
        .await
        .expect("Failed to create dataset");
    let version = database
        .create_version(&dataset, "2024-01-01", 1, None)
        .await
        .expect("Failed to create version");
    let table = database
        .create_table(&dataset, &version, &spec)
        .await
        .expect("Failed to create table");
    for field in &fields {
        engine
            .add_field(&table, field)
            .await
            .expect("Failed to create field");
    }
    table
}

async fn new_generation(engine: &TableEngine, table: &Table) -> DataTable {
    let new = engine.new_data_table(table);
    let definition = engine
        .definition_for(table, &new.db_table_name)
        .await
        .expect("Failed to synthesize definition");
    engine
        .create_table(&definition, true)
        .await
        .expect("Failed to create physical table");
    engine
        .create_triggers(&definition)
        .await
        .expect("Failed to create triggers");
    engine
        .save_data_table(&new)
        .await
        .expect("Failed to save DataTable")
}

async fn active_ids(engine: &TableEngine, table: &Table) -> Vec<i32> {
    engine
        .database()
        .data_tables_for_table(table.id)
        .await
        .expect("Failed to list generations")
        .into_iter()
        .filter(|g| g.active)
        .map(|g| g.id)
        .collect()
}

async fn cleanup(engine: &TableEngine, table: &Table) {
    if let Ok(Some(active)) = engine.database().active_data_table(table.id).await {
        let _ = engine.deactivate(&active, false, false).await;
    }
    let _ = engine
        .delete_inactive_data_tables(&[table.dataset_slug.clone()])
        .await;
}

fn spec(ordering: &[&str], filtering: &[&str], search: &[&str]) -> TableSpec {
    let strings = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
    TableSpec {
        name: "empresas".to_string(),
        default: true,
        api_enabled: true,
        ordering: strings(ordering),
        filtering: strings(filtering),
        search: strings(search),
        ..TableSpec::default()
    }
}

fn text_row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::Text(v.to_string())))
        .collect()
}

#[tokio::test]
async fn test_cutover_keeps_at_most_one_active_generation() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a table with three generations created in order A, B, C
    let table = create_table(&engine, spec(&[], &["nome"], &[]), vec![FieldSpec::new("nome", "string", 1)]).await;
    let a = new_generation(&engine, &table).await;
    let b = new_generation(&engine, &table).await;
    let c = new_generation(&engine, &table).await;
    assert!(active_ids(&engine, &table).await.is_empty());

    // When: activating each of them in turn
    for generation in [&a, &b, &c] {
        engine.activate(generation, false).await.expect("Failed to activate");

        // Then: only the latest activated one is active
        assert_eq!(active_ids(&engine, &table).await, vec![generation.id]);
    }

    // When: deactivating C with rollback
    let plan = engine
        .deactivate(&c, true, true)
        .await
        .expect("Failed to deactivate");

    // Then: B is active again and C was not dropped
    assert_eq!(plan.activate, Some(b.id));
    assert!(plan.drop.is_empty());
    assert_eq!(active_ids(&engine, &table).await, vec![b.id]);
    let definition = engine.get_model(&table, true, Some(&c)).await.unwrap();
    let mut query = TableQuery::new(definition).apply_filters([("nome", "x")]);
    assert_eq!(engine.count(&mut query).await.unwrap(), 0);

    // And: the active generation cannot be deleted, and nothing changed
    let result = engine.delete_data_table(&b).await;
    assert!(matches!(result, Err(EngineError::ActiveDataTableDeletion { .. })));
    let definition = engine.get_model(&table, true, None).await.unwrap();
    assert_eq!(definition.db_table_name, b.db_table_name);
    let mut query = TableQuery::new(definition).apply_filters([("nome", "x")]);
    assert_eq!(engine.count(&mut query).await.unwrap(), 0);

    // When: deleting an inactive generation twice
    engine.delete_data_table(&a).await.expect("Failed to delete A");
    let again = engine.delete_data_table(&a).await;

    // Then: the record is gone
    assert!(matches!(again, Err(EngineError::DataTableNotFound { .. })));
    let remaining = engine.database().data_tables_for_table(table.id).await.unwrap();
    assert_eq!(remaining.len(), 2);

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_activation_can_drop_previous_generation() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: A active and B inactive
    let table = create_table(&engine, spec(&[], &[], &[]), vec![FieldSpec::new("nome", "string", 1)]).await;
    let a = new_generation(&engine, &table).await;
    let b = new_generation(&engine, &table).await;
    engine.activate(&a, false).await.unwrap();

    // When: activating B dropping inactive storage
    let plan = engine.activate(&b, true).await.unwrap();

    // Then: A's physical table and record are both gone
    assert_eq!(plan.deactivate, vec![a.id]);
    assert_eq!(plan.remove, vec![a.id]);
    assert_eq!(plan.drop, vec![a.db_table_name.clone()]);
    assert_eq!(active_ids(&engine, &table).await, vec![b.id]);
    let definition = engine.get_model(&table, false, Some(&a)).await.unwrap();
    let mut query = TableQuery::new(definition).apply_filters([("nome", "x")]);
    assert!(engine.count(&mut query).await.is_err());
    let deleted = engine.delete_data_table(&a).await;
    assert!(matches!(deleted, Err(EngineError::DataTableNotFound { .. })));

    // When: deactivating B asking for a rollback
    let plan = engine.deactivate(&b, false, true).await.unwrap();

    // Then: the dropped generation is not brought back
    assert_eq!(plan.activate, None);
    assert!(active_ids(&engine, &table).await.is_empty());

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_round_trip_of_every_field_type() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a table with one field of each type
    let mut decimal = FieldSpec::new("valor", "decimal", 5);
    decimal.options = FieldOptions {
        max_length: None,
        max_digits: Some(12),
        decimal_places: Some(2),
    };
    let fields = vec![
        FieldSpec::new("dados", "binary", 1),
        FieldSpec::new("ativo", "boolean", 2),
        FieldSpec::new("data", "date", 3),
        FieldSpec::new("momento", "datetime", 4),
        decimal,
        FieldSpec::new("email", "email", 6),
        FieldSpec::new("taxa", "float", 7),
        FieldSpec::new("ano", "integer", 8),
        FieldSpec::new("extra", "json", 9),
        FieldSpec::new("nome", "string", 10),
        FieldSpec::new("descricao", "text", 11),
    ];
    let table = create_table(&engine, spec(&[], &[], &[]), fields).await;
    let generation = new_generation(&engine, &table).await;
    engine.activate(&generation, false).await.unwrap();
    let definition = engine.get_model(&table, true, None).await.unwrap();

    let row: Row = BTreeMap::from([
        ("dados".to_string(), Value::Binary(vec![0, 255])),
        ("ativo".to_string(), Value::Bool(false)),
        (
            "data".to_string(),
            Value::Date(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()),
        ),
        (
            "momento".to_string(),
            Value::Datetime(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()),
        ),
        ("valor".to_string(), Value::Decimal("0.00".to_string())),
        ("email".to_string(), Value::Text("a@b.c".to_string())),
        ("taxa".to_string(), Value::Float(0.0)),
        ("ano".to_string(), Value::Integer(0)),
        ("extra".to_string(), Value::Json(json!({"a": [1, ""]}))),
        ("nome".to_string(), Value::Text(String::new())),
        ("descricao".to_string(), Value::Null),
    ]);

    // When: inserting and reading it back
    let inserted = engine.insert_rows(&definition, &[row.clone()]).await.unwrap();
    let rows = engine
        .fetch(&TableQuery::new(definition.clone()), None, 0)
        .await
        .unwrap();

    // Then: every value comes back unchanged
    assert_eq!(inserted, 1);
    assert_eq!(rows, vec![row]);

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_search_requires_every_term() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a searchable table
    let table = create_table(
        &engine,
        spec(&["nome"], &["uf"], &["nome"]),
        vec![FieldSpec::new("nome", "string", 1), FieldSpec::new("uf", "string", 2)],
    )
    .await;
    let generation = new_generation(&engine, &table).await;
    engine.activate(&generation, false).await.unwrap();
    let definition = engine.get_model(&table, true, None).await.unwrap();
    engine
        .insert_rows(
            &definition,
            &[
                text_row(&[("nome", "padaria foo bar"), ("uf", "SP")]),
                text_row(&[("nome", "mercado foo"), ("uf", "RJ")]),
                text_row(&[("nome", "bar do ze"), ("uf", "SP")]),
            ],
        )
        .await
        .unwrap();

    let count = |text: &str| {
        let mut query = TableQuery::new(definition.clone()).search(text);
        let engine = engine.clone();
        async move { engine.count(&mut query).await.unwrap() }
    };

    // Then: terms are combined with AND and duplicates are ignored
    assert_eq!(count("foo bar").await, 1);
    assert_eq!(count("foo").await, 2);
    assert_eq!(count("foo foo").await, count("foo").await);

    // And: search composes with filters and ordering
    let query = TableQuery::new(definition.clone())
        .apply_filters([("uf", "SP"), ("ignored", "x")])
        .apply_ordering(&["-nome"])
        .search("bar");
    let rows = engine.fetch(&query, Some(10), 0).await.unwrap();
    let names: Vec<_> = rows.iter().map(|r| r["nome"].clone()).collect();
    assert_eq!(
        names,
        vec![
            Value::Text("padaria foo bar".to_string()),
            Value::Text("bar do ze".to_string()),
        ]
    );

    // And: the search vector can be rebuilt
    assert_eq!(engine.update_search_index(&definition).await.unwrap(), 3);
    assert_eq!(count("mercado").await, 1);

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_import_switches_generations() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a table with a choiceable field and a first import
    let mut uf = FieldSpec::new("uf", "string", 2);
    uf.has_choices = true;
    let table = create_table(
        &engine,
        spec(&["-ano"], &["uf"], &["nome"]),
        vec![FieldSpec::new("nome", "string", 1), uf, FieldSpec::new("ano", "integer", 3)],
    )
    .await;
    let first = ImportJob::new(&engine, table.clone(), ImportOptions::default())
        .run("nome,uf,ano\nfoo,SP,2019\n".as_bytes())
        .await
        .expect("First import failed");
    let first_import_date = engine
        .get_table(&table.dataset_slug, &table.name)
        .await
        .unwrap()
        .import_date
        .expect("Import date must be recorded with the activation");

    // When: importing a second file dropping the old generation
    let collected_at = NaiveDate::from_ymd_opt(2021, 6, 30).unwrap();
    let options = ImportOptions {
        delete_old_table: true,
        collected_at: Some(collected_at),
        ..ImportOptions::default()
    };
    let second = ImportJob::new(&engine, table.clone(), options)
        .run("uf,nome,ano\nRJ,bar,2020\nSP,baz,2021\n".as_bytes())
        .await
        .expect("Second import failed");

    // Then: the new generation is active and the old one dropped
    let first_table = first.data_table.unwrap();
    let second_table = second.data_table.unwrap();
    assert_eq!(second.rows_imported, 2);
    assert_eq!(active_ids(&engine, &table).await, vec![second_table.id]);
    assert_eq!(
        second.cutover.unwrap().drop,
        vec![first_table.db_table_name.clone()]
    );

    // And: choices, import date and collection date were stored with the switch
    let field = engine.database().get_field(&table, "uf").await.unwrap();
    assert_eq!(field.choices, Some(vec!["RJ".to_string(), "SP".to_string()]));
    let second_import_date = engine
        .get_table(&table.dataset_slug, &table.name)
        .await
        .unwrap()
        .import_date
        .unwrap();
    assert!(second_import_date >= first_import_date);
    let version = engine.database().get_version(table.version_id).await.unwrap();
    assert_eq!(version.collected_at, Some(collected_at));

    // And: queries see the new rows, ordered by the default ordering
    let query = engine.query(&table).await.unwrap().apply_ordering::<&str>(&[]);
    let rows = engine.fetch(&query, None, 0).await.unwrap();
    assert_eq!(rows[0]["ano"], Value::Integer(2021));

    // When: an import fails on a bad value
    let failed = ImportJob::new(&engine, table.clone(), ImportOptions::default())
        .run("nome,uf,ano\nqux,MG,dois mil\n".as_bytes())
        .await;

    // Then: the failed generation is removed and the active one is untouched
    assert!(matches!(failed, Err(EngineError::InvalidValue { .. })));
    let generations = engine.database().data_tables_for_table(table.id).await.unwrap();
    assert_eq!(generations.len(), 1);
    assert_eq!(active_ids(&engine, &table).await, vec![second_table.id]);

    // And: the import date still points at the last successful import
    let after_failure = engine
        .get_table(&table.dataset_slug, &table.name)
        .await
        .unwrap()
        .import_date;
    assert_eq!(after_failure, Some(second_import_date));

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_delete_and_activate_race_never_loses_active_storage() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: an active generation and several inactive ones
    let table = create_table(&engine, spec(&[], &["nome"], &[]), vec![FieldSpec::new("nome", "string", 1)]).await;
    let first = new_generation(&engine, &table).await;
    engine.activate(&first, false).await.unwrap();

    for _ in 0..5 {
        let candidate = new_generation(&engine, &table).await;

        // When: deleting and activating the same generation concurrently
        let (deleted, activated) = tokio::join!(
            engine.delete_data_table(&candidate),
            engine.activate(&candidate, false)
        );

        // Then: exactly one wins and the active generation keeps its storage
        match (deleted, activated) {
            (Ok(()), Err(EngineError::DataTableNotFound { .. })) => {}
            (Err(EngineError::ActiveDataTableDeletion { .. }), Ok(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        let definition = engine.get_model(&table, false, None).await.unwrap();
        let mut query = TableQuery::new(definition).apply_filters([("nome", "x")]);
        assert_eq!(engine.count(&mut query).await.unwrap(), 0);
    }

    cleanup(&engine, &table).await;
}

#[tokio::test]
async fn test_unfiltered_count_uses_statistics_when_present() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a never analysed table with three rows
    let table = create_table(&engine, spec(&[], &["nome"], &[]), vec![FieldSpec::new("nome", "string", 1)]).await;
    let generation = new_generation(&engine, &table).await;
    engine.activate(&generation, false).await.unwrap();
    let definition = engine.get_model(&table, true, None).await.unwrap();
    let rows = |names: &[&str]| -> Vec<Row> { names.iter().map(|n| text_row(&[("nome", *n)])).collect() };
    engine.insert_rows(&definition, &rows(&["a", "b", "c"])).await.unwrap();

    // When: counting without filters
    let mut query = TableQuery::new(definition.clone());
    let first = engine.count(&mut query).await.unwrap();

    // Then: without statistics the rows are counted exactly
    assert_eq!(first, 3);

    // And: the count is kept for the lifetime of the query
    engine.insert_rows(&definition, &rows(&["d", "e"])).await.unwrap();
    assert_eq!(engine.count(&mut query).await.unwrap(), 3);

    // When: statistics are refreshed and more rows arrive
    engine.analyse_table(&definition).await.unwrap();
    engine.insert_rows(&definition, &rows(&["f"])).await.unwrap();

    // Then: an unfiltered count reports the planner estimate
    let mut unfiltered = TableQuery::new(definition.clone());
    assert_eq!(engine.count(&mut unfiltered).await.unwrap(), 5);

    // And: a filtered count is always exact
    let mut filtered = TableQuery::new(definition.clone()).apply_filters([("nome", "f")]);
    assert_eq!(engine.count(&mut filtered).await.unwrap(), 1);

    cleanup(&engine, &table).await;
}

#[derive(QueryableByName)]
struct IndexState {
    #[diesel(sql_type = Text)]
    valid: String,
}

#[tokio::test]
async fn test_create_indexes_rebuilds_invalid_index() {
    let Some(engine) = test_engine().await else {
        return;
    };

    // Given: a table whose filter index was left invalid by a failed build
    let table = create_table(&engine, spec(&[], &["uf"], &[]), vec![FieldSpec::new("uf", "string", 1)]).await;
    let new = engine.new_data_table(&table);
    let definition = engine.definition_for(&table, &new.db_table_name).await.unwrap();
    engine.create_table(&definition, false).await.unwrap();
    let data_table = engine.save_data_table(&new).await.unwrap();
    engine
        .insert_rows(&definition, &[text_row(&[("uf", "SP")]), text_row(&[("uf", "SP")])])
        .await
        .unwrap();
    let index = definition.index(IndexKind::Filter).next().unwrap().name.clone();
    let mut conn = engine.database().connection().await.unwrap();
    let failed = diesel::sql_query(format!(
        "CREATE UNIQUE INDEX CONCURRENTLY \"{}\" ON \"{}\" (\"uf\")",
        index, definition.db_table_name
    ))
    .execute(&mut conn)
    .await;
    assert!(failed.is_err());

    // When: building the indexes
    engine.create_indexes(&definition).await.unwrap();

    // Then: the index exists and is valid
    let states: Vec<IndexState> = diesel::sql_query(
        "SELECT i.indisvalid::text AS valid FROM pg_index i \
         JOIN pg_class c ON c.oid = i.indexrelid WHERE c.relname = $1",
    )
    .bind::<Text, _>(index.clone())
    .load(&mut conn)
    .await
    .unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].valid, "true");
    drop(conn);

    engine.delete_data_table(&data_table).await.unwrap();
    cleanup(&engine, &table).await;
}
