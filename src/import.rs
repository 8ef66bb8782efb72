//! Loading a CSV file into a fresh generation and switching to it.

use chrono::{NaiveDate, Utc};
use csv::StringRecord;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::catalog::{table_schema, DataTable, FieldType, Table};
use crate::cutover::{ActivationUpdates, CutoverPlan};
use crate::engine::TableEngine;
use crate::error::EngineError;
use crate::synth::TableDefinition;
use crate::value::{Row, Value};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Load the file into a new generation. Without it the remaining steps
    /// run against the active generation.
    pub import_data: bool,
    pub vacuum: bool,
    pub create_indexes: bool,
    pub fill_choices: bool,
    /// Drop the previously active generation after the cutover.
    pub delete_old_table: bool,
    pub collected_at: Option<NaiveDate>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            import_data: true,
            vacuum: true,
            create_indexes: true,
            fill_choices: true,
            delete_old_table: false,
            collected_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub data_table: Option<DataTable>,
    pub rows_imported: usize,
    pub cutover: Option<CutoverPlan>,
}

/// Maps the CSV header onto the table schema. Every column must be a field.
pub fn resolve_header(
    table: &Table,
    header: &StringRecord,
    schema: &[(String, FieldType)],
) -> Result<Vec<(String, FieldType)>, EngineError> {
    header
        .iter()
        .map(|name| {
            schema
                .iter()
                .find(|(field, _)| field == name)
                .cloned()
                .ok_or_else(|| EngineError::InvalidTableSettings {
                    table: table.label(),
                    message: format!("CSV column {:?} is not a field", name),
                })
        })
        .collect()
}

pub fn parse_record(columns: &[(String, FieldType)], record: &StringRecord) -> Result<Row, EngineError> {
    let mut row = Row::new();
    for ((name, field_type), raw) in columns.iter().zip(record.iter()) {
        let value = Value::parse(*field_type, raw).map_err(|_| EngineError::InvalidValue {
            field: name.clone(),
            field_type: field_type.to_string(),
            value: raw.to_string(),
        })?;
        row.insert(name.clone(), value);
    }
    Ok(row)
}

/// Parses `source` and hands rows to `sender` in batches of `batch_size`.
/// Runs on a blocking thread.
fn read_batches<R: Read>(
    source: R,
    table: &Table,
    schema: &[(String, FieldType)],
    batch_size: usize,
    sender: &mpsc::Sender<Vec<Row>>,
) -> Result<(), EngineError> {
    let mut reader = csv::Reader::from_reader(source);
    let columns = resolve_header(table, reader.headers()?, schema)?;

    let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
    for record in reader.records() {
        batch.push(parse_record(&columns, &record?)?);
        if batch.len() >= batch_size && sender.blocking_send(std::mem::take(&mut batch)).is_err() {
            // The loader stopped and reports its own error.
            return Ok(());
        }
    }
    if !batch.is_empty() {
        let _ = sender.blocking_send(batch);
    }
    Ok(())
}

pub struct ImportJob<'a> {
    engine: &'a TableEngine,
    table: Table,
    options: ImportOptions,
}

impl<'a> ImportJob<'a> {
    pub fn new(engine: &'a TableEngine, table: Table, options: ImportOptions) -> Self {
        Self {
            engine,
            table,
            options,
        }
    }

    pub async fn run_file(&self, path: &Path) -> Result<ImportSummary, EngineError> {
        info!("Importing {} into {}", path.display(), self.table.label());
        let file = tokio::fs::File::open(path).await?.into_std().await;
        self.run(file).await
    }

    pub async fn run<R: Read + Send + 'static>(&self, source: R) -> Result<ImportSummary, EngineError> {
        if !self.options.import_data {
            let definition = self.engine.get_model(&self.table, false, None).await?;
            self.post_process(&definition).await?;
            if self.options.fill_choices {
                for (field_id, choices) in self.collect_choices(None).await? {
                    self.engine.database().save_choices(field_id, &choices).await?;
                }
            }
            return Ok(ImportSummary {
                data_table: None,
                rows_imported: 0,
                cutover: None,
            });
        }

        let new = self.engine.new_data_table(&self.table);
        let definition = self.engine.definition_for(&self.table, &new.db_table_name).await?;
        let data_table = self.engine.save_data_table(&new).await?;

        if let Err(e) = self.engine.create_table(&definition, false).await {
            if let Err(cleanup) = self.engine.database().delete_data_table_record(data_table.id).await {
                error!("Failed to remove DataTable {}: {}", data_table.db_table_name, cleanup);
            }
            return Err(e);
        }

        match self.load_and_activate(source, &definition, &data_table).await {
            Ok((rows_imported, plan)) => Ok(ImportSummary {
                data_table: Some(data_table),
                rows_imported,
                cutover: Some(plan),
            }),
            Err(e) => {
                warn!(
                    "Deleting import table {} due to an error: {}",
                    data_table.db_table_name, e
                );
                if let Err(cleanup) = self.engine.delete_data_table(&data_table).await {
                    error!("Cleanup of {} failed: {}", data_table.db_table_name, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn load_and_activate<R: Read + Send + 'static>(
        &self,
        source: R,
        definition: &TableDefinition,
        data_table: &DataTable,
    ) -> Result<(usize, CutoverPlan), EngineError> {
        self.engine.create_triggers(definition).await?;
        let rows_imported = self.load(source, definition).await?;

        // VACUUM and concurrent index builds cannot run inside a transaction.
        self.post_process(definition).await?;

        let updates = ActivationUpdates {
            choices: if self.options.fill_choices {
                self.collect_choices(Some(data_table)).await?
            } else {
                Vec::new()
            },
            import_date: Some(Utc::now()),
            collected_at: self
                .options
                .collected_at
                .map(|collected_at| (self.table.version_id, collected_at)),
        };
        let plan = self
            .engine
            .activate_with(data_table, self.options.delete_old_table, &updates)
            .await?;
        Ok((rows_imported, plan))
    }

    async fn load<R: Read + Send + 'static>(
        &self,
        source: R,
        definition: &TableDefinition,
    ) -> Result<usize, EngineError> {
        let start = Instant::now();
        let fields = self.engine.database().fields_for_table(&self.table).await?;
        let schema = table_schema(&fields)?;

        let table = self.table.clone();
        let batch_size = self.engine.config().import_batch_size.max(1);
        let (sender, mut receiver) = mpsc::channel::<Vec<Row>>(2);
        let reader = tokio::task::spawn_blocking(move || {
            read_batches(source, &table, &schema, batch_size, &sender)
        });

        let mut imported = 0;
        while let Some(batch) = receiver.recv().await {
            imported += self.engine.insert_rows(definition, &batch).await?;
        }
        reader.await.map_err(|e| EngineError::Io {
            message: format!("CSV reader task failed: {}", e),
        })??;

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            "Imported {} rows into {} in {:.3}s ({:.3} rows/s)",
            imported,
            definition.db_table_name,
            elapsed,
            imported as f64 / elapsed.max(f64::EPSILON)
        );
        Ok(imported)
    }

    async fn post_process(&self, definition: &TableDefinition) -> Result<(), EngineError> {
        if self.options.vacuum {
            self.engine.analyse_table(definition).await?;
        }
        if self.options.create_indexes {
            let start = Instant::now();
            self.engine.create_indexes(definition).await?;
            info!("Indexes done in {:.3}s", start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    async fn collect_choices(
        &self,
        data_table: Option<&DataTable>,
    ) -> Result<Vec<(i32, Vec<String>)>, EngineError> {
        let fields = self.engine.database().fields_for_table(&self.table).await?;
        let mut choices = Vec::new();
        for field in fields.iter().filter(|f| f.has_choices) {
            let start = Instant::now();
            let values = self
                .engine
                .compute_choices(&self.table, field, data_table)
                .await?;
            info!(
                "Choices for {}: {} values in {:.3}s",
                field.name,
                values.len(),
                start.elapsed().as_secs_f64()
            );
            choices.push((field.id, values));
        }
        Ok(choices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::table;

    fn schema() -> Vec<(String, FieldType)> {
        vec![
            ("cnpj".to_string(), FieldType::String),
            ("capital".to_string(), FieldType::Decimal),
            ("ativa".to_string(), FieldType::Boolean),
        ]
    }

    #[test]
    fn header_follows_file_order() {
        let header = StringRecord::from(vec!["ativa", "cnpj"]);
        let columns = resolve_header(&table(&[], &[], &[]), &header, &schema()).unwrap();
        assert_eq!(columns[0], ("ativa".to_string(), FieldType::Boolean));
        assert_eq!(columns[1], ("cnpj".to_string(), FieldType::String));
    }

    #[test]
    fn unknown_header_is_rejected() {
        let header = StringRecord::from(vec!["cnpj", "razao_social"]);
        assert!(matches!(
            resolve_header(&table(&[], &[], &[]), &header, &schema()),
            Err(EngineError::InvalidTableSettings { .. })
        ));
    }

    #[test]
    fn parses_records_per_column_type() {
        let columns = schema();
        let row = parse_record(&columns, &StringRecord::from(vec!["", "", "t"])).unwrap();
        assert_eq!(row["cnpj"], Value::Text(String::new()));
        assert_eq!(row["capital"], Value::Null);
        assert_eq!(row["ativa"], Value::Bool(true));

        let bad = parse_record(&columns, &StringRecord::from(vec!["1", "1,5", "t"]));
        assert!(matches!(bad, Err(EngineError::InvalidValue { field, .. }) if field == "capital"));
    }

    #[test]
    fn reads_batches_off_the_runtime() {
        let data = "cnpj,ativa\n1,t\n2,f\n3,t\n";
        let (sender, mut receiver) = mpsc::channel(4);
        read_batches(data.as_bytes(), &table(&[], &[], &[]), &schema(), 2, &sender).unwrap();
        drop(sender);

        let first = receiver.blocking_recv().unwrap();
        let second = receiver.blocking_recv().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["cnpj"], Value::Text("3".to_string()));
        assert!(receiver.blocking_recv().is_none());
    }

    #[test]
    fn reader_reports_bad_values() {
        let data = "ativa\nmaybe\n";
        let (sender, _receiver) = mpsc::channel(1);
        let result = read_batches(data.as_bytes(), &table(&[], &[], &[]), &schema(), 10, &sender);
        assert!(matches!(result, Err(EngineError::InvalidValue { .. })));
    }

    #[test]
    fn reads_csv_in_file_order() {
        let data = "capital,cnpj\n10.50,00000000000191\n,\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let columns = resolve_header(&table(&[], &[], &[]), reader.headers().unwrap(), &schema()).unwrap();
        let rows: Vec<Row> = reader
            .records()
            .map(|r| parse_record(&columns, &r.unwrap()).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["capital"], Value::Decimal("10.50".to_string()));
        assert_eq!(rows[1]["cnpj"], Value::Text(String::new()));
    }
}
