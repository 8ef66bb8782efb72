use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datatable_engine::import::{ImportJob, ImportOptions};
use datatable_engine::query::compose;
use datatable_engine::{EngineConfig, TableEngine};

#[derive(Parser)]
#[command(name = "datatable-engine")]
#[command(about = "Manage dynamic dataset tables and their generations", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./datatable-engine.toml when present).
    #[arg(long)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a CSV file into a new generation and activate it.
    Import {
        dataset: String,
        table: String,
        csv: Option<PathBuf>,
        /// Skip loading and only run the remaining steps on the active generation.
        #[arg(long)]
        no_import_data: bool,
        #[arg(long)]
        no_vacuum: bool,
        #[arg(long)]
        no_indexes: bool,
        #[arg(long)]
        no_choices: bool,
        /// Drop the previously active generation after the switch.
        #[arg(long)]
        drop_old: bool,
        /// Collection date of the data (YYYY-MM-DD).
        #[arg(long)]
        collected_at: Option<NaiveDate>,
    },
    /// Make a generation the active one of its table.
    Activate {
        data_table_id: i32,
        #[arg(long)]
        drop_inactive: bool,
    },
    /// Deactivate a generation.
    Deactivate {
        data_table_id: i32,
        /// Drop its physical table unless a rollback happened.
        #[arg(long)]
        drop: bool,
        /// Activate the most recent previous generation.
        #[arg(long)]
        rollback: bool,
    },
    /// Delete inactive generations and their physical tables.
    DeleteInactive {
        /// Only these dataset slugs.
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Build the missing indexes of the active generation.
    CreateIndexes { dataset: String, table: String },
    /// Recompute the search vector of every row of the active generation.
    UpdateSearchIndex { dataset: String, table: String },
    /// Print rows of the active generation as JSON lines.
    Query {
        dataset: String,
        table: String,
        /// Filter as field=value; repeatable.
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Order field, `-` prefix for descending; repeatable.
        #[arg(long = "order")]
        ordering: Vec<String>,
        #[arg(long)]
        search: Option<String>,
        /// Extension lookup as name=argument.
        #[arg(long)]
        lookup: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn split_pair(raw: &str) -> anyhow::Result<(String, String)> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| anyhow!("expected name=value, got {:?}", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datatable_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let engine = TableEngine::new(config).await?;

    match args.command {
        Command::Import {
            dataset,
            table,
            csv,
            no_import_data,
            no_vacuum,
            no_indexes,
            no_choices,
            drop_old,
            collected_at,
        } => {
            let table = engine.get_table(&dataset, &table).await?;
            let options = ImportOptions {
                import_data: !no_import_data,
                vacuum: !no_vacuum,
                create_indexes: !no_indexes,
                fill_choices: !no_choices,
                delete_old_table: drop_old,
                collected_at,
            };
            let job = ImportJob::new(&engine, table, options);
            let summary = match csv {
                Some(path) if !no_import_data => job.run_file(&path).await?,
                None if !no_import_data => return Err(anyhow!("a CSV file is required")),
                _ => job.run(std::io::empty()).await?,
            };
            if let Some(data_table) = summary.data_table {
                info!(
                    "{} rows imported, {} is now active",
                    summary.rows_imported, data_table.db_table_name
                );
            }
        }
        Command::Activate {
            data_table_id,
            drop_inactive,
        } => {
            let data_table = engine.database().get_data_table(data_table_id).await?;
            let plan = engine.activate(&data_table, drop_inactive).await?;
            info!("Activated {} ({:?})", data_table.db_table_name, plan);
        }
        Command::Deactivate {
            data_table_id,
            drop,
            rollback,
        } => {
            let data_table = engine.database().get_data_table(data_table_id).await?;
            let plan = engine.deactivate(&data_table, drop, rollback).await?;
            info!("Deactivated {} ({:?})", data_table.db_table_name, plan);
        }
        Command::DeleteInactive { only } => {
            let deleted = engine.delete_inactive_data_tables(&only).await?;
            info!("{} generations deleted", deleted);
        }
        Command::CreateIndexes { dataset, table } => {
            let table = engine.get_table(&dataset, &table).await?;
            let definition = engine.get_model(&table, false, None).await?;
            engine.create_indexes(&definition).await?;
        }
        Command::UpdateSearchIndex { dataset, table } => {
            let table = engine.get_table(&dataset, &table).await?;
            let definition = engine.get_model(&table, false, None).await?;
            let updated = engine.update_search_index(&definition).await?;
            info!("{} rows updated", updated);
        }
        Command::Query {
            dataset,
            table,
            filters,
            ordering,
            search,
            lookup,
            limit,
            offset,
        } => {
            let table = engine.get_table(&dataset, &table).await?;
            let filters = filters
                .iter()
                .map(|raw| split_pair(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut query = compose(
                engine.get_model(&table, true, None).await?,
                filters,
                search.as_deref().unwrap_or(""),
                ordering.as_slice(),
            );
            if let Some(lookup) = lookup {
                let (name, argument) = split_pair(&lookup)?;
                let extension = engine
                    .extension(&table)
                    .ok_or_else(|| anyhow!("{} has no extensions", table.label()))?;
                query = extension.lookup(query, &name, &argument)?;
            }

            let total = engine.count(&mut query).await?;
            for row in engine.fetch(&query, Some(limit), offset).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
            info!("{} rows match", total);
        }
    }

    Ok(())
}
