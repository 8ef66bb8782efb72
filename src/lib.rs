pub mod catalog;
pub mod cutover;
pub mod database;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod import;
pub mod lifecycle;
pub mod models;
pub mod query;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod synth;
pub mod value;

#[cfg(test)]
mod test_support;

pub use catalog::{DataTable, Field, FieldType, Table};
pub use engine::TableEngine;
pub use error::EngineError;
pub use query::TableQuery;
pub use settings::EngineConfig;
pub use synth::TableDefinition;
