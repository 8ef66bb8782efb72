use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset not found: {slug}")]
    DatasetNotFound { slug: String },

    #[error("Table not found: {name}")]
    TableNotFound { name: String },

    #[error("DataTable not found: {id}")]
    DataTableNotFound { id: i32 },

    #[error("Table {table} has no active DataTable")]
    NoActiveDataTable { table: String },

    #[error("Cannot delete active DataTable {db_table_name}: deactivate it first")]
    ActiveDataTableDeletion { db_table_name: String },

    #[error("Invalid field name: {name:?}")]
    InvalidFieldName { name: String },

    #[error("Unknown field type {field_type:?} for field {field}")]
    UnknownFieldType { field: String, field_type: String },

    #[error("Invalid table settings for {table}: {message}")]
    InvalidTableSettings { table: String, message: String },

    #[error("Field {field} is inconsistent with its table: {message}")]
    InconsistentField { field: String, message: String },

    #[error("Table {db_table_name} already exists")]
    TableAlreadyExists { db_table_name: String },

    #[error("Invalid value {value:?} for {field_type} column {field}")]
    InvalidValue {
        field: String,
        field_type: String,
        value: String,
    },

    #[error("Table {table} has no lookup named {lookup:?}")]
    UnknownLookup { table: String, lookup: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Database connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {message}")]
    Pool { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError {
            message: err.to_string(),
        }
    }
}

impl EngineError {
    /// Configuration errors are raised at synthesis time and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidFieldName { .. }
                | EngineError::UnknownFieldType { .. }
                | EngineError::InvalidTableSettings { .. }
                | EngineError::InconsistentField { .. }
                | EngineError::ConfigError { .. }
        )
    }

    pub(crate) fn pool<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Pool {
            message: format!("Failed to get database connection: {}", err),
        }
    }
}
