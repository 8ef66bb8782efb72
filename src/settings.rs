use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use url::Url;

use crate::error::EngineError;
use crate::synth::validate_identifier;

pub const DEFAULT_CONFIG_FILE: &str = "datatable-engine";
pub const ENV_PREFIX: &str = "DATATABLE";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub database_url: String,
    /// Text search configuration used for search vectors and queries.
    pub search_config: String,
    /// Maximum number of table definitions kept by the registry.
    pub registry_capacity: usize,
    pub data_table_suffix_size: usize,
    pub import_batch_size: usize,
    pub run_migrations: bool,
}

impl EngineConfig {
    /// Defaults, then `DATABASE_URL`, then the config file (optional unless
    /// `path` is given), then `DATATABLE_*` variables.
    pub fn load(path: Option<&str>) -> Result<Self, EngineError> {
        let mut builder = Self::defaults()?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_default("database_url", url)?;
        }
        let builder = builder
            .add_source(File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE)).required(path.is_some()))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        Self::finish(builder)
    }

    pub fn from_toml(contents: &str) -> Result<Self, EngineError> {
        Self::finish(Self::defaults()?.add_source(File::from_str(contents, FileFormat::Toml)))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, EngineError> {
        Ok(Config::builder()
            .set_default("search_config", "portuguese")?
            .set_default("registry_capacity", 256)?
            .set_default("data_table_suffix_size", 8)?
            .set_default("import_batch_size", 1000)?
            .set_default("run_migrations", true)?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, EngineError> {
        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.database_url.trim().is_empty() {
            return Err(EngineError::ConfigError {
                message: "database_url is empty".to_string(),
            });
        }
        validate_identifier(&self.search_config).map_err(|_| EngineError::ConfigError {
            message: format!("Invalid search_config: {:?}", self.search_config),
        })?;
        if self.registry_capacity == 0 || self.import_batch_size == 0 {
            return Err(EngineError::ConfigError {
                message: "registry_capacity and import_batch_size must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn masked_database_url(&self) -> String {
        mask_database_url(&self.database_url)
    }
}

/// Hides the password of a connection URL for logging.
pub fn mask_database_url(database_url: &str) -> String {
    match Url::parse(database_url) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some("***")).is_err() {
                return "<unprintable database url>".to_string();
            }
            url.to_string()
        }
        Err(_) => "<unprintable database url>".to_string(),
    }
}
