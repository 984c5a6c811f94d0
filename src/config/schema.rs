use std::path::Path;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use crate::store::Direction;
use crate::sync::{SyncOptions, DEFAULT_BATCH_SIZE, DEFAULT_DOCUMENT_CONCURRENCY};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct DocflatConfig {
    pub source: Source,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub misc: Misc,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    #[serde(rename = "memory")]
    InMemory(InMemory),
}

impl Source {
    // Label of this connector instance in the sync metrics
    pub fn client_id(&self) -> String {
        match self {
            Source::InMemory(InMemory { id, .. }) => format!("memory:{id}"),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct InMemory {
    // JSON dump the store is seeded from
    pub path: String,
    #[serde(default = "default_source_id")]
    pub id: String,
}

fn default_source_id() -> String {
    "default".to_string()
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub include_nested_tables: bool,
    pub flatten_nested_tables: bool,
    pub batch_size: usize,
    pub order_by: Option<String>,
    pub order_direction: Direction,
    pub document_concurrency: usize,
    // Resources buffered between the sync tasks and the writer
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_nested_tables: false,
            flatten_nested_tables: false,
            batch_size: DEFAULT_BATCH_SIZE,
            order_by: None,
            order_direction: Direction::Asc,
            document_concurrency: DEFAULT_DOCUMENT_CONCURRENCY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            include_nested_tables: self.include_nested_tables,
            flatten_nested_tables: self.flatten_nested_tables,
            batch_size: self.batch_size,
            order_by: self.order_by.clone(),
            order_direction: self.order_direction,
            document_concurrency: self.document_concurrency,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Default, Clone)]
pub struct Misc {
    pub metrics: Option<Metrics>,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Metrics {
    pub host: String,
    pub port: u16,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

pub fn validate_config(config: DocflatConfig) -> Result<DocflatConfig, ConfigError> {
    if config.sync.flatten_nested_tables && !config.sync.include_nested_tables {
        return Err(ConfigError::Message(
            "Flattening nested tables requires including them, \
            set include_nested_tables = true as well"
                .to_string(),
        ));
    }

    if config.sync.channel_capacity == 0 {
        return Err(ConfigError::Message(
            "The channel capacity must be positive".to_string(),
        ));
    }

    config
        .sync
        .options()
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<DocflatConfig, ConfigError> {
    let path = path.to_str().ok_or_else(|| {
        ConfigError::Message(format!("Config path {path:?} is not valid UTF-8"))
    })?;
    let config = Config::builder().add_source(File::with_name(path));

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<DocflatConfig, ConfigError> {
    let config =
        Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
