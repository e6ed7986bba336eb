//! Pool and unit configuration

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PoolError, Result};

/// Upper bound for a single channel read (64 KiB)
pub const MAX_READ_CHUNK: usize = 64 * 1024;

/// Default prefix of a unit's display name
pub const DEFAULT_NAME_PREFIX: &str = "procpool-ProcessPools";

/// Prefix of environment overrides (`PROCPOOL_LOG_LEVEL`, ...)
pub const ENV_PREFIX: &str = "PROCPOOL";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Settings shared by every unit of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum log level (`trace` .. `error`)
    pub log_level: String,
    /// Prefix of unit display names
    pub name_prefix: String,
    /// Bytes read per readiness event
    pub read_chunk_size: usize,
    /// Whether units install a read watcher unless told otherwise
    pub async_default: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            read_chunk_size: MAX_READ_CHUNK,
            async_default: true,
        }
    }
}

impl PoolConfig {
    /// Load from an optional TOML file, then apply `PROCPOOL_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: PoolConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(PoolError::Config(format!(
                "Unknown log level '{}'",
                self.log_level
            )));
        }

        if self.name_prefix.is_empty() {
            return Err(PoolError::Config(
                "Name prefix must not be empty".to_string(),
            ));
        }

        validate_chunk_size(self.read_chunk_size).map_err(PoolError::Config)
    }
}

fn validate_chunk_size(size: usize) -> std::result::Result<(), String> {
    if size == 0 || size > MAX_READ_CHUNK {
        return Err(format!(
            "Read chunk size must be within 1..={MAX_READ_CHUNK}, got {size}"
        ));
    }
    Ok(())
}

/// Configuration for a single unit
#[derive(Debug, Clone)]
pub struct UnitConfig {
    /// Logical name, unique per unit
    pub identity: String,
    /// Install a read watcher on the channel
    pub async_enabled: bool,
    /// Opaque startup arguments
    pub args: Vec<Value>,
    /// Prefix of the display name
    pub name_prefix: String,
    /// Bytes read per readiness event
    pub read_chunk_size: usize,
}

impl UnitConfig {
    /// Create a unit configuration with default settings
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            async_enabled: true,
            args: vec![],
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            read_chunk_size: MAX_READ_CHUNK,
        }
    }

    /// Apply pool-wide defaults
    pub fn with_pool_config(mut self, pool: &PoolConfig) -> Self {
        self.async_enabled = pool.async_default;
        self.name_prefix = pool.name_prefix.clone();
        self.read_chunk_size = pool.read_chunk_size;
        self
    }

    /// Enable/disable the read watcher
    pub fn async_enabled(mut self, enabled: bool) -> Self {
        self.async_enabled = enabled;
        self
    }

    /// Set startup arguments
    pub fn args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append one startup argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set the display name prefix
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the read chunk size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(PoolError::InvalidArgument(
                "unit identity can not be empty".to_string(),
            ));
        }
        validate_chunk_size(self.read_chunk_size).map_err(PoolError::InvalidArgument)
    }
}
