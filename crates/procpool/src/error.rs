//! Error types for process pool units

use std::io;
use thiserror::Error;

use crate::registry::RegistryError;

/// Process pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to allocate the OS resources backing a unit
    #[error("Failed to allocate process resources: {0}")]
    ConstructionFailure(#[source] io::Error),

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No worker id was given and none is bound to the unit
    #[error("Unit '{identity}' is not bound to a worker")]
    NotBound { identity: String },

    /// The entry callback has already been consumed
    #[error("Process has already been started")]
    AlreadyStarted,

    /// Failed to fork the unit's process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Failed to collect a unit's exit status
    #[error("Failed to wait for process: {0}")]
    WaitFailed(#[source] io::Error),

    /// Registry access failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Failed to install the termination signal handler
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    /// Channel I/O failed
    #[error("Channel error: {0}")]
    Channel(#[from] io::Error),

    /// The requested end of the channel is not held by this process
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(&'static str),

    /// The hosting server failed to deliver a message
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Result type for process pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
