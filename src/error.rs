//! Typed error taxonomy shared by the registry and the config store.
//!
//! The HTTP layer maps these onto status codes and never recovers them;
//! the CLI client maps them onto distinct process exit codes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the process registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No process definition exists under this name.
    #[error("no process named '{name}' is defined")]
    UnknownDefinition { name: String },

    /// The name already has a live runner.
    #[error("process '{name}' is already running")]
    AlreadyRunning { name: String },

    /// A start or stop for this name is still in flight.
    #[error("another operation is in flight for process '{name}'")]
    OperationInFlight { name: String },

    /// No live runner (and no retained output) under this name.
    #[error("process '{name}' is not running")]
    NotRunning { name: String },

    /// The OS failed to create the process.
    #[error("failed to spawn process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Errors returned by the config store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A definition failed validation before persisting.
    #[error("invalid process definition: {0}")]
    Invalid(String),

    /// No definition exists under this name.
    #[error("no server named '{name}' in configuration")]
    UnknownServer { name: String },

    /// The config file could not be read or parsed.
    #[error("failed to load config file {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The config file could not be written durably.
    #[error("failed to save config file {path}")]
    Save {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
