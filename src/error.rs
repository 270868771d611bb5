use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task '{0}' is already running")]
    AlreadyRunning(String),

    #[error("failed to launch task '{task_id}': {source}")]
    LaunchFailed {
        task_id: String,
        #[source]
        source: io::Error,
    },

    #[error("task '{0}' is not running")]
    NotTracked(String),

    #[error("cannot start '{task_id}', {limit} tasks are already running")]
    TooManyTasks { task_id: String, limit: usize },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to access catalog file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed catalog file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid directory: {0}")]
    InvalidDirectory(PathBuf),

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("no task matches '{0}'")]
    UnknownTask(String),

    #[error("'{0}' matches more than one task")]
    AmbiguousTask(String),

    #[error("group '{0}' already exists")]
    DuplicateGroup(String),

    #[error("group '{0}' does not exist")]
    UnknownGroup(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}
