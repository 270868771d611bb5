use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-defined command bound to a working directory.
///
/// Field names on disk follow the `commands.json` layout (`path`, `cmd`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(rename = "path")]
    pub working_dir: PathBuf,
    #[serde(rename = "cmd")]
    pub command: String,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, working_dir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            working_dir: working_dir.into(),
            command: command.into(),
        }
    }

    /// Creates a task with a fresh random id. An empty title falls back to the command.
    pub fn create(working_dir: &Path, command: &str, title: Option<&str>) -> Self {
        let title = match title {
            Some(title) if !title.trim().is_empty() => title.trim().to_string(),
            _ => command.to_string(),
        };
        Self::new(Uuid::new_v4().to_string(), title, working_dir, command)
    }
}

/// Lifecycle of a running-task record inside the supervisor.
///
/// `NotRunning` is the absence of a record; `Exited` and `Terminated` are
/// never stored, the record is purged as part of those transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}
