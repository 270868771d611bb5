//! Process lifecycle engine for user-defined shell tasks: spawn, stream
//! output, detect exit, and tear down whole process trees.

pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod worker;

pub use config::{AppConfig, EngineConfig, LaunchMode};
pub use error::{CatalogError, ConfigError, EngineError};
pub use manager::{
    catalog::Catalog,
    supervisor::{PollStatus, RunningInfo, Started, Stopped, Supervisor},
    task_manager::TaskManager,
};
pub use models::{
    message::{EngineEvent, EventSink},
    task::{StreamKind, Task, TaskState},
};
pub use worker::ansi::OutputFormat;
