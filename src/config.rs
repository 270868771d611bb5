use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::worker::ansi::OutputFormat;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_BATCH_LINES: usize = 5;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Ceiling on concurrently tracked tasks; each one holds four relay threads.
pub const DEFAULT_MAX_TASKS: usize = 64;
pub const DEFAULT_CATALOG_FILE: &str = "commands.json";

/// How a task's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// stdout and stderr are piped and relayed as output events.
    #[default]
    Captured,
    /// Fire-and-forget: streams go to the null device, nothing is relayed.
    Detached,
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "captured" => Ok(LaunchMode::Captured),
            "detached" => Ok(LaunchMode::Detached),
            other => Err(format!("expected 'captured' or 'detached', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    /// Upper bound on waiting for relay workers to hit EOF after a process is gone.
    ///
    /// The wait runs on whichever thread purges the task. For the status
    /// poller that means every exited task whose pipe is still held open by
    /// an orphaned grandchild delays the current tick by up to this long.
    pub drain_timeout: Duration,
    pub batch_lines: usize,
    /// Longest a line may sit in a partial output batch.
    pub flush_interval: Duration,
    pub max_tasks: usize,
    pub launch_mode: LaunchMode,
    pub output_format: OutputFormat,
    pub stop_on_shutdown: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            batch_lines: DEFAULT_BATCH_LINES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_tasks: DEFAULT_MAX_TASKS,
            launch_mode: LaunchMode::default(),
            output_format: OutputFormat::default(),
            stop_on_shutdown: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: millis_var("TASKER_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            grace_period: millis_var("TASKER_GRACE_PERIOD_MS")?.unwrap_or(defaults.grace_period),
            drain_timeout: millis_var("TASKER_DRAIN_TIMEOUT_MS")?.unwrap_or(defaults.drain_timeout),
            batch_lines: positive_var("TASKER_BATCH_LINES")?.unwrap_or(defaults.batch_lines),
            flush_interval: millis_var("TASKER_FLUSH_INTERVAL_MS")?.unwrap_or(defaults.flush_interval),
            max_tasks: positive_var("TASKER_MAX_TASKS")?.unwrap_or(defaults.max_tasks),
            launch_mode: parsed_var("TASKER_LAUNCH_MODE")?.unwrap_or(defaults.launch_mode),
            output_format: parsed_var("TASKER_OUTPUT_FORMAT")?.unwrap_or(defaults.output_format),
            stop_on_shutdown: bool_var("TASKER_STOP_ON_SHUTDOWN")?.unwrap_or(defaults.stop_on_shutdown),
        })
    }
}

/// Settings for the whole application: the engine, where the task catalog
/// lives, and the directory new tasks run in unless told otherwise.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub catalog_path: PathBuf,
    pub default_dir: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::from_env()?,
            catalog_path: read_var("TASKER_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_FILE)),
            default_dir: dir_var("TASKER_DEFAULT_DIR")?.unwrap_or_else(default_dir),
        })
    }
}

/// The home directory, or the working directory when there is none.
pub fn default_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn read_var(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_var<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    read_var(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn millis_var(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed_var::<u64>(key)?.map(Duration::from_millis))
}

fn positive_var(key: &'static str) -> Result<Option<usize>, ConfigError> {
    match parsed_var::<usize>(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        }),
        other => Ok(other),
    }
}

fn dir_var(key: &'static str) -> Result<Option<PathBuf>, ConfigError> {
    match read_var(key).map(PathBuf::from) {
        Some(dir) if !dir.is_dir() => Err(ConfigError::InvalidValue {
            key,
            value: dir.display().to_string(),
            reason: "not an existing directory".to_string(),
        }),
        other => Ok(other),
    }
}

fn bool_var(key: &'static str) -> Result<Option<bool>, ConfigError> {
    read_var(key)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.batch_lines, 5);
        assert_eq!(config.launch_mode, LaunchMode::Captured);
        assert!(config.stop_on_shutdown);
    }

    #[test]
    fn launch_mode_parses_case_insensitively() {
        assert_eq!("Detached".parse::<LaunchMode>(), Ok(LaunchMode::Detached));
        assert_eq!(" captured ".parse::<LaunchMode>(), Ok(LaunchMode::Captured));
        assert!("window".parse::<LaunchMode>().is_err());
    }

    // Each test uses its own variable so parallel tests never race on the environment.
    #[test]
    fn rejects_zero_batch_size() {
        env::set_var("TASKER_TEST_ZERO_LINES", "0");
        let err = positive_var("TASKER_TEST_ZERO_LINES").unwrap_err();
        assert!(err.to_string().contains("at least 1"));
        env::remove_var("TASKER_TEST_ZERO_LINES");
    }

    #[test]
    fn reads_millisecond_durations() {
        env::set_var("TASKER_TEST_GRACE_MS", "250");
        assert_eq!(millis_var("TASKER_TEST_GRACE_MS").unwrap(), Some(Duration::from_millis(250)));
        env::set_var("TASKER_TEST_GRACE_MS", "soon");
        assert!(millis_var("TASKER_TEST_GRACE_MS").is_err());
        env::remove_var("TASKER_TEST_GRACE_MS");
        assert_eq!(millis_var("TASKER_TEST_GRACE_MS").unwrap(), None);
    }

    #[test]
    fn parses_boolean_spellings() {
        env::set_var("TASKER_TEST_FLAG", "off");
        assert_eq!(bool_var("TASKER_TEST_FLAG").unwrap(), Some(false));
        env::set_var("TASKER_TEST_FLAG", "maybe");
        assert!(bool_var("TASKER_TEST_FLAG").is_err());
        env::remove_var("TASKER_TEST_FLAG");
    }

    #[test]
    fn default_dir_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var("TASKER_TEST_DIR", dir.path());
        assert_eq!(dir_var("TASKER_TEST_DIR").unwrap(), Some(dir.path().to_path_buf()));
        env::set_var("TASKER_TEST_DIR", dir.path().join("missing"));
        assert!(dir_var("TASKER_TEST_DIR").unwrap_err().to_string().contains("not an existing directory"));
        env::remove_var("TASKER_TEST_DIR");
        assert_eq!(dir_var("TASKER_TEST_DIR").unwrap(), None);
    }

    #[test]
    fn fallback_dir_is_home() {
        let expected = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        assert_eq!(default_dir(), expected);
    }
}
