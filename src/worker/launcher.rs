use std::path::{Path, PathBuf};
use std::process::Command;

/// Everything needed to hand a task's command to the host interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Builds the launch spec for `command` run from `working_dir`.
///
/// The directory is applied by the launcher itself rather than by a
/// `cd` inside the command, so exactly one interpreter sits between the
/// engine and the user's command.
pub fn build(working_dir: &Path, command: &str) -> LaunchSpec {
    let (program, flag) = interpreter();
    LaunchSpec {
        program: program.to_string(),
        args: vec![flag.to_string(), command.to_string()],
        working_dir: working_dir.to_path_buf(),
    }
}

#[cfg(unix)]
fn interpreter() -> (&'static str, &'static str) {
    ("sh", "-c")
}

#[cfg(windows)]
fn interpreter() -> (&'static str, &'static str) {
    ("cmd", "/C")
}

impl LaunchSpec {
    /// A `Command` with program, arguments and working directory applied.
    /// Stream wiring is left to the caller.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.working_dir);
        command
    }
}
