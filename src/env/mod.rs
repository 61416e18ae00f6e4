//! Test environment abstraction.
//!
//! An environment owns one scratch directory and one log file for the whole
//! bisection run. Every command it runs starts from empty compiled-artifact
//! caches, so no probe can pick up output compiled under another probe's
//! filters.

pub mod device;
pub mod host;

pub use device::DeviceTestEnv;
pub use host::HostTestEnv;

use crate::config::Config;
use crate::error::BisectionError;
use crate::util::run_command_with_timeout;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const SCRATCH_DIR_PREFIX: &str = "bisection_search_";
const LOG_FILE_NAME: &str = "log";
const DALVIK_CACHE_DIR: &str = "dalvik-cache";

/// Unified interface over host and device test environments.
pub trait TestEnvironment {
    /// Creates a file in the test directory and returns a path usable in
    /// commands run by this environment. Unnamed files get an arbitrary name.
    fn create_file(&mut self, name: Option<&str>) -> Result<String>;

    /// Overwrites `file_path` with `lines`, one per line.
    fn write_lines(&mut self, file_path: &str, lines: &[String]) -> Result<()>;

    /// Empties the artifact caches, then runs `cmd` in the environment.
    ///
    /// A non-zero exit or a timeout is reported through
    /// [`CommandOutput::status`]; `Err` means the command could not be run
    /// at all.
    fn run_command(&mut self, cmd: &ProbeCommand, timeout: Duration) -> Result<CommandOutput>;

    /// Environment specific classpath with the test class.
    fn classpath(&self) -> &str;

    /// Path of the log file residing on the host.
    fn logfile(&self) -> &Path;

    /// Removes caches and staged files, keeping the log.
    fn cleanup(&mut self) -> Result<()>;
}

/// A program invocation kept as argv rather than a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProbeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Renders the command for a POSIX shell, quoting where needed.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_escape::unix::escape(Cow::from(part.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Exited(i32),
    /// Ended by a signal we did not send.
    Terminated,
    TimedOut,
}

impl CommandStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Exited(0))
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Exited(code) => write!(f, "{}", code),
            CommandStatus::Terminated => f.write_str("TERMINATED"),
            CommandStatus::TimedOut => f.write_str("TIMEOUT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
}

/// One attempted command as written to the run log.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
    pub elapsed: Duration,
}

/// Append-only log of every command an environment runs.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, record: &ExecutionRecord) -> Result<()> {
        write!(
            self.file,
            "Command:\n{}\nReturn code: {}\nDuration: {}ms\nSTDERR:\n{}\nSTDOUT:\n{}\n",
            record.command,
            record.status,
            record.elapsed.as_millis(),
            record.stderr,
            record.stdout
        )
        .and_then(|()| self.file.flush())
        .with_context(|| format!("Failed to write log file '{}'", self.path.display()))
    }
}

/// Creates `<host_tmp_dir>/bisection_search_<id>` with its log file.
pub(crate) fn create_scratch_dir(config: &Config) -> Result<(PathBuf, RunLog)> {
    let dir = config
        .host_tmp_dir
        .join(format!("{}{}", SCRATCH_DIR_PREFIX, Uuid::new_v4().simple()));
    fs::create_dir_all(&dir).map_err(|e| {
        BisectionError::Environment(format!(
            "cannot create scratch directory '{}': {}",
            dir.display(),
            e
        ))
    })?;
    let log = RunLog::create(&dir.join(LOG_FILE_NAME))?;
    Ok((dir, log))
}

/// Architecture specific cache directories under `data_path`.
pub(crate) fn dex_arch_cache_paths(data_path: &str, archs: &[String]) -> Vec<String> {
    archs
        .iter()
        .map(|arch| format!("{}/{}/{}", data_path, DALVIK_CACHE_DIR, arch))
        .collect()
}

pub(crate) fn dalvik_cache_root(data_path: &str) -> String {
    format!("{}/{}", data_path, DALVIK_CACHE_DIR)
}

/// Runs `command`, appends the attempt to `log`, and maps the exit state.
pub(crate) fn run_and_log(
    command: &mut Command,
    label: String,
    timeout: Duration,
    log: &mut RunLog,
) -> Result<CommandOutput> {
    let result = run_command_with_timeout(command, timeout)?;
    let status = if result.timed_out {
        CommandStatus::TimedOut
    } else {
        match result.status.and_then(|s| s.code()) {
            Some(code) => CommandStatus::Exited(code),
            None => CommandStatus::Terminated,
        }
    };

    if status == CommandStatus::TimedOut {
        warn!(timeout_secs = timeout.as_secs(), command = %label, "command timed out");
    } else {
        debug!(%status, elapsed_ms = result.elapsed.as_millis() as u64, "command finished");
    }

    log.record(&ExecutionRecord {
        command: label,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        status,
        elapsed: result.elapsed,
    })?;

    Ok(CommandOutput {
        stdout: result.stdout,
        stderr: result.stderr,
        status,
    })
}
