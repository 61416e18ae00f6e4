//! Device test environment.
//!
//! Keeps a staging directory on the host and mirrors it into an on-device
//! test directory reached through `adb`. Files are written on the host side
//! and pushed; commands run through `adb shell`.

use super::{
    create_scratch_dir, dalvik_cache_root, dex_arch_cache_paths, run_and_log, CommandOutput,
    ProbeCommand, RunLog, TestEnvironment,
};
use crate::config::Config;
use crate::error::BisectionError;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::from(s)).into_owned()
}

/// Maps a path under `host_root` to the mirrored path under `device_root`.
pub fn to_device_path(host_root: &Path, device_root: &str, host_path: &Path) -> Option<String> {
    let relative = host_path.strip_prefix(host_root).ok()?;
    if relative.as_os_str().is_empty() {
        return Some(device_root.to_string());
    }
    Some(format!("{}/{}", device_root, relative.to_string_lossy()))
}

/// Inverse of [`to_device_path`].
pub fn to_host_path(host_root: &Path, device_root: &str, device_path: &str) -> Option<PathBuf> {
    let rest = device_path.strip_prefix(device_root)?;
    if rest.is_empty() {
        return Some(host_root.to_path_buf());
    }
    let rest = rest.strip_prefix('/')?;
    Some(host_root.join(rest))
}

/// Shell script run on the device for one probe.
///
/// Compiler diagnostics only reach logcat on the device, so the log is
/// cleared before the run and the compiler's tag is dumped to stderr after.
pub fn remote_invocation(device_env_path: &str, cmd: &ProbeCommand) -> String {
    format!(
        "logcat -c && ANDROID_DATA={} {} && logcat -d 'dex2oat:*' '*:S' 1>&2",
        quote(device_env_path),
        cmd.to_shell_string()
    )
}

pub struct DeviceTestEnv {
    adb: String,
    host_env_path: PathBuf,
    device_env_path: String,
    classpath: String,
    cache_paths: Vec<String>,
    staged_files: Vec<String>,
    bookkeeping_timeout: Duration,
    log: RunLog,
}

impl DeviceTestEnv {
    /// Creates the device directory tree and pushes `classpath` into it.
    ///
    /// An unreachable device surfaces here, before any probe runs.
    pub fn new(classpath: &str, config: &Config) -> Result<Self> {
        let (host_env_path, log) = create_scratch_dir(config)?;
        let dir_name = host_env_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let device_env_path = format!("{}/{}", config.device_tmp_dir.trim_end_matches('/'), dir_name);
        let classpath_name = Path::new(classpath)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                BisectionError::Environment(format!("classpath '{}' has no file name", classpath))
            })?;
        let device_classpath = format!("{}/{}", device_env_path, classpath_name);
        let cache_paths = dex_arch_cache_paths(&device_env_path, &config.dalvik_cache_archs);

        let mut env = Self {
            adb: config.adb.clone(),
            host_env_path,
            device_env_path,
            classpath: device_classpath,
            cache_paths,
            staged_files: Vec::new(),
            bookkeeping_timeout: config.timeout(),
            log,
        };

        // push doesn't create empty directories, so make them explicitly
        let mut mkdir = vec!["shell".to_string(), "mkdir".to_string(), "-p".to_string()];
        mkdir.extend(env.cache_paths.iter().map(|p| quote(p)));
        env.adb(&mkdir)?;
        let device_dir = env.device_env_path.clone();
        env.adb_push(classpath, &device_dir)?;

        info!(
            host_scratch = %env.host_env_path.display(),
            device_dir = %env.device_env_path,
            "device test environment ready"
        );
        Ok(env)
    }

    pub fn device_path(&self) -> &str {
        &self.device_env_path
    }

    pub fn host_path(&self) -> &Path {
        &self.host_env_path
    }

    fn adb(&mut self, args: &[String]) -> Result<CommandOutput> {
        let mut command = Command::new(&self.adb);
        command.args(args);
        let label = ProbeCommand::new(self.adb.clone()).args(args.iter().cloned()).to_shell_string();
        let output = run_and_log(&mut command, label.clone(), self.bookkeeping_timeout, &mut self.log)?;
        if !output.status.is_success() {
            return Err(BisectionError::Environment(format!(
                "'{}' failed with return code {}",
                label, output.status
            ))
            .into());
        }
        Ok(output)
    }

    fn adb_push(&mut self, what: &str, where_: &str) -> Result<()> {
        self.adb(&["push".to_string(), what.to_string(), where_.to_string()])?;
        Ok(())
    }

    fn empty_dex_cache(&mut self) -> Result<()> {
        for cache_path in self.cache_paths.clone() {
            let script = format!("rm -f {}/*", quote(&cache_path));
            self.adb(&["shell".to_string(), script])?;
        }
        Ok(())
    }
}

impl TestEnvironment for DeviceTestEnv {
    fn create_file(&mut self, name: Option<&str>) -> Result<String> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("tmp{}", Uuid::new_v4().simple()),
        };
        let host_path = self.host_env_path.join(&name);
        fs::File::create(&host_path)
            .with_context(|| format!("Failed to create '{}'", host_path.display()))?;
        let device_path = to_device_path(&self.host_env_path, &self.device_env_path, &host_path)
            .with_context(|| format!("'{}' escapes the test directory", name))?;
        self.adb_push(&host_path.to_string_lossy(), &device_path)?;
        self.staged_files.push(device_path.clone());
        Ok(device_path)
    }

    fn write_lines(&mut self, file_path: &str, lines: &[String]) -> Result<()> {
        let host_path = to_host_path(&self.host_env_path, &self.device_env_path, file_path)
            .with_context(|| format!("'{}' is not a device test path", file_path))?;
        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        fs::write(&host_path, content)
            .with_context(|| format!("Failed to write '{}'", host_path.display()))?;
        self.adb_push(&host_path.to_string_lossy(), file_path)
    }

    fn run_command(&mut self, cmd: &ProbeCommand, timeout: Duration) -> Result<CommandOutput> {
        self.empty_dex_cache()?;
        let wrapped = ProbeCommand::new(self.adb.clone())
            .arg("shell")
            .arg(remote_invocation(&self.device_env_path, cmd));
        let mut command = Command::new(&wrapped.program);
        command.args(&wrapped.args);
        run_and_log(&mut command, wrapped.to_shell_string(), timeout, &mut self.log)
    }

    fn classpath(&self) -> &str {
        &self.classpath
    }

    fn logfile(&self) -> &Path {
        self.log.path()
    }

    fn cleanup(&mut self) -> Result<()> {
        let mut targets = vec![quote(&dalvik_cache_root(&self.device_env_path))];
        targets.extend(self.staged_files.iter().map(|p| quote(p)));
        self.adb(&["shell".to_string(), format!("rm -rf {}", targets.join(" "))])?;

        for device_path in self.staged_files.drain(..) {
            if let Some(host_path) = to_host_path(&self.host_env_path, &self.device_env_path, &device_path) {
                let _ = fs::remove_file(host_path);
            }
        }
        self.cache_paths.clear();
        Ok(())
    }
}
