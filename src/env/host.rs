//! Host test environment.
//!
//! Maintains a test directory under the configured host temp dir and runs
//! commands on the host in a modified process environment that mimics what
//! the `art` launcher script sets up.

use super::{
    create_scratch_dir, dalvik_cache_root, dex_arch_cache_paths, run_and_log, CommandOutput,
    ProbeCommand, RunLog, TestEnvironment,
};
use crate::config::Config;
use crate::error::BisectionError;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const HOST_OUT_SUBDIR: &str = "out/host/linux-x86";

/// Host output directory for the build tree rooted at `build_top`.
pub fn android_root(build_top: &Path) -> PathBuf {
    build_top.join(HOST_OUT_SUBDIR)
}

fn require_build_top(build_top: Option<PathBuf>) -> Result<PathBuf, BisectionError> {
    build_top.ok_or_else(|| {
        BisectionError::Environment("Cannot find ANDROID_BUILD_TOP environmental variable.".to_string())
    })
}

pub struct HostTestEnv {
    classpath: String,
    android_root: PathBuf,
    env_path: PathBuf,
    cache_paths: Vec<PathBuf>,
    shell_env: Vec<(String, OsString)>,
    created_files: Vec<PathBuf>,
    log: RunLog,
}

impl HostTestEnv {
    /// Sets up the scratch directory and caches.
    ///
    /// Fails before any probe runs when no build top is configured or the
    /// scratch directory cannot be created.
    pub fn new(classpath: &str, x64: bool, config: &Config) -> Result<Self> {
        let build_top = require_build_top(config.android_build_top())?;
        Self::with_build_top(classpath, x64, &build_top, config)
    }

    /// Like [`HostTestEnv::new`], against an explicit build tree.
    pub fn with_build_top(classpath: &str, x64: bool, build_top: &Path, config: &Config) -> Result<Self> {
        let (env_path, log) = create_scratch_dir(config)?;
        let data_path = env_path.to_string_lossy().to_string();

        let cache_paths: Vec<PathBuf> = dex_arch_cache_paths(&data_path, &config.dalvik_cache_archs)
            .into_iter()
            .map(PathBuf::from)
            .collect();
        for cache_path in &cache_paths {
            fs::create_dir_all(cache_path).map_err(|e| {
                BisectionError::Environment(format!(
                    "cannot create cache directory '{}': {}",
                    cache_path.display(),
                    e
                ))
            })?;
        }

        let root = android_root(build_top);
        let lib = if x64 { "lib64" } else { "lib" };
        let mut path = OsString::from(root.join("bin"));
        if let Some(inherited) = std::env::var_os("PATH") {
            path.push(":");
            path.push(inherited);
        }
        let shell_env = vec![
            ("ANDROID_DATA".to_string(), OsString::from(&env_path)),
            ("ANDROID_ROOT".to_string(), OsString::from(&root)),
            ("LD_LIBRARY_PATH".to_string(), OsString::from(root.join(lib))),
            ("PATH".to_string(), path),
            // Using dlopen requires load bias on the host.
            ("LD_USE_LOAD_BIAS".to_string(), OsString::from("1")),
        ];

        info!(scratch = %env_path.display(), "host test environment ready");
        Ok(Self {
            classpath: classpath.to_string(),
            android_root: root,
            env_path,
            cache_paths,
            shell_env,
            created_files: Vec::new(),
            log,
        })
    }

    /// Host output directory of the build tree under test.
    pub fn android_root(&self) -> &Path {
        &self.android_root
    }

    /// Scratch directory backing this environment.
    pub fn base_path(&self) -> &Path {
        &self.env_path
    }

    fn empty_dex_cache(&self) -> Result<()> {
        for cache_path in &self.cache_paths {
            let entries = fs::read_dir(cache_path)
                .with_context(|| format!("Failed to list cache '{}'", cache_path.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove '{}'", path.display()))?;
                }
            }
        }
        Ok(())
    }
}

impl TestEnvironment for HostTestEnv {
    fn create_file(&mut self, name: Option<&str>) -> Result<String> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("tmp{}", Uuid::new_v4().simple()),
        };
        let path = self.env_path.join(name);
        fs::File::create(&path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;
        self.created_files.push(path.clone());
        Ok(path.to_string_lossy().to_string())
    }

    fn write_lines(&mut self, file_path: &str, lines: &[String]) -> Result<()> {
        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        fs::write(file_path, content).with_context(|| format!("Failed to write '{}'", file_path))
    }

    fn run_command(&mut self, cmd: &ProbeCommand, timeout: Duration) -> Result<CommandOutput> {
        self.empty_dex_cache()?;
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).current_dir(&self.env_path);
        for (key, value) in &self.shell_env {
            command.env(key, value);
        }
        run_and_log(&mut command, cmd.to_shell_string(), timeout, &mut self.log)
    }

    fn classpath(&self) -> &str {
        &self.classpath
    }

    fn logfile(&self) -> &Path {
        self.log.path()
    }

    fn cleanup(&mut self) -> Result<()> {
        let cache_root = dalvik_cache_root(&self.env_path.to_string_lossy());
        if Path::new(&cache_root).exists() {
            fs::remove_dir_all(&cache_root)
                .with_context(|| format!("Failed to remove '{}'", cache_root))?;
        }
        for file in self.created_files.drain(..) {
            let _ = fs::remove_file(file);
        }
        self.cache_paths.clear();
        Ok(())
    }
}
