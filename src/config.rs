//! Configuration management for bisection-search
//!
//! Stores settings in ~/.config/bisection-search/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const BUILD_TOP_ENV: &str = "ANDROID_BUILD_TOP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the platform source tree; `ANDROID_BUILD_TOP` wins when set
    pub android_build_top: Option<PathBuf>,
    /// Parent directory for per-run scratch directories on the host
    pub host_tmp_dir: PathBuf,
    /// Parent directory for per-run scratch directories on the device
    pub device_tmp_dir: String,
    /// Program used to reach the device
    pub adb: String,
    /// Per-probe timeout
    pub timeout_secs: u64,
    /// Architectures with their own compiled-artifact cache
    pub dalvik_cache_archs: Vec<String>,
    /// Passes kept in every probe on top of the built-in mandatory set
    pub extra_mandatory_passes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            android_build_top: None,
            host_tmp_dir: PathBuf::from("/tmp"),
            device_tmp_dir: "/data/local/tmp".to_string(),
            adb: "adb".to_string(),
            timeout_secs: 60,
            dalvik_cache_archs: ["arm", "arm64", "x86", "x86_64"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_mandatory_passes: Vec::new(),
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bisection-search"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`. A missing file yields defaults; a corrupt
    /// one is set aside as `*.toml.corrupt` and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Self::default()
            }
        }
    }

    /// Build top from the environment, falling back to the config file.
    pub fn android_build_top(&self) -> Option<PathBuf> {
        std::env::var_os(BUILD_TOP_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.android_build_top.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/bisection-search/config.toml".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
