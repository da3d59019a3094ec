/// Configuration file support for softcam
///
/// A `FrameBufferConfig` names the shared region (the registry key every
/// producer and consumer agree on) and carries the liveness timings.
/// Loadable from TOML or YAML with auto-detection of the file format.
use crate::error::{SoftcamError, SoftcamResult};
use crate::memory::platform::shm_base_dir;
use crate::memory::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known region name shared by the camera and its consumers
pub const DEFAULT_REGION_NAME: &str = "softcam";

/// Producer silence after which consumers declare the region inactive
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(1000);

/// How often a live producer refreshes its heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Longest a waiter sleeps before re-checking counter, flag and watchdog
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBufferConfig {
    /// Region name
    pub name: String,

    /// Directory holding the shared memory files (platform default if unset)
    pub base_dir: Option<PathBuf>,

    pub watchdog_timeout_ms: u64,

    pub heartbeat_interval_ms: u64,

    pub recheck_interval_ms: u64,

    /// Allocation cap for one frame
    pub max_frame_bytes: u64,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_REGION_NAME.to_string(),
            base_dir: None,
            watchdog_timeout_ms: DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            recheck_interval_ms: DEFAULT_RECHECK_INTERVAL.as_millis() as u64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FrameBufferConfig {
    /// Default timings with a custom region name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn shm_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(shm_base_dir)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn validate(&self) -> SoftcamResult<()> {
        if self.name.is_empty() {
            return Err(SoftcamError::config("region name must not be empty"));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(SoftcamError::config("watchdog_timeout_ms must be positive"));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.watchdog_timeout_ms
        {
            return Err(SoftcamError::config(format!(
                "heartbeat_interval_ms ({}) must be positive and shorter than watchdog_timeout_ms ({})",
                self.heartbeat_interval_ms, self.watchdog_timeout_ms
            )));
        }
        if self.recheck_interval_ms == 0 {
            return Err(SoftcamError::config("recheck_interval_ms must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(SoftcamError::config("max_frame_bytes must be positive"));
        }
        Ok(())
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> SoftcamResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SoftcamError::config(format!("Failed to read config file: {}", e)))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&contents)?,
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> SoftcamResult<Self> {
        toml::from_str(contents)
            .map_err(|e| SoftcamError::config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn from_yaml(contents: &str) -> SoftcamResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| SoftcamError::config(format!("Failed to parse YAML: {}", e)))
    }

    /// Load the first config file found on the standard search paths, or
    /// defaults when none exists
    ///
    /// Search order:
    /// 1. ./softcam.toml or ./softcam.yaml
    /// 2. ~/.softcam/config.toml or ~/.softcam/config.yaml
    /// 3. /etc/softcam/config.toml or /etc/softcam/config.yaml
    pub fn load_or_default() -> SoftcamResult<Self> {
        match Self::get_search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("softcam.toml"),
            PathBuf::from("softcam.yaml"),
            PathBuf::from("softcam.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let softcam_dir = home.join(".softcam");
            paths.push(softcam_dir.join("config.toml"));
            paths.push(softcam_dir.join("config.yaml"));
            paths.push(softcam_dir.join("config.yml"));
        }

        paths.push(PathBuf::from("/etc/softcam/config.toml"));
        paths.push(PathBuf::from("/etc/softcam/config.yaml"));

        paths
    }
}
