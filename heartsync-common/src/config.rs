//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is a TOML file per service. Nothing in it can be
//! changed while the service runs.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable that overrides the root folder
pub const ROOT_FOLDER_ENV: &str = "HEARTSYNC_ROOT_FOLDER";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable (`HEARTSYNC_ROOT_FOLDER`)
/// 3. `root_folder` key of the service's TOML file
/// 4. OS-dependent compiled default
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl RootFolderResolver {
    /// Create a resolver for the named service (e.g. "heartsync-bf")
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            config_path: None,
        }
    }

    /// Use a command-line supplied root folder
    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    /// Read `root_folder` from this file instead of the default location
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Resolve the root folder; never fails, falls back to the compiled default
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            debug!(root_folder = %path.display(), "Root folder from command line");
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.is_empty() {
                debug!(root_folder = %path, "Root folder from environment");
                return PathBuf::from(path);
            }
        }

        let config_path = self
            .config_path
            .clone()
            .or_else(|| default_config_path(&self.module_name));
        if let Some(config_path) = config_path {
            if let Ok(content) = std::fs::read_to_string(&config_path) {
                if let Ok(value) = toml::from_str::<toml::Value>(&content) {
                    if let Some(root) = value.get("root_folder").and_then(|v| v.as_str()) {
                        debug!(root_folder = %root, config = %config_path.display(), "Root folder from TOML");
                        return PathBuf::from(root);
                    }
                }
            }
        }

        default_root_folder()
    }
}

/// Default TOML location for a service
///
/// Linux prefers `~/.config/heartsync/<module>.toml` and falls back to
/// `/etc/heartsync/<module>.toml` when only the system-wide file exists.
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    let file_name = format!("{}.toml", module_name);
    let user_config = dirs::config_dir().map(|d| d.join("heartsync").join(&file_name));

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/heartsync").join(&file_name);
        if let Some(path) = &user_config {
            if path.exists() {
                return user_config;
            }
        }
        if system_config.exists() {
            return Some(system_config);
        }
    }

    user_config
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("heartsync"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\heartsync"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("heartsync"))
            .unwrap_or_else(|| PathBuf::from("./heartsync_data"))
    }
}

/// Load and parse a TOML file
pub fn load_toml_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

/// Load a TOML file, falling back to defaults when it is missing
///
/// A missing file only warns. A file that exists but does not parse is an
/// error: silently ignoring a typo in an experiment parameter is worse than
/// refusing to start.
pub fn load_toml_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) if path.exists() => load_toml_config(path),
        Some(path) => {
            warn!(config = %path.display(), "Config file not found, using built-in defaults");
            Ok(T::default())
        }
        None => {
            warn!("No config file location available, using built-in defaults");
            Ok(T::default())
        }
    }
}

/// Write a TOML file atomically (temp file + rename)
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize TOML: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
