//! Configuration management for gfs

pub mod schema;

pub use schema::Config;

use crate::error::{GfsError, GfsResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the cache directory
pub const ENV_CACHE_DIR: &str = "GFS_CACHE_DIR";
/// Environment variable overriding the stale block age (seconds)
pub const ENV_CACHE_MAXAGE: &str = "GFS_CACHE_MAXAGE";
/// Environment variable overriding the maximum cache size (bytes)
pub const ENV_CACHE_MAXSIZE: &str = "GFS_CACHE_MAXSIZE";
/// Environment variable overriding the cleanup period (seconds)
pub const ENV_CACHE_CLEANUP_PERIOD: &str = "GFS_CACHE_CLEANUP_PERIOD";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gfs")
            .join("config.toml")
    }

    /// Load configuration, using defaults if the file does not exist,
    /// then apply environment overrides
    pub fn load(&self) -> GfsResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path)?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        apply_env(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&self, path: &Path) -> GfsResult<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| GfsError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| GfsError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub fn save(&self, config: &Config) -> GfsResult<()> {
        self.ensure_config_dir()?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).map_err(|e| {
            GfsError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    fn ensure_config_dir(&self) -> GfsResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| GfsError::ConfigDirCreate {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `GFS_CACHE_*` overrides on top of file configuration.
///
/// Unparsable numbers are ignored with a warning so a typo in the
/// environment never prevents reading files.
pub fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = var(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
        config.cache.dir = Some(PathBuf::from(dir));
    }
    if let Some(v) = parse_env_u64(&var, ENV_CACHE_MAXAGE) {
        config.cache.max_age_secs = v;
    }
    if let Some(v) = parse_env_u64(&var, ENV_CACHE_MAXSIZE) {
        config.cache.max_size_bytes = v;
    }
    if let Some(v) = parse_env_u64(&var, ENV_CACHE_CLEANUP_PERIOD) {
        config.cache.cleanup_period_secs = v;
    }
}

fn parse_env_u64(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = var(key)?;
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v as u64),
        _ => {
            warn!("Ignoring {}={:?}: not a non-negative number", key, raw);
            None
        }
    }
}
