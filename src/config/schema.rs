//! Configuration schema for gfs
//!
//! Configuration is stored at `~/.config/gfs/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Block cache settings
    pub cache: CacheConfig,

    /// Pooled connection settings
    pub connections: ConnectionsConfig,

    /// Local filesystem settings
    pub file: FileConfig,

    /// HTTP(S) settings
    pub http: HttpConfig,

    /// FTP settings
    pub ftp: FtpConfig,

    /// S3 settings
    pub s3: S3Config,

    /// Google Cloud Storage settings
    pub gcs: GcsConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Block cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root (default: ~/.cache/gfs)
    pub dir: Option<PathBuf>,

    /// Size of a cached block in bytes
    pub block_size: u64,

    /// Age in seconds after which stale blocks are purged
    pub max_age_secs: u64,

    /// Total cache size in bytes before whole entries are evicted
    pub max_size_bytes: u64,

    /// Minimum seconds between two full cache scans
    pub cleanup_period_secs: u64,

    /// Run the throttled cleanup when entries are opened
    pub auto_cleanup: bool,

    /// Give up waiting for a cache lock after N seconds (unset = wait forever)
    pub lock_timeout_secs: Option<u64>,

    /// Mean delay between lock attempts in milliseconds
    pub lock_retry_ms: u64,

    /// Mean delay between holder liveness checks in milliseconds
    pub lock_check_ms: u64,
}

impl CacheConfig {
    /// Default block size (1 MiB)
    pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;
    /// Default stale block age (5 minutes)
    pub const DEFAULT_MAX_AGE_SECS: u64 = 300;
    /// Default total cache size (16 GiB)
    pub const DEFAULT_MAX_SIZE_BYTES: u64 = 16 * 1024 * 1024 * 1024;
    /// Default cleanup period (8 hours)
    pub const DEFAULT_CLEANUP_PERIOD_SECS: u64 = 8 * 60 * 60;

    /// Resolved cache directory, `~/.cache/gfs` on every platform
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cache")
                .join("gfs")
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_age_secs: Self::DEFAULT_MAX_AGE_SECS,
            max_size_bytes: Self::DEFAULT_MAX_SIZE_BYTES,
            cleanup_period_secs: Self::DEFAULT_CLEANUP_PERIOD_SECS,
            auto_cleanup: true,
            lock_timeout_secs: None,
            lock_retry_ms: 500,
            lock_check_ms: 2500,
        }
    }
}

/// Pooled connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Drop idle clients and sessions after N seconds
    pub max_age_secs: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self { max_age_secs: 60 }
    }
}

/// Local filesystem settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Route local reads through the block cache (useful for slow network mounts)
    pub use_cache: bool,
}

/// HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: format!("gfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// FTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    /// User when the URL carries none
    pub user: String,

    /// Password when the URL carries none
    pub password: String,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            user: "anonymous".to_string(),
            password: "anonymous@".to_string(),
        }
    }
}

/// S3 settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// AWS region
    pub region: Option<String>,

    /// Custom endpoint (MinIO, RustFS, ...)
    pub endpoint: Option<String>,

    /// AWS profile to use
    pub profile: Option<String>,

    /// Use path-style addressing
    pub force_path_style: bool,
}

/// GCS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Static OAuth access token
    pub token: Option<String>,

    /// Service account to impersonate when asking gcloud for a token
    pub service_account: Option<String>,

    /// API endpoint
    pub endpoint: String,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            token: None,
            service_account: None,
            endpoint: "https://storage.googleapis.com".to_string(),
        }
    }
}
