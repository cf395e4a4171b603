//! Error types for gfs
//!
//! All modules use `GfsResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gfs operations
pub type GfsResult<T> = Result<T, GfsError>;

/// All errors that can occur in gfs
#[derive(Error, Debug)]
pub enum GfsError {
    // Addressing errors
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No filesystem registered for protocol: {0}")]
    UnknownProtocol(String),

    #[error("{operation} is not supported by the {backend} filesystem")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    // Cache errors
    #[error("Offset {offset} is not aligned to block size {block_size}")]
    MisalignedOffset { offset: u64, block_size: u64 },

    #[error("Seek to {offset} is outside of [0, {size}]")]
    SeekOutOfRange { offset: i128, size: u64 },

    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Invalid cache metadata at {path}: {reason}")]
    MetaInvalid { path: PathBuf, reason: String },

    // Backend errors
    #[error("{backend} error: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("GCS not authenticated. Run: gcloud auth login")]
    GcsNotAuthenticated,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem registry is not initialized")]
    NotInitialized,

    #[error("Filesystem registry is already initialized")]
    AlreadyInitialized,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GfsError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a backend error from anything displayable
    pub fn backend(backend: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Map an IO error on `path`, turning `NotFound` into [`GfsError::NotFound`]
    pub fn from_io_at(path: impl AsRef<std::path::Path>, context: &str, e: std::io::Error) -> Self {
        let path = path.as_ref();
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.display().to_string()),
            _ => Self::io(format!("{} {}", context, path.display()), e),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if error means the target does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::HttpStatus { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::GcsNotAuthenticated => Some("Run: gcloud auth login, or set GCS_OAUTH_TOKEN"),
            Self::UnknownProtocol(_) => {
                Some("Supported protocols: file, http, https, ftp, s3, gs, gcs")
            }
            Self::LockTimeout { .. } => {
                Some("Another process holds the cache lock; retry or raise cache.lock_timeout_secs")
            }
            _ => None,
        }
    }
}

impl From<GfsError> for std::io::Error {
    fn from(e: GfsError) -> Self {
        match e {
            GfsError::Io { source, .. } => source,
            GfsError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, e),
            GfsError::SeekOutOfRange { .. } | GfsError::MisalignedOffset { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            }
            GfsError::Unsupported { .. } => std::io::Error::new(std::io::ErrorKind::Unsupported, e),
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GfsError::MisalignedOffset {
            offset: 10,
            block_size: 4,
        };
        assert!(err.to_string().contains("not aligned"));
    }

    #[test]
    fn error_hint() {
        let err = GfsError::GcsNotAuthenticated;
        assert!(err.hint().unwrap().contains("gcloud auth login"));
        assert!(GfsError::NotFound("x".into()).hint().is_none());
    }

    #[test]
    fn error_retryable() {
        let busy = GfsError::HttpStatus {
            url: "http://x".into(),
            status: 503,
        };
        let missing = GfsError::HttpStatus {
            url: "http://x".into(),
            status: 404,
        };
        assert!(busy.is_retryable());
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = GfsError::from_io_at("/tmp/nope", "reading", e);
        assert!(matches!(err, GfsError::NotFound(_)));
    }

    #[test]
    fn converts_into_io_error() {
        let err: std::io::Error = GfsError::SeekOutOfRange { offset: -1, size: 3 }.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
