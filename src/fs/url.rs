//! URL splitting shared by every backend

use crate::error::{GfsError, GfsResult};
use std::path::PathBuf;

/// Protocol assumed for paths without a scheme
pub const DEFAULT_PROTOCOL: &str = "file";

/// Components of `<protocol>://<netloc>/<path>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// Lowercase scheme
    pub protocol: String,
    /// Host, bucket or `user@host:port`
    pub netloc: String,
    /// Path after the netloc, without the leading slash
    pub path: String,
}

impl UrlParts {
    /// Reassemble the URL
    pub fn to_url(&self) -> String {
        format!("{}://{}/{}", self.protocol, self.netloc, self.path)
    }

    /// Whether the path denotes a directory (empty or trailing slash)
    pub fn is_dir_like(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }
}

/// Scheme of `url`, or `None` for a bare local path
pub fn protocol_of(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then(|| scheme.to_ascii_lowercase())
}

/// Scheme of `url`, defaulting to `file`
pub fn protocol_or_default(url: &str) -> String {
    protocol_of(url).unwrap_or_else(|| DEFAULT_PROTOCOL.to_string())
}

/// Split a URL that must carry a scheme
pub fn split_url(url: &str) -> GfsResult<UrlParts> {
    let protocol = protocol_of(url).ok_or_else(|| GfsError::InvalidUrl {
        url: url.to_string(),
        reason: "missing protocol".to_string(),
    })?;
    let rest = &url[protocol.len() + 3..];
    let (netloc, path) = rest.split_once('/').unwrap_or((rest, ""));
    Ok(UrlParts {
        protocol,
        netloc: netloc.to_string(),
        path: path.to_string(),
    })
}

/// Local filesystem path for a bare path or a `file://` URL
pub fn local_path(url: &str) -> PathBuf {
    match url.strip_prefix("file://") {
        Some(rest) => PathBuf::from(rest),
        None => PathBuf::from(url),
    }
}

/// Append `name` to a directory URL
pub fn join_url(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Last path component, ignoring a trailing slash
pub fn basename(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Ensure a trailing slash, as used for directory prefixes on object stores
pub fn as_dir(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Split `user:password@host:port` into its parts
pub fn split_netloc(netloc: &str) -> (Option<String>, Option<String>, String, Option<u16>) {
    let (auth, hostport) = match netloc.rsplit_once('@') {
        Some((auth, hostport)) => (Some(auth), hostport),
        None => (None, netloc),
    };
    let (user, password) = match auth {
        Some(auth) => match auth.split_once(':') {
            Some((u, p)) => (Some(decode(u)), Some(decode(p))),
            None => (Some(decode(auth)), None),
        },
        None => (None, None),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host.to_string(), port.parse().ok())
        }
        _ => (hostport.to_string(), None),
    };
    (user, password, host, port)
}

fn decode(part: &str) -> String {
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| part.to_string())
}
