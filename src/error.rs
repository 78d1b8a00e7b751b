//! Error taxonomy for the mirror engine.
//!
//! Fatal conditions surface to the caller as [`MirrorError`]. The engine
//! recovers from [`MirrorError::RemoteMetadataUnavailable`] and publish
//! failures locally and only reports them through `tracing` warnings.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while mirroring remote content.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Resource not found at {path:?}")]
    ResourceNotFound { path: String },

    #[error("Large object {path:?} not found in its parent tree listing")]
    LargeObjectUnresolved { path: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Invalid logical path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("{source_kind} source does not support {operation}")]
    NotSupported {
        source_kind: &'static str,
        operation: &'static str,
    },

    #[error("Remote metadata unavailable for {path:?}")]
    RemoteMetadataUnavailable { path: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("Verification failed for {path}: expected {expected}, got {actual}")]
    VerificationFailed {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error at {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to publish metadata for {path:?}: {reason}")]
    Publish { path: String, reason: String },
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

impl MirrorError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::ResourceNotFound { path: path.into() }
    }

    pub fn decode(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the remote entry does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}

/// Attach a path to an [`std::io::Error`].
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| MirrorError::LocalIo {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        MirrorError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            MirrorError::not_found("a/b.txt").to_string(),
            "Resource not found at \"a/b.txt\""
        );
        assert_eq!(
            MirrorError::Http {
                status: 500,
                url: "https://example.org/x".into()
            }
            .to_string(),
            "HTTP 500 from https://example.org/x"
        );
        let err = MirrorError::NotSupported {
            source_kind: "http",
            operation: "directory listing",
        };
        assert_eq!(
            err.to_string(),
            "http source does not support directory listing"
        );
    }

    #[test]
    fn test_io_context() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.at(Path::new("/cache/x")).unwrap_err();
        assert!(err.to_string().contains("/cache/x"));
        assert!(!err.is_not_found());
    }
}
