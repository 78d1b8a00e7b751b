//! Sidecar records.
//!
//! A sidecar persists the [`Fingerprint`] of a cached file next to it:
//!
//! ```text
//! a/b.txt          content
//! a/.b.txt.hash    "<token>"              (SidecarFormat::Hash)
//! a/.b.txt.meta    "<unix-seconds>|<token>" (SidecarFormat::Meta)
//! ```
//!
//! Each backend uses exactly one format. The same naming is used for remote
//! sidecars published next to remote content.

pub mod generate;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, MirrorError, Result};
use crate::fingerprint::Fingerprint;
use crate::path::LogicalPath;

pub use generate::{GenerateOptions, GenerateReport, generate_sidecars};

/// Suffix of files being downloaded before they are renamed into place.
pub const DOWNLOAD_SUFFIX: &str = ".downloading";

/// On-disk representation of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarFormat {
    /// `.name.hash` containing only the token.
    Hash,
    /// `.name.meta` containing `mtime|token`.
    Meta,
}

impl SidecarFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Meta => "meta",
        }
    }

    /// Whether fingerprints in this format carry a timestamp.
    pub fn is_timestamped(self) -> bool {
        matches!(self, Self::Meta)
    }

    /// Sidecar file name for a content file name.
    pub fn sidecar_name(self, name: &str) -> String {
        format!(".{name}.{}", self.extension())
    }

    /// Sidecar path for a logical path, kept in the same directory.
    pub fn sidecar_path(self, path: &LogicalPath) -> Result<LogicalPath> {
        if path.is_root() {
            return Err(MirrorError::InvalidPath {
                path: String::new(),
                reason: "the source root has no sidecar",
            });
        }
        path.with_file_name(&self.sidecar_name(path.file_name()))
    }

    /// Render a fingerprint for storage.
    pub fn render(self, fingerprint: &Fingerprint) -> String {
        match self {
            Self::Hash => fingerprint.token.clone(),
            Self::Meta => format!(
                "{}|{}",
                fingerprint.mtime.unwrap_or_default(),
                fingerprint.token
            ),
        }
    }

    /// Parse a stored record; surrounding whitespace is ignored.
    pub fn parse(self, raw: &str) -> Result<Fingerprint> {
        let raw = raw.trim();
        match self {
            Self::Hash => {
                if raw.is_empty() || raw.contains(char::is_whitespace) {
                    return Err(MirrorError::decode("hash sidecar", "expected a single token"));
                }
                Ok(Fingerprint::new(raw))
            }
            Self::Meta => {
                let (mtime, token) = raw
                    .split_once('|')
                    .ok_or_else(|| MirrorError::decode("meta sidecar", "missing '|' separator"))?;
                let mtime = mtime
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| MirrorError::decode("meta sidecar timestamp", e))?;
                let token = token.trim();
                if token.is_empty() {
                    return Err(MirrorError::decode("meta sidecar", "empty hash"));
                }
                Ok(Fingerprint::with_mtime(token, mtime))
            }
        }
    }
}

/// Whether a file name is a sidecar record of either format.
pub fn is_sidecar_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('.') else {
        return false;
    };
    [".hash", ".meta"]
        .iter()
        .any(|suffix| rest.len() > suffix.len() && rest.ends_with(suffix))
}

/// Sidecars and partially written downloads; never treated as content.
pub fn is_cache_artifact(name: &str) -> bool {
    is_sidecar_name(name) || (name.starts_with('.') && name.ends_with(DOWNLOAD_SUFFIX))
}

/// Local sidecar records under one cache root.
#[derive(Debug, Clone)]
pub struct SidecarStore {
    root: PathBuf,
    format: SidecarFormat,
}

impl SidecarStore {
    pub fn new(root: impl Into<PathBuf>, format: SidecarFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn format(&self) -> SidecarFormat {
        self.format
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of the sidecar for `path`.
    pub fn local_path(&self, path: &LogicalPath) -> Result<PathBuf> {
        Ok(self.format.sidecar_path(path)?.to_local(&self.root))
    }

    /// Read the local record; unreadable or malformed records count as absent.
    pub async fn read_local(&self, path: &LogicalPath) -> Result<Option<Fingerprint>> {
        let sidecar = self.local_path(path)?;
        let raw = match tokio::fs::read_to_string(&sidecar).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::warn!(sidecar = %sidecar.display(), error = %e, "unreadable sidecar");
                return Ok(None);
            }
        };
        match self.format.parse(&raw) {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(e) => {
                tracing::warn!(sidecar = %sidecar.display(), error = %e, "malformed sidecar");
                Ok(None)
            }
        }
    }

    /// Write (or overwrite) the local record, creating parent directories.
    pub async fn write_local(&self, path: &LogicalPath, fingerprint: &Fingerprint) -> Result<()> {
        let sidecar = self.local_path(path)?;
        if let Some(parent) = sidecar.parent() {
            tokio::fs::create_dir_all(parent).await.at(parent)?;
        }
        tokio::fs::write(&sidecar, self.format.render(fingerprint))
            .await
            .at(&sidecar)?;
        tracing::debug!(path = %path, sidecar = %sidecar.display(), "wrote sidecar");
        Ok(())
    }

    /// Remove the local record; returns whether one existed.
    pub async fn remove_local(&self, path: &LogicalPath) -> Result<bool> {
        let sidecar = self.local_path(path)?;
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MirrorError::LocalIo {
                path: sidecar,
                source: e,
            }),
        }
    }
}
