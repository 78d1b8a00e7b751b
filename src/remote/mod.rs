//! Remote content sources.
//!
//! [`RemoteSource`] has one variant per backend. They all answer the same
//! questions (what is at this path, what is its fingerprint, give me its
//! bytes) so the engine runs one sync algorithm over all of them. Variants
//! that can list directories are built on top of the file-only ones.

pub mod dropbox;
pub mod github;
pub mod http;

use std::path::PathBuf;

use serde::Serialize;

use crate::config::SourceConfig;
use crate::error::{MirrorError, Result};
use crate::fingerprint::{Fingerprint, HashAlgorithm};
use crate::path::LogicalPath;
use crate::sidecar::SidecarFormat;
use crate::transport::Fetcher;

pub use dropbox::DropboxSource;
pub use github::{GitHubBlobSource, GitHubMetaSource, GitHubRepo, GitHubTreeSource};
pub use http::HttpSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    File,
    Dir,
}

/// One child of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: LogicalPath,
    pub kind: RemoteKind,
}

/// Result of pushing a fingerprint back to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The backend's fingerprints are native; nothing to write.
    NotNeeded,
    /// Publishing needs a credential that was not configured.
    NoCredential,
}

/// Listings are visited in name order.
pub(crate) fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| a.path.file_name().cmp(b.path.file_name()));
}

#[derive(Debug, Clone)]
pub enum RemoteSource {
    GitHubBlob(GitHubBlobSource),
    GitHubTree(GitHubTreeSource),
    GitHubMeta(GitHubMetaSource),
    Dropbox(DropboxSource),
    Http(HttpSource),
}

impl RemoteSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        match config {
            SourceConfig::GitHub(c) => {
                let blobs = GitHubBlobSource::new(
                    GitHubRepo::parse(&c.repos)?,
                    &c.api_url,
                    c.token.as_deref(),
                    c.user.as_deref(),
                );
                Ok(if c.directories {
                    Self::GitHubTree(GitHubTreeSource::new(blobs))
                } else {
                    Self::GitHubBlob(blobs)
                })
            }
            SourceConfig::GitHubRemoteData(c) => {
                let blobs = GitHubBlobSource::new(
                    GitHubRepo::parse(&c.repos)?,
                    &c.api_url,
                    c.token.as_deref(),
                    c.user.as_deref(),
                );
                Ok(Self::GitHubMeta(GitHubMetaSource::new(
                    GitHubTreeSource::new(blobs),
                )))
            }
            SourceConfig::Dropbox(c) => Ok(Self::Dropbox(DropboxSource::new(c)?)),
            SourceConfig::Http(c) => Ok(Self::Http(HttpSource::new(c)?)),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::GitHubBlob(_) | Self::GitHubTree(_) => "github",
            Self::GitHubMeta(_) => "github.remotedata",
            Self::Dropbox(_) => "dropbox",
            Self::Http(_) => "http",
        }
    }

    pub fn sidecar_format(&self) -> SidecarFormat {
        match self {
            Self::GitHubBlob(_) | Self::GitHubTree(_) | Self::Dropbox(_) => SidecarFormat::Hash,
            Self::GitHubMeta(_) | Self::Http(_) => SidecarFormat::Meta,
        }
    }

    /// Cache sub-directory for this source, relative to the cache dir.
    pub fn namespace(&self) -> PathBuf {
        match self {
            Self::Dropbox(_) => PathBuf::from("dropbox"),
            Self::Http(s) => PathBuf::from("http").join(s.host()),
            Self::GitHubBlob(s) => PathBuf::from("github").join(s.repo().namespace()),
            Self::GitHubTree(s) => PathBuf::from("github").join(s.blobs().repo().namespace()),
            Self::GitHubMeta(s) => PathBuf::from("github").join(s.blobs().repo().namespace()),
        }
    }

    /// Algorithm whose output equals the remote's native fingerprint, for
    /// checking downloads. `None` when fingerprints are not content hashes
    /// the engine can reproduce.
    pub fn native_algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            Self::GitHubBlob(_) | Self::GitHubTree(_) => Some(HashAlgorithm::GitBlob),
            Self::Dropbox(_) => Some(HashAlgorithm::Dropbox),
            Self::GitHubMeta(_) | Self::Http(_) => None,
        }
    }

    pub fn supports_directories(&self) -> bool {
        !matches!(self, Self::GitHubBlob(_) | Self::Http(_))
    }

    pub async fn fetch_content(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Vec<u8>> {
        match self {
            Self::GitHubBlob(s) => s.fetch_content(fetcher, path).await,
            Self::GitHubTree(s) => s.blobs().fetch_content(fetcher, path).await,
            Self::GitHubMeta(s) => s.blobs().fetch_content(fetcher, path).await,
            Self::Dropbox(s) => s.fetch_content(fetcher, path).await,
            Self::Http(s) => s.fetch_content(fetcher, path).await,
        }
    }

    pub async fn fetch_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
    ) -> Result<Option<Fingerprint>> {
        match self {
            Self::GitHubBlob(s) => s.fetch_fingerprint(fetcher, path).await,
            Self::GitHubTree(s) => s.blobs().fetch_fingerprint(fetcher, path).await,
            Self::GitHubMeta(s) => s.fetch_fingerprint(fetcher, path).await,
            Self::Dropbox(s) => s.fetch_fingerprint(fetcher, path).await,
            Self::Http(s) => s.fetch_fingerprint(fetcher, path).await,
        }
    }

    pub async fn exists(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<bool> {
        match self {
            Self::GitHubBlob(s) => s.exists(fetcher, path).await,
            Self::GitHubTree(s) => s.blobs().exists(fetcher, path).await,
            Self::GitHubMeta(s) => s.blobs().exists(fetcher, path).await,
            Self::Dropbox(s) => s.exists(fetcher, path).await,
            Self::Http(s) => s.exists(fetcher, path).await,
        }
    }

    pub async fn list_directory(
        &self,
        fetcher: &Fetcher,
        dir: &LogicalPath,
    ) -> Result<Vec<RemoteEntry>> {
        match self {
            Self::GitHubTree(s) => s.list_directory(fetcher, dir).await,
            Self::GitHubMeta(s) => s.tree().list_directory(fetcher, dir).await,
            Self::Dropbox(s) => s.list_directory(fetcher, dir).await,
            Self::GitHubBlob(_) | Self::Http(_) => Err(MirrorError::NotSupported {
                source_kind: self.kind_name(),
                operation: "directory listing",
            }),
        }
    }

    pub async fn classify(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<RemoteKind> {
        match self {
            Self::GitHubBlob(s) => s.classify(fetcher, path).await,
            Self::GitHubTree(s) => s.blobs().classify(fetcher, path).await,
            Self::GitHubMeta(s) => s.blobs().classify(fetcher, path).await,
            Self::Dropbox(s) => s.classify(fetcher, path).await,
            Self::Http(s) => s.classify(fetcher, path).await,
        }
    }

    pub async fn publish_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
        fingerprint: &Fingerprint,
    ) -> Result<PublishOutcome> {
        match self {
            Self::GitHubMeta(s) => s.publish_fingerprint(fetcher, path, fingerprint).await,
            Self::Http(s) => s.publish_fingerprint(fetcher, path, fingerprint).await,
            Self::GitHubBlob(_) | Self::GitHubTree(_) | Self::Dropbox(_) => {
                Ok(PublishOutcome::NotNeeded)
            }
        }
    }
}
