//! Mirror configuration.
//!
//! A [`MirrorConfig`] is built once (from a TOML file, environment variables
//! and command-line flags, in increasing precedence) and handed to
//! [`SyncEngine::new`](crate::engine::SyncEngine::new). Nothing is read from
//! ambient state after construction.
//!
//! ```toml
//! cache_dir = "/var/cache/remotedata"
//! concurrency = 8
//!
//! [source]
//! type = "github"
//! repos = "owner/repo/develop"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{IoResultExt, MirrorError, Result};
use crate::fingerprint::HashAlgorithm;
use crate::remote::github::GitHubRepo;
use crate::transport::DEFAULT_MEMO_CAPACITY;

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_DROPBOX_API: &str = "https://api.dropboxapi.com/2";
pub const DEFAULT_DROPBOX_CONTENT: &str = "https://content.dropboxapi.com/2";

/// Placeholder replaced by the logical path in HTTP URL templates.
pub const FILE_PLACEHOLDER: &str = "{file}";

fn default_github_api() -> String {
    DEFAULT_GITHUB_API.to_string()
}

fn default_dropbox_api() -> String {
    DEFAULT_DROPBOX_API.to_string()
}

fn default_dropbox_content() -> String {
    DEFAULT_DROPBOX_CONTENT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_memo_capacity() -> usize {
    DEFAULT_MEMO_CAPACITY
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    300
}

/// GitHub repository source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubSourceConfig {
    /// `<owner>/<repo>[/<branch>]`.
    pub repos: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Basic-auth user; the token is sent as a bearer token when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// List directories through the trees API. Disable for file-only access.
    #[serde(default = "default_true")]
    pub directories: bool,
}

impl GitHubSourceConfig {
    pub fn new(repos: impl Into<String>) -> Self {
        Self {
            repos: repos.into(),
            token: None,
            user: None,
            api_url: default_github_api(),
            directories: true,
        }
    }
}

/// Dropbox account source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropboxSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_dropbox_api")]
    pub api_url: String,
    #[serde(default = "default_dropbox_content")]
    pub content_url: String,
}

impl Default for DropboxSourceConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_dropbox_api(),
            content_url: default_dropbox_content(),
        }
    }
}

/// Generic HTTP host publishing `.name.meta` sidecars next to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// URL containing the literal `{file}` placeholder.
    pub url_template: String,
    /// Bearer token used to publish sidecars with `PUT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Which remote to mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    #[serde(rename = "github")]
    GitHub(GitHubSourceConfig),
    /// A GitHub repository carrying committed `.name.meta` sidecars.
    #[serde(rename = "github.remotedata", alias = "github-remotedata")]
    GitHubRemoteData(GitHubSourceConfig),
    #[serde(rename = "dropbox")]
    Dropbox(DropboxSourceConfig),
    #[serde(rename = "http")]
    Http(HttpSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GitHub(_) => "github",
            Self::GitHubRemoteData(_) => "github.remotedata",
            Self::Dropbox(_) => "dropbox",
            Self::Http(_) => "http",
        }
    }

    /// Algorithm used when a fingerprint has to be computed locally.
    pub fn default_algorithm(&self) -> HashAlgorithm {
        match self {
            Self::GitHub(_) | Self::GitHubRemoteData(_) => HashAlgorithm::GitBlob,
            Self::Dropbox(_) => HashAlgorithm::Dropbox,
            Self::Http(_) => HashAlgorithm::Sha1,
        }
    }

    fn token_mut(&mut self) -> &mut Option<String> {
        match self {
            Self::GitHub(c) | Self::GitHubRemoteData(c) => &mut c.token,
            Self::Dropbox(c) => &mut c.token,
            Self::Http(c) => &mut c.token,
        }
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        *self.token_mut() = Some(token.into());
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::GitHub(c) | Self::GitHubRemoteData(c) => c.token.as_deref(),
            Self::Dropbox(c) => c.token.as_deref(),
            Self::Http(c) => c.token.as_deref(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Base cache directory; each source gets its own namespace below it.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    pub source: SourceConfig,
    /// Maximum concurrent file syncs.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum memoized HTTP responses.
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: usize,
    /// Override the algorithm used for locally computed fingerprints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<HashAlgorithm>,
    /// Check downloaded bytes against native remote hashes.
    #[serde(default = "default_true")]
    pub verify_downloads: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Platform cache directory for remotedata, falling back to `./.remotedata`.
pub fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("", "", "remotedata")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".remotedata"))
}

/// Platform location of `config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "remotedata").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl MirrorConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, source: SourceConfig) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            source,
            concurrency: default_concurrency(),
            memo_capacity: default_memo_capacity(),
            hash_algorithm: None,
            verify_downloads: true,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| MirrorError::ConfigurationInvalid(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).at(path)?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), source = config.source.kind(), "loaded config");
        Ok(config)
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply environment overrides using `lookup`.
    ///
    /// `REMOTEDATA_CACHE_DIR` replaces the cache directory. `REMOTEDATA_TOKEN`
    /// supplies a token for any source; `GITHUB_TOKEN` / `DROPBOX_TOKEN` only
    /// for the matching source and only when no token is configured.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("REMOTEDATA_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(token) = lookup("REMOTEDATA_TOKEN") {
            self.source.set_token(token);
            return;
        }
        if self.source.token().is_some() {
            return;
        }
        let fallback = match self.source {
            SourceConfig::GitHub(_) | SourceConfig::GitHubRemoteData(_) => lookup("GITHUB_TOKEN"),
            SourceConfig::Dropbox(_) => lookup("DROPBOX_TOKEN"),
            SourceConfig::Http(_) => None,
        };
        if let Some(token) = fallback {
            self.source.set_token(token);
        }
    }

    /// Algorithm for locally computed fingerprints.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
            .unwrap_or_else(|| self.source.default_algorithm())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check everything that can be checked without the network.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MirrorError::ConfigurationInvalid(msg));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return invalid(format!(
                "concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            ));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return invalid("cache_dir must not be empty".into());
        }
        match &self.source {
            SourceConfig::GitHub(c) | SourceConfig::GitHubRemoteData(c) => {
                GitHubRepo::parse(&c.repos)?;
                if c.user.is_some() && c.token.is_none() {
                    return invalid("github user given without a token".into());
                }
            }
            SourceConfig::Dropbox(c) => {
                if c.token.is_none() {
                    return invalid("dropbox source requires an access token".into());
                }
            }
            SourceConfig::Http(c) => {
                if !c.url_template.contains(FILE_PLACEHOLDER) {
                    return invalid(format!(
                        "url_template {:?} must contain {FILE_PLACEHOLDER}",
                        c.url_template
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_config() -> MirrorConfig {
        MirrorConfig::new("/tmp", SourceConfig::GitHub(GitHubSourceConfig::new("o/r")))
    }

    #[test]
    fn test_parse_github_config() {
        let config = MirrorConfig::from_toml_str(
            r#"
cache_dir = "/tmp/rd"
concurrency = 2

[source]
type = "github"
repos = "pwwang/remotedata/develop"
"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/rd"));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.memo_capacity, DEFAULT_MEMO_CAPACITY);
        assert!(config.verify_downloads);
        let SourceConfig::GitHub(github) = &config.source else {
            panic!("expected github source");
        };
        assert_eq!(github.api_url, DEFAULT_GITHUB_API);
        assert!(github.directories);
        assert_eq!(config.hash_algorithm(), HashAlgorithm::GitBlob);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_other_sources() {
        let config = MirrorConfig::from_toml_str(
            r#"
cache_dir = "/tmp/rd"
hash_algorithm = "sha256"
[source]
type = "http"
url_template = "https://data.example.org/files/{file}"
"#,
        )
        .unwrap();
        assert_eq!(config.source.kind(), "http");
        assert_eq!(config.hash_algorithm(), HashAlgorithm::Sha256);

        let config = MirrorConfig::from_toml_str(
            r#"
cache_dir = "/tmp/rd"
[source]
type = "github.remotedata"
repos = "o/r"
"#,
        )
        .unwrap();
        assert_eq!(config.source.kind(), "github.remotedata");
    }

    #[test]
    fn test_unknown_source_rejected() {
        let err = MirrorConfig::from_toml_str("[source]\ntype = \"ftp\"\n").unwrap_err();
        assert!(matches!(err, MirrorError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_repo = MirrorConfig::new(
            "/tmp",
            SourceConfig::GitHub(GitHubSourceConfig::new("justowner")),
        );
        assert!(matches!(
            bad_repo.validate(),
            Err(MirrorError::ConfigurationInvalid(_))
        ));

        let no_token = MirrorConfig::new(
            "/tmp",
            SourceConfig::Dropbox(DropboxSourceConfig::default()),
        );
        assert!(no_token.validate().is_err());

        let no_placeholder = MirrorConfig::new(
            "/tmp",
            SourceConfig::Http(HttpSourceConfig {
                url_template: "https://example.org/static".into(),
                token: None,
            }),
        );
        assert!(no_placeholder.validate().is_err());

        let mut zero = github_config();
        zero.concurrency = 0;
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_concurrency() {
        let mut config = github_config();
        config.concurrency = Semaphore::MAX_PERMITS;
        config.validate().unwrap();

        config.concurrency = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(MirrorError::ConfigurationInvalid(msg)) if msg.contains("at most")
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env = |pairs: &'static [(&'static str, &'static str)]| {
            move |key: &str| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            }
        };

        let mut config = github_config();
        config.apply_env_from(env(&[
            ("GITHUB_TOKEN", "gh"),
            ("REMOTEDATA_CACHE_DIR", "/c"),
        ]));
        assert_eq!(config.source.token(), Some("gh"));
        assert_eq!(config.cache_dir, PathBuf::from("/c"));

        // Configured tokens win over GITHUB_TOKEN but not REMOTEDATA_TOKEN.
        config.apply_env_from(env(&[("GITHUB_TOKEN", "other")]));
        assert_eq!(config.source.token(), Some("gh"));
        config.apply_env_from(env(&[("REMOTEDATA_TOKEN", "rd")]));
        assert_eq!(config.source.token(), Some("rd"));

        let mut dropbox = MirrorConfig::new(
            "/tmp",
            SourceConfig::Dropbox(DropboxSourceConfig::default()),
        );
        dropbox.apply_env_from(env(&[("GITHUB_TOKEN", "gh")]));
        assert_eq!(dropbox.source.token(), None);
        dropbox.apply_env_from(env(&[("DROPBOX_TOKEN", "db")]));
        assert_eq!(dropbox.source.token(), Some("db"));
    }
}
