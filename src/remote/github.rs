//! GitHub repository sources.
//!
//! - [`GitHubBlobSource`] reads single files through the contents API. The
//!   `sha` it reports is the git-blob hash of the file, so the fingerprint
//!   comes for free with the content request.
//! - [`GitHubTreeSource`] adds directory listing through the trees API.
//! - [`GitHubMetaSource`] reads fingerprints from `.name.meta` sidecars
//!   committed next to the content (a "remotedata-format" repository) and
//!   publishes them back through the contents API.
//!
//! # Large objects
//!
//! The contents API only inlines blobs up to 1 MB. Above that it either
//! answers with a `too_large` error message or returns the file object with
//! `encoding: "none"` and no content. In both cases the parent directory's
//! tree (or the repository root tree) is listed, the entry is matched by
//! name, and its blob URL is fetched instead.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::{PublishOutcome, RemoteEntry, RemoteKind, sort_entries};
use crate::error::{MirrorError, Result};
use crate::fingerprint::Fingerprint;
use crate::path::LogicalPath;
use crate::sidecar::{SidecarFormat, is_sidecar_name};
use crate::transport::{Auth, Fetcher, HttpRequest};

const TOO_LARGE_MARKER: &str = "blobs up to 1 MB";

/// Branch used when `repos` names none; GitHub resolves it to the
/// repository's default branch.
pub const DEFAULT_REF: &str = "HEAD";

// =============================================================================
// Repository identifier
// =============================================================================

/// `<owner>/<repo>[/<branch>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo {
    pub owner: String,
    pub name: String,
    pub branch: Option<String>,
}

impl GitHubRepo {
    pub fn parse(repos: &str) -> Result<Self> {
        let parts: Vec<&str> = repos.trim().split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(MirrorError::ConfigurationInvalid(format!(
                "invalid github repository {repos:?}, expected \"<owner>/<repo>[/<branch>]\""
            )));
        }
        Ok(Self {
            owner: parts[0].to_string(),
            name: parts[1].to_string(),
            branch: parts.get(2).map(|b| b.to_string()),
        })
    }

    /// Git ref used in requests.
    pub fn ref_name(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_REF)
    }

    /// `owner/name`.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Cache namespace: `owner.name@ref`.
    pub fn namespace(&self) -> String {
        format!("{}.{}@{}", self.owner, self.name, self.ref_name())
    }
}

/// Percent-encode each path segment, keeping the separators.
pub(crate) fn encode_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// API payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct ContentsItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

impl ApiMessage {
    fn is_too_large(&self) -> bool {
        self.message.contains(TOO_LARGE_MARKER)
            || self
                .errors
                .iter()
                .any(|e| e.code.as_deref() == Some("too_large"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Listing(Vec<serde_json::Value>),
    Item(ContentsItem),
    Message(ApiMessage),
}

#[derive(Debug, Clone, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TreeListing {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct BlobPayload {
    content: String,
    encoding: String,
    size: u64,
}

/// What the contents endpoint said about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Contents {
    Missing,
    Dir,
    File {
        sha: Option<String>,
        /// `None` when the API did not inline the content.
        content: Option<Vec<u8>>,
    },
    /// The API refused to return the blob; only the tree knows its sha.
    TooLarge,
}

fn decode_base64(what: &str, raw: &str) -> Result<Vec<u8>> {
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| MirrorError::decode(what, e))
}

// =============================================================================
// File-only source
// =============================================================================

/// Files of a GitHub repository via the contents and blobs APIs.
#[derive(Debug, Clone)]
pub struct GitHubBlobSource {
    repo: GitHubRepo,
    api_url: String,
    auth: Option<Auth>,
}

impl GitHubBlobSource {
    pub fn new(repo: GitHubRepo, api_url: &str, token: Option<&str>, user: Option<&str>) -> Self {
        let auth = token.map(|token| match user {
            Some(user) => Auth::Basic {
                user: user.to_string(),
                password: token.to_string(),
            },
            None => Auth::Bearer(token.to_string()),
        });
        Self {
            repo,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn repo(&self) -> &GitHubRepo {
        &self.repo
    }

    pub fn has_credential(&self) -> bool {
        self.auth.is_some()
    }

    fn repo_url(&self) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url,
            urlencoding::encode(&self.repo.owner),
            urlencoding::encode(&self.repo.name)
        )
    }

    pub(crate) fn contents_url(&self, path: &LogicalPath) -> String {
        if path.is_root() {
            format!("{}/contents", self.repo_url())
        } else {
            format!("{}/contents/{}", self.repo_url(), encode_segments(path.as_str()))
        }
    }

    pub(crate) fn tree_url(&self, dir: &LogicalPath) -> String {
        let git_ref = encode_segments(self.repo.ref_name());
        if dir.is_root() {
            format!("{}/git/trees/{}", self.repo_url(), git_ref)
        } else {
            format!(
                "{}/git/trees/{}:{}",
                self.repo_url(),
                git_ref,
                encode_segments(dir.as_str())
            )
        }
    }

    fn api_request(&self, url: impl Into<String>) -> HttpRequest {
        HttpRequest::get(url)
            .header("Accept", "application/vnd.github+json")
            .auth(self.auth.clone())
    }

    fn contents_request(&self, path: &LogicalPath) -> HttpRequest {
        self.api_request(self.contents_url(path))
            .query("ref", self.repo.ref_name())
    }

    async fn contents(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Contents> {
        let request = self.contents_request(path);
        let response = fetcher.fetch(&request).await?;
        if response.is_not_found() {
            return Ok(Contents::Missing);
        }

        let payload: ContentsPayload = match response.json("github contents") {
            Ok(payload) => payload,
            Err(e) if response.is_success() => return Err(e),
            Err(_) => {
                return Err(MirrorError::Http {
                    status: response.status,
                    url: request.display_url(),
                });
            }
        };

        match payload {
            ContentsPayload::Message(msg) if msg.is_too_large() => {
                tracing::debug!(path = %path, "contents API refused large blob");
                Ok(Contents::TooLarge)
            }
            ContentsPayload::Message(msg) if msg.message.contains("Not Found") => {
                Ok(Contents::Missing)
            }
            ContentsPayload::Message(msg) => {
                tracing::warn!(path = %path, message = %msg.message, "github API error");
                Err(MirrorError::Http {
                    status: response.status,
                    url: request.display_url(),
                })
            }
            ContentsPayload::Listing(_) => Ok(Contents::Dir),
            ContentsPayload::Item(item) => match item.kind.as_str() {
                "dir" => Ok(Contents::Dir),
                "file" | "symlink" => {
                    let inline = item.encoding.as_deref() != Some("none")
                        && (item.content.as_deref().is_some_and(|c| !c.is_empty())
                            || item.size == Some(0));
                    let content = if inline {
                        Some(decode_base64(
                            "github contents",
                            item.content.as_deref().unwrap_or_default(),
                        )?)
                    } else {
                        None
                    };
                    Ok(Contents::File {
                        sha: item.sha,
                        content,
                    })
                }
                other => Err(MirrorError::NotSupported {
                    source_kind: "github",
                    operation: if other == "submodule" {
                        "submodules"
                    } else {
                        "this entry type"
                    },
                }),
            },
        }
    }

    async fn tree(&self, fetcher: &Fetcher, dir: &LogicalPath) -> Result<Option<TreeListing>> {
        let request = self.api_request(self.tree_url(dir));
        let response = fetcher.fetch(&request).await?;
        if response.is_not_found() {
            return Ok(None);
        }
        let response = response.ensure_success(&request.display_url())?;
        let listing: TreeListing = response.json("github tree")?;
        if listing.truncated {
            tracing::warn!(dir = %dir, "github tree listing truncated");
        }
        Ok(Some(listing))
    }

    /// Find the tree entry of a file too large for the contents API.
    async fn large_object_entry(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<TreeEntry> {
        let parent = path.parent().unwrap_or_else(LogicalPath::root);
        let unresolved = || MirrorError::LargeObjectUnresolved {
            path: path.to_string(),
        };
        let listing = self.tree(fetcher, &parent).await?.ok_or_else(unresolved)?;
        let name = path.file_name();
        listing
            .tree
            .into_iter()
            .find(|entry| entry.kind == "blob" && (entry.path == name || entry.path == path.as_str()))
            .ok_or_else(unresolved)
    }

    async fn fetch_large_object(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Vec<u8>> {
        let entry = self.large_object_entry(fetcher, path).await?;
        let url = entry.url.clone().unwrap_or_else(|| {
            format!("{}/git/blobs/{}", self.repo_url(), entry.sha)
        });
        tracing::info!(path = %path, sha = %entry.sha, "fetching large object through blobs API");

        // Blob bodies can be large; keep them out of the memo.
        let request = self.api_request(url.clone()).memoized(false);
        let response = fetcher.fetch(&request).await?.ensure_success(&url)?;
        let blob: BlobPayload = response.json("github blob")?;
        let bytes = match blob.encoding.as_str() {
            "base64" => decode_base64("github blob", &blob.content)?,
            "utf-8" | "utf8" => blob.content.into_bytes(),
            other => {
                return Err(MirrorError::decode(
                    "github blob",
                    format!("unsupported encoding {other:?}"),
                ));
            }
        };
        let expected = entry.size.unwrap_or(blob.size);
        if bytes.len() as u64 != expected || blob.size != expected {
            return Err(MirrorError::decode(
                "github blob",
                format!("expected {expected} bytes, got {}", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    pub async fn fetch_content(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Vec<u8>> {
        match self.contents(fetcher, path).await? {
            Contents::Missing => Err(MirrorError::not_found(path.as_str())),
            Contents::Dir => Err(MirrorError::NotSupported {
                source_kind: "github",
                operation: "fetching a directory as file content",
            }),
            Contents::File {
                content: Some(bytes),
                ..
            } => Ok(bytes),
            Contents::File { content: None, .. } | Contents::TooLarge => {
                self.fetch_large_object(fetcher, path).await
            }
        }
    }

    pub async fn fetch_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
    ) -> Result<Option<Fingerprint>> {
        match self.contents(fetcher, path).await? {
            Contents::Missing | Contents::Dir => Ok(None),
            Contents::File { sha: Some(sha), .. } => Ok(Some(Fingerprint::new(sha))),
            Contents::File { sha: None, .. } | Contents::TooLarge => {
                let entry = self.large_object_entry(fetcher, path).await?;
                Ok(Some(Fingerprint::new(entry.sha)))
            }
        }
    }

    pub async fn classify(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<RemoteKind> {
        if path.is_root() {
            return Ok(RemoteKind::Dir);
        }
        match self.contents(fetcher, path).await? {
            Contents::Missing => Err(MirrorError::not_found(path.as_str())),
            Contents::Dir => Ok(RemoteKind::Dir),
            Contents::File { .. } | Contents::TooLarge => Ok(RemoteKind::File),
        }
    }

    pub async fn exists(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<bool> {
        if path.is_root() {
            return Ok(true);
        }
        Ok(self.contents(fetcher, path).await? != Contents::Missing)
    }

    /// Blob sha of an existing file, needed to update it through the API.
    async fn existing_sha(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Option<String>> {
        match self.contents(fetcher, path).await? {
            Contents::File { sha, .. } => Ok(sha),
            Contents::TooLarge => Ok(Some(self.large_object_entry(fetcher, path).await?.sha)),
            Contents::Missing | Contents::Dir => Ok(None),
        }
    }

    /// Create or update a file through `PUT .../contents/{path}`.
    async fn put_file(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
        content: &[u8],
        message: &str,
    ) -> Result<()> {
        let publish_err = |reason: String| MirrorError::Publish {
            path: path.to_string(),
            reason,
        };
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(content),
        });
        if let Some(branch) = &self.repo.branch {
            body["branch"] = json!(branch);
        }
        if let Some(sha) = self.existing_sha(fetcher, path).await? {
            body["sha"] = json!(sha);
        }

        let url = self.contents_url(path);
        let request = HttpRequest::put(url.clone())
            .header("Accept", "application/vnd.github+json")
            .auth(self.auth.clone())
            .json_body(&body);
        let response = fetcher.fetch(&request).await?;
        fetcher.invalidate(&url);
        if !response.is_success() {
            return Err(publish_err(format!(
                "HTTP {}: {}",
                response.status,
                response.text().trim()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Directory-capable source
// =============================================================================

/// [`GitHubBlobSource`] plus directory listing through the trees API.
#[derive(Debug, Clone)]
pub struct GitHubTreeSource {
    blobs: GitHubBlobSource,
}

impl GitHubTreeSource {
    pub fn new(blobs: GitHubBlobSource) -> Self {
        Self { blobs }
    }

    pub fn blobs(&self) -> &GitHubBlobSource {
        &self.blobs
    }

    pub async fn list_directory(
        &self,
        fetcher: &Fetcher,
        dir: &LogicalPath,
    ) -> Result<Vec<RemoteEntry>> {
        let listing = self
            .blobs
            .tree(fetcher, dir)
            .await?
            .ok_or_else(|| MirrorError::not_found(dir.as_str()))?;

        let mut entries = Vec::with_capacity(listing.tree.len());
        for entry in listing.tree {
            let kind = match entry.kind.as_str() {
                "blob" => RemoteKind::File,
                "tree" => RemoteKind::Dir,
                other => {
                    tracing::debug!(dir = %dir, path = %entry.path, kind = other, "skipping tree entry");
                    continue;
                }
            };
            if is_sidecar_name(&entry.path) {
                continue;
            }
            entries.push(RemoteEntry {
                path: dir.join(&entry.path)?,
                kind,
            });
        }
        sort_entries(&mut entries);
        Ok(entries)
    }
}

// =============================================================================
// remotedata-format source
// =============================================================================

/// GitHub repository whose files carry committed `.name.meta` sidecars.
#[derive(Debug, Clone)]
pub struct GitHubMetaSource {
    tree: GitHubTreeSource,
}

impl GitHubMetaSource {
    pub fn new(tree: GitHubTreeSource) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &GitHubTreeSource {
        &self.tree
    }

    pub fn blobs(&self) -> &GitHubBlobSource {
        self.tree.blobs()
    }

    /// Fingerprint from the committed sidecar; `None` if there is none.
    pub async fn fetch_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
    ) -> Result<Option<Fingerprint>> {
        let sidecar = SidecarFormat::Meta.sidecar_path(path)?;
        let raw = match self.blobs().fetch_content(fetcher, &sidecar).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match SidecarFormat::Meta.parse(&String::from_utf8_lossy(&raw)) {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "malformed remote sidecar");
                Ok(None)
            }
        }
    }

    pub async fn publish_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
        fingerprint: &Fingerprint,
    ) -> Result<PublishOutcome> {
        if !self.blobs().has_credential() {
            return Ok(PublishOutcome::NoCredential);
        }
        let sidecar = SidecarFormat::Meta.sidecar_path(path)?;
        let record = SidecarFormat::Meta.render(fingerprint);
        self.blobs()
            .put_file(
                fetcher,
                &sidecar,
                record.as_bytes(),
                &format!("Update remotedata metadata for {path}"),
            )
            .await?;
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo() {
        let repo = GitHubRepo::parse("pwwang/remotedata").unwrap();
        assert_eq!(repo.slug(), "pwwang/remotedata");
        assert_eq!(repo.branch, None);
        assert_eq!(repo.ref_name(), DEFAULT_REF);

        let repo = GitHubRepo::parse("pwwang/remotedata/develop").unwrap();
        assert_eq!(repo.branch.as_deref(), Some("develop"));
        assert_eq!(repo.namespace(), "pwwang.remotedata@develop");
    }

    #[test]
    fn test_parse_repo_invalid() {
        for raw in ["", "owner", "a/b/c/d", "a//b", "/a/b"] {
            assert!(
                matches!(
                    GitHubRepo::parse(raw),
                    Err(MirrorError::ConfigurationInvalid(_))
                ),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn test_urls() {
        let source = GitHubBlobSource::new(
            GitHubRepo::parse("o/r/main").unwrap(),
            "https://api.github.com/",
            None,
            None,
        );
        let path = LogicalPath::parse("data/my file.txt").unwrap();
        assert_eq!(
            source.contents_url(&path),
            "https://api.github.com/repos/o/r/contents/data/my%20file.txt"
        );
        assert_eq!(
            source.tree_url(&LogicalPath::root()),
            "https://api.github.com/repos/o/r/git/trees/main"
        );
        assert_eq!(
            source.tree_url(&LogicalPath::parse("data").unwrap()),
            "https://api.github.com/repos/o/r/git/trees/main:data"
        );
    }

    #[test]
    fn test_auth_selection() {
        let repo = GitHubRepo::parse("o/r").unwrap();
        let anon = GitHubBlobSource::new(repo.clone(), "https://api", None, None);
        assert!(!anon.has_credential());

        let bearer = GitHubBlobSource::new(repo.clone(), "https://api", Some("t"), None);
        assert_eq!(bearer.auth, Some(Auth::Bearer("t".into())));

        let basic = GitHubBlobSource::new(repo, "https://api", Some("t"), Some("me"));
        assert_eq!(
            basic.auth,
            Some(Auth::Basic {
                user: "me".into(),
                password: "t".into()
            })
        );
    }

    #[test]
    fn test_too_large_detection() {
        let msg: ApiMessage = serde_json::from_str(
            r#"{"message":"This API returns blobs up to 1 MB in size. The requested blob is too large to fetch via the API, but you can use the Git Data API to request blobs up to 100 MB in size.","errors":[{"resource":"Blob","field":"data","code":"too_large"}]}"#,
        )
        .unwrap();
        assert!(msg.is_too_large());

        let msg: ApiMessage = serde_json::from_str(r#"{"message":"Not Found"}"#).unwrap();
        assert!(!msg.is_too_large());
    }

    #[test]
    fn test_decode_base64_with_newlines() {
        assert_eq!(decode_base64("t", "aGVs\nbG8=\n").unwrap(), b"hello");
        assert!(decode_base64("t", "!!!").is_err());
    }
}
