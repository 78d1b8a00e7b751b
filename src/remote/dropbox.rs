//! Dropbox account source.
//!
//! Metadata and listings come from the RPC endpoints on `api.dropboxapi.com`;
//! file bodies from `content.dropboxapi.com/2/files/download`. Every file
//! entry carries a `content_hash` computed with the Dropbox content hash, so
//! fingerprints never require a download.

use serde::Deserialize;
use serde_json::json;

use super::{RemoteEntry, RemoteKind, sort_entries};
use crate::config::DropboxSourceConfig;
use crate::error::{MirrorError, Result};
use crate::fingerprint::Fingerprint;
use crate::path::LogicalPath;
use crate::sidecar::is_sidecar_name;
use crate::transport::{Auth, Fetcher, HttpRequest, HttpResponse};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
enum Metadata {
    File {
        name: String,
        #[serde(default)]
        content_hash: Option<String>,
    },
    Folder {
        name: String,
    },
    Deleted {},
}

#[derive(Debug, Deserialize)]
struct FolderPage {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

/// Dropbox paths are absolute with a leading slash; the root is `""`.
fn wire_path(path: &LogicalPath) -> String {
    if path.is_root() {
        String::new()
    } else {
        format!("/{}", path.as_str())
    }
}

/// JSON for the `Dropbox-API-Arg` header, which must be plain ASCII.
fn header_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Whether a 409 response is Dropbox's "path not found".
fn is_path_not_found(response: &HttpResponse) -> bool {
    response.status == 409
        && response
            .json::<ApiError>("dropbox error")
            .is_ok_and(|e| e.error_summary.contains("not_found"))
}

#[derive(Debug, Clone)]
pub struct DropboxSource {
    api_url: String,
    content_url: String,
    auth: Auth,
}

impl DropboxSource {
    pub fn new(config: &DropboxSourceConfig) -> Result<Self> {
        let token = config.token.as_deref().ok_or_else(|| {
            MirrorError::ConfigurationInvalid("dropbox source requires an access token".into())
        })?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            content_url: config.content_url.trim_end_matches('/').to_string(),
            auth: Auth::Bearer(token.to_string()),
        })
    }

    fn rpc(&self, endpoint: &str, body: serde_json::Value) -> HttpRequest {
        HttpRequest::post(format!("{}/{endpoint}", self.api_url))
            .auth(Some(self.auth.clone()))
            .json_body(&body)
            .memoized(true)
    }

    async fn metadata(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Option<Metadata>> {
        let request = self.rpc("files/get_metadata", json!({ "path": wire_path(path) }));
        let response = fetcher.fetch(&request).await?;
        if response.is_not_found() || is_path_not_found(&response) {
            return Ok(None);
        }
        let response = response.ensure_success(&request.url)?;
        match response.json("dropbox metadata")? {
            Metadata::Deleted { .. } => Ok(None),
            metadata => Ok(Some(metadata)),
        }
    }

    pub async fn fetch_content(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Vec<u8>> {
        let url = format!("{}/files/download", self.content_url);
        let request = HttpRequest::post(url.clone())
            .auth(Some(self.auth.clone()))
            .header("Dropbox-API-Arg", header_json(&json!({ "path": wire_path(path) })));
        let response = fetcher.fetch(&request).await?;
        if response.is_not_found() || is_path_not_found(&response) {
            return Err(MirrorError::not_found(path.as_str()));
        }
        Ok(response.ensure_success(&url)?.body)
    }

    pub async fn fetch_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
    ) -> Result<Option<Fingerprint>> {
        match self.metadata(fetcher, path).await? {
            Some(Metadata::File {
                content_hash: Some(hash),
                ..
            }) => Ok(Some(Fingerprint::new(hash))),
            _ => Ok(None),
        }
    }

    pub async fn classify(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<RemoteKind> {
        // get_metadata rejects the root.
        if path.is_root() {
            return Ok(RemoteKind::Dir);
        }
        match self.metadata(fetcher, path).await? {
            Some(Metadata::File { .. }) => Ok(RemoteKind::File),
            Some(Metadata::Folder { .. }) => Ok(RemoteKind::Dir),
            Some(Metadata::Deleted { .. }) | None => Err(MirrorError::not_found(path.as_str())),
        }
    }

    pub async fn exists(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<bool> {
        if path.is_root() {
            return Ok(true);
        }
        Ok(self.metadata(fetcher, path).await?.is_some())
    }

    pub async fn list_directory(
        &self,
        fetcher: &Fetcher,
        dir: &LogicalPath,
    ) -> Result<Vec<RemoteEntry>> {
        let mut request = self.rpc(
            "files/list_folder",
            json!({ "path": wire_path(dir), "recursive": false }),
        );
        let mut entries = Vec::new();
        loop {
            let response = fetcher.fetch(&request).await?;
            if response.is_not_found() || is_path_not_found(&response) {
                return Err(MirrorError::not_found(dir.as_str()));
            }
            let page: FolderPage = response
                .ensure_success(&request.url)?
                .json("dropbox folder listing")?;

            for metadata in page.entries {
                let (name, kind) = match metadata {
                    Metadata::File { name, .. } => (name, RemoteKind::File),
                    Metadata::Folder { name } => (name, RemoteKind::Dir),
                    Metadata::Deleted { .. } => continue,
                };
                if is_sidecar_name(&name) {
                    continue;
                }
                entries.push(RemoteEntry {
                    path: dir.join(&name)?,
                    kind,
                });
            }

            if !page.has_more {
                break;
            }
            request = self.rpc("files/list_folder/continue", json!({ "cursor": page.cursor }));
        }
        sort_entries(&mut entries);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_path() {
        assert_eq!(wire_path(&LogicalPath::root()), "");
        assert_eq!(wire_path(&LogicalPath::parse("a/b.txt").unwrap()), "/a/b.txt");
    }

    #[test]
    fn test_header_json_escapes_non_ascii() {
        let arg = header_json(&json!({ "path": "/é😀" }));
        assert_eq!(arg, r#"{"path":"/\u00e9\ud83d\ude00"}"#);
        let back: serde_json::Value = serde_json::from_str(&arg).unwrap();
        assert_eq!(back["path"], "/é😀");
    }

    #[test]
    fn test_not_found_detection() {
        let missing = HttpResponse::new(
            409,
            br#"{"error_summary":"path/not_found/..","error":{".tag":"path"}}"#.to_vec(),
        );
        assert!(is_path_not_found(&missing));
        let conflict = HttpResponse::new(409, br#"{"error_summary":"path/malformed_path/"}"#.to_vec());
        assert!(!is_path_not_found(&conflict));
    }

    #[test]
    fn test_metadata_tags() {
        let file: Metadata = serde_json::from_str(
            r#"{".tag":"file","name":"a.txt","path_display":"/a.txt","content_hash":"abc"}"#,
        )
        .unwrap();
        assert!(matches!(file, Metadata::File { content_hash: Some(ref h), .. } if h == "abc"));
        let folder: Metadata =
            serde_json::from_str(r#"{".tag":"folder","name":"d","id":"id:1"}"#).unwrap();
        assert!(matches!(folder, Metadata::Folder { .. }));
    }

    #[test]
    fn test_requires_token() {
        assert!(matches!(
            DropboxSource::new(&DropboxSourceConfig::default()),
            Err(MirrorError::ConfigurationInvalid(_))
        ));
    }
}
