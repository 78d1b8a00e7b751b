#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use remotedata::config::{GitHubSourceConfig, MirrorConfig, SourceConfig};
use remotedata::error::Result;
use remotedata::fingerprint::{HashAlgorithm, hash_bytes};
use remotedata::transport::{HttpClient, HttpRequest, HttpResponse, Method};
use serde_json::{Value, json};

pub const API: &str = "https://api.test";

/// In-memory HTTP host. Unknown requests answer 404; `PUT` bodies become
/// the `GET` response for the same URL.
#[derive(Default)]
pub struct StubHttp {
    routes: Mutex<HashMap<String, HttpResponse>>,
    calls: Mutex<Vec<HttpRequest>>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn key(method: Method, url: &str, payload: &str) -> String {
    format!("{} {url}\n{payload}", method.as_str())
}

fn request_key(request: &HttpRequest) -> String {
    let payload = match &request.body {
        Some(body) => String::from_utf8_lossy(body).into_owned(),
        None => request
            .headers
            .iter()
            .find(|(k, _)| k == "Dropbox-API-Arg")
            .map(|(_, v)| v.clone())
            .unwrap_or_default(),
    };
    key(request.method, &request.display_url(), &payload)
}

impl StubHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, method: Method, url: &str, payload: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .insert(key(method, url, payload), HttpResponse::new(status, body));
    }

    pub fn get(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.route(Method::Get, url, "", status, body);
    }

    /// Every request to `url` (any method) takes at least `delay`.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    /// Highest number of requests that were being served at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn post_json(&self, url: &str, request: &Value, status: u16, body: &Value) {
        self.route(Method::Post, url, &request.to_string(), status, body.to_string());
    }

    /// Number of requests made with `method` to `url` (query included).
    pub fn count(&self, method: Method, url: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.method == method && r.display_url() == url)
            .count()
    }

    pub fn requests(&self, method: Method) -> Vec<HttpRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpClient for StubHttp {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.calls.lock().push(request.clone());
        let delay = self.delays.lock().get(&request.url).copied();
        if let Some(delay) = delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if request.method == Method::Put {
            let body = request.body.clone().unwrap_or_default();
            self.get(&request.display_url(), 200, body);
            return Ok(HttpResponse::new(201, b"{}".to_vec()));
        }
        Ok(self
            .routes
            .lock()
            .get(&request_key(request))
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, br#"{"message":"Not Found"}"#.to_vec())))
    }
}

// =============================================================================
// GitHub fixtures
// =============================================================================

pub fn github_config(cache: &Path, repos: &str) -> MirrorConfig {
    let mut source = GitHubSourceConfig::new(repos);
    source.api_url = API.to_string();
    MirrorConfig::new(cache, SourceConfig::GitHub(source))
}

pub fn contents_url(repo: &str, path: &str) -> String {
    format!("{API}/repos/{repo}/contents/{path}?ref=HEAD")
}

pub fn git_sha(content: &[u8]) -> String {
    hash_bytes(content, HashAlgorithm::GitBlob)
}

/// Contents-API file object with inline base64 content.
pub fn contents_file(path: &str, content: &[u8]) -> Value {
    json!({
        "type": "file",
        "name": path.rsplit('/').next().unwrap(),
        "path": path,
        "sha": git_sha(content),
        "size": content.len(),
        "encoding": "base64",
        "content": BASE64.encode(content),
    })
}

pub fn serve_github_file(stub: &StubHttp, repo: &str, path: &str, content: &[u8]) -> String {
    stub.get(
        &contents_url(repo, path),
        200,
        contents_file(path, content).to_string(),
    );
    git_sha(content)
}

pub fn tree_entry(path: &str, kind: &str, sha: &str) -> Value {
    json!({ "path": path, "mode": "100644", "type": kind, "sha": sha })
}

pub fn serve_tree(stub: &StubHttp, repo: &str, tree_ref: &str, entries: Vec<Value>) {
    stub.get(
        &format!("{API}/repos/{repo}/git/trees/{tree_ref}"),
        200,
        json!({ "sha": "t0", "tree": entries, "truncated": false }).to_string(),
    );
}

pub fn base64(content: &[u8]) -> String {
    BASE64.encode(content)
}
