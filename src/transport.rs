//! HTTP transport.
//!
//! Remote sources talk to the network through the [`HttpClient`] capability:
//! a request goes in, a status and body come out. [`ReqwestClient`] is the
//! production implementation; tests substitute an in-memory one.
//!
//! [`Fetcher`] sits between the sources and the client and memoizes read
//! requests in a bounded LRU. The engine owns it and clears it whenever it
//! goes idle, so one sync operation never fetches the same metadata twice
//! (GitHub answers both the fingerprint and the content from one endpoint).

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Bearer(String),
    Basic { user: String, password: String },
}

/// A single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub auth: Option<Auth>,
    /// Read-only request whose response may be reused within an operation.
    pub memoize: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            auth: None,
            memoize: true,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            ..Self::get(url)
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            memoize: false,
            ..Self::get(url)
        }
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self {
            method: Method::Put,
            memoize: false,
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json_body(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }

    pub fn auth(mut self, auth: Option<Auth>) -> Self {
        self.auth = auth;
        self
    }

    /// Mark a non-GET request as a pure read (e.g. Dropbox metadata calls).
    pub fn memoized(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }

    /// URL with the query string appended, for logs and errors.
    pub fn display_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.url, query)
    }

    fn memo_key(&self) -> String {
        let mut key = format!("{} {}", self.method.as_str(), self.display_url());
        if let Some(body) = &self.body {
            key.push('\n');
            key.push_str(&String::from_utf8_lossy(body));
        }
        key
    }
}

/// Status and body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| MirrorError::decode(what, e))
    }

    /// Fail with [`MirrorError::Http`] unless the status is 2xx.
    pub fn ensure_success(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MirrorError::Http {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

/// Capability to perform HTTP requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform `request`. Non-2xx statuses are returned, not raised; only
    /// network-level failures become errors.
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(concat!("remotedata/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MirrorError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.client.head(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        builder = match &request.auth {
            Some(Auth::Bearer(token)) => builder.bearer_auth(token),
            Some(Auth::Basic { user, password }) => builder.basic_auth(user, Some(password)),
            None => builder,
        };
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        tracing::debug!(
            method = request.method.as_str(),
            url = %request.display_url(),
            status,
            bytes = body.len(),
            "http request"
        );
        Ok(HttpResponse { status, body })
    }
}

/// Default number of memoized responses.
pub const DEFAULT_MEMO_CAPACITY: usize = 256;

/// Memoizing front for an [`HttpClient`].
pub struct Fetcher {
    client: Arc<dyn HttpClient>,
    memo: Mutex<LruCache<String, HttpResponse>>,
}

impl Fetcher {
    pub fn new(client: Arc<dyn HttpClient>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            client,
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Execute a request, reusing a memoized response when allowed.
    pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if !request.memoize {
            return self.client.execute(request).await;
        }
        let key = request.memo_key();
        if let Some(hit) = self.memo.lock().get(&key).cloned() {
            tracing::trace!(url = %request.display_url(), "memo hit");
            return Ok(hit);
        }
        let response = self.client.execute(request).await?;
        // Server errors are not worth remembering; 404s are.
        if response.status < 500 {
            self.memo.lock().put(key, response.clone());
        }
        Ok(response)
    }

    /// Drop memoized responses for `url` (any query or body).
    pub fn invalidate(&self, url: &str) {
        let matches_url = |key: &str| {
            key.split_once(' ')
                .and_then(|(_, rest)| rest.strip_prefix(url))
                .is_some_and(|tail| tail.is_empty() || tail.starts_with(['?', '\n']))
        };
        let mut memo = self.memo.lock();
        let stale: Vec<String> = memo
            .iter()
            .filter(|(key, _)| matches_url(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            memo.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.memo.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.memo.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("memoized", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl HttpClient for CountingClient {
        async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(self.status, request.url.clone()))
        }
    }

    fn counting(status: u16) -> Arc<CountingClient> {
        Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            status,
        })
    }

    #[test]
    fn test_display_url_encodes_query() {
        let req = HttpRequest::get("https://api.example.org/x").query("ref", "feature/a b");
        assert_eq!(
            req.display_url(),
            "https://api.example.org/x?ref=feature%2Fa%20b"
        );
    }

    #[tokio::test]
    async fn test_fetcher_memoizes_reads() {
        let client = counting(200);
        let fetcher = Fetcher::new(client.clone(), 8);
        let req = HttpRequest::get("https://h/a").query("ref", "main");

        fetcher.fetch(&req).await.unwrap();
        fetcher.fetch(&req).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        // Different query is a different key.
        fetcher
            .fetch(&HttpRequest::get("https://h/a").query("ref", "dev"))
            .await
            .unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        fetcher.clear();
        assert!(fetcher.is_empty());
        fetcher.fetch(&req).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetcher_skips_writes_and_server_errors() {
        let client = counting(200);
        let fetcher = Fetcher::new(client.clone(), 8);
        let put = HttpRequest::put("https://h/a").body("x");
        fetcher.fetch(&put).await.unwrap();
        fetcher.fetch(&put).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        let failing = counting(503);
        let fetcher = Fetcher::new(failing.clone(), 8);
        let get = HttpRequest::get("https://h/b");
        fetcher.fetch(&get).await.unwrap();
        fetcher.fetch(&get).await.unwrap();
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetcher_is_bounded() {
        let client = counting(200);
        let fetcher = Fetcher::new(client.clone(), 2);
        for i in 0..5 {
            fetcher
                .fetch(&HttpRequest::get(format!("https://h/{i}")))
                .await
                .unwrap();
        }
        assert_eq!(fetcher.len(), 2);
    }

    #[tokio::test]
    async fn test_fetcher_invalidate() {
        let client = counting(200);
        let fetcher = Fetcher::new(client.clone(), 8);
        fetcher
            .fetch(&HttpRequest::get("https://h/a").query("ref", "main"))
            .await
            .unwrap();
        fetcher.fetch(&HttpRequest::get("https://h/ab")).await.unwrap();
        fetcher.invalidate("https://h/a");
        assert_eq!(fetcher.len(), 1);
    }

    #[test]
    fn test_response_helpers() {
        let ok = HttpResponse::new(200, br#"{"sha":"abc"}"#.to_vec());
        let value: serde_json::Value = ok.json("test").unwrap();
        assert_eq!(value["sha"], "abc");
        assert!(ok.clone().ensure_success("u").is_ok());

        let missing = HttpResponse::new(404, Vec::new());
        assert!(missing.is_not_found());
        assert!(matches!(
            missing.ensure_success("u"),
            Err(MirrorError::Http { status: 404, .. })
        ));
    }
}
