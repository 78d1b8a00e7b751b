//! Generic HTTP host.
//!
//! Content lives at a URL built from a template such as
//! `https://data.example.org/v1/{file}`. The host is expected to serve the
//! `.name.meta` sidecar of each file at the same template position. Hosts
//! without sidecars still work: the engine then fingerprints downloads
//! locally.

use super::{PublishOutcome, RemoteKind};
use crate::config::{FILE_PLACEHOLDER, HttpSourceConfig};
use crate::error::{MirrorError, Result};
use crate::fingerprint::Fingerprint;
use crate::path::LogicalPath;
use crate::remote::github::encode_segments;
use crate::sidecar::SidecarFormat;
use crate::transport::{Auth, Fetcher, HttpRequest};

const METHOD_NOT_ALLOWED: u16 = 405;

#[derive(Debug, Clone)]
pub struct HttpSource {
    url_template: String,
    auth: Option<Auth>,
}

impl HttpSource {
    pub fn new(config: &HttpSourceConfig) -> Result<Self> {
        if !config.url_template.contains(FILE_PLACEHOLDER) {
            return Err(MirrorError::ConfigurationInvalid(format!(
                "url_template {:?} must contain {FILE_PLACEHOLDER}",
                config.url_template
            )));
        }
        Ok(Self {
            url_template: config.url_template.clone(),
            auth: config.token.clone().map(Auth::Bearer),
        })
    }

    /// Host part of the template, used as the cache namespace.
    pub fn host(&self) -> String {
        let rest = self
            .url_template
            .split_once("://")
            .map_or(self.url_template.as_str(), |(_, rest)| rest);
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let host: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        if host.is_empty() { "local".to_string() } else { host }
    }

    pub fn url_for(&self, path: &LogicalPath) -> String {
        self.url_template
            .replace(FILE_PLACEHOLDER, &encode_segments(path.as_str()))
    }

    pub async fn fetch_content(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<Vec<u8>> {
        let url = self.url_for(path);
        let request = HttpRequest::get(url.clone())
            .auth(self.auth.clone())
            .memoized(false);
        let response = fetcher.fetch(&request).await?;
        if response.is_not_found() {
            return Err(MirrorError::not_found(path.as_str()));
        }
        Ok(response.ensure_success(&url)?.body)
    }

    /// Fingerprint from the remote sidecar. A missing, unreachable or
    /// malformed sidecar yields `None`.
    pub async fn fetch_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
    ) -> Result<Option<Fingerprint>> {
        let url = self.url_for(&SidecarFormat::Meta.sidecar_path(path)?);
        let request = HttpRequest::get(url.clone()).auth(self.auth.clone());
        let response = match fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "remote sidecar unreachable");
                return Ok(None);
            }
        };
        if !response.is_success() {
            tracing::debug!(url = %url, status = response.status, "no remote sidecar");
            return Ok(None);
        }
        match SidecarFormat::Meta.parse(&response.text()) {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "malformed remote sidecar");
                Ok(None)
            }
        }
    }

    /// `HEAD` the file; hosts that refuse `HEAD` are asked with `GET`.
    pub async fn exists(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<bool> {
        let url = self.url_for(path);
        let request = HttpRequest::head(url.clone()).auth(self.auth.clone());
        let response = fetcher.fetch(&request).await?;
        if response.status != METHOD_NOT_ALLOWED {
            return Ok(response.is_success());
        }
        tracing::debug!(url = %url, "HEAD not allowed; retrying with GET");
        let request = HttpRequest::get(url)
            .auth(self.auth.clone())
            .memoized(false);
        Ok(fetcher.fetch(&request).await?.is_success())
    }

    pub async fn classify(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<RemoteKind> {
        if path.is_root() {
            return Err(MirrorError::NotSupported {
                source_kind: "http",
                operation: "directories",
            });
        }
        if self.exists(fetcher, path).await? {
            Ok(RemoteKind::File)
        } else {
            Err(MirrorError::not_found(path.as_str()))
        }
    }

    pub async fn publish_fingerprint(
        &self,
        fetcher: &Fetcher,
        path: &LogicalPath,
        fingerprint: &Fingerprint,
    ) -> Result<PublishOutcome> {
        if self.auth.is_none() {
            return Ok(PublishOutcome::NoCredential);
        }
        let url = self.url_for(&SidecarFormat::Meta.sidecar_path(path)?);
        let request = HttpRequest::put(url.clone())
            .auth(self.auth.clone())
            .header("Content-Type", "text/plain")
            .body(SidecarFormat::Meta.render(fingerprint));
        let response = fetcher.fetch(&request).await?;
        fetcher.invalidate(&url);
        if !response.is_success() {
            return Err(MirrorError::Publish {
                path: path.to_string(),
                reason: format!("HTTP {} from {url}", response.status),
            });
        }
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(template: &str) -> HttpSource {
        HttpSource::new(&HttpSourceConfig {
            url_template: template.to_string(),
            token: None,
        })
        .unwrap()
    }

    #[test]
    fn test_url_for() {
        let s = source("https://data.example.org/v1/{file}?raw=1");
        assert_eq!(
            s.url_for(&LogicalPath::parse("dir/a b.txt").unwrap()),
            "https://data.example.org/v1/dir/a%20b.txt?raw=1"
        );
        let sidecar = SidecarFormat::Meta
            .sidecar_path(&LogicalPath::parse("dir/a.txt").unwrap())
            .unwrap();
        assert_eq!(s.url_for(&sidecar), "https://data.example.org/v1/dir/.a.txt.meta?raw=1");
    }

    #[test]
    fn test_host() {
        assert_eq!(source("https://data.example.org:8443/{file}").host(), "data.example.org_8443");
        assert_eq!(source("http://localhost/{file}").host(), "localhost");
    }

    #[test]
    fn test_template_requires_placeholder() {
        let err = HttpSource::new(&HttpSourceConfig {
            url_template: "https://example.org/".into(),
            token: None,
        })
        .unwrap_err();
        assert!(matches!(err, MirrorError::ConfigurationInvalid(_)));
    }
}
