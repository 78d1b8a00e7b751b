//! Sync engine: keeps a local cache in step with a remote source.
//!
//! A file is current when its local sidecar matches the fingerprint the
//! remote reports. Otherwise it is downloaded again, its sidecar refreshed,
//! and (for sources that store fingerprints themselves) a locally computed
//! fingerprint published back.
//!
//! # Example
//!
//! ```rust,ignore
//! use remotedata::config::{GitHubSourceConfig, MirrorConfig, SourceConfig};
//! use remotedata::engine::SyncEngine;
//!
//! let config = MirrorConfig::new(
//!     "/tmp/cache",
//!     SourceConfig::GitHub(GitHubSourceConfig::new("owner/repo")),
//! );
//! let engine = SyncEngine::new(&config)?;
//! let local = engine.get("data/file.txt").await?;
//! ```

mod locks;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::config::MirrorConfig;
use crate::error::{IoResultExt, MirrorError, Result};
use crate::fingerprint::{Fingerprint, HashAlgorithm, hash_file};
use crate::path::LogicalPath;
use crate::remote::{PublishOutcome, RemoteKind, RemoteSource};
use crate::sidecar::{DOWNLOAD_SUFFIX, SidecarStore, is_sidecar_name};
use crate::transport::{Fetcher, HttpClient, ReqwestClient};

pub use locks::{PathGuard, PathLocks};
pub use report::{
    ClearFailure, ClearReport, EntryOutcome, EntryState, FileSyncResult, SyncReport,
};

struct EngineInner {
    source: RemoteSource,
    store: SidecarStore,
    client: Arc<dyn HttpClient>,
    memo_capacity: usize,
    locks: PathLocks,
    /// Bounds work that talks to the remote, across every clone.
    limiter: Semaphore,
    algorithm: HashAlgorithm,
    verify: bool,
}

/// Temp file of an in-flight download. Removed on drop unless persisted, so
/// failed or cancelled downloads leave nothing behind.
struct TempDownload {
    path: PathBuf,
    persisted: bool,
}

impl TempDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    async fn persist(mut self, target: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, target).await.at(target)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempDownload {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Cheaply cloneable handle; clones share locks and the limiter. Each
/// top-level call gets its own request memo.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("source", &self.inner.source.kind_name())
            .field("cache_root", &self.inner.store.root())
            .finish()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn join_error(path: &Path, err: tokio::task::JoinError) -> MirrorError {
    if err.is_panic() {
        std::panic::resume_unwind(err.into_panic());
    }
    MirrorError::LocalIo {
        path: path.to_path_buf(),
        source: std::io::Error::other(err),
    }
}

/// Hash a local file off the async runtime.
async fn hash_file_blocking(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
        .await
        .map_err(|e| join_error(path, e))?
}

impl SyncEngine {
    /// Engine talking to the network through `reqwest`.
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        config.validate()?;
        let client = ReqwestClient::new(config.connect_timeout(), config.request_timeout())?;
        Self::with_client(config, Arc::new(client))
    }

    /// Engine using a caller-supplied HTTP client.
    pub fn with_client(config: &MirrorConfig, client: Arc<dyn HttpClient>) -> Result<Self> {
        config.validate()?;
        let source = RemoteSource::from_config(&config.source)?;
        let cache_root = config.cache_dir.join(source.namespace());
        let store = SidecarStore::new(cache_root, source.sidecar_format());
        tracing::debug!(
            source = source.kind_name(),
            cache_root = %store.root().display(),
            concurrency = config.concurrency,
            "engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                source,
                store,
                client,
                memo_capacity: config.memo_capacity,
                locks: PathLocks::new(),
                limiter: Semaphore::new(config.concurrency),
                algorithm: config.hash_algorithm(),
                verify: config.verify_downloads,
            }),
        })
    }

    pub fn source(&self) -> &RemoteSource {
        &self.inner.source
    }

    /// Local directory mirroring the source root.
    pub fn cache_root(&self) -> &Path {
        self.inner.store.root()
    }

    /// Local counterpart of a logical path (whether or not it is cached).
    pub fn local_path(&self, path: &str) -> Result<PathBuf> {
        Ok(LogicalPath::parse(path)?.to_local(self.cache_root()))
    }

    /// Make `path` current locally and return its local path.
    pub async fn get(&self, path: &str) -> Result<PathBuf> {
        Ok(self.sync(path).await?.local_path)
    }

    /// Like [`get`](Self::get), reporting what happened to every file.
    pub async fn sync(&self, path: &str) -> Result<SyncReport> {
        let path = LogicalPath::parse(path)?;
        let fetcher = self.scope();
        let started = Instant::now();

        let kind = {
            let _permit = self.permit().await?;
            self.inner.source.classify(&fetcher, &path).await?
        };
        let mut report = SyncReport::new(path.clone(), path.to_local(self.cache_root()));
        match kind {
            RemoteKind::File => {
                let result = self.sync_file(&fetcher, &path).await?;
                report.add_file_result(result);
            }
            RemoteKind::Dir => self.sync_dir(&fetcher, &path, &mut report).await?,
        }
        report.total_duration_ms = elapsed_ms(started);

        tracing::info!(
            path = %path,
            files = report.files.len(),
            downloaded = report.downloaded(),
            bytes = report.total_bytes(),
            duration_ms = report.total_duration_ms,
            "sync complete"
        );
        Ok(report)
    }

    /// Whether the local copy of a file is current.
    pub async fn is_cached(&self, path: &str) -> Result<bool> {
        let path = LogicalPath::parse(path)?;
        let fetcher = self.scope();
        let _permit = self.permit().await?;
        Ok(self.check(&fetcher, &path).await? == EntryState::Fresh)
    }

    /// Download a file unconditionally and refresh its sidecar.
    pub async fn download(&self, path: &str) -> Result<PathBuf> {
        let path = LogicalPath::parse(path)?;
        let fetcher = self.scope();
        let _guard = self.inner.locks.lock(&path).await;
        let _permit = self.permit().await?;
        self.download_locked(&fetcher, &path).await?;
        Ok(path.to_local(self.cache_root()))
    }

    /// Forget a cached entry.
    ///
    /// Removes the sidecar so the next access re-downloads. With `clean`, the
    /// content goes too. For a directory, `clean` removes the whole subtree
    /// and otherwise every sidecar inside it.
    pub async fn remove(&self, path: &str, clean: bool) -> Result<()> {
        let path = LogicalPath::parse(path)?;
        let _guard = self.inner.locks.lock(&path).await;
        let local = path.to_local(self.cache_root());

        let is_dir = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => path.is_root(),
            Err(e) => return Err(MirrorError::LocalIo { path: local, source: e }),
        };

        if is_dir {
            if clean {
                match tokio::fs::remove_dir_all(&local).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MirrorError::LocalIo { path: local, source: e }),
                }
            } else {
                let removed = remove_sidecars_under(&local).await?;
                tracing::debug!(path = %path, removed, "removed sidecars");
            }
        } else {
            self.inner.store.remove_local(&path).await?;
            if clean {
                match tokio::fs::remove_file(&local).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MirrorError::LocalIo { path: local, source: e }),
                }
            }
        }
        tracing::info!(path = %path, clean, "removed");
        Ok(())
    }

    /// Remove everything under the cache root. Entries that cannot be removed
    /// are logged and reported, not raised.
    pub async fn clear(&self) -> Result<ClearReport> {
        let root = self.cache_root();
        let mut report = ClearReport::default();
        let mut dir = match tokio::fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(MirrorError::LocalIo { path: root.to_path_buf(), source: e }),
        };

        while let Some(entry) = dir.next_entry().await.at(root)? {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.removed.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove cache entry");
                    report.failed.push(ClearFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            root = %root.display(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "cache cleared"
        );
        Ok(report)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Request memo for one top-level operation. Separate calls never share
    /// responses, so a remote change is seen by the next call.
    fn scope(&self) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(
            self.inner.client.clone(),
            self.inner.memo_capacity,
        ))
    }

    /// Limiter slot. Never wait for a path lock while holding one.
    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.inner
            .limiter
            .acquire()
            .await
            .map_err(|e| MirrorError::Transport(e.to_string()))
    }

    /// Compare local and remote fingerprints.
    async fn check(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<EntryState> {
        let inner = &self.inner;
        tracing::debug!(path = %path, state = %EntryState::Checking);

        let Some(local) = inner.store.read_local(path).await? else {
            return Ok(EntryState::Stale);
        };
        let content = path.to_local(self.cache_root());
        if !tokio::fs::try_exists(&content).await.at(&content)? {
            tracing::debug!(path = %path, "sidecar without content");
            return Ok(EntryState::Stale);
        }

        match inner.source.fetch_fingerprint(fetcher, path).await? {
            Some(remote) if local.is_fresh_against(&remote) => Ok(EntryState::Fresh),
            Some(remote) => {
                tracing::debug!(path = %path, local = %local, remote = %remote, "fingerprint changed");
                Ok(EntryState::Stale)
            }
            None if inner.store.format().is_timestamped() => {
                let signal = MirrorError::RemoteMetadataUnavailable {
                    path: path.to_string(),
                };
                tracing::warn!(path = %path, "{signal}; treating the remote as newer");
                Ok(EntryState::Stale)
            }
            None => Err(MirrorError::not_found(path.as_str())),
        }
    }

    /// Check one file and download it if stale. Caller must hold neither its
    /// lock nor a limiter slot.
    async fn sync_file(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<FileSyncResult> {
        let started = Instant::now();
        let _guard = self.inner.locks.lock(path).await;
        let _permit = self.permit().await?;

        let (outcome, bytes) = match self.check(fetcher, path).await? {
            EntryState::Fresh => {
                tracing::debug!(path = %path, state = %EntryState::Fresh);
                (EntryOutcome::Fresh, 0)
            }
            _ => (
                EntryOutcome::Downloaded,
                self.download_locked(fetcher, path).await?,
            ),
        };
        Ok(FileSyncResult {
            path: path.clone(),
            local_path: path.to_local(self.cache_root()),
            outcome,
            bytes,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Walk a remote directory and sync every file under it.
    async fn sync_dir(
        &self,
        fetcher: &Arc<Fetcher>,
        dir: &LogicalPath,
        report: &mut SyncReport,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut pending = vec![dir.clone()];
        let mut files = Vec::new();
        while let Some(current) = pending.pop() {
            let local = current.to_local(self.cache_root());
            tokio::fs::create_dir_all(&local).await.at(&local)?;
            let listing = {
                let _permit = self.permit().await?;
                inner.source.list_directory(fetcher, &current).await?
            };
            for entry in listing {
                match entry.kind {
                    RemoteKind::Dir => pending.push(entry.path),
                    RemoteKind::File => files.push(entry.path),
                }
            }
        }
        files.sort();

        // Children queue on the limiter inside sync_file.
        let mut tasks = JoinSet::new();
        for path in files {
            let engine = self.clone();
            let fetcher = fetcher.clone();
            tasks.spawn(async move { engine.sync_file(&fetcher, &path).await });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            // Returning early drops the set, which aborts the remaining tasks.
            let result = joined.map_err(|e| join_error(&dir.to_local(self.cache_root()), e))??;
            results.push(result);
        }
        results.sort_by(|a, b| a.path.cmp(&b.path));
        for result in results {
            report.add_file_result(result);
        }
        Ok(())
    }

    /// Fetch content into place and refresh fingerprints. Caller holds the
    /// path's lock and a limiter slot. Returns the number of bytes written.
    async fn download_locked(&self, fetcher: &Fetcher, path: &LogicalPath) -> Result<u64> {
        let inner = &self.inner;
        if path.is_root() {
            return Err(MirrorError::InvalidPath {
                path: String::new(),
                reason: "the source root is not a file",
            });
        }
        tracing::debug!(path = %path, state = %EntryState::Downloading);

        let content = inner.source.fetch_content(fetcher, path).await?;
        let remote = inner.source.fetch_fingerprint(fetcher, path).await?;

        let local = path.to_local(self.cache_root());
        let parent = local.parent().unwrap_or(self.cache_root()).to_path_buf();
        tokio::fs::create_dir_all(&parent).await.at(&parent)?;
        let temp = TempDownload::new(
            parent.join(format!(".{}{DOWNLOAD_SUFFIX}", path.file_name())),
        );

        let mut file = tokio::fs::File::create(&temp.path).await.at(&temp.path)?;
        file.write_all(&content).await.at(&temp.path)?;
        file.sync_all().await.at(&temp.path)?;
        drop(file);

        self.verify(path, &temp.path, remote.as_ref()).await?;
        temp.persist(&local).await?;

        let (fingerprint, computed) = match remote {
            Some(remote) => (remote, false),
            None => {
                let token = hash_file_blocking(&local, inner.algorithm).await?;
                let fingerprint = if inner.store.format().is_timestamped() {
                    Fingerprint::with_mtime(token, chrono::Utc::now().timestamp())
                } else {
                    Fingerprint::new(token)
                };
                (fingerprint, true)
            }
        };
        inner.store.write_local(path, &fingerprint).await?;
        tracing::info!(path = %path, bytes = content.len(), fingerprint = %fingerprint, "downloaded");

        if computed {
            self.publish(fetcher, path, &fingerprint).await;
        }
        Ok(content.len() as u64)
    }

    /// Check downloaded bytes against a native content hash.
    async fn verify(
        &self,
        path: &LogicalPath,
        file: &Path,
        remote: Option<&Fingerprint>,
    ) -> Result<()> {
        let inner = &self.inner;
        let (Some(algorithm), Some(remote), true) =
            (inner.source.native_algorithm(), remote, inner.verify)
        else {
            return Ok(());
        };
        let actual = hash_file_blocking(file, algorithm).await?;
        if actual != remote.token {
            return Err(MirrorError::VerificationFailed {
                path: path.to_string(),
                expected: remote.token.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Best-effort push of a locally computed fingerprint.
    async fn publish(&self, fetcher: &Fetcher, path: &LogicalPath, fingerprint: &Fingerprint) {
        let inner = &self.inner;
        match inner
            .source
            .publish_fingerprint(fetcher, path, fingerprint)
            .await
        {
            Ok(PublishOutcome::Published) => tracing::info!(path = %path, "published fingerprint"),
            Ok(PublishOutcome::NotNeeded) => {}
            Ok(PublishOutcome::NoCredential) => {
                tracing::warn!(path = %path, "no credential configured; fingerprint not published")
            }
            Err(e) => tracing::warn!(path = %path, error = %e, "failed to publish fingerprint"),
        }
    }
}

/// Delete every sidecar below `dir`; returns how many were removed.
async fn remove_sidecars_under(dir: &Path) -> Result<usize> {
    let owned = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&owned) {
            let entry = entry.map_err(|e| MirrorError::LocalIo {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| owned.clone()),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            })?;
            if entry.file_type().is_file() && is_sidecar_name(&entry.file_name().to_string_lossy()) {
                std::fs::remove_file(entry.path()).at(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    })
    .await
    .map_err(|e| join_error(dir, e))?
}
