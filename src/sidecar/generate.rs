//! Generate sidecars for a local tree so it can be published as a
//! remotedata-format source (a GitHub repository or a static HTTP host).
//!
//! Every regular file gets a `.name.hash` or `.name.meta` sibling. `.git/`,
//! existing sidecars and the patterns of the tree's top-level `.gitignore` are
//! skipped. Records whose token is unchanged are left alone, so regenerating
//! does not churn timestamps.

use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use walkdir::WalkDir;

use super::{SidecarFormat, is_cache_artifact};
use crate::error::{IoResultExt, MirrorError, Result};
use crate::fingerprint::{Fingerprint, HashAlgorithm, hash_file};

/// Options for [`generate_sidecars`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub algorithm: HashAlgorithm,
    pub format: SidecarFormat,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::GitBlob,
            format: SidecarFormat::Meta,
        }
    }
}

/// Outcome for a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerateStatus {
    Updated { previous: Option<String> },
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub sidecar: PathBuf,
    pub token: String,
    #[serde(flatten)]
    pub status: GenerateStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateReport {
    pub entries: Vec<GeneratedEntry>,
}

impl GenerateReport {
    pub fn updated(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, GenerateStatus::Updated { .. }))
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.entries.len() - self.updated()
    }
}

/// Ignore rules: `.git/` plus the tree's `.gitignore`.
struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    fn load(root: &Path) -> Result<Self> {
        let mut raw = vec![".git/".to_string()];
        let gitignore = root.join(".gitignore");
        if gitignore.is_file() {
            let content = fs::read_to_string(&gitignore).at(&gitignore)?;
            raw.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }

        let mut patterns = Vec::with_capacity(raw.len());
        for line in raw {
            let expanded = if let Some(dir) = line.strip_suffix('/') {
                let dir = dir.trim_start_matches('/');
                if dir.contains('/') {
                    format!("{dir}/*")
                } else {
                    format!("**/{dir}/*")
                }
            } else if line.contains('/') {
                line.trim_start_matches('/').to_string()
            } else {
                format!("**/{line}")
            };
            match Pattern::new(&expanded) {
                Ok(p) => patterns.push(p),
                Err(e) => {
                    tracing::warn!(pattern = %line, error = %e, "skipping invalid ignore pattern")
                }
            }
        }
        Ok(Self { patterns })
    }

    fn is_ignored(&self, rel: &str) -> bool {
        // `**/x` must also match a top-level `x`, so test with a leading slash.
        let anchored = format!("/{rel}");
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|p| {
            p.matches_with(rel, options) || p.matches_with(&anchored, options)
        })
    }
}

fn modified_secs(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path).at(path)?.modified().at(path)?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

/// Write or refresh the sidecar of every file under `root`.
pub fn generate_sidecars(root: &Path, options: &GenerateOptions) -> Result<GenerateReport> {
    if !root.is_dir() {
        return Err(MirrorError::LocalIo {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }
    let rules = IgnoreRules::load(root)?;
    let mut report = GenerateReport::default();

    let walker = WalkDir::new(root).sort_by_file_name().into_iter();
    for entry in walker {
        let entry = entry.map_err(|e| MirrorError::LocalIo {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_cache_artifact(&name) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rules.is_ignored(&rel) {
            tracing::debug!(path = %rel, "ignored");
            continue;
        }

        let token = hash_file(entry.path(), options.algorithm)?;
        let sidecar = entry
            .path()
            .with_file_name(options.format.sidecar_name(&name));
        let previous = fs::read_to_string(&sidecar)
            .ok()
            .and_then(|raw| options.format.parse(&raw).ok());

        let unchanged = previous.as_ref().is_some_and(|fp| fp.token == token);
        let status = if unchanged {
            GenerateStatus::Unchanged
        } else {
            let fingerprint = match options.format {
                SidecarFormat::Hash => Fingerprint::new(token.clone()),
                SidecarFormat::Meta => {
                    Fingerprint::with_mtime(token.clone(), modified_secs(entry.path())?)
                }
            };
            fs::write(&sidecar, options.format.render(&fingerprint)).at(&sidecar)?;
            tracing::info!(path = %rel, token = %token, "sidecar updated");
            GenerateStatus::Updated {
                previous: previous.map(|fp| fp.token),
            }
        };

        report.entries.push(GeneratedEntry {
            path: rel,
            sidecar,
            token,
            status,
        });
    }

    Ok(report)
}
