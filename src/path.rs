//! Logical paths inside a remote source.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// A slash-separated path relative to the root of a remote source.
///
/// Never absolute and never contains `..`, `.` or empty components. The
/// empty path is the source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason| MirrorError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        if raw.starts_with('/') {
            return Err(invalid("absolute paths are not allowed"));
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        for component in trimmed.split('/') {
            match component {
                "" => return Err(invalid("empty path component")),
                "." => return Err(invalid("'.' components are not allowed")),
                ".." => return Err(invalid("'..' components are not allowed")),
                _ => {}
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final component; empty for the root.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Directory prefix; `None` for the root, empty for top-level entries.
    pub fn parent(&self) -> Option<LogicalPath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        })
    }

    /// Append a single child name.
    pub fn join(&self, name: &str) -> Result<LogicalPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(MirrorError::InvalidPath {
                path: name.to_string(),
                reason: "child names must be a single component",
            });
        }
        Ok(if self.is_root() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        })
    }

    /// Same directory, final component replaced.
    pub fn with_file_name(&self, name: &str) -> Result<LogicalPath> {
        self.parent().unwrap_or_else(Self::root).join(name)
    }

    /// Resolve against a local directory.
    pub fn to_local(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.0.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for LogicalPath {
    type Error = MirrorError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<LogicalPath> for String {
    fn from(value: LogicalPath) -> Self {
        value.0
    }
}

impl AsRef<str> for LogicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
