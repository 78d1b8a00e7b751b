//! Reports returned by engine operations.

use std::path::PathBuf;

use serde::Serialize;

use crate::path::LogicalPath;

/// Lifecycle of a path during one operation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Unknown,
    Checking,
    Fresh,
    Stale,
    Downloading,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Checking => write!(f, "checking"),
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Downloading => write!(f, "downloading"),
        }
    }
}

/// What happened to a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    /// Local copy was already current.
    Fresh,
    /// Content was (re)downloaded.
    Downloaded,
}

/// Result of syncing a single file.
#[derive(Debug, Clone, Serialize)]
pub struct FileSyncResult {
    /// Logical path inside the source.
    pub path: LogicalPath,
    /// Local destination path.
    pub local_path: PathBuf,
    pub outcome: EntryOutcome,
    /// Bytes written to the cache; zero when fresh.
    pub bytes: u64,
    pub duration_ms: u64,
}

/// Report from syncing a file or a directory tree.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Path that was requested.
    pub path: LogicalPath,
    /// Local counterpart of `path`.
    pub local_path: PathBuf,
    /// Per-file results, in path order.
    pub files: Vec<FileSyncResult>,
    pub total_duration_ms: u64,
}

impl SyncReport {
    pub fn new(path: LogicalPath, local_path: PathBuf) -> Self {
        Self {
            path,
            local_path,
            files: Vec::new(),
            total_duration_ms: 0,
        }
    }

    pub fn add_file_result(&mut self, result: FileSyncResult) {
        self.files.push(result);
    }

    pub fn downloaded(&self) -> usize {
        self.files
            .iter()
            .filter(|r| r.outcome == EntryOutcome::Downloaded)
            .count()
    }

    pub fn fresh(&self) -> usize {
        self.files.len() - self.downloaded()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|r| r.bytes).sum()
    }
}

/// An entry `clear` could not remove.
#[derive(Debug, Clone, Serialize)]
pub struct ClearFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of clearing the cache root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClearReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<ClearFailure>,
}

impl ClearReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, outcome: EntryOutcome, bytes: u64) -> FileSyncResult {
        FileSyncResult {
            path: LogicalPath::parse(name).unwrap(),
            local_path: PathBuf::from("/cache").join(name),
            outcome,
            bytes,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_report_totals() {
        let mut report = SyncReport::new(LogicalPath::root(), PathBuf::from("/cache"));
        report.add_file_result(result("a", EntryOutcome::Downloaded, 10));
        report.add_file_result(result("b", EntryOutcome::Fresh, 0));
        report.add_file_result(result("c", EntryOutcome::Downloaded, 5));

        assert_eq!(report.downloaded(), 2);
        assert_eq!(report.fresh(), 1);
        assert_eq!(report.total_bytes(), 15);
    }

    #[test]
    fn test_report_serializes() {
        let mut report = SyncReport::new(LogicalPath::parse("a").unwrap(), PathBuf::from("/c/a"));
        report.add_file_result(result("a", EntryOutcome::Fresh, 0));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["path"], "a");
        assert_eq!(json["files"][0]["outcome"], "fresh");
        assert_eq!(EntryState::Downloading.to_string(), "downloading");
    }
}
