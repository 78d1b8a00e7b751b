//! Content fingerprints.
//!
//! A [`Fingerprint`] is an opaque token (plus an optional modification time)
//! identifying one content state. Tokens are produced by one of the
//! [`HashAlgorithm`]s, which must agree bit-for-bit with what remote hosts
//! compute themselves:
//!
//! - `git-blob`: SHA-1 over `"blob <len>\0" + content`, the `sha` GitHub reports
//! - `sha1` / `sha256` / `md5`: plain digests of the file bytes
//! - `dropbox`: the Dropbox `content_hash` (see [`dropbox`])
//!
//! Files are streamed in 64 KiB blocks. Directories hash to a digest over
//! their children visited in name order, skipping sidecar files.

pub mod dropbox;

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{IoResultExt, MirrorError, Result};
use crate::sidecar::is_cache_artifact;

pub use dropbox::DropboxContentHasher;

/// Read buffer used when streaming files through a hasher.
pub const READ_BLOCK_SIZE: usize = 64 * 1024;

/// Supported fingerprint algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "git-blob", alias = "git-sha")]
    GitBlob,
    #[serde(rename = "sha1", alias = "sha")]
    Sha1,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "md5")]
    Md5,
    #[serde(rename = "dropbox")]
    Dropbox,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 5] = [
        Self::GitBlob,
        Self::Sha1,
        Self::Sha256,
        Self::Md5,
        Self::Dropbox,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitBlob => "git-blob",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
            Self::Dropbox => "dropbox",
        }
    }

    /// The plain digest directories are folded through.
    fn folding(self) -> HashAlgorithm {
        match self {
            Self::GitBlob => Self::Sha1,
            Self::Dropbox => Self::Sha256,
            other => other,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git-blob" | "git-sha" | "git" => Ok(Self::GitBlob),
            "sha1" | "sha" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            "dropbox" | "dropbox-content-hash" => Ok(Self::Dropbox),
            other => Err(MirrorError::ConfigurationInvalid(format!(
                "unsupported hash algorithm {other:?}"
            ))),
        }
    }
}

/// A content fingerprint: token plus optional unix modification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub token: String,
    pub mtime: Option<i64>,
}

impl Fingerprint {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            mtime: None,
        }
    }

    pub fn with_mtime(token: impl Into<String>, mtime: i64) -> Self {
        Self {
            token: token.into(),
            mtime: Some(mtime),
        }
    }

    /// Whether a local record still describes `remote`.
    ///
    /// Tokens must match; when both sides carry a timestamp the remote one
    /// must not be newer.
    pub fn is_fresh_against(&self, remote: &Fingerprint) -> bool {
        if self.token != remote.token {
            return false;
        }
        match (self.mtime, remote.mtime) {
            (Some(local), Some(remote)) => remote <= local,
            _ => true,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mtime {
            Some(mtime) => write!(f, "{mtime}|{}", self.token),
            None => f.write_str(&self.token),
        }
    }
}

// =============================================================================
// Streaming digests
// =============================================================================

enum StreamingDigest {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(Md5),
    Dropbox(DropboxContentHasher),
}

impl StreamingDigest {
    /// Plain streaming digest; git-blob needs the length up front and is
    /// handled by [`git_blob_hasher`].
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::GitBlob | HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Md5 => Self::Md5(Md5::new()),
            HashAlgorithm::Dropbox => Self::Dropbox(DropboxContentHasher::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Md5(h) => h.update(data),
            Self::Dropbox(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Dropbox(h) => h.finalize(),
        }
    }
}

fn git_blob_hasher(len: u64) -> StreamingDigest {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {len}\0").as_bytes());
    StreamingDigest::Sha1(hasher)
}

fn hasher_for(algorithm: HashAlgorithm, len: u64) -> StreamingDigest {
    match algorithm {
        HashAlgorithm::GitBlob => git_blob_hasher(len),
        other => StreamingDigest::new(other),
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Fingerprint an in-memory buffer.
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = hasher_for(algorithm, data.len() as u64);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Fingerprint a reader of known length.
///
/// `len` is only consulted by `git-blob`, whose header embeds the size.
pub fn hash_reader<R: Read>(
    reader: R,
    len: u64,
    algorithm: HashAlgorithm,
) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(READ_BLOCK_SIZE, reader);
    let mut hasher = hasher_for(algorithm, len);
    let mut buffer = vec![0u8; READ_BLOCK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Fingerprint a local file, streaming it in fixed-size blocks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let file = File::open(path).at(path)?;
    let len = file.metadata().at(path)?.len();
    hash_reader(file, len, algorithm).at(path)
}

/// Fingerprint a local directory.
///
/// Children are visited in lexicographic name order so the result does not
/// depend on filesystem iteration order. Sidecar files and in-flight download
/// files are skipped. Each subdirectory contributes its name followed by its
/// own directory hash; each file contributes its file hash.
pub fn hash_dir(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path).at(path)? {
        let entry = entry.at(path)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_cache_artifact(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let mut digest = StreamingDigest::new(algorithm.folding());
    for name in names {
        let child = path.join(&name);
        if child.is_dir() {
            digest.update(name.as_bytes());
            digest.update(hash_dir(&child, algorithm)?.as_bytes());
        } else {
            digest.update(hash_file(&child, algorithm)?.as_bytes());
        }
    }
    Ok(digest.finalize_hex())
}

/// Fingerprint a file or directory.
pub fn hash_path(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    if path.is_dir() {
        hash_dir(path, algorithm)
    } else {
        hash_file(path, algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_blob_matches_git_hash_object() {
        // `printf 'hello world\n' | git hash-object --stdin`
        assert_eq!(
            hash_bytes(b"hello world\n", HashAlgorithm::GitBlob),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
        // `git hash-object /dev/null`
        assert_eq!(
            hash_bytes(b"", HashAlgorithm::GitBlob),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
    }

    #[test]
    fn test_plain_digests() {
        assert_eq!(
            hash_bytes(b"hello world", HashAlgorithm::Sha256),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash_bytes(b"hello world", HashAlgorithm::Sha1),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            hash_bytes(b"hello world", HashAlgorithm::Md5),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        fs::write(&path, &data).unwrap();

        for algorithm in HashAlgorithm::ALL {
            assert_eq!(
                hash_file(&path, algorithm).unwrap(),
                hash_bytes(&data, algorithm),
                "{algorithm}"
            );
        }
    }

    #[test]
    fn test_hash_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let err = hash_file(&tmp.path().join("nope"), HashAlgorithm::Sha1).unwrap_err();
        assert!(matches!(err, MirrorError::LocalIo { .. }));
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("b.txt"), b"beta").unwrap();
        fs::write(root.join("sub/c.txt"), b"gamma").unwrap();
    }

    #[test]
    fn test_hash_dir_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");

        build_tree(&one);
        // Same content created in a different order.
        fs::create_dir_all(two.join("sub")).unwrap();
        fs::write(two.join("sub/c.txt"), b"gamma").unwrap();
        fs::write(two.join("b.txt"), b"beta").unwrap();
        fs::write(two.join("a.txt"), b"alpha").unwrap();

        assert_eq!(
            hash_dir(&one, HashAlgorithm::Sha1).unwrap(),
            hash_dir(&two, HashAlgorithm::Sha1).unwrap()
        );
    }

    #[test]
    fn test_hash_dir_ignores_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let before = hash_dir(tmp.path(), HashAlgorithm::Sha256).unwrap();

        fs::write(tmp.path().join(".a.txt.hash"), "abc").unwrap();
        fs::write(tmp.path().join("sub/.c.txt.meta"), "1|abc").unwrap();

        assert_eq!(hash_dir(tmp.path(), HashAlgorithm::Sha256).unwrap(), before);
    }

    #[test]
    fn test_hash_dir_sensitive_to_content_and_names() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let before = hash_dir(tmp.path(), HashAlgorithm::GitBlob).unwrap();

        fs::write(tmp.path().join("sub/c.txt"), b"delta").unwrap();
        let changed = hash_dir(tmp.path(), HashAlgorithm::GitBlob).unwrap();
        assert_ne!(before, changed);

        fs::rename(tmp.path().join("sub"), tmp.path().join("sub2")).unwrap();
        assert_ne!(changed, hash_dir(tmp.path(), HashAlgorithm::GitBlob).unwrap());
    }

    #[test]
    fn test_hash_path_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        assert_eq!(
            hash_path(&tmp.path().join("a.txt"), HashAlgorithm::Md5).unwrap(),
            hash_bytes(b"alpha", HashAlgorithm::Md5)
        );
        assert_eq!(
            hash_path(tmp.path(), HashAlgorithm::Md5).unwrap(),
            hash_dir(tmp.path(), HashAlgorithm::Md5).unwrap()
        );
    }

    #[test]
    fn test_algorithm_parse_and_display() {
        for algorithm in HashAlgorithm::ALL {
            assert_eq!(
                algorithm.as_str().parse::<HashAlgorithm>().unwrap(),
                algorithm
            );
        }
        assert_eq!(
            "git-sha".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::GitBlob
        );
        assert_eq!("SHA".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_fingerprint_freshness() {
        let local = Fingerprint::with_mtime("abc", 100);
        assert!(local.is_fresh_against(&Fingerprint::with_mtime("abc", 100)));
        assert!(local.is_fresh_against(&Fingerprint::with_mtime("abc", 50)));
        assert!(!local.is_fresh_against(&Fingerprint::with_mtime("abc", 101)));
        assert!(!local.is_fresh_against(&Fingerprint::with_mtime("xyz", 100)));
        assert!(Fingerprint::new("abc").is_fresh_against(&Fingerprint::new("abc")));
        assert!(!Fingerprint::new("abc").is_fresh_against(&Fingerprint::new("abd")));
    }

    #[test]
    fn test_fingerprint_display() {
        assert_eq!(Fingerprint::new("abc").to_string(), "abc");
        assert_eq!(Fingerprint::with_mtime("abc", 42).to_string(), "42|abc");
    }
}
