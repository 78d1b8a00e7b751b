//! Dropbox content hash.
//!
//! Content is split into 4 MiB blocks, each block is hashed with SHA-256, and
//! the concatenated block digests are hashed again with SHA-256. This is the
//! value Dropbox reports as `content_hash` in file metadata.

use sha2::{Digest, Sha256};

/// Dropbox hashes content in 4 MiB blocks.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Streaming Dropbox content hasher.
///
/// `finalize` consumes the hasher, so it cannot be updated or finalized twice.
#[derive(Clone)]
pub struct DropboxContentHasher {
    overall: Sha256,
    block: Sha256,
    block_pos: usize,
}

impl Default for DropboxContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl DropboxContentHasher {
    pub fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_pos: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.block_pos == BLOCK_SIZE {
                self.flush_block();
            }
            let take = (BLOCK_SIZE - self.block_pos).min(data.len());
            self.block.update(&data[..take]);
            self.block_pos += take;
            data = &data[take..];
        }
    }

    fn flush_block(&mut self) {
        let digest = std::mem::take(&mut self.block).finalize();
        self.overall.update(digest);
        self.block_pos = 0;
    }

    /// Finish hashing and return the raw 32-byte digest.
    pub fn finalize_bytes(mut self) -> [u8; 32] {
        if self.block_pos > 0 {
            self.flush_block();
        }
        self.overall.finalize().into()
    }

    /// Finish hashing and return the lowercase hex token.
    pub fn finalize(self) -> String {
        hex::encode(self.finalize_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    #[test]
    fn test_empty_input() {
        let hasher = DropboxContentHasher::new();
        assert_eq!(hasher.finalize(), hex::encode(sha256(b"")));
    }

    #[test]
    fn test_single_small_block() {
        let mut hasher = DropboxContentHasher::new();
        hasher.update(b"hello world");
        let expected = sha256(&sha256(b"hello world"));
        assert_eq!(hasher.finalize(), hex::encode(expected));
    }

    #[test]
    fn test_one_block_plus_one_byte() {
        let mut data = vec![0x5au8; BLOCK_SIZE];
        data.push(0x01);

        let mut concat = sha256(&data[..BLOCK_SIZE]);
        concat.extend(sha256(&data[BLOCK_SIZE..]));
        let expected = hex::encode(sha256(&concat));

        let mut hasher = DropboxContentHasher::new();
        hasher.update(&data);
        assert_eq!(hasher.finalize(), expected);
    }

    #[test]
    fn test_update_split_across_block_boundary() {
        let data: Vec<u8> = (0..BLOCK_SIZE + 4096).map(|i| (i % 251) as u8).collect();

        let mut whole = DropboxContentHasher::new();
        whole.update(&data);

        let mut pieces = DropboxContentHasher::new();
        for chunk in data.chunks(100_003) {
            pieces.update(chunk);
        }

        assert_eq!(whole.finalize(), pieces.finalize());
    }

    #[test]
    fn test_exact_block_has_single_digest() {
        let data = vec![7u8; BLOCK_SIZE];
        let mut hasher = DropboxContentHasher::new();
        hasher.update(&data);
        assert_eq!(hasher.finalize(), hex::encode(sha256(&sha256(&data))));
    }
}
