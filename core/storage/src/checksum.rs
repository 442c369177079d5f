//! Content checksums over folder entries.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provider::StorageProvider;
use crate::CHUNK_SIZE;
use peersync_common::{FolderPath, Result};

type Blake2b256 = Blake2b<U32>;

const DIRECTORY_MARKER: &str = "directory";

/// Hex-encoded BLAKE2b-256 digest of a file, or the directory marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// The fixed value every directory hashes to.
    pub fn directory() -> Self {
        Self(DIRECTORY_MARKER.to_string())
    }

    pub fn is_directory(&self) -> bool {
        self.0 == DIRECTORY_MARKER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl From<String> for ContentHash {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the checksum of whatever is currently stored at `path`.
///
/// Files are streamed in `CHUNK_SIZE` pieces so large files never sit in
/// memory at once.
///
/// # Errors
/// - Path not found
pub async fn content_hash<P: StorageProvider + ?Sized>(
    provider: &P,
    path: &FolderPath,
) -> Result<ContentHash> {
    let metadata = provider.metadata(path).await?;
    if metadata.is_directory {
        return Ok(ContentHash::directory());
    }

    let mut hasher = Blake2b256::new();
    let mut offset = 0u64;
    loop {
        let chunk = provider.read_chunk(path, offset, CHUNK_SIZE).await?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
        offset += chunk.len() as u64;
        if chunk.len() < CHUNK_SIZE {
            break;
        }
    }

    Ok(ContentHash(hex::encode(hasher.finalize())))
}
