//! Flat archive container.
//!
//! An archive is an ordered list of `(relative path, is_directory, bytes)`
//! entries. Directories are zero-byte marker entries. The encoding is:
//!
//! ```text
//! magic "PSAR" | version u8 | entry count u32
//! per entry: path len u32 | path utf-8 | is_directory u8 | content len u64 | content
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use peersync_common::{Error, FolderPath, Result};

const MAGIC: &[u8; 4] = b"PSAR";
const FORMAT_VERSION: u8 = 1;

/// One archived file or directory marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the archive root, `/`-separated, no leading separator.
    pub path: String,
    pub is_directory: bool,
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            is_directory: false,
            content,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: true,
            content: Vec::new(),
        }
    }
}

/// A flat list of archived entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    pub entries: Vec<ArchiveEntry>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ArchiveEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a file entry by path.
    pub fn file(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries
            .iter()
            .find(|e| !e.is_directory && e.path == path)
    }

    /// Serialize to the container format.
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self
            .entries
            .iter()
            .map(|e| 4 + e.path.len() + 1 + 8 + e.content.len())
            .sum();
        let mut buf = BytesMut::with_capacity(MAGIC.len() + 1 + 4 + payload);

        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u32(entry.path.len() as u32);
            buf.put_slice(entry.path.as_bytes());
            buf.put_u8(u8::from(entry.is_directory));
            buf.put_u64(entry.content.len() as u64);
            buf.put_slice(&entry.content);
        }

        buf.to_vec()
    }

    /// Parse the container format.
    ///
    /// # Errors
    /// - Bad magic or unsupported format version
    /// - Truncated input or trailing bytes
    /// - Entry paths that are absolute or escape the root
    /// - Directory entries carrying content
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        if buf.remaining() < MAGIC.len() + 1 + 4 || &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::Serialization("Not an archive".to_string()));
        }
        buf.advance(MAGIC.len());

        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported archive version {}",
                version
            )));
        }

        let count = buf.get_u32() as usize;
        let mut entries = Vec::with_capacity(count.min(4096));

        for index in 0..count {
            let path_len = take_u32(&mut buf, index)? as usize;
            let path_bytes = take_bytes(&mut buf, path_len, index)?;
            let path = String::from_utf8(path_bytes).map_err(|_| {
                Error::Serialization(format!("Entry {} has a non UTF-8 path", index))
            })?;
            validate_path(&path)?;

            if buf.remaining() < 1 {
                return Err(truncated(index));
            }
            let is_directory = match buf.get_u8() {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::Serialization(format!(
                        "Entry {} has invalid kind flag {}",
                        index, other
                    )))
                }
            };

            if buf.remaining() < 8 {
                return Err(truncated(index));
            }
            let content_len = buf.get_u64() as usize;
            let content = take_bytes(&mut buf, content_len, index)?;

            if is_directory && !content.is_empty() {
                return Err(Error::Serialization(format!(
                    "Directory entry '{}' carries content",
                    path
                )));
            }

            entries.push(ArchiveEntry {
                path,
                is_directory,
                content,
            });
        }

        if buf.has_remaining() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after archive",
                buf.remaining()
            )));
        }

        Ok(Self { entries })
    }
}

fn truncated(index: usize) -> Error {
    Error::Serialization(format!("Archive truncated in entry {}", index))
}

fn take_u32(buf: &mut &[u8], index: usize) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(index));
    }
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut &[u8], len: usize, index: usize) -> Result<Vec<u8>> {
    if buf.remaining() < len {
        return Err(truncated(index));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(Error::Serialization(format!(
            "Archive path '{}' must be relative and non-empty",
            path
        )));
    }
    FolderPath::parse(path)
        .map(|_| ())
        .map_err(|e| Error::Serialization(format!("Archive path '{}': {}", path, e)))
}
