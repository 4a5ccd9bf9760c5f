use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::DecodeError;

/// Something that can produce the encoded bytes of an image.
///
/// Sources must support being opened several times, possibly concurrently:
/// every decoder instance reads its own stream.
pub trait ImageSource: Send + Sync {
    /// Stable identifier, used in tile cache keys and logs.
    fn key(&self) -> &str;

    /// Open a fresh stream over the encoded image.
    fn open_stream(&self) -> Result<Box<dyn Read + Send>, DecodeError>;
}

// =============================================================================
// FileImageSource
// =============================================================================

/// Image stored in a local file.
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    key: String,
}

impl FileImageSource {
    /// The key is the path as given.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let key = format!("file://{}", path.display());
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn open_stream(&self) -> Result<Box<dyn Read + Send>, DecodeError> {
        let file = File::open(&self.path).map_err(|e| DecodeError::UnreadableSource {
            reason: format!("{}: {}", self.path.display(), e),
        })?;
        Ok(Box::new(BufReader::new(file)))
    }
}

// =============================================================================
// MemoryImageSource
// =============================================================================

/// Image already held in memory (downloaded, embedded, generated in tests).
#[derive(Debug, Clone)]
pub struct MemoryImageSource {
    key: String,
    data: Bytes,
}

impl MemoryImageSource {
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ImageSource for MemoryImageSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn open_stream(&self) -> Result<Box<dyn Read + Send>, DecodeError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}
