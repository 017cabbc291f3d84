//! Files offered for sending
//!
//! A file is opened only when its turn in the queue comes, so a handle
//! that went stale while queued fails that one transfer and nothing else.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncRead;

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Something that can be read from the start, possibly more than once
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn open(&self) -> io::Result<FileReader>;
}

/// File on disk
pub struct PathSource {
    path: PathBuf,
}

impl PathSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FileSource for PathSource {
    async fn open(&self) -> io::Result<FileReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

/// In-memory contents
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn open(&self) -> io::Result<FileReader> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }
}

/// A file handed to the orchestrator
#[derive(Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Unix millis
    pub last_modified: u64,
    pub source: Arc<dyn FileSource>,
}

/// Identity used to keep transfer ids stable across repeated enqueues
pub(crate) type FileKey = (String, u64, u64);

impl OutgoingFile {
    /// Describe a file on disk
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Ok(Self {
            mime_type: mime_from_name(&name).to_string(),
            name,
            size: metadata.len(),
            last_modified,
            source: Arc::new(PathSource::new(path)),
        })
    }

    /// Describe in-memory contents
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        Self {
            mime_type: mime_from_name(&name).to_string(),
            name,
            size: data.len() as u64,
            last_modified: 0,
            source: Arc::new(MemorySource::new(data)),
        }
    }

    pub(crate) fn key(&self) -> FileKey {
        (self.name.clone(), self.size, self.last_modified)
    }
}

/// Guess a mime type from the file extension
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
