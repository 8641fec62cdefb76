//! Remote stores holding the Calibre library.
//!
//! A library lives either in Dropbox or, for development and tests, in a
//! local directory standing in for it. Both expose the same capability set
//! so the validator, the sync engine and the file routes never care which
//! one is configured.

mod dropbox;
mod local;

pub use dropbox::DropboxStore;
pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;

/// Errors raised by a remote store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path does not exist.
    #[error("File not found: {0}")]
    NotFound(String),

    /// Path exists but is a folder.
    #[error("Path is not a file: {0}")]
    NotAFile(String),

    /// Path exists but is a file.
    #[error("Path is not a folder: {0}")]
    NotAFolder(String),

    /// Credential rejected or missing.
    #[error("Dropbox authentication failed: {0}")]
    Auth(String),

    /// Network, timeout or 5xx.
    #[error("Remote request failed: {0}")]
    Transport(String),

    /// Path resolves outside the store root.
    #[error("Path traversal attempt detected: {0}")]
    Security(String),

    /// Local I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected response from the backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Size and modification time of a remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time as reported by the store.
    pub modified: Option<DateTime<Utc>>,
}

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Folder.
    Folder,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    /// Entry name (last path component).
    pub name: String,
    /// File or folder.
    pub kind: EntryKind,
}

/// Requested thumbnail bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    /// Maximum width in pixels.
    pub width: u32,
    /// Maximum height in pixels.
    pub height: u32,
}

impl ThumbnailSize {
    /// Dropbox size tag, e.g. `w128h128`.
    pub fn tag(&self) -> String {
        format!("w{}h{}", self.width, self.height)
    }
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
        }
    }
}

/// Result of one thumbnail request in a batch.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// Path that was requested.
    pub path: String,
    /// JPEG bytes on success.
    pub data: Option<Vec<u8>>,
    /// Short failure reason.
    pub error: Option<String>,
}

/// Uniform capability set of a library store.
///
/// Paths are absolute within the store (`/Calibre Library/metadata.db`);
/// the root folder is `""`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name for logs and `/api/config`.
    fn name(&self) -> &'static str;

    /// Size and modification time, or `None` when the path does not exist.
    async fn metadata(&self, path: &str) -> StorageResult<Option<RemoteMetadata>>;

    /// Entries directly inside `path`.
    async fn list_folder(&self, path: &str) -> StorageResult<Vec<RemoteEntry>>;

    /// Full content of a file.
    async fn download(&self, path: &str) -> StorageResult<Bytes>;

    /// Short-lived URL a browser can fetch the file from.
    async fn temporary_link(&self, path: &str) -> StorageResult<String>;

    /// JPEG thumbnails for a batch of image paths.
    ///
    /// Failures are reported per entry; only a failure of the whole batch
    /// is an error.
    async fn thumbnails(
        &self,
        paths: &[String],
        size: ThumbnailSize,
    ) -> StorageResult<Vec<Thumbnail>> {
        let mut results = Vec::with_capacity(paths.len());

        for path in paths {
            let result = match self.download(path).await {
                Ok(data) => match make_thumbnail(&data, size) {
                    Ok(jpeg) => Thumbnail {
                        path: path.clone(),
                        data: Some(jpeg),
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Failed to generate thumbnail");
                        Thumbnail {
                            path: path.clone(),
                            data: None,
                            error: Some("conversion_error".to_string()),
                        }
                    }
                },
                Err(StorageError::NotFound(_)) | Err(StorageError::NotAFile(_)) => Thumbnail {
                    path: path.clone(),
                    data: None,
                    error: Some("path".to_string()),
                },
                Err(e @ StorageError::Auth(_)) => return Err(e),
                Err(e) => Thumbnail {
                    path: path.clone(),
                    data: None,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }

        Ok(results)
    }
}

/// Resize an image to fit `size` and encode it as JPEG.
pub fn make_thumbnail(data: &[u8], size: ThumbnailSize) -> image::ImageResult<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    // JPEG has no alpha channel
    let thumb = img.thumbnail(size.width, size.height).to_rgb8();

    let mut jpeg = Vec::new();
    image::DynamicImage::ImageRgb8(thumb)
        .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)?;

    Ok(jpeg)
}

/// Ensure a single leading `/` and no trailing `/`.
///
/// The store root normalizes to `""`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Join a library folder and a path relative to it.
pub fn join_path(base: &str, relative: &str) -> String {
    let base = normalize_path(base);
    let relative = relative.trim().trim_start_matches('/');
    if relative.is_empty() {
        base
    } else {
        format!("{}/{}", base, relative)
    }
}
