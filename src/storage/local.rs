//! Local directory standing in for Dropbox.

use super::{EntryKind, RemoteEntry, RemoteMetadata, RemoteStore, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

/// Filesystem-backed store rooted at a fixed directory.
///
/// Every path is resolved relative to the root; a path that would leave
/// the root is rejected with [`StorageError::Security`], never clamped.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open a store rooted at an existing directory.
    pub fn new<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StorageError::NotFound(format!(
                "Local storage path does not exist: {}",
                root.display()
            )));
        }

        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store path to a filesystem path inside the root.
    pub fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        if path.contains('\0') {
            return Err(StorageError::Security(path.to_string()));
        }

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(s) => parts.push(s),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(StorageError::Security(path.to_string()));
                    }
                }
                Component::Prefix(_) => return Err(StorageError::Security(path.to_string())),
            }
        }

        let resolved = parts
            .into_iter()
            .fold(self.root.clone(), |acc, part| acc.join(part));

        // Symlinks inside the root may still point elsewhere
        if let Ok(real) = resolved.canonicalize()
            && !real.starts_with(&self.root)
        {
            return Err(StorageError::Security(path.to_string()));
        }

        Ok(resolved)
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, path: &str) -> StorageResult<Option<RemoteMetadata>> {
        let resolved = self.resolve(path)?;

        let meta = match tokio::fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(RemoteMetadata {
            size: if meta.is_file() { meta.len() } else { 0 },
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    async fn list_folder(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let resolved = self.resolve(path)?;

        if !resolved.exists() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !resolved.is_dir() {
            return Err(StorageError::NotAFolder(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&resolved).await?;
        while let Some(entry) = dir.next_entry().await? {
            let kind = if entry.file_type().await?.is_dir() {
                EntryKind::Folder
            } else {
                EntryKind::File
            };
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn download(&self, path: &str) -> StorageResult<Bytes> {
        let resolved = self.resolve(path)?;

        if !resolved.exists() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !resolved.is_file() {
            return Err(StorageError::NotAFile(path.to_string()));
        }

        let data = tokio::fs::read(&resolved).await?;
        Ok(Bytes::from(data))
    }

    async fn temporary_link(&self, path: &str) -> StorageResult<String> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }

        // No signed URLs locally: hand out the same-origin proxy route
        Ok(format!("/api/local-file?path={}", urlencoding::encode(path)))
    }
}
