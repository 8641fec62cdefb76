//! Synchronization of the Calibre `metadata.db` into local storage.
//!
//! The local copy is only ever replaced through a temp file that is
//! flushed to disk and renamed over the target, so a reader sees either
//! the previous complete database or the new one.

mod shared_link;

pub use shared_link::{SharedLink, normalize_shared_link};

use crate::error::{AppError, Result};
use crate::storage::{RemoteStore, join_path};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Fixed name of the Calibre metadata database.
pub const METADATA_DB: &str = "metadata.db";

/// First 16 bytes of every SQLite 3 database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Suffix of the file recording which source the local copy came from.
const SOURCE_SUFFIX: &str = ".source";

/// Local file header of a ZIP archive.
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Something the sync engine can pull a database from.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Human-readable origin for logs and reports.
    fn describe(&self) -> String;

    /// Identity recorded next to the local copy; defaults to [`describe`](Self::describe).
    fn identity(&self) -> String {
        self.describe()
    }

    /// Remote modification time, `None` when the source cannot tell.
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>>;

    /// Full database content.
    async fn fetch(&self) -> Result<Bytes>;
}

/// `metadata.db` inside a library folder of a remote store.
pub struct StoreSource<'a> {
    store: &'a dyn RemoteStore,
    path: String,
}

impl<'a> StoreSource<'a> {
    /// Source for `<library_path>/metadata.db`.
    pub fn new(store: &'a dyn RemoteStore, library_path: &str) -> Self {
        Self {
            store,
            path: join_path(library_path, METADATA_DB),
        }
    }

    /// Remote path of the database.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl<'a> SyncSource for StoreSource<'a> {
    fn describe(&self) -> String {
        format!("{}:{}", self.store.name(), self.path)
    }

    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .metadata(&self.path)
            .await?
            .and_then(|m| m.modified))
    }

    async fn fetch(&self) -> Result<Bytes> {
        Ok(self.store.download(&self.path).await?)
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Bytes written.
    pub size: u64,
    /// Where the database came from.
    pub path: String,
    /// Remote modification time stamped on the local copy.
    pub modified: Option<DateTime<Utc>>,
}

/// Result of a conditional sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    /// Whether a download happened.
    pub synced: bool,
    /// Download details when `synced`.
    #[serde(flatten)]
    pub report: Option<SyncReport>,
}

/// Keeps the local copy of `metadata.db` current.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    local_path: PathBuf,
    min_size: usize,
}

impl SyncEngine {
    /// Create an engine writing to `local_path`.
    ///
    /// Downloads shorter than `min_size` bytes are rejected.
    pub fn new(local_path: impl Into<PathBuf>, min_size: usize) -> Self {
        Self {
            local_path: local_path.into(),
            min_size: min_size.max(SQLITE_MAGIC.len()),
        }
    }

    /// Path of the synced database.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Path of the file naming the source of the local copy.
    pub fn source_marker_path(&self) -> PathBuf {
        let mut name = self.local_path.as_os_str().to_os_string();
        name.push(SOURCE_SUFFIX);
        PathBuf::from(name)
    }

    /// Identity of the source the local copy was last synced from.
    pub async fn synced_from(&self) -> Option<String> {
        tokio::fs::read_to_string(self.source_marker_path())
            .await
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    /// Whether the local copy is missing, empty, from another source or
    /// older than the remote.
    ///
    /// Any doubt (unreadable local file, unknown or unreachable remote
    /// timestamp) counts as stale.
    pub async fn needs_sync(&self, source: &dyn SyncSource) -> bool {
        let local_modified = match tokio::fs::metadata(&self.local_path).await {
            Ok(meta) if meta.len() > 0 => match meta.modified() {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(_) => return true,
            },
            _ => return true,
        };

        if self.synced_from().await.as_deref() != Some(source.identity().as_str()) {
            tracing::debug!(source = %source.describe(), "Local copy came from another source");
            return true;
        }

        match source.last_modified().await {
            Ok(Some(remote_modified)) => remote_modified.naive_utc() > local_modified.naive_utc(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(source = %source.describe(), error = %e, "Staleness check failed, assuming stale");
                true
            }
        }
    }

    /// Download, validate and atomically install the database.
    pub async fn sync(&self, source: &dyn SyncSource) -> Result<SyncReport> {
        let origin = source.describe();
        tracing::info!(source = %origin, "Syncing metadata database");

        // Read the timestamp before the content so the stamp is never newer
        let modified = source.last_modified().await.unwrap_or_else(|e| {
            tracing::debug!(source = %origin, error = %e, "No remote timestamp");
            None
        });

        let content = source.fetch().await?;
        validate_database(&content, self.min_size)?;

        let size = content.len() as u64;
        let target = self.local_path.clone();
        let marker = self.source_marker_path();
        let identity = source.identity();
        tokio::task::spawn_blocking(move || install(&target, &marker, &content, modified, &identity))
            .await
            .map_err(|e| AppError::Internal(format!("Sync task failed: {}", e)))??;

        tracing::info!(source = %origin, size, local = %self.local_path.display(), "Database synced");

        Ok(SyncReport {
            size,
            path: origin,
            modified,
        })
    }

    /// Sync when stale, or unconditionally with `force`.
    pub async fn sync_if_needed(&self, source: &dyn SyncSource, force: bool) -> Result<SyncOutcome> {
        if !force && !self.needs_sync(source).await {
            tracing::debug!(source = %source.describe(), "Local database is current");
            return Ok(SyncOutcome {
                synced: false,
                report: None,
            });
        }

        let report = self.sync(source).await?;
        Ok(SyncOutcome {
            synced: true,
            report: Some(report),
        })
    }
}

/// Check that downloaded bytes look like a SQLite database.
pub fn validate_database(content: &[u8], min_size: usize) -> Result<()> {
    if content.starts_with(SQLITE_MAGIC) && content.len() >= min_size {
        return Ok(());
    }

    if content.starts_with(ZIP_MAGIC) {
        return Err(AppError::Validation(
            "Downloaded file is a ZIP archive, not a SQLite database. \
             This usually means a folder link was used; share the metadata.db file itself."
                .to_string(),
        ));
    }

    if content.len() < min_size {
        return Err(AppError::Validation(format!(
            "Downloaded file is too small to be a Calibre database ({} bytes). \
             Check that the link points to metadata.db.",
            content.len()
        )));
    }

    Err(AppError::Validation(
        "Downloaded file is not a valid SQLite database. \
         Check that the path points to a Calibre library."
            .to_string(),
    ))
}

/// Replace the database at `target` and record `identity` in `marker`.
///
/// The marker is removed before the database is replaced and rewritten
/// after it, so an interrupted install leaves no marker behind.
fn install(
    target: &Path,
    marker: &Path,
    content: &[u8],
    modified: Option<DateTime<Utc>>,
    identity: &str,
) -> Result<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    match fs::remove_file(marker) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    write_atomic(&dir, target, content, modified)?;
    write_atomic(&dir, marker, identity.as_bytes(), None)?;

    // Persist the renames themselves
    if let Ok(d) = File::open(&dir) {
        let _ = d.sync_all();
    }

    Ok(())
}

/// Write `content` to a temp file in `dir`, flush it and rename it over `target`.
fn write_atomic(
    dir: &Path,
    target: &Path,
    content: &[u8],
    modified: Option<DateTime<Utc>>,
) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| METADATA_DB.to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        if let Some(ts) = modified {
            file.set_modified(ts.into())?;
        }
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written.and_then(|_| fs::rename(&tmp, target)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// In-memory source with a controllable timestamp.
    struct FakeSource {
        name: &'static str,
        content: Vec<u8>,
        modified: Mutex<Option<DateTime<Utc>>>,
    }

    impl FakeSource {
        fn new(content: Vec<u8>, modified: Option<DateTime<Utc>>) -> Self {
            Self::named("fake", content, modified)
        }

        fn named(name: &'static str, content: Vec<u8>, modified: Option<DateTime<Utc>>) -> Self {
            Self {
                name,
                content,
                modified: Mutex::new(modified),
            }
        }

        fn set_modified(&self, ts: Option<DateTime<Utc>>) {
            *self.modified.lock().unwrap() = ts;
        }
    }

    #[async_trait]
    impl SyncSource for FakeSource {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(*self.modified.lock().unwrap())
        }

        async fn fetch(&self) -> Result<Bytes> {
            Ok(Bytes::from(self.content.clone()))
        }
    }

    fn sqlite_bytes(len: usize) -> Vec<u8> {
        let mut data = SQLITE_MAGIC.to_vec();
        data.resize(len, 0xAB);
        data
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_validate_database() {
        assert!(validate_database(&sqlite_bytes(1024), 512).is_ok());
        assert!(validate_database(&sqlite_bytes(100), 512).is_err());
        assert!(validate_database(b"", 512).is_err());

        let mut zip = b"PK\x03\x04".to_vec();
        zip.resize(2048, 0);
        let err = validate_database(&zip, 512).unwrap_err().to_string();
        assert!(err.contains("folder link"), "{err}");

        let html = b"<!DOCTYPE html>".repeat(100);
        let err = validate_database(&html, 512).unwrap_err().to_string();
        assert!(err.contains("not a valid SQLite database"), "{err}");
    }

    #[tokio::test]
    async fn test_needs_sync_when_local_missing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);
        let source = FakeSource::new(sqlite_bytes(1024), Some(ts(1_700_000_000)));

        assert!(engine.needs_sync(&source).await);
    }

    #[tokio::test]
    async fn test_needs_sync_when_local_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_DB);
        std::fs::write(&path, b"").unwrap();
        let engine = SyncEngine::new(&path, 512);
        let source = FakeSource::new(sqlite_bytes(1024), Some(ts(0)));

        assert!(engine.needs_sync(&source).await);
    }

    #[tokio::test]
    async fn test_sync_then_current_until_remote_changes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);
        let source = FakeSource::new(sqlite_bytes(1024), Some(ts(1_700_000_000)));

        let report = engine.sync(&source).await.unwrap();
        assert_eq!(report.size, 1024);
        assert_eq!(report.modified, Some(ts(1_700_000_000)));
        assert_eq!(std::fs::read(engine.local_path()).unwrap(), sqlite_bytes(1024));

        // Local mtime now equals the remote timestamp
        assert!(!engine.needs_sync(&source).await);

        source.set_modified(Some(ts(1_700_000_001)));
        assert!(engine.needs_sync(&source).await);

        // Unknown remote timestamp is treated as stale
        source.set_modified(None);
        assert!(engine.needs_sync(&source).await);
    }

    #[tokio::test]
    async fn test_invalid_content_leaves_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);

        let good = FakeSource::new(sqlite_bytes(2048), Some(ts(1_000)));
        engine.sync(&good).await.unwrap();

        for bad in [
            b"not a database at all".repeat(100),
            {
                let mut zip = b"PK\x03\x04".to_vec();
                zip.resize(4096, 1);
                zip
            },
            b"SQLite format 3\0".to_vec(),
            Vec::new(),
        ] {
            let source = FakeSource::new(bad, Some(ts(2_000)));
            assert!(matches!(
                engine.sync(&source).await,
                Err(AppError::Validation(_))
            ));
            assert_eq!(std::fs::read(engine.local_path()).unwrap(), sqlite_bytes(2048));
        }

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_switching_source_resyncs_older_database() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);
        let newer = FakeSource::named("library-a", sqlite_bytes(2048), Some(ts(9_000)));
        let older = FakeSource::named("library-b", sqlite_bytes(1024), Some(ts(1_000)));

        engine.sync(&newer).await.unwrap();
        assert_eq!(engine.synced_from().await.as_deref(), Some("library-a"));
        assert!(!engine.needs_sync(&newer).await);

        // Older remote, but a different library
        assert!(engine.needs_sync(&older).await);
        assert!(engine.sync_if_needed(&older, false).await.unwrap().synced);
        assert_eq!(std::fs::read(engine.local_path()).unwrap(), sqlite_bytes(1024));
        assert_eq!(engine.synced_from().await.as_deref(), Some("library-b"));

        assert!(engine.needs_sync(&newer).await);
        assert!(!engine.needs_sync(&older).await);
    }

    #[tokio::test]
    async fn test_local_copy_without_marker_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);
        let source = FakeSource::new(sqlite_bytes(1024), Some(ts(1_000)));

        engine.sync(&source).await.unwrap();
        assert!(!engine.needs_sync(&source).await);

        std::fs::remove_file(engine.source_marker_path()).unwrap();
        assert!(engine.needs_sync(&source).await);
    }

    #[tokio::test]
    async fn test_sync_if_needed_skips_current_copy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(dir.path().join(METADATA_DB), 512);
        let source = FakeSource::new(sqlite_bytes(1024), Some(ts(5_000)));

        assert!(engine.sync_if_needed(&source, false).await.unwrap().synced);
        assert!(!engine.sync_if_needed(&source, false).await.unwrap().synced);
        assert!(engine.sync_if_needed(&source, true).await.unwrap().synced);
    }

    #[tokio::test]
    async fn test_store_source_reads_library_folder() {
        let remote = tempfile::tempdir().unwrap();
        let library = remote.path().join("Calibre Library");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(library.join(METADATA_DB), sqlite_bytes(4096)).unwrap();

        let store = LocalStore::new(remote.path()).unwrap();
        let source = StoreSource::new(&store, "Calibre Library/");
        assert_eq!(source.path(), "/Calibre Library/metadata.db");

        let local = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(local.path().join(METADATA_DB), 512);
        assert!(engine.needs_sync(&source).await);

        let report = engine.sync(&source).await.unwrap();
        assert_eq!(report.size, 4096);
        assert!(!engine.needs_sync(&source).await);

        let missing = StoreSource::new(&store, "/Elsewhere");
        assert!(engine.sync(&missing).await.is_err());
    }
}
