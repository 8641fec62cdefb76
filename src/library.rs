//! Locating Calibre libraries in remote storage.

use crate::error::{AppError, Result};
use crate::storage::{EntryKind, RemoteStore, join_path, normalize_path};
use crate::sync::METADATA_DB;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A folder confirmed to hold a Calibre `metadata.db`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedLibrary {
    /// Normalized library path.
    pub path: String,
    /// Size of `metadata.db` in bytes.
    pub metadata_size: u64,
    /// Last modification of `metadata.db`, if the store reports one.
    pub metadata_modified: Option<DateTime<Utc>>,
}

/// Check that `library_path` contains a `metadata.db`.
///
/// When it does not, up to `max_suggestions` top-level folders are probed
/// and the ones that do hold a `metadata.db` are reported in the error.
pub async fn validate_library_path(
    store: &dyn RemoteStore,
    library_path: &str,
    max_suggestions: usize,
) -> Result<ValidatedLibrary> {
    let path = normalize_path(library_path);
    if path.is_empty() {
        return Err(AppError::BadRequest("Library path is required".to_string()));
    }

    if let Some(meta) = store.metadata(&join_path(&path, METADATA_DB)).await? {
        tracing::debug!("Found {} under {} ({} bytes)", METADATA_DB, path, meta.size);
        return Ok(ValidatedLibrary {
            path,
            metadata_size: meta.size,
            metadata_modified: meta.modified,
        });
    }

    let suggestions = find_libraries(store, max_suggestions).await;
    tracing::info!(
        "No {} at {} ({} candidate libraries found)",
        METADATA_DB,
        path,
        suggestions.len()
    );

    Err(AppError::LibraryNotFound { path, suggestions })
}

/// Top-level folders of the store that contain a `metadata.db`.
///
/// Only the first listing page is considered and at most `max_probes`
/// folders are checked. Probe failures count as "not a library".
pub async fn find_libraries(store: &dyn RemoteStore, max_probes: usize) -> Vec<String> {
    let entries = match store.list_folder("").await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to list storage root: {}", e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for entry in entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::Folder)
        .take(max_probes)
    {
        let folder = normalize_path(&entry.name);
        if let Ok(Some(_)) = store.metadata(&join_path(&folder, METADATA_DB)).await {
            found.push(folder);
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    fn store_with_libraries(libraries: &[&str], plain: &[&str]) -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        for name in libraries {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join(METADATA_DB), b"db").unwrap();
        }
        for name in plain {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let store = LocalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_valid_library() {
        let (_dir, store) = store_with_libraries(&["Calibre Library"], &[]);
        let library = validate_library_path(&store, "Calibre Library/", 50)
            .await
            .unwrap();

        assert_eq!(library.path, "/Calibre Library");
        assert_eq!(library.metadata_size, 2);
        assert!(library.metadata_modified.is_some());
    }

    #[tokio::test]
    async fn test_missing_library_suggests_siblings() {
        let (_dir, store) = store_with_libraries(&["Books"], &["Photos", "Music"]);
        let err = validate_library_path(&store, "/Nonexistent", 50)
            .await
            .unwrap_err();

        match &err {
            AppError::LibraryNotFound { path, suggestions } => {
                assert_eq!(path, "/Nonexistent");
                assert_eq!(suggestions, &vec!["/Books".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("/Books"));
    }

    #[tokio::test]
    async fn test_missing_library_without_suggestions() {
        let (_dir, store) = store_with_libraries(&[], &["Photos"]);
        let err = validate_library_path(&store, "/Nonexistent", 50)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Calibre Library folder"));
    }

    #[tokio::test]
    async fn test_probe_count_is_bounded() {
        let (_dir, store) = store_with_libraries(&["B-lib", "C-lib"], &["A-plain"]);
        assert_eq!(find_libraries(&store, 2).await, vec!["/B-lib".to_string()]);
        assert_eq!(find_libraries(&store, 0).await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected() {
        let (_dir, store) = store_with_libraries(&["Books"], &[]);
        assert!(matches!(
            validate_library_path(&store, " / ", 50).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let (_dir, store) = store_with_libraries(&["Books"], &[]);
        let err = validate_library_path(&store, "/../etc", 50).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Storage(crate::storage::StorageError::Security(_))
        ));
    }
}
