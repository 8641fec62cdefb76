//! Application state shared across handlers.

use crate::auth::SharedSecret;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::storage::{RemoteStore, StorageError};
use crate::sync::{SharedLink, StoreSource, SyncEngine, SyncOutcome};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Shared secret checked on every API request.
    pub secret: Arc<SharedSecret>,
    /// Local copy of `metadata.db`.
    pub sync: SyncEngine,
    /// Queries against the local copy.
    pub catalog: Catalog,
    /// Remote store, or why it could not be built.
    store: std::result::Result<Arc<dyn RemoteStore>, Arc<str>>,
}

impl AppState {
    /// Build state from config, opening the configured store.
    ///
    /// A missing Dropbox token does not fail startup; requests that need
    /// the store report it instead.
    pub fn new(config: Config) -> Result<Self> {
        let store = match config.open_store() {
            Ok(store) => Ok(store),
            Err(AppError::Storage(StorageError::Auth(msg))) => {
                tracing::warn!("Remote store unavailable: {}", msg);
                Err(Arc::from(msg))
            }
            Err(e) => return Err(e),
        };

        Self::build(config, store)
    }

    /// Build state around an already opened store.
    pub fn with_store(config: Config, store: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::build(config, Ok(store))
    }

    fn build(
        config: Config,
        store: std::result::Result<Arc<dyn RemoteStore>, Arc<str>>,
    ) -> Result<Self> {
        let secret = SharedSecret::from_config(&config.auth)?;
        if !secret.is_configured() {
            tracing::warn!("No shared secret configured, API requests will be refused");
        }

        let sync = SyncEngine::new(&config.sync.local_path, config.sync.min_size_bytes);
        let catalog = Catalog::new(&config.sync.local_path);

        Ok(Self {
            config: Arc::new(config),
            secret: Arc::new(secret),
            sync,
            catalog,
            store,
        })
    }

    /// The remote store, or the configuration problem that prevents it.
    pub fn store(&self) -> Result<Arc<dyn RemoteStore>> {
        self.store
            .clone()
            .map_err(|msg| StorageError::Auth(msg.to_string()).into())
    }

    /// Whether the remote store is usable.
    pub fn store_available(&self) -> bool {
        self.store.is_ok()
    }

    /// Sync the local copy from a library folder when it is stale.
    pub async fn sync_library(&self, library_path: &str, force: bool) -> Result<SyncOutcome> {
        let store = self.store()?;
        let source = StoreSource::new(store.as_ref(), library_path);
        self.sync.sync_if_needed(&source, force).await
    }

    /// Sync the local copy from a public shared link when it is stale.
    pub async fn sync_shared_link(&self, link: &str, force: bool) -> Result<SyncOutcome> {
        let source = SharedLink::new(link)?;
        self.sync.sync_if_needed(&source, force).await
    }

    /// Make the local copy current before a query.
    ///
    /// Without a library path the configured shared link is used, and
    /// without either the existing local copy is served as is. A failed
    /// transfer falls back to an existing local copy.
    pub async fn ensure_fresh(&self, library_path: Option<&str>) -> Result<()> {
        let result = match (library_path, self.config.storage.shared_link.as_deref()) {
            (Some(path), _) => self.sync_library(path, false).await,
            (None, Some(link)) => self.sync_shared_link(link, false).await,
            (None, None) => return Ok(()),
        };

        match result {
            Ok(_) => Ok(()),
            Err(AppError::Storage(StorageError::Transport(e))) if self.catalog.path().is_file() => {
                tracing::warn!(error = %e, "Sync failed, serving existing local copy");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RemoteEntry, RemoteMetadata, StorageResult};
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Store whose every call fails with the same error.
    struct BrokenStore {
        error: fn(String) -> StorageError,
    }

    #[async_trait]
    impl RemoteStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn metadata(&self, path: &str) -> StorageResult<Option<RemoteMetadata>> {
            Err((self.error)(path.to_string()))
        }

        async fn list_folder(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
            Err((self.error)(path.to_string()))
        }

        async fn download(&self, path: &str) -> StorageResult<Bytes> {
            Err((self.error)(path.to_string()))
        }

        async fn temporary_link(&self, path: &str) -> StorageResult<String> {
            Err((self.error)(path.to_string()))
        }
    }

    fn state_with(dir: &tempfile::TempDir, error: fn(String) -> StorageError) -> AppState {
        let mut config = Config::default();
        config.sync.local_path = dir.path().join("metadata.db");
        AppState::with_store(config, Arc::new(BrokenStore { error })).unwrap()
    }

    #[tokio::test]
    async fn test_transport_failure_without_local_copy_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, StorageError::Transport);

        let err = state.ensure_fresh(Some("/Calibre Library")).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(StorageError::Transport(_))));
        assert!(!state.catalog.path().exists());
    }

    #[tokio::test]
    async fn test_transport_failure_serves_existing_copy() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, StorageError::Transport);
        std::fs::write(state.catalog.path(), b"previous copy").unwrap();

        state.ensure_fresh(Some("/Calibre Library")).await.unwrap();
        assert_eq!(std::fs::read(state.catalog.path()).unwrap(), b"previous copy");
    }

    #[tokio::test]
    async fn test_other_failures_propagate_despite_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, StorageError::NotFound);
        std::fs::write(state.catalog.path(), b"previous copy").unwrap();

        let err = state.ensure_fresh(Some("/Calibre Library")).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_no_source_leaves_local_copy_alone() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, StorageError::Transport);

        state.ensure_fresh(None).await.unwrap();
        assert!(!state.catalog.path().exists());
    }
}
