use crate::error::{AppError, Result};
use crate::storage::{DropboxStore, LocalStore, RemoteStore, ThumbnailSize};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Web backend for browsing a Calibre library kept in Dropbox.
#[derive(Parser, Debug, Clone)]
#[command(name = "calibre-web-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "CALIBRE_WEB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Write a default config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },

    /// Check that a folder in storage is a Calibre library.
    Validate {
        /// Library folder, e.g. "/Calibre Library".
        library_path: String,
    },

    /// Download the library database to the configured local path.
    Sync {
        /// Library folder in storage.
        library_path: Option<String>,
        /// Download even when the local copy is current.
        #[arg(short, long)]
        force: bool,
        /// Public shared link to metadata.db, instead of the store.
        #[arg(long)]
        link: Option<String>,
    },

    /// Generate a sample Calibre library.
    Fixtures {
        /// Directory that receives the "Calibre Library" folder.
        dir: PathBuf,
        /// Number of random books besides the canary.
        #[arg(long, default_value_t = 25)]
        books: usize,
        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Print an argon2 hash for `auth.password_hash`.
    HashPassword {
        /// Password (will prompt if not provided).
        password: Option<String>,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Local database copy.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Paging limits.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Library lookup.
    #[serde(default)]
    pub library: LibraryConfig,

    /// Cover thumbnails.
    #[serde(default)]
    pub covers: CoversConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Display title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Built frontend to serve for non-API paths.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            static_dir: None,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        5000,
    )
}

fn default_title() -> String {
    "Calibre Library".to_string()
}

/// Shared-secret authentication.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Plaintext shared secret.
    #[serde(default)]
    pub password: Option<String>,

    /// Argon2 PHC hash of the shared secret; wins over `password`.
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_hash", &self.password_hash.is_some())
            .finish()
    }
}

/// Which storage the library lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Dropbox HTTP API.
    #[default]
    Dropbox,
    /// Local directory standing in for Dropbox.
    Local,
}

impl StorageBackend {
    /// Name used in config and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Dropbox => "dropbox",
            StorageBackend::Local => "local",
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dropbox" => Ok(StorageBackend::Dropbox),
            "local" => Ok(StorageBackend::Local),
            other => Err(AppError::Config(format!(
                "Unknown storage backend '{}', expected 'dropbox' or 'local'",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selected backend.
    #[serde(default)]
    pub backend: StorageBackend,

    /// Dropbox settings.
    #[serde(default)]
    pub dropbox: DropboxConfig,

    /// Local directory settings.
    #[serde(default)]
    pub local: LocalConfig,

    /// Public shared link to a `metadata.db`, used when a sync names no library.
    #[serde(default)]
    pub shared_link: Option<String>,
}

/// Dropbox settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DropboxConfig {
    /// OAuth access token.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl std::fmt::Debug for DropboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxConfig")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Local directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory that plays the role of the Dropbox root.
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
        }
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("test_data")
}

/// Local database copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Where the synced `metadata.db` is written.
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    /// Downloads smaller than this are rejected.
    #[serde(default = "default_min_size")]
    pub min_size_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
            min_size_bytes: default_min_size(),
        }
    }
}

fn default_local_path() -> PathBuf {
    PathBuf::from("metadata.db")
}

fn default_min_size() -> usize {
    512
}

/// Paging limits for book lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Page size when the request gives none.
    #[serde(default = "default_per_page")]
    pub default_per_page: u32,

    /// Largest page size served.
    #[serde(default = "default_max_per_page")]
    pub max_per_page: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_per_page: default_per_page(),
            max_per_page: default_max_per_page(),
        }
    }
}

fn default_per_page() -> u32 {
    20
}

fn default_max_per_page() -> u32 {
    100
}

/// Library lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Most top-level folders probed when suggesting libraries.
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            max_suggestions: default_max_suggestions(),
        }
    }
}

fn default_max_suggestions() -> usize {
    50
}

/// Cover thumbnails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoversConfig {
    /// Thumbnail bounding box width.
    #[serde(default = "default_thumbnail_edge")]
    pub width: u32,

    /// Thumbnail bounding box height.
    #[serde(default = "default_thumbnail_edge")]
    pub height: u32,

    /// Most covers returned per request.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for CoversConfig {
    fn default() -> Self {
        Self {
            width: default_thumbnail_edge(),
            height: default_thumbnail_edge(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl CoversConfig {
    /// Thumbnail size for the store.
    pub fn size(&self) -> ThumbnailSize {
        ThumbnailSize {
            width: self.width,
            height: self.height,
        }
    }
}

fn default_thumbnail_edge() -> u32 {
    128
}

fn default_batch_limit() -> usize {
    25
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("calibre-web-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("calibre-web-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/calibre-web-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(password) = get("APP_PASSWORD") {
            self.auth.password = Some(password);
        }
        if let Some(backend) = get("STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(token) = get("DROPBOX_ACCESS_TOKEN") {
            self.storage.dropbox.access_token = Some(token);
        }
        if let Some(root) = get("LOCAL_STORAGE_PATH") {
            self.storage.local.root = PathBuf::from(root);
        }
        if let Some(link) = get("DROPBOX_SHARED_LINK") {
            self.storage.shared_link = Some(link);
        }
        if let Some(port) = get("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid PORT value: {}", port)))?;
            self.server.bind.set_port(port);
        }

        Ok(())
    }

    /// Build the configured remote store.
    ///
    /// A missing Dropbox token is reported as a storage auth error, a
    /// missing local root as a storage not-found error.
    pub fn open_store(&self) -> Result<Arc<dyn RemoteStore>> {
        let store: Arc<dyn RemoteStore> = match self.storage.backend {
            StorageBackend::Dropbox => {
                let token = self.storage.dropbox.access_token.clone().unwrap_or_default();
                Arc::new(DropboxStore::new(token)?)
            }
            StorageBackend::Local => {
                let store = LocalStore::new(&self.storage.local.root)?;
                tracing::info!(root = %store.root().display(), "Using local storage");
                Arc::new(store)
            }
        };

        Ok(store)
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# calibre-web-rs configuration

[server]
bind = "0.0.0.0:5000"
title = "Calibre Library"
# static_dir = "frontend/dist"

[auth]
# Shared secret sent by clients in the X-App-Password header.
# password = "change-me"
# Or an argon2 hash from `calibre-web-rs hash-password`
# password_hash = "$argon2id$..."

[storage]
# "dropbox" or "local"
backend = "dropbox"
# shared_link = "https://www.dropbox.com/s/.../metadata.db?dl=0"

[storage.dropbox]
# access_token = "..."

[storage.local]
root = "test_data"

[sync]
local_path = "metadata.db"
min_size_bytes = 512

[catalog]
default_per_page = 20
max_per_page = 100

[library]
max_suggestions = 50

[covers]
width = 128
height = 128
batch_limit = 25
"#
        .to_string()
    }
}
