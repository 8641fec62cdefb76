//! calibre-web-rs entry point.

use calibre_web_rs::{
    auth,
    config::{Cli, Command, Config},
    fixtures, library, server,
    sync::{SharedLink, StoreSource, SyncEngine},
};
use clap::Parser;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calibre_web_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let mut config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };
    config.apply_env()?;

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Validate { library_path }) => cmd_validate(&config, &library_path).await,
        Some(Command::Sync {
            library_path,
            force,
            link,
        }) => cmd_sync(&config, library_path, link, force).await,
        Some(Command::Fixtures { dir, books, seed }) => cmd_fixtures(dir, books, seed),
        Some(Command::HashPassword { password }) => cmd_hash_password(password),
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());
    println!("\nSet auth.password (or APP_PASSWORD) and a storage backend, then run:");
    println!("  calibre-web-rs serve");

    Ok(())
}

/// Check a library folder and print what was found.
async fn cmd_validate(config: &Config, library_path: &str) -> anyhow::Result<()> {
    let store = config.open_store()?;
    let found =
        library::validate_library_path(store.as_ref(), library_path, config.library.max_suggestions)
            .await?;

    println!("Library: {}", found.path);
    println!("metadata.db: {} bytes", found.metadata_size);
    if let Some(modified) = found.metadata_modified {
        println!("Modified: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

/// Sync the local database once.
async fn cmd_sync(
    config: &Config,
    library_path: Option<String>,
    link: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let engine = SyncEngine::new(&config.sync.local_path, config.sync.min_size_bytes);

    let link = link.filter(|l| !l.trim().is_empty());
    let outcome = match (link, library_path) {
        (Some(link), _) => {
            let source = SharedLink::new(&link)?;
            engine.sync_if_needed(&source, force).await?
        }
        (None, Some(path)) => {
            let store = config.open_store()?;
            library::validate_library_path(store.as_ref(), &path, config.library.max_suggestions)
                .await?;
            let source = StoreSource::new(store.as_ref(), &path);
            engine.sync_if_needed(&source, force).await?
        }
        (None, None) => match config.storage.shared_link.as_deref() {
            Some(link) => {
                let source = SharedLink::new(link)?;
                engine.sync_if_needed(&source, force).await?
            }
            None => anyhow::bail!("Give a library path or --link"),
        },
    };

    match outcome.report {
        Some(report) => println!(
            "Synced {} ({} bytes) -> {}",
            report.path,
            report.size,
            engine.local_path().display()
        ),
        None => println!("Local copy is current: {}", engine.local_path().display()),
    }

    Ok(())
}

/// Generate a sample library.
fn cmd_fixtures(dir: PathBuf, books: usize, seed: u64) -> anyhow::Result<()> {
    let library = fixtures::generate(&dir, books, seed)?;

    println!(
        "Created {} books in {}",
        library.books.len(),
        library.root.display()
    );
    for book in library.books.iter().take(5) {
        println!("  - {} by {}", book.title, book.author);
    }
    println!("\nTo browse it:");
    println!(
        "  STORAGE_BACKEND=local LOCAL_STORAGE_PATH={} APP_PASSWORD=test calibre-web-rs serve",
        dir.display()
    );
    println!("  Then use library path '/{}'", fixtures::LIBRARY_DIR);

    Ok(())
}

/// Print an argon2 hash for the config file.
fn cmd_hash_password(password: Option<String>) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt_password("Password: ")?,
    };
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }

    println!("{}", auth::hash_password(&password)?);
    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    tracing::info!(
        bind = %config.server.bind,
        backend = config.storage.backend.as_str(),
        database = %config.sync.local_path.display(),
        "Starting calibre-web-rs server"
    );

    if let Some(parent) = config.sync.local_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let bind = config.server.bind;
    let state = server::AppState::new(config)?;
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
