//! HTTP server and routes.

mod handlers;
mod state;

pub use handlers::LIBRARY_PATH_HEADER;
pub use state::AppState;

use crate::auth;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/config", get(handlers::api_config))
        .route("/validate-path", post(handlers::validate_path))
        .route("/sync", post(handlers::sync_database))
        .route("/books", get(handlers::list_books))
        .route("/books/{id}", get(handlers::book_detail))
        .route("/authors", get(handlers::list_authors))
        .route("/tags", get(handlers::list_tags))
        .route("/series", get(handlers::list_series))
        .route("/download-db", get(handlers::download_db))
        .route("/download-link", get(handlers::download_link))
        .route("/book-content", get(handlers::book_content))
        .route("/local-file", get(handlers::local_file))
        .route("/covers", post(handlers::covers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_password,
        ))
        // Added after the auth layer, so reachable without a password
        .route("/auth-check", get(handlers::auth_check))
        .fallback(handlers::api_not_found);

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes);

    if let Some(dir) = &state.config.server.static_dir {
        // Client-side routing: unknown paths get the SPA entry point
        let spa = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
        router = router.fallback_service(spa);
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
