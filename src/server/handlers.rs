//! HTTP request handlers.

use crate::catalog::{BookDetail, BookSummary, NamedEntry, Page, Pagination};
use crate::error::{AppError, Result};
use crate::formats;
use crate::library::{self, ValidatedLibrary};
use crate::server::AppState;
use crate::storage::join_path;
use crate::sync::{self, METADATA_DB, SyncOutcome};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header naming the library folder for the request.
pub const LIBRARY_PATH_HEADER: &str = "x-library-path";

const SQLITE_MIME: &str = "application/x-sqlite3";

/// Build a binary response with extra headers.
fn binary_response(
    content_type: &str,
    headers: &[(header::HeaderName, String)],
    body: impl Into<Body>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }

    builder.body(body.into()).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Internal error"))
            .unwrap_or_default()
    })
}

/// Library folder from the `X-Library-Path` header, if present and non-empty.
fn header_library_path(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LIBRARY_PATH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Sync the local copy for the request's library before reading it.
async fn refresh(state: &AppState, headers: &HeaderMap) -> Result<()> {
    state
        .ensure_fresh(header_library_path(headers).as_deref())
        .await
}

fn require_library_path(headers: &HeaderMap) -> Result<String> {
    header_library_path(headers).ok_or_else(|| {
        AppError::BadRequest("No library path provided. Set X-Library-Path header.".to_string())
    })
}

/// Query string carrying a file path.
#[derive(Debug, Deserialize)]
pub struct PathQuery {
    /// Path relative to the library (or store root for local files).
    #[serde(default)]
    pub path: String,
}

impl PathQuery {
    fn require(&self) -> Result<&str> {
        let path = self.path.trim();
        if path.is_empty() {
            return Err(AppError::BadRequest(
                "No file path provided. Set path query parameter.".to_string(),
            ));
        }
        Ok(path)
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Auth check response.
#[derive(Serialize)]
pub struct AuthCheckResponse {
    auth_required: bool,
    authenticated: bool,
}

/// Report whether the presented password is accepted.
pub async fn auth_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuthCheckResponse>> {
    if !state.secret.is_configured() {
        return Err(AppError::Misconfigured(
            "APP_PASSWORD environment variable is not set. The server administrator must configure a password."
                .to_string(),
        ));
    }

    let provided = crate::auth::provided_password(&headers);
    Ok(Json(AuthCheckResponse {
        auth_required: true,
        authenticated: !provided.is_empty() && state.secret.matches(provided),
    }))
}

/// Config status response.
#[derive(Serialize)]
pub struct ConfigResponse {
    success: bool,
    title: String,
    backend: &'static str,
    token_configured: bool,
    shared_link_configured: bool,
}

/// Configuration status for the client.
pub async fn api_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        success: true,
        title: config.server.title.clone(),
        backend: config.storage.backend.as_str(),
        token_configured: state.store_available(),
        shared_link_configured: config.storage.shared_link.is_some(),
    })
}

// ============================================================================
// LIBRARY & SYNC
// ============================================================================

/// Validate-path request body.
#[derive(Debug, Deserialize)]
pub struct ValidatePathRequest {
    /// Library folder to check.
    #[serde(default)]
    pub library_path: String,
}

/// Validate-path response.
#[derive(Serialize)]
pub struct ValidatePathResponse {
    success: bool,
    #[serde(flatten)]
    library: ValidatedLibrary,
}

/// Check that a folder holds a Calibre library.
pub async fn validate_path(
    State(state): State<AppState>,
    Json(req): Json<ValidatePathRequest>,
) -> Result<Json<ValidatePathResponse>> {
    let store = state.store()?;
    let library = library::validate_library_path(
        store.as_ref(),
        &req.library_path,
        state.config.library.max_suggestions,
    )
    .await?;

    Ok(Json(ValidatePathResponse {
        success: true,
        library,
    }))
}

/// Sync request body; every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    /// Library folder, defaults to the `X-Library-Path` header.
    #[serde(default)]
    pub library_path: Option<String>,
    /// Public shared link to `metadata.db`.
    #[serde(default)]
    pub link: Option<String>,
    /// Download even when the local copy is current.
    #[serde(default)]
    pub force: bool,
}

/// Sync response.
#[derive(Serialize)]
pub struct SyncResponse {
    success: bool,
    #[serde(flatten)]
    outcome: SyncOutcome,
}

/// Bring the local database up to date.
///
/// A `link` wins over a library path; with neither, the configured
/// shared link is used.
pub async fn sync_database(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncResponse>> {
    let req: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid sync request: {}", e)))?
    };
    let link = req.link.filter(|l| !l.trim().is_empty());
    let library_path = req
        .library_path
        .filter(|p| !p.trim().is_empty())
        .or_else(|| header_library_path(&headers));

    let outcome = match (link, library_path) {
        (Some(link), _) => state.sync_shared_link(&link, req.force).await?,
        (None, Some(path)) => {
            let store = state.store()?;
            library::validate_library_path(
                store.as_ref(),
                &path,
                state.config.library.max_suggestions,
            )
            .await?;
            state.sync_library(&path, req.force).await?
        }
        (None, None) => match state.config.storage.shared_link.as_deref() {
            Some(link) => state.sync_shared_link(link, req.force).await?,
            None => {
                return Err(AppError::BadRequest(
                    "No library path or shared link provided".to_string(),
                ));
            }
        },
    };

    Ok(Json(SyncResponse {
        success: true,
        outcome,
    }))
}

/// Proxy the remote `metadata.db` for in-browser SQLite.
pub async fn download_db(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let store = state.store()?;
    let library_path = require_library_path(&headers)?;
    let path = join_path(&library_path, METADATA_DB);

    let content = store.download(&path).await?;
    sync::validate_database(&content, state.config.sync.min_size_bytes)?;

    tracing::info!(path = %path, size = content.len(), "Serving metadata database");

    Ok(binary_response(
        SQLITE_MIME,
        &[
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=metadata.db".to_string(),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        content,
    ))
}

// ============================================================================
// CATALOG
// ============================================================================

/// Book list query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct BooksQuery {
    /// 1-based page.
    pub page: Option<i64>,
    /// Page size.
    pub per_page: Option<i64>,
    /// Search term over titles and authors.
    pub q: Option<String>,
}

/// Book list response.
#[derive(Serialize)]
pub struct BooksResponse {
    success: bool,
    #[serde(flatten)]
    page: Page<BookSummary>,
}

/// List or search books, syncing first when the remote is newer.
pub async fn list_books(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BooksQuery>,
) -> Result<Json<BooksResponse>> {
    refresh(&state, &headers).await?;

    let catalog = &state.config.catalog;
    let pagination = Pagination::new(
        query.page.unwrap_or(1),
        query.per_page.unwrap_or(0),
        catalog.default_per_page,
        catalog.max_per_page,
    );

    let page = match query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(term) => state.catalog.search(term, pagination)?,
        None => state.catalog.list(pagination)?,
    };

    Ok(Json(BooksResponse {
        success: true,
        page,
    }))
}

/// Book detail response.
#[derive(Serialize)]
pub struct BookResponse {
    success: bool,
    book: BookDetail,
}

/// Full record of one book.
pub async fn book_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<BookResponse>> {
    refresh(&state, &headers).await?;

    let book = state
        .catalog
        .detail(id)?
        .ok_or_else(|| AppError::NotFound(format!("Book {}", id)))?;

    Ok(Json(BookResponse {
        success: true,
        book,
    }))
}

/// Facet list response.
#[derive(Serialize)]
pub struct FacetResponse {
    success: bool,
    items: Vec<NamedEntry>,
}

/// All authors.
pub async fn list_authors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FacetResponse>> {
    refresh(&state, &headers).await?;

    Ok(Json(FacetResponse {
        success: true,
        items: state.catalog.authors()?,
    }))
}

/// All tags.
pub async fn list_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FacetResponse>> {
    refresh(&state, &headers).await?;

    Ok(Json(FacetResponse {
        success: true,
        items: state.catalog.tags()?,
    }))
}

/// All series.
pub async fn list_series(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FacetResponse>> {
    refresh(&state, &headers).await?;

    Ok(Json(FacetResponse {
        success: true,
        items: state.catalog.series()?,
    }))
}

// ============================================================================
// FILES
// ============================================================================

/// Download link response.
#[derive(Serialize)]
pub struct LinkResponse {
    success: bool,
    link: String,
}

/// Short-lived direct link to a book file.
pub async fn download_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Json<LinkResponse>> {
    let store = state.store()?;
    let library_path = require_library_path(&headers)?;
    let full_path = join_path(&library_path, query.require()?);

    let link = store.temporary_link(&full_path).await?;
    Ok(Json(LinkResponse {
        success: true,
        link,
    }))
}

/// Proxy a book file so the browser reader avoids cross-origin fetches.
pub async fn book_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Response> {
    let store = state.store()?;
    let library_path = require_library_path(&headers)?;
    let file_path = query.require()?;
    let full_path = join_path(&library_path, file_path);

    tracing::info!(path = %full_path, "Downloading book content");
    let content = store.download(&full_path).await?;

    Ok(binary_response(
        formats::content_type_for(file_path),
        &[(header::CACHE_CONTROL, "private, max-age=3600".to_string())],
        content,
    ))
}

/// Serve a file of the local backend; target of its temporary links.
pub async fn local_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Response> {
    let store = state.store()?;
    if store.name() != "local" {
        return Err(AppError::NotFound(
            "Local file access requires the local storage backend".to_string(),
        ));
    }

    let path = query.require()?;
    let content = store.download(path).await?;

    Ok(binary_response(
        formats::content_type_for(path),
        &[(header::CACHE_CONTROL, "private, max-age=3600".to_string())],
        content,
    ))
}

/// Covers request body.
#[derive(Debug, Deserialize)]
pub struct CoversRequest {
    /// Book folders relative to the library.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Covers response: base64 JPEG per book folder.
#[derive(Serialize)]
pub struct CoversResponse {
    success: bool,
    covers: BTreeMap<String, String>,
}

/// Thumbnails for a batch of book folders.
///
/// Paths beyond the batch limit are ignored; books without a usable cover
/// are left out of the map.
pub async fn covers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CoversRequest>,
) -> Result<Json<CoversResponse>> {
    let store = state.store()?;
    let library_path = require_library_path(&headers)?;

    if req.paths.is_empty() {
        return Ok(Json(CoversResponse {
            success: true,
            covers: BTreeMap::new(),
        }));
    }

    let requested = req.paths.len();
    let book_paths: Vec<String> = req
        .paths
        .into_iter()
        .take(state.config.covers.batch_limit)
        .collect();
    let cover_paths: Vec<String> = book_paths
        .iter()
        .map(|p| join_path(&join_path(&library_path, p), "cover.jpg"))
        .collect();

    tracing::info!(
        requested,
        served = book_paths.len(),
        library = %library_path,
        "Covers request"
    );

    let thumbnails = store
        .thumbnails(&cover_paths, state.config.covers.size())
        .await?;

    let mut covers = BTreeMap::new();
    let mut failed = 0usize;
    for (book_path, thumb) in book_paths.into_iter().zip(thumbnails) {
        match (thumb.data, thumb.error) {
            (Some(data), _) => {
                covers.insert(book_path, STANDARD.encode(data));
            }
            (None, error) => {
                failed += 1;
                tracing::debug!(path = %book_path, error = ?error, "No cover thumbnail");
            }
        }
    }

    if failed > 0 {
        tracing::warn!(succeeded = covers.len(), failed, "Some covers could not be loaded");
    }

    Ok(Json(CoversResponse {
        success: true,
        covers,
    }))
}

/// Unknown API routes answer with the JSON error body.
pub async fn api_not_found() -> impl IntoResponse {
    AppError::NotFound("API endpoint".to_string())
}
