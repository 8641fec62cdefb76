use crate::auth::PASSWORD_HEADER;
use crate::config::{Config, StorageBackend};
use crate::fixtures::{self, CANARY_TITLE, GeneratedLibrary, LIBRARY_DIR};
use crate::server::{self, AppState, LIBRARY_PATH_HEADER};
use crate::storage::LocalStore;
use crate::sync::SQLITE_MAGIC;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const PASSWORD: &str = "test";

struct TestApp {
    _dir: TempDir,
    library: GeneratedLibrary,
    router: Router,
}

fn library_path() -> String {
    format!("/{}", LIBRARY_DIR)
}

fn test_config(dir: &TempDir, password: Option<&str>) -> Config {
    let mut config = Config::default();
    config.auth.password = password.map(String::from);
    config.storage.backend = StorageBackend::Local;
    config.storage.local.root = dir.path().join("store");
    config.sync.local_path = dir.path().join("local").join("metadata.db");
    config
}

fn test_app_with(password: Option<&str>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let store_root = dir.path().join("store");
    std::fs::create_dir_all(&store_root).unwrap();
    std::fs::create_dir_all(dir.path().join("local")).unwrap();
    // A folder without metadata.db, for suggestion tests
    std::fs::create_dir_all(store_root.join("Photos")).unwrap();

    let library = fixtures::generate(&store_root, 25, 42).unwrap();
    let config = test_config(&dir, password);
    let store = LocalStore::new(&store_root).unwrap();
    let state = AppState::with_store(config, Arc::new(store)).unwrap();

    TestApp {
        _dir: dir,
        library,
        router: server::create_router(state),
    }
}

fn test_app() -> TestApp {
    test_app_with(Some(PASSWORD))
}

fn get(uri: &str) -> Request<Body> {
    get_in(uri, &library_path())
}

fn get_in(uri: &str, library: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(PASSWORD_HEADER, PASSWORD)
        .header(LIBRARY_PATH_HEADER, library)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(PASSWORD_HEADER, PASSWORD)
        .header(LIBRARY_PATH_HEADER, library_path())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    tokio_test::block_on(async {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    })
}

fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(router, request);
    (status, serde_json::from_slice(&body).unwrap())
}

// ============================================================================
// AUTH
// ============================================================================

#[test]
fn health_needs_no_password() {
    let app = test_app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[test]
fn api_rejects_missing_password() {
    let app = test_app();
    let request = Request::builder().uri("/api/books").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["auth_required"], true);
}

#[test]
fn api_rejects_wrong_password() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/config")
        .header(PASSWORD_HEADER, "nope")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid password");
}

#[test]
fn api_refuses_when_no_password_configured() {
    let app = test_app_with(None);
    let (status, body) = send_json(&app.router, get("/api/config"));
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["misconfigured"], true);

    let request = Request::builder().uri("/api/auth-check").body(Body::empty()).unwrap();
    let (status, _) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[test]
fn auth_check_reports_without_rejecting() {
    let app = test_app();

    let request = Request::builder().uri("/api/auth-check").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth_required"], true);
    assert_eq!(body["authenticated"], false);

    let (status, body) = send_json(&app.router, get("/api/auth-check"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authenticated"], true);
}

#[test]
fn unknown_api_route_is_json_404() {
    let app = test_app();
    let (status, body) = send_json(&app.router, get("/api/nope"));
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[test]
fn config_reports_backend() {
    let app = test_app();
    let (status, body) = send_json(&app.router, get("/api/config"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "local");
    assert_eq!(body["token_configured"], true);
    assert_eq!(body["shared_link_configured"], false);
}

// ============================================================================
// LIBRARY & SYNC
// ============================================================================

#[test]
fn validate_path_accepts_library() {
    let app = test_app();
    let (status, body) = send_json(
        &app.router,
        post_json("/api/validate-path", json!({ "library_path": library_path() })),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["metadata_size"].as_u64().unwrap() > 512);
}

#[test]
fn validate_path_suggests_libraries() {
    let app = test_app();
    let (status, body) = send_json(
        &app.router,
        post_json("/api/validate-path", json!({ "library_path": "/Photos" })),
    );
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("metadata.db not found"));
    assert!(error.ends_with("Found Calibre libraries at: /Calibre Library"));
}

#[test]
fn sync_downloads_then_skips() {
    let app = test_app();

    let (status, body) = send_json(&app.router, post_json("/api/sync", json!({})));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], true);

    let (status, body) = send_json(&app.router, post_json("/api/sync", json!({})));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], false);

    let (status, body) = send_json(&app.router, post_json("/api/sync", json!({ "force": true })));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], true);
}

#[test]
fn sync_without_source_is_bad_request() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/api/sync")
        .header(PASSWORD_HEADER, PASSWORD)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test]
fn download_db_serves_sqlite() {
    let app = test_app();
    let (status, headers, body) = send(&app.router, get("/api/download-db"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/x-sqlite3");
    assert!(body.starts_with(SQLITE_MAGIC));
}

#[test]
fn download_db_needs_library_header() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/download-db")
        .header(PASSWORD_HEADER, PASSWORD)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app.router, request);
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("X-Library-Path"));
}

// ============================================================================
// CATALOG
// ============================================================================

#[test]
fn books_sync_on_first_request() {
    let app = test_app();
    let (status, body) = send_json(&app.router, get("/api/books"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 26);
    assert_eq!(body["page"], 1);
    assert_eq!(body["per_page"], 20);
    assert_eq!(body["books"].as_array().unwrap().len(), 20);
    assert_eq!(body["books"][0]["title"], CANARY_TITLE);
}

#[test]
fn books_clamp_page_size() {
    let app = test_app();
    let (status, body) = send_json(&app.router, get("/api/books?page=2&per_page=1000"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["per_page"], 100);
    assert!(body["books"].as_array().unwrap().is_empty());
}

#[test]
fn books_search_matches_title() {
    let app = test_app();
    let (status, body) = send_json(&app.router, get("/api/books?q=Alpha"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["books"][0]["id"], app.library.canary_id);
}

#[test]
fn book_detail_and_missing_book() {
    let app = test_app();

    let uri = format!("/api/books/{}", app.library.canary_id);
    let (status, body) = send_json(&app.router, get(&uri));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["book"]["title"], CANARY_TITLE);
    assert_eq!(body["book"]["formats"][0]["format"], "EPUB");

    let (status, body) = send_json(&app.router, get("/api/books/9999"));
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[test]
fn switching_library_serves_its_own_catalog() {
    let app = test_app();
    let store_root = app._dir.path().join("store");
    let other = fixtures::generate(&store_root.join("Other"), 3, 7).unwrap();
    // Older than the main library's database
    std::fs::File::options()
        .write(true)
        .open(other.root.join("metadata.db"))
        .unwrap()
        .set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800))
        .unwrap();
    let other_path = format!("/Other/{}", LIBRARY_DIR);

    let (status, body) = send_json(&app.router, get("/api/books"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 26);

    let (status, body) = send_json(&app.router, get_in("/api/books", &other_path));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 4);

    let (status, body) = send_json(&app.router, get_in("/api/authors", &other_path));
    assert_eq!(status, StatusCode::OK);
    let authors = body["items"].as_array().unwrap();
    assert!(authors.len() <= 4);
    assert!(authors.iter().any(|a| a["name"] == fixtures::CANARY_AUTHOR));

    let (status, body) = send_json(&app.router, get("/api/books"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 26);
}

#[test]
fn facets_list_entries() {
    let app = test_app();

    for uri in ["/api/authors", "/api/tags", "/api/series"] {
        let (status, body) = send_json(&app.router, get(uri));
        assert_eq!(status, StatusCode::OK, "{}", uri);
        assert!(!body["items"].as_array().unwrap().is_empty(), "{}", uri);
    }
}

// ============================================================================
// FILES
// ============================================================================

#[test]
fn book_content_serves_epub() {
    let app = test_app();
    let book = &app.library.books[0];
    let file = format!("{}/{}.epub", book.path, book.filename);
    let uri = format!("/api/book-content?path={}", urlencoding::encode(&file));

    let (status, headers, body) = send(&app.router, get(&uri));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/epub+zip");
    assert!(body.starts_with(b"PK"));
}

#[test]
fn book_content_rejects_traversal() {
    let app = test_app();
    let uri = format!(
        "/api/book-content?path={}",
        urlencoding::encode("../../../etc/passwd")
    );
    let (status, body) = send_json(&app.router, get(&uri));
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "PATH_TRAVERSAL");
}

#[test]
fn download_link_points_at_local_proxy() {
    let app = test_app();
    let book = &app.library.books[0];
    let file = format!("{}/{}.epub", book.path, book.filename);
    let uri = format!("/api/download-link?path={}", urlencoding::encode(&file));

    let (status, body) = send_json(&app.router, get(&uri));
    assert_eq!(status, StatusCode::OK);
    let link = body["link"].as_str().unwrap();
    assert!(link.starts_with("/api/local-file?path="));

    let (status, _, content) = send(&app.router, get(link));
    assert_eq!(status, StatusCode::OK);
    assert!(content.starts_with(b"PK"));
}

#[test]
fn covers_returns_base64_thumbnails() {
    let app = test_app();
    let paths: Vec<String> = app.library.books.iter().take(3).map(|b| b.path.clone()).collect();
    let (status, body) = send_json(
        &app.router,
        post_json(
            "/api/covers",
            json!({ "paths": [paths[0], paths[1], paths[2], "Nobody/Missing (0)"] }),
        ),
    );
    assert_eq!(status, StatusCode::OK);

    let covers = body["covers"].as_object().unwrap();
    assert_eq!(covers.len(), 3);
    assert!(!covers.contains_key("Nobody/Missing (0)"));
    // base64 of the JPEG SOI marker
    assert!(covers[&paths[0]].as_str().unwrap().starts_with("/9j/"));
}

#[test]
fn missing_dropbox_token_is_reported_per_request() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, Some(PASSWORD));
    config.storage.backend = StorageBackend::Dropbox;
    config.storage.dropbox.access_token = None;

    let state = AppState::new(config).unwrap();
    assert!(!state.store_available());
    let router = server::create_router(state);

    let (status, body) = send_json(&router, get("/api/download-db"));
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "DROPBOX_AUTH_FAILED");
}
