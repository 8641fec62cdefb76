//! Dropbox HTTP API backend.

use super::{
    EntryKind, RemoteEntry, RemoteMetadata, RemoteStore, StorageError, StorageResult, Thumbnail,
    ThumbnailSize,
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Control-plane endpoint (JSON in, JSON out).
pub const API_URL: &str = "https://api.dropboxapi.com/2";
/// Content-plane endpoint (JSON argument header, binary body).
pub const CONTENT_URL: &str = "https://content.dropboxapi.com/2";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const LINK_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Store backed by a Dropbox account, authenticated with a bearer token.
pub struct DropboxStore {
    client: Client,
    access_token: String,
    api_url: String,
    content_url: String,
}

#[derive(Deserialize)]
struct EntryMetadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    size: u64,
    server_modified: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<EntryMetadata>,
}

#[derive(Deserialize)]
struct TemporaryLinkResponse {
    link: String,
}

#[derive(Deserialize)]
struct ThumbnailBatchResponse {
    entries: Vec<ThumbnailBatchEntry>,
}

#[derive(Deserialize)]
struct ThumbnailBatchEntry {
    #[serde(rename = ".tag")]
    tag: String,
    thumbnail: Option<String>,
    failure: Option<Value>,
}

/// Route-specific error as returned with HTTP 409.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_summary: String,
    #[serde(default)]
    error: Value,
}

impl ApiErrorBody {
    /// `(error tag, nested path tag)`, e.g. `("path", "not_found")`.
    fn tags(&self) -> (Option<&str>, Option<&str>) {
        let tag = self.error.get(".tag").and_then(Value::as_str);
        let path_tag = self
            .error
            .get("path")
            .and_then(|p| p.get(".tag"))
            .and_then(Value::as_str);
        (tag, path_tag)
    }
}

impl DropboxStore {
    /// Create a client for the public Dropbox API.
    pub fn new(access_token: impl Into<String>) -> StorageResult<Self> {
        Self::with_endpoints(access_token, API_URL, CONTENT_URL)
    }

    /// Create a client against custom endpoints.
    pub fn with_endpoints(
        access_token: impl Into<String>,
        api_url: impl Into<String>,
        content_url: impl Into<String>,
    ) -> StorageResult<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(StorageError::Auth(
                "Dropbox access token not configured. Set DROPBOX_ACCESS_TOKEN environment variable."
                    .to_string(),
            ));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            client,
            access_token,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            content_url: content_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn rpc(&self, endpoint: &str, body: Value, timeout: Duration) -> StorageResult<Response> {
        self.client
            .post(format!("{}/{}", self.api_url, endpoint))
            .bearer_auth(&self.access_token)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn content(
        &self,
        endpoint: &str,
        arg: &Value,
        body: Option<Value>,
        timeout: Duration,
    ) -> StorageResult<Response> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.content_url, endpoint))
            .bearer_auth(&self.access_token)
            .timeout(timeout);

        request = match body {
            // Batch endpoints take their argument as a JSON body instead
            Some(body) => request.json(&body),
            None => request.header("Dropbox-API-Arg", api_arg_header(arg)),
        };

        request.send().await.map_err(transport_error)
    }
}

#[async_trait]
impl RemoteStore for DropboxStore {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    async fn metadata(&self, path: &str) -> StorageResult<Option<RemoteMetadata>> {
        let resp = self
            .rpc("files/get_metadata", json!({ "path": path }), METADATA_TIMEOUT)
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = read_error(resp).await;
            if body.tags().0 == Some("path") {
                return Ok(None);
            }
            return Err(StorageError::Backend(body.error_summary));
        }

        let entry: EntryMetadata = check_status(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        Ok(Some(RemoteMetadata {
            size: entry.size,
            modified: entry.server_modified,
        }))
    }

    async fn list_folder(&self, path: &str) -> StorageResult<Vec<RemoteEntry>> {
        let resp = self
            .rpc("files/list_folder", json!({ "path": path }), LIST_TIMEOUT)
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = read_error(resp).await;
            return Err(match body.tags() {
                (Some("path"), Some("not_found")) => StorageError::NotFound(path.to_string()),
                (Some("path"), Some("not_folder")) => StorageError::NotAFolder(path.to_string()),
                _ => StorageError::Backend(body.error_summary),
            });
        }

        // Only the first page: callers use listings for best-effort scans
        let listing: ListFolderResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        Ok(listing
            .entries
            .into_iter()
            .filter_map(|e| {
                let kind = match e.tag.as_str() {
                    "folder" => EntryKind::Folder,
                    "file" => EntryKind::File,
                    _ => return None,
                };
                Some(RemoteEntry { name: e.name, kind })
            })
            .collect())
    }

    async fn download(&self, path: &str) -> StorageResult<Bytes> {
        let resp = self
            .content(
                "files/download",
                &json!({ "path": path }),
                None,
                DOWNLOAD_TIMEOUT,
            )
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = read_error(resp).await;
            return Err(match body.tags() {
                (Some("path"), Some("not_found")) => StorageError::NotFound(path.to_string()),
                (Some("path"), Some("not_file")) => StorageError::NotAFile(path.to_string()),
                _ => StorageError::Backend(body.error_summary),
            });
        }

        check_status(resp)
            .await?
            .bytes()
            .await
            .map_err(transport_error)
    }

    async fn temporary_link(&self, path: &str) -> StorageResult<String> {
        let resp = self
            .rpc(
                "files/get_temporary_link",
                json!({ "path": path }),
                LINK_TIMEOUT,
            )
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = read_error(resp).await;
            return Err(match body.tags() {
                (Some("path"), Some("not_found")) => StorageError::NotFound(path.to_string()),
                (Some("path"), _) => StorageError::NotAFile(path.to_string()),
                _ => StorageError::Backend(body.error_summary),
            });
        }

        let link: TemporaryLinkResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        Ok(link.link)
    }

    async fn thumbnails(
        &self,
        paths: &[String],
        size: ThumbnailSize,
    ) -> StorageResult<Vec<Thumbnail>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<Value> = paths
            .iter()
            .map(|p| {
                json!({
                    "path": p,
                    "format": "jpeg",
                    "size": size.tag(),
                    "mode": "bestfit",
                })
            })
            .collect();

        let resp = self
            .content(
                "files/get_thumbnail_batch",
                &Value::Null,
                Some(json!({ "entries": entries })),
                DOWNLOAD_TIMEOUT,
            )
            .await?;

        let batch: ThumbnailBatchResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        // Results come back in request order
        Ok(paths
            .iter()
            .zip(batch.entries)
            .map(|(path, entry)| {
                if entry.tag == "success" {
                    match entry.thumbnail.as_deref().map(|t| STANDARD.decode(t)) {
                        Some(Ok(data)) => Thumbnail {
                            path: path.clone(),
                            data: Some(data),
                            error: None,
                        },
                        _ => Thumbnail {
                            path: path.clone(),
                            data: None,
                            error: Some("invalid_thumbnail".to_string()),
                        },
                    }
                } else {
                    let reason = entry
                        .failure
                        .as_ref()
                        .and_then(|f| f.get(".tag"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    Thumbnail {
                        path: path.clone(),
                        data: None,
                        error: Some(reason),
                    }
                }
            })
            .collect())
    }
}

/// Map non-success statuses other than 409 to store errors.
async fn check_status(resp: Response) -> StorageResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => StorageError::Auth(format!(
            "Dropbox rejected the access token ({status}): {body}"
        )),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            StorageError::Transport(format!("Dropbox returned {status}: {body}"))
        }
        _ => StorageError::Backend(format!("Dropbox returned {status}: {body}")),
    })
}

async fn read_error(resp: Response) -> ApiErrorBody {
    resp.json().await.unwrap_or(ApiErrorBody {
        error_summary: "unreadable error response".to_string(),
        error: Value::Null,
    })
}

fn transport_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Transport(format!("request timed out: {}", e))
    } else {
        StorageError::Transport(e.to_string())
    }
}

/// Serialize an argument for the `Dropbox-API-Arg` header.
///
/// Header values must be ASCII, so everything else is `\u`-escaped.
pub fn api_arg_header(arg: &Value) -> String {
    let raw = arg.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
