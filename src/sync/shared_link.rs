//! Public Dropbox shared links as a sync source.

use super::SyncSource;
use crate::error::{AppError, Result};
use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url, header};
use std::time::Duration;

const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Rewrite a shared link so it serves the raw file instead of a preview page.
///
/// Any `dl`/`raw` toggle is replaced by `dl=1`; other query parameters
/// (such as `rlkey`) are kept.
pub fn normalize_shared_link(link: &str) -> Result<Url> {
    let mut url = Url::parse(link.trim())
        .map_err(|e| AppError::BadRequest(format!("Invalid shared link '{}': {}", link, e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(AppError::BadRequest(format!(
            "Shared link must be an http(s) URL: {}",
            link
        )));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "dl" && k != "raw")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("dl", "1");

    Ok(url)
}

/// Unauthenticated download of a single file through its public link.
pub struct SharedLink {
    client: Client,
    url: Url,
}

impl SharedLink {
    /// Build a source from a user-supplied link.
    pub fn new(link: &str) -> Result<Self> {
        let url = normalize_shared_link(link)?;
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    /// Normalized download URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SyncSource for SharedLink {
    fn describe(&self) -> String {
        // Links embed access keys, keep them out of the logs
        format!(
            "shared-link:{}{}",
            self.url.host_str().unwrap_or_default(),
            self.url.path()
        )
    }

    fn identity(&self) -> String {
        self.url().to_string()
    }

    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let resp = self
            .client
            .head(self.url.clone())
            .timeout(HEAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Ok(None);
        }

        Ok(resp
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn fetch(&self) -> Result<Bytes> {
        let resp = self
            .client
            .get(self.url.clone())
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(StorageError::NotFound(self.describe()).into());
            }
            s => {
                return Err(
                    StorageError::Transport(format!("Shared link returned {}", s)).into(),
                );
            }
        }

        Ok(resp
            .bytes()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?)
    }
}
