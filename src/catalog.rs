//! Read-only view of a synced Calibre library.

mod queries;

pub use queries::Catalog;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Book row of a listing or search page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    /// Calibre book id.
    pub id: i64,
    /// Title.
    pub title: String,
    /// Sort key used for ordering.
    pub sort: Option<String>,
    /// Folder of the book relative to the library root.
    pub path: String,
    /// Whether `cover.jpg` exists in the book folder.
    pub has_cover: bool,
    /// When the book was added to the library.
    pub timestamp: Option<String>,
    /// Publication date.
    pub pubdate: Option<String>,
    /// Position within the series.
    pub series_index: Option<f64>,
    /// Author names joined with `" & "`.
    pub authors: Option<String>,
    /// Series name.
    pub series: Option<String>,
    /// Calibre rating (0-10, two per star).
    pub rating: Option<i64>,
}

/// One stored file format of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRecord {
    /// Upper-case format, e.g. `EPUB`.
    pub format: String,
    /// Size in bytes.
    pub size: Option<i64>,
    /// File name without extension.
    pub name: Option<String>,
}

/// Full record for a book detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDetail {
    /// Calibre book id.
    pub id: i64,
    /// Title.
    pub title: String,
    /// Sort key.
    pub sort: Option<String>,
    /// Folder of the book relative to the library root.
    pub path: String,
    /// Whether `cover.jpg` exists in the book folder.
    pub has_cover: bool,
    /// When the book was added to the library.
    pub timestamp: Option<String>,
    /// Publication date.
    pub pubdate: Option<String>,
    /// Position within the series.
    pub series_index: Option<f64>,
    /// Calibre UUID.
    pub uuid: Option<String>,
    /// Series name.
    pub series: Option<String>,
    /// Calibre rating (0-10).
    pub rating: Option<i64>,
    /// Publisher name.
    pub publisher: Option<String>,
    /// Description (HTML).
    pub comments: Option<String>,
    /// Author names.
    pub authors: Vec<String>,
    /// Tag names.
    pub tags: Vec<String>,
    /// Language codes.
    pub languages: Vec<String>,
    /// Stored formats.
    pub formats: Vec<FormatRecord>,
    /// External identifiers by type (`isbn`, `amazon`, ...).
    pub identifiers: BTreeMap<String, String>,
}

/// Id and display name of an author, tag or series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedEntry {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub name: String,
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// Rows on this page.
    pub books: Vec<T>,
    /// Total matching rows.
    pub total: u64,
    /// 1-based page number actually served.
    pub page: u32,
    /// Page size actually served.
    pub per_page: u32,
}

/// Validated page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub per_page: u32,
}

impl Pagination {
    /// Clamp raw query values.
    ///
    /// Pages below 1 become 1, a non-positive page size falls back to
    /// `default_per_page`, and page sizes above `max_per_page` are capped.
    pub fn new(page: i64, per_page: i64, default_per_page: u32, max_per_page: u32) -> Self {
        let max = max_per_page.max(1);
        let per_page = if per_page < 1 {
            default_per_page.clamp(1, max)
        } else {
            per_page.min(max as i64) as u32
        };

        Self {
            page: page.clamp(1, u32::MAX as i64) as u32,
            per_page,
        }
    }

    /// Row offset of the first item.
    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.per_page as u64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}
