use super::{BookDetail, BookSummary, FormatRecord, NamedEntry, Page, Pagination};
use crate::error::{AppError, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SUMMARY_COLUMNS: &str = r#"
    b.id, b.title, b.sort, b.path, b.has_cover, b.timestamp, b.pubdate, b.series_index,
    GROUP_CONCAT(a.name, ' & ') AS authors,
    s.name AS series,
    r.rating
"#;

const SUMMARY_JOINS: &str = r#"
    LEFT JOIN books_authors_link bal ON b.id = bal.book
    LEFT JOIN authors a ON bal.author = a.id
    LEFT JOIN books_series_link bsl ON b.id = bsl.book
    LEFT JOIN series s ON bsl.series = s.id
    LEFT JOIN books_ratings_link brl ON b.id = brl.book
    LEFT JOIN ratings r ON brl.rating = r.id
"#;

/// Query layer over a local copy of a Calibre `metadata.db`.
///
/// Each call opens its own read-only connection and drops it before
/// returning, so a sync may replace the file between calls.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    /// Catalog backed by the database file at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if !self.path.is_file() {
            return Err(AppError::NotFound(
                "Library database not synced yet".to_string(),
            ));
        }

        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| AppError::Internal(format!("Failed to open library database: {}", e)))
    }

    /// Page of books ordered by sort key.
    pub fn list(&self, page: Pagination) -> Result<Page<BookSummary>> {
        let conn = self.connect()?;

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to count books: {}", e)))?;

        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM books b {SUMMARY_JOINS}
             GROUP BY b.id
             ORDER BY b.sort
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![page.per_page, page.offset() as i64], summary_from_row)
            .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(Page {
            books,
            total: total as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }

    /// Page of books whose title or any author contains `term`.
    ///
    /// Matching is case-insensitive for ASCII. Every author of a matching
    /// book is reported, not only the one that matched.
    pub fn search(&self, term: &str, page: Pagination) -> Result<Page<BookSummary>> {
        let conn = self.connect()?;
        let pattern = format!("%{}%", term);

        let matching = r#"
            SELECT mb.id FROM books mb
            LEFT JOIN books_authors_link mbal ON mb.id = mbal.book
            LEFT JOIN authors ma ON mbal.author = ma.id
            WHERE mb.title LIKE ?1 OR ma.name LIKE ?1
        "#;

        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(DISTINCT id) FROM ({matching})"),
                params![pattern],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to count search results: {}", e)))?;

        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM books b {SUMMARY_JOINS}
             WHERE b.id IN ({matching})
             GROUP BY b.id
             ORDER BY b.sort
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(
                params![pattern, page.per_page, page.offset() as i64],
                summary_from_row,
            )
            .map_err(|e| AppError::Internal(format!("Failed to search books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(Page {
            books,
            total: total as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }

    /// Full record of one book.
    pub fn detail(&self, id: i64) -> Result<Option<BookDetail>> {
        let conn = self.connect()?;

        let book = conn
            .query_row(
                r#"
                SELECT b.id, b.title, b.sort, b.path, b.has_cover, b.timestamp, b.pubdate,
                       b.series_index, b.uuid, s.name, r.rating, p.name, c.text
                FROM books b
                LEFT JOIN books_series_link bsl ON b.id = bsl.book
                LEFT JOIN series s ON bsl.series = s.id
                LEFT JOIN books_ratings_link brl ON b.id = brl.book
                LEFT JOIN ratings r ON brl.rating = r.id
                LEFT JOIN books_publishers_link bpl ON b.id = bpl.book
                LEFT JOIN publishers p ON bpl.publisher = p.id
                LEFT JOIN comments c ON b.id = c.book
                WHERE b.id = ?1
                "#,
                params![id],
                |row| {
                    Ok(BookDetail {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        sort: row.get(2)?,
                        path: row.get(3)?,
                        has_cover: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                        timestamp: row.get(5)?,
                        pubdate: row.get(6)?,
                        series_index: row.get(7)?,
                        uuid: row.get(8)?,
                        series: row.get(9)?,
                        rating: row.get(10)?,
                        publisher: row.get(11)?,
                        comments: row.get(12)?,
                        authors: Vec::new(),
                        tags: Vec::new(),
                        languages: Vec::new(),
                        formats: Vec::new(),
                        identifiers: BTreeMap::new(),
                    })
                },
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))?;

        let Some(mut book) = book else {
            return Ok(None);
        };

        book.authors = string_column(
            &conn,
            "SELECT a.name FROM authors a
             JOIN books_authors_link bal ON a.id = bal.author
             WHERE bal.book = ?1
             ORDER BY bal.id",
            id,
        )?;
        book.tags = string_column(
            &conn,
            "SELECT t.name FROM tags t
             JOIN books_tags_link btl ON t.id = btl.tag
             WHERE btl.book = ?1
             ORDER BY t.name",
            id,
        )?;
        book.languages = string_column(
            &conn,
            "SELECT l.lang_code FROM languages l
             JOIN books_languages_link bll ON l.id = bll.lang_code
             WHERE bll.book = ?1
             ORDER BY bll.item_order",
            id,
        )?;
        book.formats = formats(&conn, id)?;
        book.identifiers = identifiers(&conn, id)?;

        Ok(Some(book))
    }

    /// All authors ordered by sort name.
    pub fn authors(&self) -> Result<Vec<NamedEntry>> {
        self.named("SELECT id, name FROM authors ORDER BY sort")
    }

    /// All tags ordered by name.
    pub fn tags(&self) -> Result<Vec<NamedEntry>> {
        self.named("SELECT id, name FROM tags ORDER BY name")
    }

    /// All series ordered by sort name.
    pub fn series(&self) -> Result<Vec<NamedEntry>> {
        self.named("SELECT id, name FROM series ORDER BY sort")
    }

    fn named(&self, sql: &str) -> Result<Vec<NamedEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt
            .query_map([], |row| {
                Ok(NamedEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<BookSummary> {
    Ok(BookSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        sort: row.get(2)?,
        path: row.get(3)?,
        has_cover: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
        timestamp: row.get(5)?,
        pubdate: row.get(6)?,
        series_index: row.get(7)?,
        authors: row.get(8)?,
        series: row.get(9)?,
        rating: row.get(10)?,
    })
}

fn string_column(conn: &Connection, sql: &str, id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(values)
}

fn formats(conn: &Connection, id: i64) -> Result<Vec<FormatRecord>> {
    let mut stmt = conn.prepare(
        "SELECT format, uncompressed_size, name FROM data WHERE book = ?1 ORDER BY format",
    )?;
    let formats = stmt
        .query_map(params![id], |row| {
            Ok(FormatRecord {
                format: row.get(0)?,
                size: row.get(1)?,
                name: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(formats)
}

fn identifiers(conn: &Connection, id: i64) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT type, val FROM identifiers WHERE book = ?1")?;
    let pairs = stmt
        .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<BTreeMap<String, String>, _>>()?;
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, CANARY_AUTHOR, CANARY_TITLE};

    fn fixture_catalog(books: usize) -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let library = fixtures::generate(dir.path(), books, 42).unwrap();
        let catalog = Catalog::new(library.root.join("metadata.db"));
        (dir, catalog)
    }

    #[test]
    fn test_missing_database_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("metadata.db"));
        assert!(matches!(
            catalog.list(Pagination::default()),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_first_page() {
        let (_dir, catalog) = fixture_catalog(25);
        let page = catalog.list(Pagination::new(1, 20, 20, 100)).unwrap();

        assert_eq!(page.total, 26);
        assert_eq!(page.books.len(), 20);
        assert_eq!(page.books[0].title, CANARY_TITLE);
        assert_eq!(page.books[0].authors.as_deref(), Some(CANARY_AUTHOR));
        assert_eq!(page.books[0].rating, Some(10));
        assert!(page.books[0].has_cover);
    }

    #[test]
    fn test_list_is_sorted_and_paged() {
        let (_dir, catalog) = fixture_catalog(25);
        let first = catalog.list(Pagination::new(1, 20, 20, 100)).unwrap();
        let second = catalog.list(Pagination::new(2, 20, 20, 100)).unwrap();

        assert_eq!(second.books.len(), 6);
        let sorts: Vec<String> = first
            .books
            .iter()
            .chain(second.books.iter())
            .map(|b| b.sort.clone().unwrap_or_default())
            .collect();
        let mut sorted = sorts.clone();
        sorted.sort();
        assert_eq!(sorts, sorted);

        let past_end = catalog.list(Pagination::new(50, 20, 20, 100)).unwrap();
        assert!(past_end.books.is_empty());
        assert_eq!(past_end.total, 26);
    }

    #[test]
    fn test_search_by_title_and_author() {
        let (_dir, catalog) = fixture_catalog(25);

        let by_title = catalog.search("Alpha", Pagination::default()).unwrap();
        assert_eq!(by_title.total, 1);
        assert_eq!(by_title.books[0].id, 26);

        let by_author = catalog.search("test auth", Pagination::default()).unwrap();
        assert_eq!(by_author.total, 1);
        assert_eq!(by_author.books[0].authors.as_deref(), Some(CANARY_AUTHOR));

        let none = catalog.search("zzzz-no-such-book", Pagination::default()).unwrap();
        assert_eq!(none.total, 0);
        assert!(none.books.is_empty());
    }

    #[test]
    fn test_detail() {
        let (_dir, catalog) = fixture_catalog(5);
        let book = catalog.detail(6).unwrap().unwrap();

        assert_eq!(book.title, CANARY_TITLE);
        assert_eq!(book.authors, vec![CANARY_AUTHOR.to_string()]);
        assert_eq!(book.publisher.as_deref(), Some("Penguin Books"));
        assert!(book.tags.contains(&"Fiction".to_string()));
        assert_eq!(book.languages, vec!["eng".to_string()]);
        assert_eq!(book.formats.len(), 1);
        assert_eq!(book.formats[0].format, "EPUB");
        assert!(book.identifiers.contains_key("isbn"));
        assert!(book.comments.is_some());
    }

    #[test]
    fn test_detail_unknown_id() {
        let (_dir, catalog) = fixture_catalog(5);
        assert!(catalog.detail(9999).unwrap().is_none());
    }

    #[test]
    fn test_facets() {
        let (_dir, catalog) = fixture_catalog(10);

        let authors = catalog.authors().unwrap();
        assert!(authors.iter().any(|a| a.name == CANARY_AUTHOR));

        let tags = catalog.tags().unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        assert!(!catalog.series().unwrap().is_empty());
    }
}
