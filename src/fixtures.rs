//! Generator for a small Calibre-shaped library.
//!
//! Produces a `metadata.db` with the subset of Calibre's schema the catalog
//! reads, one folder per book (`Author/Title (id)/`) holding a cover and a
//! minimal EPUB, and a fixed canary book that sorts first.

use crate::error::{AppError, Result};
use chrono::{Duration, NaiveDate, Utc};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use rand::{RngExt, SeedableRng, rngs::StdRng, seq::IndexedRandom};
use rusqlite::{Connection, params};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

/// Folder name of the generated library.
pub const LIBRARY_DIR: &str = "Calibre Library";
/// Title of the canary book.
pub const CANARY_TITLE: &str = "Alpha Test Book";
/// Author of the canary book.
pub const CANARY_AUTHOR: &str = "Test Author";

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Charlie", "Diana", "Edward", "Fiona", "George", "Hannah", "Isaac", "Julia",
    "Kevin", "Laura", "Michael", "Nina", "Oliver", "Patricia",
];

const LAST_NAMES: &[&str] = &[
    "Anderson", "Brown", "Clark", "Davis", "Evans", "Foster", "Garcia", "Harris", "Irving",
    "Johnson", "King", "Lewis", "Miller", "Nelson", "O'Brien", "Parker",
];

const TITLE_WORDS: &[&str] = &[
    "The", "A", "Secret", "Lost", "Hidden", "Dark", "Light", "Final", "First", "Last", "Eternal",
    "Silent", "Forgotten", "Ancient", "Modern", "Digital", "Garden", "City", "Mountain", "Ocean",
    "Forest", "Desert", "River", "Sky", "Journey", "Quest", "Mystery", "Legend", "Chronicle",
    "Tale", "Story", "Love", "War", "Peace", "Truth", "Dream", "Shadow", "Fire", "Ice", "Storm",
];

const SERIES: &[&str] = &[
    "The Chronicles of Eldoria",
    "Dark Tower",
    "Quantum Files",
    "The Inheritance Cycle",
    "Starlight Saga",
];

const TAGS: &[&str] = &[
    "Fiction",
    "Non-Fiction",
    "Science Fiction",
    "Fantasy",
    "Mystery",
    "Thriller",
    "Romance",
    "Historical",
    "Biography",
    "Self-Help",
    "Technology",
    "Philosophy",
    "Adventure",
    "Horror",
    "Young Adult",
];

const PUBLISHERS: &[&str] = &[
    "Penguin Books",
    "Random House",
    "HarperCollins",
    "Simon & Schuster",
    "Macmillan Publishers",
    "Hachette Book Group",
];

const LANGUAGES: &[&str] = &["eng", "fra", "deu", "spa"];

/// Calibre stores ratings as 2, 4, 6, 8, 10 for one to five stars.
const RATINGS: [i64; 5] = [2, 4, 6, 8, 10];

const SCHEMA: &str = r#"
    CREATE TABLE books (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        sort TEXT,
        timestamp TEXT,
        pubdate TEXT,
        series_index REAL DEFAULT 1.0,
        path TEXT,
        has_cover INTEGER DEFAULT 0,
        uuid TEXT
    );
    CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL, sort TEXT);
    CREATE TABLE books_authors_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, author INTEGER NOT NULL);
    CREATE TABLE series (id INTEGER PRIMARY KEY, name TEXT NOT NULL, sort TEXT);
    CREATE TABLE books_series_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, series INTEGER NOT NULL);
    CREATE TABLE ratings (id INTEGER PRIMARY KEY, rating INTEGER);
    CREATE TABLE books_ratings_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, rating INTEGER NOT NULL);
    CREATE TABLE publishers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, sort TEXT);
    CREATE TABLE books_publishers_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, publisher INTEGER NOT NULL);
    CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE books_tags_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, tag INTEGER NOT NULL);
    CREATE TABLE languages (id INTEGER PRIMARY KEY, lang_code TEXT NOT NULL);
    CREATE TABLE books_languages_link (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        lang_code INTEGER NOT NULL,
        item_order INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE comments (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, text TEXT);
    CREATE TABLE data (
        id INTEGER PRIMARY KEY,
        book INTEGER NOT NULL,
        format TEXT NOT NULL,
        uncompressed_size INTEGER,
        name TEXT
    );
    CREATE TABLE identifiers (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, type TEXT NOT NULL, val TEXT NOT NULL);
"#;

/// A book written by the generator.
#[derive(Debug, Clone)]
pub struct FixtureBook {
    /// Calibre book id.
    pub id: i64,
    /// Title.
    pub title: String,
    /// Author name.
    pub author: String,
    /// Folder relative to the library root.
    pub path: String,
    /// EPUB file name without extension.
    pub filename: String,
    sort: String,
    uuid: String,
    pubdate: String,
    series: Option<(usize, f64)>,
    rating: Option<usize>,
    publisher: Option<usize>,
    tags: Vec<usize>,
    language: usize,
    comment: String,
    isbn: String,
    epub_size: u64,
}

/// Result of a fixture run.
#[derive(Debug, Clone)]
pub struct GeneratedLibrary {
    /// Library folder holding `metadata.db`.
    pub root: PathBuf,
    /// Every book, canary last.
    pub books: Vec<FixtureBook>,
    /// Id of the canary book.
    pub canary_id: i64,
}

/// Write `<dir>/Calibre Library/` with `num_books` random books plus the canary.
///
/// The same seed produces the same titles, authors and metadata. An
/// existing library folder at that location is replaced.
pub fn generate(dir: &Path, num_books: usize, seed: u64) -> Result<GeneratedLibrary> {
    let root = dir.join(LIBRARY_DIR);
    if root.exists() {
        std::fs::remove_dir_all(&root)?;
    }
    std::fs::create_dir_all(&root)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut series_counts = [0u32; SERIES.len()];
    let mut books = Vec::with_capacity(num_books + 1);

    for i in 1..=num_books {
        let id = i as i64;
        let title = random_title(&mut rng);
        let author = format!("{} {}", pick(&mut rng, FIRST_NAMES), pick(&mut rng, LAST_NAMES));

        let series = if rng.random_bool(0.3) {
            let idx = rng.random_range(0..SERIES.len());
            series_counts[idx] += 1;
            Some((idx, series_counts[idx] as f64))
        } else {
            None
        };

        let mut comment = format!(
            "<p>This is a test book titled <em>{}</em> by {}.</p>",
            title, author
        );
        if let Some((idx, index)) = series {
            comment.push_str(&format!("<p>Book {} in the {} series.</p>", index, SERIES[idx]));
        }

        let tag_count = rng.random_range(1..=3);
        let tags = (0..TAGS.len())
            .collect::<Vec<_>>()
            .sample(&mut rng, tag_count)
            .copied()
            .collect();

        let color = Rgb([
            rng.random_range(50..=200u8),
            rng.random_range(50..=200u8),
            rng.random_range(50..=200u8),
        ]);

        let mut book = FixtureBook {
            id,
            sort: sort_key(&title),
            path: format!("{}/{} ({})", author, title, id),
            filename: format!("{} - {}", title, author),
            uuid: random_uuid(&mut rng),
            pubdate: random_pubdate(&mut rng),
            series,
            rating: rng.random_bool(5.0 / 6.0).then(|| rng.random_range(0..RATINGS.len())),
            publisher: rng.random_bool(0.7).then(|| rng.random_range(0..PUBLISHERS.len())),
            tags,
            language: rng.random_range(0..LANGUAGES.len()),
            comment,
            isbn: format!(
                "978-{}-{}-{}-{}",
                rng.random_range(0..10),
                rng.random_range(1000..10000),
                rng.random_range(1000..10000),
                rng.random_range(0..10)
            ),
            epub_size: 0,
            title,
            author,
        };
        book.epub_size = write_book_files(&root, &book, color)?;
        books.push(book);
    }

    let canary_id = num_books as i64 + 1;
    let mut canary = FixtureBook {
        id: canary_id,
        title: CANARY_TITLE.to_string(),
        author: CANARY_AUTHOR.to_string(),
        path: format!("{}/{} ({})", CANARY_AUTHOR, CANARY_TITLE, canary_id),
        filename: format!("{} - {}", CANARY_TITLE, CANARY_AUTHOR),
        sort: CANARY_TITLE.to_string(),
        uuid: random_uuid(&mut rng),
        pubdate: "2024-01-01 00:00:00".to_string(),
        series: None,
        rating: Some(RATINGS.len() - 1),
        publisher: Some(0),
        tags: vec![0],
        language: 0,
        comment: "<p>A known test book for automated testing.</p>".to_string(),
        isbn: "978-0-0000-0000-0".to_string(),
        epub_size: 0,
    };
    canary.epub_size = write_book_files(&root, &canary, Rgb([100, 150, 200]))?;
    books.push(canary);

    write_database(&root.join("metadata.db"), &books, &timestamp)?;

    tracing::info!(
        "Generated fixture library at {} ({} books)",
        root.display(),
        books.len()
    );

    Ok(GeneratedLibrary {
        root,
        books,
        canary_id,
    })
}

fn pick(rng: &mut StdRng, items: &[&'static str]) -> &'static str {
    items[rng.random_range(0..items.len())]
}

fn random_title(rng: &mut StdRng) -> String {
    let count = rng.random_range(2..=5);
    TITLE_WORDS
        .sample(rng, count)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

fn random_pubdate(rng: &mut StdRng) -> String {
    let start = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default();
    let span = (end - start).num_days();
    let date = start + Duration::days(rng.random_range(0..=span));
    format!("{} 00:00:00", date.format("%Y-%m-%d"))
}

fn random_uuid(rng: &mut StdRng) -> String {
    uuid::Builder::from_random_bytes(rng.random()).into_uuid().to_string()
}

/// Move a leading article to the end, the way Calibre builds title sorts.
pub fn sort_key(title: &str) -> String {
    let lower = title.to_lowercase();
    for prefix in ["the ", "a ", "an "] {
        if lower.starts_with(prefix) {
            let article = &title[..prefix.len() - 1];
            return format!("{}, {}", &title[prefix.len()..], article);
        }
    }
    title.to_string()
}

fn write_book_files(root: &Path, book: &FixtureBook, color: Rgb<u8>) -> Result<u64> {
    let folder = root.join(&book.path);
    std::fs::create_dir_all(&folder)?;

    let cover = RgbImage::from_pixel(300, 400, color);
    let mut out = BufWriter::new(std::fs::File::create(folder.join("cover.jpg"))?);
    JpegEncoder::new_with_quality(&mut out, 85).encode_image(&cover)?;
    out.flush()?;

    let epub_path = folder.join(format!("{}.epub", book.filename));
    write_epub(&epub_path, book)?;

    Ok(std::fs::metadata(&epub_path)?.len())
}

/// Minimal EPUB 2 package with a single chapter.
fn write_epub(path: &Path, book: &FixtureBook) -> Result<()> {
    let (title, author, uuid) = (&book.title, &book.author, &book.uuid);
    let zip_err = |e: zip::result::ZipError| AppError::Internal(format!("Failed to write EPUB: {}", e));

    let container = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
    <rootfiles>
        <rootfile full-path="content.opf" media-type="application/oebps-package+xml"/>
    </rootfiles>
</container>"#;

    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="uuid_id" version="2.0">
    <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
        <dc:title>{title}</dc:title>
        <dc:creator>{author}</dc:creator>
        <dc:identifier id="uuid_id">{uuid}</dc:identifier>
        <dc:language>en</dc:language>
    </metadata>
    <manifest>
        <item href="chapter1.xhtml" id="chapter1" media-type="application/xhtml+xml"/>
        <item href="toc.ncx" id="ncx" media-type="application/x-dtbncx+xml"/>
    </manifest>
    <spine toc="ncx">
        <itemref idref="chapter1"/>
    </spine>
</package>"#
    );

    let chapter = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body>
    <h1>{title}</h1>
    <p>By {author}</p>
    <p>This is a placeholder book for testing purposes.</p>
</body>
</html>"#
    );

    let ncx = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
    <head><meta name="dtb:uid" content="{uuid}"/></head>
    <docTitle><text>{title}</text></docTitle>
    <navMap>
        <navPoint id="chapter1" playOrder="1">
            <navLabel><text>Chapter 1</text></navLabel>
            <content src="chapter1.xhtml"/>
        </navPoint>
    </navMap>
</ncx>"#
    );

    let mut zip = ZipWriter::new(std::fs::File::create(path)?);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    // Readers expect mimetype first and uncompressed
    zip.start_file("mimetype", stored).map_err(zip_err)?;
    zip.write_all(b"application/epub+zip")?;

    for (name, body) in [
        ("META-INF/container.xml", container.to_string()),
        ("content.opf", opf),
        ("chapter1.xhtml", chapter),
        ("toc.ncx", ncx),
    ] {
        zip.start_file(name, deflated).map_err(zip_err)?;
        zip.write_all(body.as_bytes())?;
    }

    zip.finish().map_err(zip_err)?;
    Ok(())
}

fn write_database(path: &Path, books: &[FixtureBook], timestamp: &str) -> Result<()> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;

    let tx = conn.transaction()?;

    for (i, rating) in RATINGS.iter().enumerate() {
        tx.execute(
            "INSERT INTO ratings (id, rating) VALUES (?1, ?2)",
            params![i as i64 + 1, rating],
        )?;
    }
    for (i, tag) in TAGS.iter().enumerate() {
        tx.execute("INSERT INTO tags (id, name) VALUES (?1, ?2)", params![i as i64 + 1, tag])?;
    }
    for (i, publisher) in PUBLISHERS.iter().enumerate() {
        tx.execute(
            "INSERT INTO publishers (id, name, sort) VALUES (?1, ?2, ?2)",
            params![i as i64 + 1, publisher],
        )?;
    }
    for (i, series) in SERIES.iter().enumerate() {
        tx.execute(
            "INSERT INTO series (id, name, sort) VALUES (?1, ?2, ?2)",
            params![i as i64 + 1, series],
        )?;
    }
    for (i, lang) in LANGUAGES.iter().enumerate() {
        tx.execute(
            "INSERT INTO languages (id, lang_code) VALUES (?1, ?2)",
            params![i as i64 + 1, lang],
        )?;
    }

    let mut author_ids: Vec<&str> = Vec::new();

    for book in books {
        tx.execute(
            "INSERT INTO books (id, title, sort, timestamp, pubdate, series_index, path, has_cover, uuid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                book.id,
                book.title,
                book.sort,
                timestamp,
                book.pubdate,
                book.series.map(|(_, index)| index).unwrap_or(1.0),
                book.path,
                book.uuid,
            ],
        )?;

        let author_id = match author_ids.iter().position(|a| *a == book.author) {
            Some(pos) => pos as i64 + 1,
            None => {
                author_ids.push(&book.author);
                let id = author_ids.len() as i64;
                tx.execute(
                    "INSERT INTO authors (id, name, sort) VALUES (?1, ?2, ?2)",
                    params![id, book.author],
                )?;
                id
            }
        };
        tx.execute(
            "INSERT INTO books_authors_link (book, author) VALUES (?1, ?2)",
            params![book.id, author_id],
        )?;

        if let Some((series, _)) = book.series {
            tx.execute(
                "INSERT INTO books_series_link (book, series) VALUES (?1, ?2)",
                params![book.id, series as i64 + 1],
            )?;
        }
        if let Some(rating) = book.rating {
            tx.execute(
                "INSERT INTO books_ratings_link (book, rating) VALUES (?1, ?2)",
                params![book.id, rating as i64 + 1],
            )?;
        }
        if let Some(publisher) = book.publisher {
            tx.execute(
                "INSERT INTO books_publishers_link (book, publisher) VALUES (?1, ?2)",
                params![book.id, publisher as i64 + 1],
            )?;
        }
        for tag in &book.tags {
            tx.execute(
                "INSERT INTO books_tags_link (book, tag) VALUES (?1, ?2)",
                params![book.id, *tag as i64 + 1],
            )?;
        }
        tx.execute(
            "INSERT INTO books_languages_link (book, lang_code, item_order) VALUES (?1, ?2, 0)",
            params![book.id, book.language as i64 + 1],
        )?;
        tx.execute(
            "INSERT INTO comments (book, text) VALUES (?1, ?2)",
            params![book.id, book.comment],
        )?;
        tx.execute(
            "INSERT INTO data (book, format, uncompressed_size, name) VALUES (?1, 'EPUB', ?2, ?3)",
            params![book.id, book.epub_size as i64, book.filename],
        )?;
        tx.execute(
            "INSERT INTO identifiers (book, type, val) VALUES (?1, 'isbn', ?2)",
            params![book.id, book.isbn],
        )?;
    }

    tx.commit()?;
    Ok(())
}
