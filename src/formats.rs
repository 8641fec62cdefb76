/// Book file formats served through the content proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFormat {
    /// EPUB.
    Epub,
    /// PDF.
    Pdf,
    /// Mobipocket and Kindle formats (MOBI, AZW, AZW3).
    Mobi,
    /// Comic book ZIP.
    Cbz,
    /// Comic book RAR.
    Cbr,
    /// FictionBook.
    Fb2,
    /// Plain text.
    Txt,
    /// HTML.
    Html,
    /// RTF.
    Rtf,
}

/// Fallback for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

impl BookFormat {
    /// MIME type served for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Mobi => "application/x-mobipocket-ebook",
            BookFormat::Cbz => "application/vnd.comicbook+zip",
            BookFormat::Cbr => "application/vnd.comicbook-rar",
            BookFormat::Fb2 => "application/x-fictionbook+xml",
            BookFormat::Txt => "text/plain",
            BookFormat::Html => "text/html",
            BookFormat::Rtf => "application/rtf",
        }
    }

    /// Format for a file extension, case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "mobi" | "azw" | "azw3" => Some(BookFormat::Mobi),
            "cbz" => Some(BookFormat::Cbz),
            "cbr" => Some(BookFormat::Cbr),
            "fb2" => Some(BookFormat::Fb2),
            "txt" => Some(BookFormat::Txt),
            "html" | "htm" => Some(BookFormat::Html),
            "rtf" => Some(BookFormat::Rtf),
            _ => None,
        }
    }

    /// Detect format from the extension of a store path.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}

/// MIME type for a store path, falling back to `application/octet-stream`.
pub fn content_type_for(path: &str) -> &'static str {
    BookFormat::from_path(path)
        .map(|f| f.mime_type())
        .unwrap_or(OCTET_STREAM)
}
