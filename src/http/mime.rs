//! MIME type table, binary-searched by extension as thttpd's `mime_encodings`
//! table is. Extensions ending in `.gz`/`.Z` resolve the type of the
//! underlying file and report a `gzip`/`compress` content-encoding so the
//! response can advertise the pre-compressed companion transparently.

struct MimeEntry {
    ext: &'static str,
    mime_type: &'static str,
}

// Kept sorted by extension for the binary search below.
const MIME_TABLE: &[MimeEntry] = &[
    MimeEntry { ext: "avi", mime_type: "video/x-msvideo" },
    MimeEntry { ext: "bin", mime_type: "application/octet-stream" },
    MimeEntry { ext: "bmp", mime_type: "image/bmp" },
    MimeEntry { ext: "css", mime_type: "text/css" },
    MimeEntry { ext: "csv", mime_type: "text/csv" },
    MimeEntry { ext: "gif", mime_type: "image/gif" },
    MimeEntry { ext: "htm", mime_type: "text/html" },
    MimeEntry { ext: "html", mime_type: "text/html" },
    MimeEntry { ext: "ico", mime_type: "image/x-icon" },
    MimeEntry { ext: "jpeg", mime_type: "image/jpeg" },
    MimeEntry { ext: "jpg", mime_type: "image/jpeg" },
    MimeEntry { ext: "js", mime_type: "application/javascript" },
    MimeEntry { ext: "json", mime_type: "application/json" },
    MimeEntry { ext: "mp3", mime_type: "audio/mpeg" },
    MimeEntry { ext: "mp4", mime_type: "video/mp4" },
    MimeEntry { ext: "pdf", mime_type: "application/pdf" },
    MimeEntry { ext: "png", mime_type: "image/png" },
    MimeEntry { ext: "svg", mime_type: "image/svg+xml" },
    MimeEntry { ext: "txt", mime_type: "text/plain" },
    MimeEntry { ext: "wav", mime_type: "audio/wav" },
    MimeEntry { ext: "woff", mime_type: "font/woff" },
    MimeEntry { ext: "woff2", mime_type: "font/woff2" },
    MimeEntry { ext: "xml", mime_type: "application/xml" },
    MimeEntry { ext: "zip", mime_type: "application/zip" },
];

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Compress,
}

impl ContentEncoding {
    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            ContentEncoding::Identity => None,
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Compress => Some("compress"),
        }
    }
}

/// Splits a trailing `.gz`/`.Z` off `name`, returning the encoding it
/// implies and the name with that suffix stripped, so the MIME type is
/// derived from the underlying file's real extension.
pub fn strip_compression_suffix(name: &str) -> (&str, ContentEncoding) {
    if let Some(stripped) = name.strip_suffix(".gz") {
        (stripped, ContentEncoding::Gzip)
    } else if let Some(stripped) = name.strip_suffix(".Z") {
        (stripped, ContentEncoding::Compress)
    } else {
        (name, ContentEncoding::Identity)
    }
}

pub fn mime_type_for(name: &str) -> &'static str {
    let (base, _) = strip_compression_suffix(name);
    let ext = match base.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };
    MIME_TABLE
        .binary_search_by(|entry| entry.ext.cmp(ext.as_str()))
        .map(|i| MIME_TABLE[i].mime_type)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        for w in MIME_TABLE.windows(2) {
            assert!(w[0].ext < w[1].ext, "{} >= {}", w[0].ext, w[1].ext);
        }
    }

    #[test]
    fn known_extension() {
        assert_eq!(mime_type_for("index.html"), "text/html");
        assert_eq!(mime_type_for("photo.JPG"), "image/jpeg");
    }

    #[test]
    fn unknown_extension_falls_back() {
        assert_eq!(mime_type_for("README"), DEFAULT_MIME_TYPE);
        assert_eq!(mime_type_for("weird.xyz123"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn gzip_suffix_uses_underlying_type() {
        assert_eq!(mime_type_for("bundle.js.gz"), "application/javascript");
        let (base, enc) = strip_compression_suffix("bundle.js.gz");
        assert_eq!(base, "bundle.js");
        assert_eq!(enc, ContentEncoding::Gzip);
    }
}
