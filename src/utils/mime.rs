//! Content type checks for fetched pages.

/// Coarse kind of a fetched payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Html,
    Document,
    Image,
    Archive,
    Binary,
}

impl PageKind {
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            "" | "text/html" | "application/xhtml+xml" | "text/plain" => Self::Html,
            "application/pdf" | "application/msword" | "application/rtf" => Self::Document,
            m if m.contains("word") || m.contains("spreadsheet") || m.contains("presentation") => {
                Self::Document
            }
            m if m.starts_with("image/") => Self::Image,
            "application/zip" | "application/gzip" | "application/x-tar"
            | "application/x-7z-compressed" | "application/x-rar-compressed" => Self::Archive,
            m if m.starts_with("text/") => Self::Html,
            _ => Self::Binary,
        }
    }

    pub fn is_html(&self) -> bool {
        matches!(self, Self::Html)
    }
}

/// Whether a Content-Type header value can carry an HTML page.
///
/// Missing or plain-text types are given the benefit of the doubt.
pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    content_type.map_or(true, |ct| PageKind::from_mime(ct).is_html())
}

/// Detect a binary payload (PDF, image, archive) from its magic bytes.
pub fn sniff_binary(body: &[u8]) -> Option<&'static str> {
    let kind = infer::get(body)?;
    match kind.matcher_type() {
        infer::MatcherType::Text => None,
        _ => Some(kind.mime_type()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_kind() {
        assert_eq!(PageKind::from_mime("text/html; charset=utf-8"), PageKind::Html);
        assert_eq!(PageKind::from_mime("application/pdf"), PageKind::Document);
        assert_eq!(PageKind::from_mime("image/png"), PageKind::Image);
        assert_eq!(PageKind::from_mime("application/octet-stream"), PageKind::Binary);
    }

    #[test]
    fn test_missing_content_type_is_html() {
        assert!(is_html_content_type(None));
        assert!(!is_html_content_type(Some("application/pdf")));
    }

    #[test]
    fn test_sniff_pdf() {
        assert_eq!(sniff_binary(b"%PDF-1.7\n%binary"), Some("application/pdf"));
        assert_eq!(sniff_binary(b"<!doctype html><html></html>"), None);
    }
}
