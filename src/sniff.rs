//! Structural classification of uploaded bytes into a syntax family before
//! any semantic parsing. Sniffing looks only at the shape of the first few
//! kilobytes; it never fails on malformed input, only degrades to `Unknown`.

/// High-level syntax family of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Json,
    Xml,
    Plist,
    PlainText,
    Unknown,
}

/// How many leading bytes the sniffer inspects.
const SNIFF_WINDOW: usize = 4096;

/// Classify raw upload bytes. `name_hint` is the uploader-declared report
/// file name, when known; it only strengthens the plist check and never
/// overrides the content shape.
#[must_use]
pub fn sniff(content: &[u8], name_hint: Option<&str>) -> DocumentKind {
    if content.is_empty() {
        return DocumentKind::Unknown;
    }

    let head = String::from_utf8_lossy(&content[..content.len().min(SNIFF_WINDOW)]).into_owned();
    let trimmed = head.trim_start();

    if head.contains("<plist") || name_hint.is_some_and(|n| n.ends_with(".plist")) {
        return DocumentKind::Plist;
    }

    if trimmed.starts_with("<?xml")
        || trimmed
            .strip_prefix('<')
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_alphabetic())
    {
        return DocumentKind::Xml;
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return DocumentKind::Json;
    }

    if looks_textual(content) {
        return DocumentKind::PlainText;
    }

    DocumentKind::Unknown
}

/// A cheap binary-vs-text check over the sniff window: no NUL bytes and a
/// high proportion of printable/whitespace characters.
fn looks_textual(content: &[u8]) -> bool {
    let window = &content[..content.len().min(SNIFF_WINDOW)];
    if window.contains(&0) {
        return false;
    }
    let printable = window
        .iter()
        .filter(|&&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7f).contains(&b))
        .count();
    printable * 100 >= window.len() * 95
}
