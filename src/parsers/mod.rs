//! Per-tool report parsers and the registry that dispatches to them.
//!
//! Parsers are partitioned by the sniffer's syntax family so only plausible
//! candidates are tried. Within a family they are consulted in a fixed
//! priority order and the first one whose [`ReportParser::claims`] returns
//! true is used exclusively — ambiguous formats are disambiguated by making
//! `claims` stricter, never by trying several parsers and picking a result.

pub mod clover;
pub mod cobertura;
pub mod gocover;
pub mod istanbul;
pub mod jacoco;
pub mod lcov;
pub mod xcodeplist;

use crate::error::{CovmergeError, Result};
use crate::model::{ReportFragment, SessionId};
use crate::sniff::DocumentKind;

/// Caller-supplied context for decoding one upload.
#[derive(Debug, Clone)]
pub struct UploadContext {
    /// The session this document belongs to.
    pub session_id: SessionId,
    /// Name of the original report file, when the uploader declared one.
    pub name_hint: Option<String>,
    /// Tool name declared by the uploader. A hint only: `claims` stays
    /// authoritative over any declared tool name.
    pub tool_hint: Option<String>,
}

impl UploadContext {
    #[must_use]
    pub fn new(session_id: SessionId) -> UploadContext {
        UploadContext {
            session_id,
            name_hint: None,
            tool_hint: None,
        }
    }
}

/// Every format parser implements this capability pair.
pub trait ReportParser {
    /// Short tool name, used in errors and warnings.
    fn name(&self) -> &'static str;

    /// Whether this parser recognizes the document. `head` is the first few
    /// kilobytes of the upload, lossily decoded. Must be cheap and must not
    /// panic on arbitrary input.
    fn claims(&self, head: &str, ctx: &UploadContext) -> bool;

    /// Decode the full document into a fragment. Total over any input
    /// accepted by `claims`: unparseable individual entries degrade to soft
    /// warnings on the fragment, not hard failures.
    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment>;
}

/// Lossily decode the sniff window of a document for `claims` checks.
#[must_use]
pub(crate) fn sniff_head(content: &[u8]) -> String {
    String::from_utf8_lossy(&content[..content.len().min(4096)]).into_owned()
}

/// Finish a decode: a fragment that recovered nothing despite skipping
/// entries means the document was claimed but unusable.
pub(crate) fn finish(fragment: ReportFragment, parser: &'static str) -> Result<ReportFragment> {
    if fragment.is_empty() && !fragment.warnings().is_empty() {
        return Err(CovmergeError::MalformedReport { parser });
    }
    Ok(fragment)
}

/// The ordered set of parsers, grouped by syntax family.
pub struct ParserRegistry {
    xml: Vec<Box<dyn ReportParser>>,
    json: Vec<Box<dyn ReportParser>>,
    plist: Vec<Box<dyn ReportParser>>,
    text: Vec<Box<dyn ReportParser>>,
}

impl Default for ParserRegistry {
    fn default() -> ParserRegistry {
        ParserRegistry {
            // Cobertura last: its `<coverage>` root is the loosest match.
            xml: vec![
                Box::new(clover::CloverParser),
                Box::new(jacoco::JacocoParser),
                Box::new(cobertura::CoberturaParser),
            ],
            json: vec![Box::new(istanbul::IstanbulParser)],
            plist: vec![Box::new(xcodeplist::XcodePlistParser)],
            text: vec![Box::new(lcov::LcovParser), Box::new(gocover::GocoverParser)],
        }
    }
}

impl ParserRegistry {
    #[must_use]
    pub fn new() -> ParserRegistry {
        ParserRegistry::default()
    }

    fn candidates(&self, kind: DocumentKind) -> &[Box<dyn ReportParser>] {
        match kind {
            DocumentKind::Xml => &self.xml,
            DocumentKind::Json => &self.json,
            DocumentKind::Plist => &self.plist,
            // An unclassifiable upload gets one best-effort pass through the
            // line-based parsers before being reported unusable.
            DocumentKind::PlainText | DocumentKind::Unknown => &self.text,
        }
    }

    /// Find the first claiming parser for `kind` and decode with it.
    pub fn decode(
        &self,
        kind: DocumentKind,
        content: &[u8],
        ctx: &UploadContext,
    ) -> Result<ReportFragment> {
        let head = sniff_head(content);
        for parser in self.candidates(kind) {
            if parser.claims(&head, ctx) {
                tracing::debug!(
                    target: "covmerge::decode",
                    parser = parser.name(),
                    session = ctx.session_id,
                    "parser claimed upload"
                );
                return parser.decode(content, ctx);
            }
        }
        Err(CovmergeError::UnusableReport)
    }
}
