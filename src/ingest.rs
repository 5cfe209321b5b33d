//! Upload processing: take the raw bytes of one uploaded document, peel the
//! uploader envelope, sniff the syntax family, and dispatch to the parser
//! registry.

use crate::error::Result;
use crate::model::ReportFragment;
use crate::parsers::{ParserRegistry, UploadContext};
use crate::sniff;

/// Decode one uploaded document into a fragment.
///
/// Uploaders may prepend a `# path=<name>` header naming the report file the
/// payload came from; it is stripped here and used as the sniffer's name
/// hint unless the caller already supplied one. Fails with
/// [`crate::error::CovmergeError::UnusableReport`] when no parser claims the
/// document.
pub fn process_upload(
    registry: &ParserRegistry,
    content: &[u8],
    ctx: &UploadContext,
) -> Result<ReportFragment> {
    let (envelope_name, body) = split_envelope(content);

    let mut ctx = ctx.clone();
    if ctx.name_hint.is_none() {
        ctx.name_hint = envelope_name;
    }

    let kind = sniff::sniff(body, ctx.name_hint.as_deref());
    tracing::debug!(
        target: "covmerge::ingest",
        session = ctx.session_id,
        ?kind,
        name = ctx.name_hint.as_deref().unwrap_or(""),
        bytes = body.len(),
        "processing upload"
    );
    registry.decode(kind, body, &ctx)
}

/// Split off a leading `# path=<name>` envelope line, if present. The name
/// is normalized the way uploaders mangle it: `#` was their path separator
/// escape, and backslashes come from Windows agents.
fn split_envelope(content: &[u8]) -> (Option<String>, &[u8]) {
    let Some(rest) = content.strip_prefix(b"# path=") else {
        return (None, content);
    };
    let Some(at) = rest.iter().position(|&b| b == b'\n') else {
        return (None, content);
    };
    let name = String::from_utf8_lossy(&rest[..at])
        .trim()
        .replace('#', "/")
        .replace('\\', "/");
    (Some(name), &rest[at + 1..])
}
