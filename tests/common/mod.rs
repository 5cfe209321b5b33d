use covmerge::ingest::process_upload;
use covmerge::merge::fold_fragment;
use covmerge::model::{Report, Session};
use covmerge::parsers::{ParserRegistry, UploadContext};

/// Decode `upload` and fold it into `report` as a new session tagged with
/// `flags`. Panics on any error; tests exercising failure paths call the
/// library directly.
pub fn fold_upload(report: &mut Report, upload: &[u8], flags: &[&str]) {
    let registry = ParserRegistry::new();
    let session_id = report.next_session_id();
    let fragment = process_upload(&registry, upload, &UploadContext::new(session_id)).unwrap();
    let session = Session::new(session_id, flags.iter().map(|f| f.to_string()));
    fold_fragment(report, session, fragment).unwrap();
}

/// A report built from a single upload.
pub fn report_from_upload(upload: &[u8], flags: &[&str]) -> Report {
    let mut report = Report::new();
    fold_upload(&mut report, upload, flags);
    report
}
