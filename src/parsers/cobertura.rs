//! Parser for Cobertura XML coverage reports.
//!
//! Cobertura XML structure:
//!   <coverage>
//!     <sources><source>...</source></sources>
//!     <packages>
//!       <package name="...">
//!         <classes>
//!           <class name="..." filename="...">
//!             <methods>
//!               <method name="..." complexity="...">
//!                 <lines><line number="..." hits="..." /></lines>
//!               </method>
//!             </methods>
//!             <lines>
//!               <line number="..." hits="..." branch="true|false"
//!                     condition-coverage="50% (1/2)" />
//!             </lines>
//!           </class>
//!         </classes>
//!       </package>
//!     </packages>
//!   </coverage>
//!
//! Lines may appear both under `<method><lines>` and `<class><lines>`; the
//! fragment's join rule deduplicates them.

use std::collections::HashMap;
use std::str;
use std::sync::LazyLock;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

/// Pre-compiled regex for condition-coverage attributes like "75% (3/4)".
static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)/(\d+)\)").unwrap());

pub struct CoberturaParser;

impl ReportParser for CoberturaParser {
    fn name(&self) -> &'static str {
        "cobertura"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        head.contains("<coverage")
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut reader = Reader::from_reader(content);
        reader.trim_text(true);

        let mut fragment = ReportFragment::new(ctx.session_id);
        let mut buf = Vec::new();

        let mut current_file: Option<ReportFile> = None;
        let mut in_method = false;
        let mut method_name: Option<String> = None;
        let mut method_complexity: Option<u32> = None;
        let mut method_start: Option<u32> = None;

        // Source prefixes from <source> elements.
        let mut sources: Vec<String> = Vec::new();
        let mut in_source = false;

        loop {
            let event = reader.read_event_into(&mut buf);
            let is_start = matches!(&event, Ok(Event::Start(_)));
            match event {
                // Malformed XML in a claimed document: keep what was read so
                // far and let finish() decide whether anything was usable.
                Err(e) => {
                    fragment.warn(format!("cobertura: XML parse error: {e}"));
                    break;
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    match e.name().as_ref() {
                        b"source" => {
                            // Self-closing <source/> has no text content; only
                            // a Start event should arm text capture.
                            if is_start {
                                in_source = true;
                            }
                        }
                        b"class" => {
                            let attrs = attr_map(e);
                            if let Some(filename) = attrs.get("filename") {
                                let path = resolve_source_path(filename, &sources);
                                current_file = Some(ReportFile::new(paths::normalize(&path)));
                            } else {
                                fragment.warn("cobertura: <class> without filename".to_string());
                            }
                        }
                        b"method" => {
                            let attrs = attr_map(e);
                            in_method = true;
                            method_name = attrs.get("name").cloned();
                            method_complexity = attrs
                                .get("complexity")
                                .and_then(|c| c.parse::<f64>().ok())
                                .map(|c| c.round() as u32);
                            method_start = None;
                        }
                        b"line" => {
                            let attrs = attr_map(e);
                            let Some(file) = current_file.as_mut() else {
                                continue;
                            };
                            let Some(number) =
                                attrs.get("number").and_then(|n| n.parse::<u32>().ok())
                            else {
                                fragment.warn("cobertura: <line> without a valid number".to_string());
                                continue;
                            };
                            let hits = attrs
                                .get("hits")
                                .and_then(|h| h.parse::<u64>().ok())
                                .unwrap_or(0);

                            let mut record = LineRecord::default();
                            let is_branch =
                                attrs.get("branch").map(|v| v == "true").unwrap_or(false);
                            let condition = attrs
                                .get("condition-coverage")
                                .and_then(|c| parse_condition(c))
                                .filter(|&(_, total)| is_branch && total > 0);
                            let state = match condition {
                                Some((covered, total)) => {
                                    for index in 0..total {
                                        record.observe_branch(index, index < covered);
                                    }
                                    CoverageState::from_branches(u64::from(covered), u64::from(total))
                                }
                                None => CoverageState::from_hits(hits),
                            };
                            record.observe(ctx.session_id, state);

                            if in_method && method_start.is_none() {
                                method_start = Some(number);
                                record.method = method_name.clone();
                                record.complexity = method_complexity;
                            }

                            file.record(number, record);
                        }
                        _ => {}
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if in_source {
                        if let Ok(text) = e.unescape() {
                            sources.push(text.to_string());
                        }
                        in_source = false;
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"source" => in_source = false,
                    b"class" => {
                        if let Some(file) = current_file.take() {
                            if file.is_empty() {
                                fragment
                                    .warn(format!("cobertura: no lines for '{}'", file.path()));
                            } else {
                                fragment.push_file(file);
                            }
                        }
                    }
                    b"method" => {
                        in_method = false;
                        method_name = None;
                        method_complexity = None;
                        method_start = None;
                    }
                    _ => {}
                },
                _ => {}
            }
            buf.clear();
        }

        // Unclosed <class> at EOF.
        if let Some(file) = current_file.take() {
            if !file.is_empty() {
                fragment.push_file(file);
            }
        }

        finish(fragment, self.name())
    }
}

/// Parse a condition-coverage attribute like "50% (1/2)" into (covered, total).
fn parse_condition(value: &str) -> Option<(u32, u32)> {
    let caps = BRANCH_RE.captures(value)?;
    let covered = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((covered, total))
}

/// Resolve a filename against the list of `<source>` prefixes: absolute
/// filenames pass through, otherwise the first non-empty prefix applies.
fn resolve_source_path(filename: &str, sources: &[String]) -> String {
    if filename.starts_with('/') {
        return filename.to_string();
    }
    for source in sources {
        let base = source.trim_end_matches('/');
        if !base.is_empty() {
            return format!("{base}/{filename}");
        }
    }
    filename.to_string()
}

/// Extract attributes from an XML element into a HashMap.
pub(crate) fn attr_map(e: &quick_xml::events::BytesStart) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|a| {
            let attr = a.ok()?;
            let key = str::from_utf8(attr.key.local_name().into_inner())
                .ok()?
                .to_string();
            let value = attr.unescape_value().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CovmergeError;

    const SAMPLE: &[u8] = br#"<?xml version="1.0"?>
<coverage line-rate="0.8" version="1.9">
  <sources><source></source><source>/home/user/project</source></sources>
  <packages>
    <package name="src">
      <classes>
        <class name="main" filename="src/main.py">
          <methods>
            <method name="do_stuff" complexity="3">
              <lines><line number="5" hits="1"/></lines>
            </method>
          </methods>
          <lines>
            <line number="1" hits="1"/>
            <line number="3" hits="0"/>
            <line number="5" hits="1"/>
            <line number="8" hits="1" branch="true" condition-coverage="50% (1/2)"/>
          </lines>
        </class>
        <class name="util" filename="src/util.py">
          <lines>
            <line number="1" hits="2"/>
            <line number="2" hits="0"/>
          </lines>
        </class>
      </classes>
    </package>
  </packages>
</coverage>
"#;

    #[test]
    fn test_parse_cobertura() {
        let fragment = CoberturaParser.decode(SAMPLE, &UploadContext::new(0)).unwrap();
        assert_eq!(fragment.file_count(), 2);

        let main = fragment.file("/home/user/project/src/main.py").unwrap();
        assert_eq!(main.get(1).unwrap().coverage(), CoverageState::Hit);
        assert_eq!(main.get(3).unwrap().coverage(), CoverageState::Miss);

        // Line 8: 50% (1/2) — partial with one taken and one untaken arm.
        let branchy = main.get(8).unwrap();
        assert_eq!(branchy.coverage(), CoverageState::Partial);
        assert_eq!(branchy.branches.len(), 2);
        assert_eq!(branchy.branches.get(&0), Some(&true));
        assert_eq!(branchy.branches.get(&1), Some(&false));

        // Method metadata lands on the method's first line, deduplicated
        // against the same line in <class><lines>.
        let method_line = main.get(5).unwrap();
        assert_eq!(method_line.method.as_deref(), Some("do_stuff"));
        assert_eq!(method_line.complexity, Some(3));
        assert_eq!(method_line.coverage(), CoverageState::Hit);

        let util = fragment.file("/home/user/project/src/util.py").unwrap();
        assert_eq!(util.len(), 2);
    }

    #[test]
    fn test_parse_condition() {
        assert_eq!(parse_condition("50% (1/2)"), Some((1, 2)));
        assert_eq!(parse_condition("100% (4/4)"), Some((4, 4)));
        assert_eq!(parse_condition("garbage"), None);
    }

    #[test]
    fn test_resolve_source_path() {
        let sources = vec![String::new(), "/home/user/project".to_string()];
        assert_eq!(
            resolve_source_path("src/app.py", &sources),
            "/home/user/project/src/app.py"
        );
        assert_eq!(resolve_source_path("/abs/app.py", &sources), "/abs/app.py");
        assert_eq!(resolve_source_path("src/f.rs", &[]), "src/f.rs");
    }

    #[test]
    fn test_malformed_xml_is_malformed_report() {
        let doc = br#"<coverage line-rate="1"><packages></wrong>"#;
        let result = CoberturaParser.decode(doc, &UploadContext::new(0));
        assert!(matches!(
            result,
            Err(CovmergeError::MalformedReport { parser: "cobertura" })
        ));
    }

    #[test]
    fn test_xml_error_keeps_files_already_read() {
        let doc = br#"<coverage><packages><package name="p"><classes>
            <class name="a" filename="a.py"><lines><line number="1" hits="1"/></lines></class>
            </wrong>"#;
        let fragment = CoberturaParser.decode(doc, &UploadContext::new(0)).unwrap();
        assert_eq!(fragment.file_count(), 1);
        assert!(!fragment.warnings().is_empty());
    }

    #[test]
    fn test_claims() {
        let ctx = UploadContext::new(0);
        assert!(CoberturaParser.claims("<?xml version=\"1.0\"?>\n<coverage>", &ctx));
        assert!(!CoberturaParser.claims("<report name=\"x\">", &ctx));
    }
}
