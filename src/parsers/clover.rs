//! Parser for Clover XML coverage reports (PHP/JS tooling).
//!
//! Structure:
//!   <coverage generated="...">
//!     <project>
//!       <package>
//!         <file name="Foo.php" path="/src/Foo.php">
//!           <line num="3" type="method" name="run" count="2" complexity="5"/>
//!           <line num="5" type="stmt" count="2"/>
//!           <line num="7" type="cond" truecount="1" falsecount="0"/>
//!         </file>
//!       </package>
//!     </project>
//!   </coverage>
//!
//! Conditionals carry a true/false pair rather than arm counts: both zero is
//! a miss, one side zero is a partial, both nonzero is a hit.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::cobertura::attr_map;
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct CloverParser;

impl ReportParser for CloverParser {
    fn name(&self) -> &'static str {
        "clover"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        // The `generated` attribute on the root distinguishes Clover from
        // Cobertura, which shares the `<coverage>` element name.
        match head.find("<coverage") {
            Some(at) => head[at..]
                .lines()
                .next()
                .is_some_and(|root| root.contains("generated=")),
            None => false,
        }
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut reader = Reader::from_reader(content);
        reader.trim_text(true);

        let mut fragment = ReportFragment::new(ctx.session_id);
        let mut buf = Vec::new();
        let mut current_file: Option<ReportFile> = None;

        loop {
            let event = reader.read_event_into(&mut buf);
            match event {
                Err(e) => {
                    fragment.warn(format!("clover: XML parse error: {e}"));
                    break;
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"file" => {
                        let attrs = attr_map(e);
                        // Prefer the full path attribute; generated sources
                        // (paths containing '{') are skipped.
                        let name = attrs.get("path").or_else(|| attrs.get("name"));
                        match name {
                            Some(name) if !name.contains('{') => {
                                current_file = Some(ReportFile::new(paths::normalize(name)));
                            }
                            Some(name) => {
                                fragment.warn(format!("clover: skipping generated file '{name}'"));
                                current_file = None;
                            }
                            None => {
                                fragment.warn("clover: <file> without name".to_string());
                                current_file = None;
                            }
                        }
                    }
                    b"line" => {
                        let Some(file) = current_file.as_mut() else {
                            continue;
                        };
                        let attrs = attr_map(e);
                        let Some(number) = attrs.get("num").and_then(|n| n.parse::<u32>().ok())
                        else {
                            fragment.warn("clover: <line> without a valid num".to_string());
                            continue;
                        };

                        let mut record = LineRecord::default();
                        let state = match attrs.get("type").map(String::as_str) {
                            Some("cond") => {
                                let truecount = attr_count(&attrs, "truecount");
                                let falsecount = attr_count(&attrs, "falsecount");
                                record.observe_branch(0, truecount > 0);
                                record.observe_branch(1, falsecount > 0);
                                let taken =
                                    u64::from(truecount > 0) + u64::from(falsecount > 0);
                                CoverageState::from_branches(taken, 2)
                            }
                            Some("method") => {
                                record.method =
                                    Some(attrs.get("name").cloned().unwrap_or_default());
                                record.complexity = attrs
                                    .get("complexity")
                                    .and_then(|c| c.parse::<u32>().ok());
                                CoverageState::from_hits(attr_count(&attrs, "count"))
                            }
                            _ => CoverageState::from_hits(attr_count(&attrs, "count")),
                        };
                        record.observe(ctx.session_id, state);
                        file.record(number, record);
                    }
                    _ => {}
                },
                Ok(Event::End(ref e)) => {
                    if e.name().as_ref() == b"file" {
                        if let Some(file) = current_file.take() {
                            // Empty file documents are common in Clover
                            // output; skip them without a warning.
                            if !file.is_empty() {
                                fragment.push_file(file);
                            }
                        }
                    }
                }
                _ => {}
            }
            buf.clear();
        }

        // A file left open at EOF or by an XML error keeps its lines.
        if let Some(file) = current_file.take() {
            if !file.is_empty() {
                fragment.push_file(file);
            }
        }

        finish(fragment, self.name())
    }
}

fn attr_count(attrs: &std::collections::HashMap<String, String>, key: &str) -> u64 {
    attrs.get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0)
}
