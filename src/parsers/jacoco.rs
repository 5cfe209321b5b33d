//! Parser for JaCoCo XML coverage reports.
//!
//! Structure:
//!   <report name="project">
//!     <package name="com/example">
//!       <class name="com/example/Calc">
//!         <method name="add" line="7">
//!           <counter type="COMPLEXITY" missed="1" covered="2"/>
//!         </method>
//!       </class>
//!       <sourcefile name="Calc.java">
//!         <line nr="7" mi="0" ci="3" mb="1" cb="1"/>
//!       </sourcefile>
//!     </package>
//!   </report>
//!
//! Line attributes: mi/ci are missed/covered instructions, mb/cb are
//! missed/covered branches. Branchful lines derive their state from cb out
//! of mb+cb arms. Method complexity is collected from the class elements and
//! attached to the matching source line (classes precede sourcefiles within
//! a package).

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::cobertura::attr_map;
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct JacocoParser;

impl ReportParser for JacocoParser {
    fn name(&self) -> &'static str {
        "jacoco"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        head.contains("<report")
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut reader = Reader::from_reader(content);
        reader.trim_text(true);

        let mut fragment = ReportFragment::new(ctx.session_id);
        let mut buf = Vec::new();

        let mut package = String::new();
        // (class name, line) → method metadata, gathered before sourcefiles.
        let mut methods: HashMap<(String, u32), MethodInfo> = HashMap::new();
        let mut current_class: Option<String> = None;
        let mut current_method_line: Option<u32> = None;
        let mut current_file: Option<ReportFile> = None;
        // Class-name key for the sourcefile being read (package + stem).
        let mut file_class_key = String::new();

        loop {
            let event = reader.read_event_into(&mut buf);
            match event {
                Err(e) => {
                    fragment.warn(format!("jacoco: XML parse error: {e}"));
                    break;
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"package" => {
                        let attrs = attr_map(e);
                        package = attrs.get("name").cloned().unwrap_or_default();
                        methods.clear();
                    }
                    b"class" => {
                        let attrs = attr_map(e);
                        // Synthetic inner classes carry no useful method data.
                        current_class = attrs
                            .get("name")
                            .filter(|name| !name.contains('$'))
                            .cloned();
                    }
                    b"method" => {
                        let attrs = attr_map(e);
                        current_method_line =
                            attrs.get("line").and_then(|l| l.parse::<u32>().ok()).filter(|&l| l > 0);
                        if let (Some(class), Some(line)) = (&current_class, current_method_line) {
                            methods.insert(
                                (class.clone(), line),
                                MethodInfo {
                                    name: attrs.get("name").cloned().unwrap_or_default(),
                                    complexity: None,
                                },
                            );
                        }
                    }
                    b"counter" => {
                        let (Some(class), Some(line)) = (&current_class, current_method_line)
                        else {
                            continue;
                        };
                        let attrs = attr_map(e);
                        if attrs.get("type").map(String::as_str) == Some("COMPLEXITY") {
                            let missed = attr_u32(&attrs, "missed");
                            let covered = attr_u32(&attrs, "covered");
                            if let Some(info) = methods.get_mut(&(class.clone(), line)) {
                                info.complexity = Some(missed + covered);
                            }
                        }
                    }
                    b"sourcefile" => {
                        let attrs = attr_map(e);
                        let Some(name) = attrs.get("name") else {
                            fragment.warn("jacoco: <sourcefile> without name".to_string());
                            continue;
                        };
                        let source_name = if package.is_empty() {
                            name.clone()
                        } else {
                            format!("{package}/{name}")
                        };
                        let stem = source_name
                            .split_once('.')
                            .map_or(source_name.as_str(), |(stem, _)| stem);
                        file_class_key = stem.to_string();
                        current_file = Some(ReportFile::new(paths::normalize(&source_name)));
                    }
                    b"line" => {
                        let Some(file) = current_file.as_mut() else {
                            continue;
                        };
                        let attrs = attr_map(e);
                        let Some(number) = attrs.get("nr").and_then(|n| n.parse::<u32>().ok())
                        else {
                            fragment.warn("jacoco: <line> without a valid nr".to_string());
                            continue;
                        };

                        let ci = attr_u32(&attrs, "ci");
                        let mb = attr_u32(&attrs, "mb");
                        let cb = attr_u32(&attrs, "cb");

                        let mut record = LineRecord::default();
                        let state = if mb + cb > 0 {
                            for index in 0..mb + cb {
                                record.observe_branch(index, index < cb);
                            }
                            CoverageState::from_branches(u64::from(cb), u64::from(mb + cb))
                        } else {
                            CoverageState::from_hits(u64::from(ci))
                        };
                        record.observe(ctx.session_id, state);

                        if let Some(info) = methods.get(&(file_class_key.clone(), number)) {
                            record.method = Some(info.name.clone());
                            record.complexity = info.complexity;
                        }

                        file.record(number, record);
                    }
                    _ => {}
                },
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"sourcefile" => {
                        if let Some(file) = current_file.take() {
                            if !file.is_empty() {
                                fragment.push_file(file);
                            }
                        }
                    }
                    b"class" => current_class = None,
                    b"method" => current_method_line = None,
                    _ => {}
                },
                _ => {}
            }
            buf.clear();
        }

        // A sourcefile left open at EOF or by an XML error keeps its lines.
        if let Some(file) = current_file.take() {
            if !file.is_empty() {
                fragment.push_file(file);
            }
        }

        finish(fragment, self.name())
    }
}

struct MethodInfo {
    name: String,
    complexity: Option<u32>,
}

fn attr_u32(attrs: &HashMap<String, String>, key: &str) -> u32 {
    attrs.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0)
}
