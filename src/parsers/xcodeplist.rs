//! Parser for Xcode `.xccoverage` property-list reports.
//!
//! The document is an NSKeyedArchiver archive serialized as an XML plist:
//! a `$objects` array where references between objects are `CF$UID` indices.
//! The archive's top array (index 2) lists coverage targets; each target
//! holds `sourceFiles`, each source file a `documentLocation` (the path) and
//! a `lines` array. A line object has `c` (execution count), `x` (whether
//! the line is tracked), and `s` (a reference to its branch list, 0 when the
//! line has none). Branch objects with `len == 2` are method endings and are
//! skipped; for the rest, `x > 0` means the arm was taken.

use std::collections::BTreeMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{CovmergeError, Result};
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct XcodePlistParser;

impl ReportParser for XcodePlistParser {
    fn name(&self) -> &'static str {
        "xcodeplist"
    }

    fn claims(&self, head: &str, ctx: &UploadContext) -> bool {
        head.contains("<plist")
            || ctx
                .name_hint
                .as_deref()
                .is_some_and(|name| name.ends_with(".plist") || name.ends_with(".xccoverage"))
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut fragment = ReportFragment::new(ctx.session_id);
        let root = match parse_plist(content) {
            Ok(root) => root,
            Err(e) => {
                fragment.warn(format!("xcodeplist: {e}"));
                return finish(fragment, self.name());
            }
        };

        let Some(objects) = root.key("$objects").and_then(Plist::as_array) else {
            fragment.warn("xcodeplist: document is not a keyed archive".to_string());
            return finish(fragment, self.name());
        };

        let targets = objects
            .get(2)
            .and_then(|top| top.key("NS.objects"))
            .and_then(Plist::as_array);
        let Some(targets) = targets else {
            fragment.warn("xcodeplist: archive has no coverage targets".to_string());
            return finish(fragment, self.name());
        };

        for target_ref in targets {
            let source_files = resolve(objects, target_ref)
                .and_then(|target| target.key("sourceFiles"))
                .and_then(|refs| resolve(objects, refs))
                .and_then(|list| list.key("NS.objects"))
                .and_then(Plist::as_array);
            let Some(source_files) = source_files else {
                fragment.warn("xcodeplist: target without sourceFiles".to_string());
                continue;
            };

            for file_ref in source_files {
                if let Err(message) = decode_source_file(objects, file_ref, ctx, &mut fragment) {
                    fragment.warn(message);
                }
            }
        }

        finish(fragment, self.name())
    }
}

fn decode_source_file(
    objects: &[Plist],
    file_ref: &Plist,
    ctx: &UploadContext,
    fragment: &mut ReportFragment,
) -> std::result::Result<(), String> {
    let source = resolve(objects, file_ref).ok_or("xcodeplist: dangling sourceFile reference")?;

    let location = source
        .key("documentLocation")
        .and_then(|loc| resolve(objects, loc))
        .and_then(Plist::as_str)
        .ok_or("xcodeplist: sourceFile without documentLocation")?;
    let path = paths::normalize(location.strip_prefix("file://").unwrap_or(location));

    let lines = source
        .key("lines")
        .and_then(|refs| resolve(objects, refs))
        .and_then(|list| list.key("NS.objects"))
        .and_then(Plist::as_array)
        .ok_or_else(|| format!("xcodeplist: no lines for '{path}'"))?;

    let mut file = ReportFile::new(path);
    for (index, line_ref) in lines.iter().enumerate() {
        let number = index as u32 + 1;
        let Some(line) = resolve(objects, line_ref) else {
            continue;
        };
        // Untracked lines are not instrumentable.
        if line.key("x") == Some(&Plist::Bool(false)) {
            continue;
        }

        let mut record = LineRecord::default();
        let branch_uid = line
            .key("s")
            .and_then(|s| s.key("CF$UID"))
            .and_then(Plist::as_int)
            .unwrap_or(0);

        let state = if branch_uid > 0 {
            let arms = objects
                .get(branch_uid as usize)
                .and_then(|list| list.key("NS.objects"))
                .and_then(Plist::as_array)
                .map(|refs| branch_arms(objects, refs))
                .unwrap_or_default();
            let taken = arms.iter().filter(|&&t| t).count() as u64;
            for (arm, &arm_taken) in arms.iter().enumerate() {
                record.observe_branch(arm as u32, arm_taken);
            }
            CoverageState::from_branches(taken, arms.len() as u64)
        } else {
            let count = line.key("c").and_then(Plist::as_int).unwrap_or(0);
            CoverageState::from_hits(count.max(0) as u64)
        };

        record.observe(ctx.session_id, state);
        file.record(number, record);
    }

    if !file.is_empty() {
        fragment.push_file(file);
    }
    Ok(())
}

/// Collect taken/untaken outcomes from a line's branch list, skipping the
/// method-ending markers (`len == 2`).
fn branch_arms(objects: &[Plist], refs: &[Plist]) -> Vec<bool> {
    refs.iter()
        .filter_map(|branch_ref| resolve(objects, branch_ref))
        .filter(|branch| branch.key("len").and_then(Plist::as_int) != Some(2))
        .map(|branch| branch.key("x").and_then(Plist::as_int).unwrap_or(0) > 0)
        .collect()
}

/// Follow a `{ CF$UID: n }` reference into the `$objects` table.
fn resolve<'a>(objects: &'a [Plist], reference: &Plist) -> Option<&'a Plist> {
    let uid = reference.key("CF$UID")?.as_int()?;
    objects.get(usize::try_from(uid).ok()?)
}

/// A generic property-list value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plist {
    Dict(BTreeMap<String, Plist>),
    Array(Vec<Plist>),
    String(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
}

impl Plist {
    fn key(&self, key: &str) -> Option<&Plist> {
        match self {
            Plist::Dict(map) => map.get(key),
            _ => None,
        }
    }

    fn as_array(&self) -> Option<&[Plist]> {
        match self {
            Plist::Array(items) => Some(items),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Plist::String(value) => Some(value),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Plist::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// What the builder is currently assembling.
enum Container {
    Dict {
        map: BTreeMap<String, Plist>,
        pending_key: Option<String>,
    },
    Array(Vec<Plist>),
}

/// Parse an XML property list into a [`Plist`] value.
pub(crate) fn parse_plist(content: &[u8]) -> Result<Plist> {
    let mut reader = Reader::from_reader(content);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Container> = Vec::new();
    let mut root: Option<Plist> = None;
    let mut text = String::new();

    fn attach(stack: &mut Vec<Container>, root: &mut Option<Plist>, value: Plist) -> Result<()> {
        match stack.last_mut() {
            Some(Container::Dict { map, pending_key }) => {
                let key = pending_key
                    .take()
                    .ok_or_else(|| CovmergeError::Parse("plist value without a key".into()))?;
                map.insert(key, value);
            }
            Some(Container::Array(items)) => items.push(value),
            None => *root = Some(value),
        }
        Ok(())
    }

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(e.into()),
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"plist" => {}
                b"dict" => stack.push(Container::Dict {
                    map: BTreeMap::new(),
                    pending_key: None,
                }),
                b"array" => stack.push(Container::Array(Vec::new())),
                b"key" | b"string" | b"integer" | b"real" | b"data" | b"date" => text.clear(),
                other => {
                    return Err(CovmergeError::Parse(format!(
                        "unexpected plist element '{}'",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"true" => attach(&mut stack, &mut root, Plist::Bool(true))?,
                b"false" => attach(&mut stack, &mut root, Plist::Bool(false))?,
                b"dict" => attach(&mut stack, &mut root, Plist::Dict(BTreeMap::new()))?,
                b"array" => attach(&mut stack, &mut root, Plist::Array(Vec::new()))?,
                b"string" | b"data" | b"date" => {
                    attach(&mut stack, &mut root, Plist::String(String::new()))?
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                if let Ok(chunk) = e.unescape() {
                    text.push_str(&chunk);
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"plist" => {}
                b"key" => {
                    if let Some(Container::Dict { pending_key, .. }) = stack.last_mut() {
                        *pending_key = Some(std::mem::take(&mut text));
                    }
                }
                b"string" | b"data" | b"date" => {
                    attach(&mut stack, &mut root, Plist::String(std::mem::take(&mut text)))?;
                }
                b"integer" => {
                    let value = text.trim().parse::<i64>().map_err(|_| {
                        CovmergeError::Parse(format!("invalid plist integer '{text}'"))
                    })?;
                    attach(&mut stack, &mut root, Plist::Integer(value))?;
                }
                b"real" => {
                    let value = text.trim().parse::<f64>().map_err(|_| {
                        CovmergeError::Parse(format!("invalid plist real '{text}'"))
                    })?;
                    attach(&mut stack, &mut root, Plist::Real(value))?;
                }
                b"dict" | b"array" => {
                    let value = match stack.pop() {
                        Some(Container::Dict { map, .. }) => Plist::Dict(map),
                        Some(Container::Array(items)) => Plist::Array(items),
                        None => {
                            return Err(CovmergeError::Parse(
                                "unbalanced plist container".into(),
                            ))
                        }
                    };
                    attach(&mut stack, &mut root, value)?;
                }
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| CovmergeError::Parse("empty plist document".into()))
}
