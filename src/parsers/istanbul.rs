//! Parser for Istanbul / NYC `coverage-final.json` output.
//!
//! Reference: https://github.com/istanbuljs/istanbuljs
//!
//! The document is a JSON object keyed by file path. Each value contains:
//!   - `statementMap`: `{ "0": { "start": { "line": 1, ... }, ... }, ... }`
//!   - `s`:            `{ "0": 5, ... }` — hit counts per statement
//!   - `branchMap`:    `{ "0": { "loc": ..., "locations": [...] }, ... }`
//!   - `b`:            `{ "0": [5, 0], ... }` — hit counts per branch arm
//!   - `fnMap`:        `{ "0": { "name": "foo", "decl": ..., "loc": ... }, ... }`
//!   - `f`:            `{ "0": 3, ... }` — hit counts per function

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct IstanbulParser;

impl ReportParser for IstanbulParser {
    fn name(&self) -> &'static str {
        "istanbul"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        let trimmed = head.trim_start();
        // "s" alone is too generic — require the two map keys.
        trimmed.starts_with('{')
            && trimmed.contains("\"statementMap\"")
            && trimmed.contains("\"fnMap\"")
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut fragment = ReportFragment::new(ctx.session_id);
        // A claimed document that does not parse is malformed, not an error:
        // claims() has already committed this parser to the upload.
        let document: BTreeMap<String, Value> = match serde_json::from_slice(content) {
            Ok(document) => document,
            Err(e) => {
                fragment.warn(format!("istanbul: invalid JSON: {e}"));
                return finish(fragment, self.name());
            }
        };

        for (path, entry) in &document {
            let Some(entry) = entry.as_object() else {
                fragment.warn(format!("istanbul: entry for '{path}' is not an object"));
                continue;
            };
            // Some generators nest the real data under "data".
            let entry = entry
                .get("data")
                .and_then(Value::as_object)
                .unwrap_or(entry);

            let mut file = ReportFile::new(paths::normalize(path));
            let lines = collect_lines(entry);
            for (number, line) in lines {
                let mut record = LineRecord::default();
                let state = if line.arms.is_empty() {
                    CoverageState::from_hits(line.statement_hits.unwrap_or(0))
                } else {
                    let taken = line.arms.iter().filter(|&&t| t).count() as u64;
                    for (index, &arm_taken) in line.arms.iter().enumerate() {
                        record.observe_branch(index as u32, arm_taken);
                    }
                    CoverageState::from_branches(taken, line.arms.len() as u64)
                };
                record.observe(ctx.session_id, state);
                record.method = line.method;
                file.record(number, record);
            }

            if file.is_empty() {
                fragment.warn(format!("istanbul: no usable entries for '{path}'"));
                continue;
            }
            fragment.push_file(file);
        }

        finish(fragment, self.name())
    }
}

#[derive(Default)]
struct LineFacts {
    statement_hits: Option<u64>,
    arms: Vec<bool>,
    method: Option<String>,
}

/// Flatten statement, branch, and function maps into per-line facts.
fn collect_lines(entry: &serde_json::Map<String, Value>) -> BTreeMap<u32, LineFacts> {
    let mut lines: BTreeMap<u32, LineFacts> = BTreeMap::new();

    // Statements: multiple statements on the same line take the max count.
    if let (Some(stmt_map), Some(s)) = (
        entry.get("statementMap").and_then(Value::as_object),
        entry.get("s").and_then(Value::as_object),
    ) {
        for (index, loc) in stmt_map {
            let Some(line) = start_line_of(loc) else { continue };
            let count = s.get(index).and_then(Value::as_u64).unwrap_or(0);
            let facts = lines.entry(line).or_default();
            facts.statement_hits = Some(facts.statement_hits.unwrap_or(0).max(count));
        }
    }

    // Branches: every location's arm count attaches to the branch's line.
    if let (Some(branch_map), Some(b)) = (
        entry.get("branchMap").and_then(Value::as_object),
        entry.get("b").and_then(Value::as_object),
    ) {
        for (index, info) in branch_map {
            let line = info
                .get("loc")
                .and_then(start_line_of)
                .or_else(|| {
                    info.get("locations")
                        .and_then(Value::as_array)
                        .and_then(|locations| locations.first())
                        .and_then(start_line_of)
                });
            let Some(line) = line else { continue };
            let Some(counts) = b.get(index).and_then(Value::as_array) else {
                continue;
            };
            let facts = lines.entry(line).or_default();
            for count in counts {
                facts.arms.push(count.as_u64().unwrap_or(0) > 0);
            }
        }
    }

    // Functions: the declaration line carries the method name; its hit count
    // contributes to that line's statement state.
    if let (Some(fn_map), Some(f)) = (
        entry.get("fnMap").and_then(Value::as_object),
        entry.get("f").and_then(Value::as_object),
    ) {
        for (index, info) in fn_map {
            let line = info
                .get("decl")
                .or_else(|| info.get("loc"))
                .and_then(start_line_of);
            let Some(line) = line else { continue };
            let count = f.get(index).and_then(Value::as_u64).unwrap_or(0);
            let facts = lines.entry(line).or_default();
            facts.method = Some(
                info.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("(anonymous)")
                    .to_string(),
            );
            facts.statement_hits = Some(facts.statement_hits.unwrap_or(0).max(count));
        }
    }

    lines
}

fn start_line_of(loc: &Value) -> Option<u32> {
    loc.get("start")
        .and_then(|start| start.get("line"))
        .and_then(Value::as_u64)
        .map(|line| line as u32)
}
