//! Parser for the LCOV `.info` format.
//!
//! Reference: https://ltp.sourceforge.net/coverage/lcov/geninfo.1.php
//!
//! Key records:
//!   TN:<test name>
//!   SF:<absolute path to source file>
//!   FN:<line>,<function name>
//!   FNDA:<execution count>,<function name>
//!   DA:<line number>,<execution count>[,<checksum>]
//!   BRDA:<line>,<block>,<branch>,<taken>   ("-" means 0)
//!   LF/LH/FNF/FNH/BRF/BRH: summary lines, derived from the data instead
//!   end_of_record

use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFile, ReportFragment};
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct LcovParser;

impl ReportParser for LcovParser {
    fn name(&self) -> &'static str {
        "lcov"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        let has_sf = head.lines().any(|l| l.starts_with("SF:"));
        let has_data = head
            .lines()
            .any(|l| l.starts_with("DA:") || l.starts_with("FN:") || l.starts_with("BRDA:"));
        (has_sf && has_data) || head.contains("\nend_of_record")
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut fragment = ReportFragment::new(ctx.session_id);
        let text = String::from_utf8_lossy(content);

        let mut record = FileRecord::default();
        let mut current_path: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line == "end_of_record" {
                if let Some(path) = current_path.take() {
                    record.emit(path, ctx, &mut fragment);
                }
                record = FileRecord::default();
                continue;
            }

            let Some((tag, value)) = line.split_once(':') else {
                continue;
            };

            match tag {
                "SF" => {
                    // A new SF before end_of_record closes the previous file.
                    if let Some(path) = current_path.take() {
                        record.emit(path, ctx, &mut fragment);
                        record = FileRecord::default();
                    }
                    current_path = Some(paths::normalize(value));
                }
                "DA" => record.data_line(value, &mut fragment),
                "BRDA" => record.branch_line(value, &mut fragment),
                "FN" => {
                    // FN:<line>,<function name>
                    if let Some((line_str, name)) = value.split_once(',') {
                        if let Ok(start) = line_str.parse::<u32>() {
                            record.fn_lines.insert(name.to_string(), start);
                        }
                    }
                }
                "FNDA" => {
                    // FNDA:<execution count>,<function name>
                    if let Some((count_str, name)) = value.split_once(',') {
                        let hits = count_str.parse::<u64>().unwrap_or(0);
                        record.fn_hits.insert(name.to_string(), hits);
                    }
                }
                // TN and the summary tags carry no line data.
                _ => {}
            }
        }

        // File ends without end_of_record.
        if let Some(path) = current_path.take() {
            record.emit(path, ctx, &mut fragment);
        }

        finish(fragment, self.name())
    }
}

/// Accumulated records for the file currently being read.
#[derive(Default)]
struct FileRecord {
    da: BTreeMap<u32, CoverageState>,
    branches: BTreeMap<u32, Vec<bool>>,
    fn_lines: HashMap<String, u32>,
    fn_hits: HashMap<String, u64>,
}

impl FileRecord {
    fn data_line(&mut self, value: &str, fragment: &mut ReportFragment) {
        // DA:<line number>,<execution count>[,<checksum>]
        let mut parts = value.splitn(3, ',');
        let (Some(line_str), Some(count_str)) = (parts.next(), parts.next()) else {
            fragment.warn(format!("lcov: malformed DA record '{value}'"));
            return;
        };
        let Ok(line) = line_str.parse::<u32>() else {
            fragment.warn(format!("lcov: unparseable DA line number '{line_str}'"));
            return;
        };
        match count_str.parse::<i64>() {
            // Negative counts mark non-instrumentable lines; skip them.
            Ok(count) if count >= 0 => {
                let state = CoverageState::from_hits(count as u64);
                self.da
                    .entry(line)
                    .and_modify(|existing| *existing = existing.join(state))
                    .or_insert(state);
            }
            Ok(_) => {}
            Err(_) => fragment.warn(format!("lcov: unparseable DA count '{count_str}'")),
        }
    }

    fn branch_line(&mut self, value: &str, fragment: &mut ReportFragment) {
        // BRDA:<line>,<block>,<branch>,<taken> — "-" means never executed.
        let parts: Vec<&str> = value.splitn(4, ',').collect();
        if parts.len() != 4 {
            fragment.warn(format!("lcov: malformed BRDA record '{value}'"));
            return;
        }
        let Ok(line) = parts[0].parse::<u32>() else {
            fragment.warn(format!("lcov: unparseable BRDA line number '{}'", parts[0]));
            return;
        };
        let taken = parts[3] != "-" && parts[3].parse::<u64>().map_or(false, |n| n > 0);
        self.branches.entry(line).or_default().push(taken);
    }

    /// Build the `ReportFile` for the finished record and push it into the
    /// fragment. Branchful lines take their state from the branch outcomes.
    fn emit(&mut self, path: String, ctx: &UploadContext, fragment: &mut ReportFragment) {
        let mut file = ReportFile::new(path);

        let mut line_numbers: Vec<u32> = self.da.keys().copied().collect();
        line_numbers.extend(self.branches.keys().copied());
        line_numbers.sort_unstable();
        line_numbers.dedup();

        for line in line_numbers {
            let mut record = LineRecord::default();
            let state = match self.branches.get(&line) {
                Some(arms) => {
                    let taken = arms.iter().filter(|&&t| t).count() as u64;
                    for (index, &arm_taken) in arms.iter().enumerate() {
                        record.observe_branch(index as u32, arm_taken);
                    }
                    CoverageState::from_branches(taken, arms.len() as u64)
                }
                None => self.da[&line],
            };
            record.observe(ctx.session_id, state);
            file.record(line, record);
        }

        for (name, &start) in &self.fn_lines {
            let hits = self.fn_hits.get(name).copied().unwrap_or(0);
            let mut record = LineRecord::observed(ctx.session_id, CoverageState::from_hits(hits));
            record.method = Some(name.clone());
            file.record(start, record);
        }

        if file.is_empty() {
            fragment.warn(format!("lcov: no usable lines for '{}'", file.path()));
            return;
        }
        fragment.push_file(file);
    }
}
