//! Patch coverage: unified diff parsing and classification of added lines
//! against a head report.
//!
//! Patch coverage answers "of the lines this change introduced, how many are
//! exercised by tests". Added lines that no parser instrumented (blank
//! lines, comments, declarations) are excluded from both the numerator and
//! the denominator, so a change consisting only of comments has no patch
//! coverage rather than 0%.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::model::{CoverageState, Report};
use crate::paths;
use crate::totals::TotalsConfig;

static HUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

/// One body line of a hunk, by its leading marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkLine {
    Added,
    Removed,
    Context,
}

/// One `@@` hunk. `old_len`/`new_len` of zero mean a pure insertion or
/// deletion at `old_start`/`new_start`.
#[derive(Debug, Clone, Default)]
pub struct Hunk {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    pub lines: Vec<HunkLine>,
}

/// The changes a diff made to a single file.
#[derive(Debug, Clone, Default)]
pub struct FileDiff {
    /// Path on the head side, normalized.
    pub path: String,
    /// Old path when the diff recorded a rename.
    pub renamed_from: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// New-side line numbers of every added line, in order.
    #[must_use]
    pub fn added_lines(&self) -> Vec<u32> {
        let mut added = Vec::new();
        for hunk in &self.hunks {
            let mut new = hunk.new_start;
            for line in &hunk.lines {
                match line {
                    HunkLine::Added => {
                        added.push(new);
                        new += 1;
                    }
                    HunkLine::Context => new += 1,
                    HunkLine::Removed => {}
                }
            }
        }
        added
    }

    /// Map an old-side line number to its new-side number, or `None` if the
    /// diff removed that line.
    #[must_use]
    pub fn old_to_new(&self, old: u32) -> Option<u32> {
        let mut offset: i64 = 0;
        for hunk in &self.hunks {
            // A zero-length old range is an insertion after `old_start`.
            if hunk.old_len == 0 {
                if old <= hunk.old_start {
                    break;
                }
                offset += i64::from(hunk.new_len);
                continue;
            }
            if old < hunk.old_start {
                break;
            }
            if old >= hunk.old_start + hunk.old_len {
                offset += i64::from(hunk.new_len) - i64::from(hunk.old_len);
                continue;
            }
            let mut o = hunk.old_start;
            let mut n = hunk.new_start;
            for line in &hunk.lines {
                match line {
                    HunkLine::Context => {
                        if o == old {
                            return Some(n);
                        }
                        o += 1;
                        n += 1;
                    }
                    HunkLine::Removed => {
                        if o == old {
                            return None;
                        }
                        o += 1;
                    }
                    HunkLine::Added => n += 1,
                }
            }
            return None;
        }
        u32::try_from(i64::from(old) + offset).ok()
    }
}

/// Parse a unified diff (the `git diff` format) into per-file changes.
/// Deleted files are dropped; unrecognized lines are skipped.
#[must_use]
pub fn parse_unified_diff(text: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<FileDiff> = None;
    // Lines still expected in the open hunk, old and new side.
    let mut remaining = (0u32, 0u32);

    let flush = |current: &mut Option<FileDiff>, files: &mut Vec<FileDiff>| {
        if let Some(file) = current.take() {
            if !file.path.is_empty() {
                files.push(file);
            }
        }
    };

    for line in text.lines() {
        if line.starts_with("diff --git") {
            flush(&mut current, &mut files);
            current = Some(FileDiff::default());
            remaining = (0, 0);
            continue;
        }
        if let Some(captures) = HUNK_RE.captures(line) {
            let group = |i: usize, default: u32| {
                captures
                    .get(i)
                    .map_or(default, |m| m.as_str().parse().unwrap_or(default))
            };
            let hunk = Hunk {
                old_start: group(1, 0),
                old_len: group(2, 1),
                new_start: group(3, 0),
                new_len: group(4, 1),
                lines: Vec::new(),
            };
            remaining = (hunk.old_len, hunk.new_len);
            if let Some(file) = current.as_mut() {
                file.hunks.push(hunk);
            }
            continue;
        }
        // Header lines are only recognized between hunks; inside a hunk body
        // lines are classified purely by their first byte, so added lines
        // like "++x;" or removed "-- comment" lines are not mistaken for
        // "+++"/"---" markers.
        if remaining == (0, 0) {
            if let Some(old) = line.strip_prefix("rename from ") {
                if let Some(file) = current.as_mut() {
                    file.renamed_from = Some(paths::normalize(old));
                }
            } else if let Some(new) = line.strip_prefix("rename to ") {
                if let Some(file) = current.as_mut() {
                    file.path = paths::normalize(new);
                }
            } else if let Some(target) = line.strip_prefix("+++ ") {
                if let Some(file) = current.as_mut() {
                    if target == "/dev/null" {
                        // Deleted file: nothing on the head side to classify.
                        file.path.clear();
                        file.hunks.clear();
                    } else {
                        let target = target.strip_prefix("b/").unwrap_or(target);
                        file.path = paths::normalize(target);
                    }
                }
            }
            continue;
        }
        let Some(file) = current.as_mut() else { continue };
        let Some(hunk) = file.hunks.last_mut() else { continue };
        match line.as_bytes().first() {
            Some(b'+') => {
                hunk.lines.push(HunkLine::Added);
                remaining.1 = remaining.1.saturating_sub(1);
            }
            Some(b'-') => {
                hunk.lines.push(HunkLine::Removed);
                remaining.0 = remaining.0.saturating_sub(1);
            }
            Some(b'\\') => {} // "\ No newline at end of file"
            _ => {
                hunk.lines.push(HunkLine::Context);
                remaining.0 = remaining.0.saturating_sub(1);
                remaining.1 = remaining.1.saturating_sub(1);
            }
        }
    }
    flush(&mut current, &mut files);
    files
}

/// Classification of one file's added lines against the head report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileDiffCoverage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    pub hits: Vec<u32>,
    pub partials: Vec<u32>,
    pub misses: Vec<u32>,
    /// Added lines no parser instrumented; excluded from patch coverage.
    pub uninstrumented: Vec<u32>,
    /// Whole-file coverage of the old path in the base report.
    pub base_coverage: Option<f64>,
    /// Whole-file coverage in the head report.
    pub head_coverage: Option<f64>,
}

/// Instrumented-line counts summed across the whole patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchTotals {
    pub hits: u64,
    pub partials: u64,
    pub misses: u64,
}

impl PatchTotals {
    #[must_use]
    pub fn instrumented(&self) -> u64 {
        self.hits + self.partials + self.misses
    }

    /// Patch coverage percentage, `None` when the diff touched no
    /// instrumented line.
    #[must_use]
    pub fn coverage(&self, config: &TotalsConfig) -> Option<f64> {
        let total = self.instrumented();
        if total == 0 {
            return None;
        }
        let pct = self.hits as f64 / total as f64 * 100.0;
        Some(config.rounding.apply(pct, config.precision))
    }
}

/// The diff engine's output: per-file classifications plus patch totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffCoverage {
    pub files: BTreeMap<String, FileDiffCoverage>,
    pub totals: PatchTotals,
}

/// Classify every added line of `diff` against `head`. Files the reports
/// never saw appear with all added lines uninstrumented; report files the
/// diff never touched contribute nothing.
#[must_use]
pub fn diff_coverage(
    head: &Report,
    base: Option<&Report>,
    diff: &[FileDiff],
    config: &TotalsConfig,
) -> DiffCoverage {
    let mut out = DiffCoverage::default();

    for file_diff in diff {
        let added = file_diff.added_lines();
        if added.is_empty() && file_diff.renamed_from.is_none() {
            continue;
        }

        let head_file = head.file(&file_diff.path);
        let mut entry = FileDiffCoverage {
            renamed_from: file_diff.renamed_from.clone(),
            ..FileDiffCoverage::default()
        };

        for line in added {
            match head_file.and_then(|file| file.get(line)) {
                Some(record) => match record.coverage() {
                    CoverageState::Hit => {
                        entry.hits.push(line);
                        out.totals.hits += 1;
                    }
                    CoverageState::Partial => {
                        entry.partials.push(line);
                        out.totals.partials += 1;
                    }
                    CoverageState::Miss => {
                        entry.misses.push(line);
                        out.totals.misses += 1;
                    }
                },
                None => entry.uninstrumented.push(line),
            }
        }

        let base_path = file_diff
            .renamed_from
            .as_deref()
            .unwrap_or(&file_diff.path);
        entry.base_coverage = base
            .and_then(|report| report.file(base_path))
            .and_then(|file| file.totals().coverage(config));
        entry.head_coverage = head_file.and_then(|file| file.totals().coverage(config));

        out.files.insert(file_diff.path.clone(), entry);
    }

    out
}
