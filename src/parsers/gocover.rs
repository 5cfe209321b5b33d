//! Parser for Go's `-coverprofile` format.
//!
//! Reference: https://go.dev/blog/cover
//!
//! Format:
//!   mode: set|count|atomic
//!   <file>:<startLine>.<startCol>,<endLine>.<endCol> <numStatements> <count>
//!
//! Each line describes a basic block. The block's hit count is expanded onto
//! every source line in its range; overlapping blocks (common in profiles
//! that were already merged by other tools) fold by lattice join.

use crate::error::Result;
use crate::model::{CoverageState, LineRecord, ReportFragment};
use crate::parsers::{finish, ReportParser, UploadContext};
use crate::paths;

pub struct GocoverParser;

impl ReportParser for GocoverParser {
    fn name(&self) -> &'static str {
        "gocover"
    }

    fn claims(&self, head: &str, _ctx: &UploadContext) -> bool {
        if head.lines().next().is_some_and(|l| l.starts_with("mode: ")) {
            return true;
        }
        // Profiles without a mode header (rare, but produced by merge tools).
        head.lines().any(looks_like_go_block)
    }

    fn decode(&self, content: &[u8], ctx: &UploadContext) -> Result<ReportFragment> {
        let mut fragment = ReportFragment::new(ctx.session_id);
        let text = String::from_utf8_lossy(content);

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("mode: ") {
                continue;
            }
            // Per-function summary lines ("file.go:12: name 83.3%") show up
            // in `go tool cover -func` output; they carry no block data.
            if line.ends_with('%') {
                continue;
            }
            let Some((path, block)) = parse_block_line(line) else {
                fragment.warn(format!("gocover: unparseable block '{line}'"));
                continue;
            };
            let file = fragment.file_entry(paths::normalize(path));
            let state = CoverageState::from_hits(block.count);
            for number in block.start_line..=block.end_line {
                file.record(number, LineRecord::observed(ctx.session_id, state));
            }
        }

        finish(fragment, self.name())
    }
}

struct Block {
    start_line: u32,
    end_line: u32,
    count: u64,
}

/// Quick heuristic: does this line look like a Go coverage block?
/// e.g. "github.com/user/repo/file.go:10.1,20.5 3 1"
fn looks_like_go_block(line: &str) -> bool {
    let Some(colon_pos) = line.rfind(".go:") else {
        return false;
    };
    let after = &line[colon_pos + 4..];
    after.contains(',') && after.split_whitespace().count() >= 2
}

/// Parse a single block line, returning `(file_path, Block)`.
///
/// Anchors on the last ".go:" to split the file path from the block range,
/// which naturally handles paths containing colons.
fn parse_block_line(line: &str) -> Option<(&str, Block)> {
    let colon_pos = line.rfind(".go:")? + 3;

    let file = &line[..colon_pos];
    let rest = &line[colon_pos + 1..];

    // rest = "startLine.startCol,endLine.endCol numStmt count"
    let (range, tail) = rest.split_once(' ')?;
    let (start, end) = range.split_once(',')?;

    let start_line: u32 = start.split_once('.')?.0.parse().ok()?;
    let end_line: u32 = end.split_once('.')?.0.parse().ok()?;

    let mut parts = tail.split_whitespace();
    let _num_stmt = parts.next()?;
    let count: u64 = parts.next()?.parse().ok()?;

    Some((
        file,
        Block {
            start_line,
            end_line,
            count,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> ReportFragment {
        GocoverParser.decode(input, &UploadContext::new(0)).unwrap()
    }

    #[test]
    fn test_parse_gocover() {
        let input = b"mode: count\n\
            github.com/acme/app/main.go:3.10,5.2 2 4\n\
            github.com/acme/app/main.go:7.10,8.2 1 0\n";
        let fragment = decode(input);
        let file = fragment.file("github.com/acme/app/main.go").unwrap();
        assert_eq!(file.len(), 5);
        assert_eq!(file.get(3).unwrap().coverage(), CoverageState::Hit);
        assert_eq!(file.get(5).unwrap().coverage(), CoverageState::Hit);
        assert_eq!(file.get(7).unwrap().coverage(), CoverageState::Miss);
        assert!(file.get(6).is_none());
    }

    #[test]
    fn test_overlapping_blocks_join() {
        // Already-merged profiles can repeat a block with different counts;
        // the covered observation must win.
        let input = b"mode: set\n\
            app.go:1.1,2.2 1 0\n\
            app.go:1.1,2.2 1 1\n\
            app.go:1.1,2.2 1 0\n";
        let fragment = decode(input);
        let file = fragment.file("app.go").unwrap();
        assert_eq!(file.get(1).unwrap().coverage(), CoverageState::Hit);
        assert_eq!(file.get(2).unwrap().coverage(), CoverageState::Hit);
    }

    #[test]
    fn test_func_summary_lines_skipped() {
        let input = b"mode: count\n\
            app.go:1.1,2.2 1 1\n\
            app.go:12: main 83.3%\n";
        let fragment = decode(input);
        assert_eq!(fragment.file_count(), 1);
        assert!(fragment.warnings().is_empty());
    }

    #[test]
    fn test_claims() {
        let ctx = UploadContext::new(0);
        assert!(GocoverParser.claims("mode: atomic\n", &ctx));
        assert!(GocoverParser.claims("pkg/file.go:1.1,2.2 1 1\n", &ctx));
        assert!(!GocoverParser.claims("SF:/src/lib.rs\nDA:1,5\n", &ctx));
    }
}
