mod common;

use covmerge::error::CovmergeError;
use covmerge::ingest::process_upload;
use covmerge::merge::fold_fragment;
use covmerge::model::{CoverageState, Session};
use covmerge::parsers::{ParserRegistry, UploadContext};
use covmerge::totals::TotalsConfig;

const LCOV: &[u8] = b"SF:/src/lib.rs\nDA:1,3\nDA:2,0\nDA:3,1\nend_of_record\n";

#[test]
fn merge_joins_lines_across_sessions() {
    let mut report = common::report_from_upload(LCOV, &["unit"]);
    common::fold_upload(
        &mut report,
        b"SF:/src/lib.rs\nDA:1,0\nDA:2,1\nDA:3,0\nend_of_record\n",
        &["integration"],
    );

    let file = report.file("/src/lib.rs").unwrap();
    // Covered in either session reads as covered.
    assert_eq!(file.get(1).unwrap().coverage(), CoverageState::Hit);
    assert_eq!(file.get(2).unwrap().coverage(), CoverageState::Hit);
    assert_eq!(file.get(3).unwrap().coverage(), CoverageState::Hit);

    let totals = report.totals();
    assert_eq!(totals.hits, 3);
    assert_eq!(totals.misses, 0);
    assert_eq!(totals.coverage(&TotalsConfig::default()), Some(100.0));
}

#[test]
fn merge_mixed_formats_into_one_report() {
    let mut report = common::report_from_upload(LCOV, &["rust"]);

    let cobertura = br#"<?xml version="1.0"?>
<coverage line-rate="0.5" version="1.9">
  <packages><package name="app"><classes>
    <class name="app" filename="app/main.py">
      <lines>
        <line number="1" hits="2"/>
        <line number="2" hits="0"/>
      </lines>
    </class>
  </classes></package></packages>
</coverage>
"#;
    common::fold_upload(&mut report, cobertura, &["python"]);

    assert_eq!(report.file_count(), 2);
    assert_eq!(report.sessions().len(), 2);

    let totals = report.totals();
    assert_eq!(totals.files, 2);
    assert_eq!(totals.lines(), 5);
    assert_eq!(totals.hits, 3);
}

#[test]
fn xml_and_json_uploads_complement_each_other() {
    // A coverage.py run covers a.py fully and misses b.py line 4; a JS-side
    // harness run covers exactly that line.
    let cobertura = br#"<?xml version="1.0"?>
<coverage line-rate="0.9" version="1.9">
  <packages><package name="app"><classes>
    <class name="a" filename="a.py">
      <lines>
        <line number="1" hits="1"/>
        <line number="2" hits="1"/>
        <line number="3" hits="1"/>
        <line number="4" hits="1"/>
        <line number="5" hits="1"/>
      </lines>
    </class>
    <class name="b" filename="b.py">
      <lines>
        <line number="1" hits="1"/>
        <line number="2" hits="1"/>
        <line number="3" hits="1"/>
        <line number="4" hits="0"/>
      </lines>
    </class>
  </classes></package></packages>
</coverage>
"#;
    let istanbul = br#"{
        "b.py": {
            "statementMap": { "0": { "start": { "line": 4, "column": 0 } } },
            "s": { "0": 2 },
            "branchMap": {}, "b": {}, "fnMap": {}, "f": {}
        }
    }"#;

    let mut report = common::report_from_upload(cobertura, &["unit"]);
    common::fold_upload(&mut report, istanbul, &["integration"]);

    let b = report.file("b.py").unwrap();
    let line = b.get(4).unwrap();
    assert_eq!(line.coverage(), CoverageState::Hit);
    assert_eq!(line.contributing_sessions(), 2);
    assert_eq!(line.session_coverage(0), Some(CoverageState::Miss));
    assert_eq!(line.session_coverage(1), Some(CoverageState::Hit));

    assert_eq!(report.totals().misses, 0);
    assert_eq!(report.totals().lines(), 9);
}

#[test]
fn refolding_identical_upload_does_not_change_line_states() {
    let mut report = common::report_from_upload(LCOV, &["unit"]);
    let before = *report.totals();

    common::fold_upload(&mut report, LCOV, &["unit"]);
    assert_eq!(*report.totals(), before);
    assert_eq!(report.sessions().len(), 2);
}

#[test]
fn partial_stays_partial_under_weaker_observations() {
    let branchy = b"SF:/src/lib.rs\nDA:4,1\nBRDA:4,0,0,2\nBRDA:4,0,1,0\nend_of_record\n";
    let mut report = common::report_from_upload(branchy, &[]);

    // A second session missing the line entirely must not weaken it.
    common::fold_upload(&mut report, b"SF:/src/lib.rs\nDA:4,0\nend_of_record\n", &[]);

    let line = report.file("/src/lib.rs").unwrap().get(4).unwrap();
    assert_eq!(line.coverage(), CoverageState::Partial);

    // A session covering only the other arm is itself partial; the join of
    // two partials stays partial, but the arm union records both as taken.
    common::fold_upload(
        &mut report,
        b"SF:/src/lib.rs\nDA:4,1\nBRDA:4,0,0,0\nBRDA:4,0,1,3\nend_of_record\n",
        &[],
    );
    let line = report.file("/src/lib.rs").unwrap().get(4).unwrap();
    assert_eq!(line.coverage(), CoverageState::Partial);
    assert_eq!(line.branches.get(&0), Some(&true));
    assert_eq!(line.branches.get(&1), Some(&true));

    // Only a session that itself covered every arm promotes the line.
    common::fold_upload(
        &mut report,
        b"SF:/src/lib.rs\nDA:4,2\nBRDA:4,0,0,1\nBRDA:4,0,1,1\nend_of_record\n",
        &[],
    );
    let line = report.file("/src/lib.rs").unwrap().get(4).unwrap();
    assert_eq!(line.coverage(), CoverageState::Hit);
}

#[test]
fn finalized_report_rejects_further_folds() {
    let mut report = common::report_from_upload(LCOV, &[]);
    report.finalize();

    let registry = ParserRegistry::new();
    let session_id = report.next_session_id();
    let fragment = process_upload(&registry, LCOV, &UploadContext::new(session_id)).unwrap();
    let result = fold_fragment(&mut report, Session::new(session_id, Vec::<String>::new()), fragment);
    assert!(matches!(result, Err(CovmergeError::ReportFinalized)));
}
