//! Canonical in-memory representation of coverage data, independent of any
//! specific tool format. Parsers produce a `ReportFragment` which the merge
//! engine folds into the commit's `Report`.
//!
//! None of these types are `Sync`: a `Report` is meant to be owned and
//! mutated by exactly one merge pass at a time. Callers must serialize folds
//! per commit themselves (the engine assumes an external per-commit lock).

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CovmergeError, Result};
use crate::totals::Totals;

/// Identifier of one upload session within a report.
pub type SessionId = u32;

/// Coverage state of a single line, ordered `Miss < Partial < Hit`.
///
/// Two observations of the same line combine by taking the stronger state
/// (the lattice join), never by overwriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageState {
    Miss,
    Partial,
    Hit,
}

impl CoverageState {
    /// The lattice join: the stronger of the two states.
    #[must_use]
    pub fn join(self, other: CoverageState) -> CoverageState {
        self.max(other)
    }

    /// Derive a state from a plain hit count.
    #[must_use]
    pub fn from_hits(hits: u64) -> CoverageState {
        if hits > 0 {
            CoverageState::Hit
        } else {
            CoverageState::Miss
        }
    }

    /// Derive a state from branch outcomes (`taken` of `total` arms).
    #[must_use]
    pub fn from_branches(taken: u64, total: u64) -> CoverageState {
        if total == 0 || taken == 0 {
            CoverageState::Miss
        } else if taken < total {
            CoverageState::Partial
        } else {
            CoverageState::Hit
        }
    }
}

/// Coverage facts for one source line.
///
/// Observations are kept per session so carry-forward can later re-key a
/// subset of sessions without losing information. The line's effective
/// coverage is the join across all contributing sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRecord {
    sessions: BTreeMap<SessionId, CoverageState>,
    /// Branch outcomes keyed by branch identifier; `true` means taken.
    pub branches: BTreeMap<u32, bool>,
    /// Method name, when this line is a method/function entry point.
    pub method: Option<String>,
    /// Cyclomatic complexity attributed to this line, when reported.
    pub complexity: Option<u32>,
}

impl LineRecord {
    /// A record holding a single observation from one session.
    #[must_use]
    pub fn observed(session: SessionId, state: CoverageState) -> LineRecord {
        let mut record = LineRecord::default();
        record.observe(session, state);
        record
    }

    /// The effective coverage: the join across all contributing sessions.
    /// An empty record (no observations) reads as `Miss`.
    #[must_use]
    pub fn coverage(&self) -> CoverageState {
        self.sessions
            .values()
            .copied()
            .fold(CoverageState::Miss, CoverageState::join)
    }

    /// Sessions that contributed to this line.
    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    /// The observation a specific session made, if any.
    #[must_use]
    pub fn session_coverage(&self, session: SessionId) -> Option<CoverageState> {
        self.sessions.get(&session).copied()
    }

    #[must_use]
    pub fn contributing_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Record an observation for `session`, joining with any existing one.
    pub fn observe(&mut self, session: SessionId, state: CoverageState) {
        self.sessions
            .entry(session)
            .and_modify(|existing| *existing = existing.join(state))
            .or_insert(state);
    }

    /// Record a branch outcome; an arm reported taken anywhere stays taken.
    pub fn observe_branch(&mut self, branch: u32, taken: bool) {
        self.branches
            .entry(branch)
            .and_modify(|existing| *existing |= taken)
            .or_insert(taken);
    }

    /// Join another record into this one: per-session lattice join, union of
    /// branch outcomes, and metadata kept or maximized so that re-joining
    /// the same record is a no-op.
    pub fn join_record(&mut self, other: &LineRecord) {
        for (&session, &state) in &other.sessions {
            self.observe(session, state);
        }
        for (&branch, &taken) in &other.branches {
            self.observe_branch(branch, taken);
        }
        if self.method.is_none() {
            self.method = other.method.clone();
        }
        self.complexity = match (self.complexity, other.complexity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Restrict this record to the sessions present in `mapping`, re-keying
    /// them to their new ids. Returns `None` when no session survives.
    #[must_use]
    pub fn filter_remap(&self, mapping: &BTreeMap<SessionId, SessionId>) -> Option<LineRecord> {
        let sessions: BTreeMap<SessionId, CoverageState> = self
            .sessions
            .iter()
            .filter_map(|(old, &state)| mapping.get(old).map(|&new| (new, state)))
            .collect();
        if sessions.is_empty() {
            return None;
        }
        Some(LineRecord {
            sessions,
            branches: self.branches.clone(),
            method: self.method.clone(),
            complexity: self.complexity,
        })
    }
}

/// Coverage data for a single source file: a sparse, 1-based map from line
/// number to [`LineRecord`], plus a lazily computed totals snapshot.
#[derive(Debug, Clone)]
pub struct ReportFile {
    path: String,
    lines: BTreeMap<u32, LineRecord>,
    totals: OnceCell<Totals>,
}

impl ReportFile {
    /// `path` must already be normalized (see [`crate::paths::normalize`]).
    #[must_use]
    pub fn new(path: String) -> ReportFile {
        ReportFile {
            path,
            lines: BTreeMap::new(),
            totals: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn get(&self, line: u32) -> Option<&LineRecord> {
        self.lines.get(&line)
    }

    pub fn lines(&self) -> impl Iterator<Item = (u32, &LineRecord)> {
        self.lines.iter().map(|(&n, record)| (n, record))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Record coverage for a line, joining with any existing record. Line
    /// numbers are 1-based; a zero line number is ignored.
    pub fn record(&mut self, line: u32, record: LineRecord) {
        if line == 0 {
            return;
        }
        self.totals.take();
        self.lines
            .entry(line)
            .and_modify(|existing| existing.join_record(&record))
            .or_insert(record);
    }

    /// Join every line of `other` into this file.
    pub fn join_file(&mut self, other: &ReportFile) {
        for (line, record) in other.lines() {
            self.record(line, record.clone());
        }
    }

    /// Aggregated totals, computed on first use and cached until the next
    /// mutation.
    #[must_use]
    pub fn totals(&self) -> &Totals {
        self.totals
            .get_or_init(|| Totals::from_lines(self.lines.values()))
    }
}

/// How a session came to be part of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// A direct upload processed in this merge batch.
    Uploaded,
    /// Coverage re-used from a previous commit's report because no upload in
    /// the current batch re-ran this session's flags.
    CarriedForward {
        /// The session's id in the report it was carried from.
        from: SessionId,
    },
}

/// One discrete upload: identity, uploader-chosen flag labels, and CI
/// provider metadata. Sessions are append-only once attached to a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub flags: BTreeSet<String>,
    /// CI job/build identifier, when the uploader supplied one.
    pub provider_job: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: SessionKind,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, flags: impl IntoIterator<Item = String>) -> Session {
        Session {
            id,
            flags: flags.into_iter().collect(),
            provider_job: None,
            timestamp: Utc::now(),
            kind: SessionKind::Uploaded,
        }
    }

    /// A copy of this session carried into a new report under a fresh id.
    #[must_use]
    pub fn carried_forward(&self, new_id: SessionId) -> Session {
        let from = match self.kind {
            SessionKind::Uploaded => self.id,
            // Preserve the original ancestry across repeated carries.
            SessionKind::CarriedForward { from } => from,
        };
        Session {
            id: new_id,
            flags: self.flags.clone(),
            provider_job: self.provider_job.clone(),
            timestamp: self.timestamp,
            kind: SessionKind::CarriedForward { from },
        }
    }
}

/// The per-commit aggregate: files, sessions, and report-level totals.
///
/// A report exclusively owns its files and sessions. It is mutated by
/// successive merge folds while uploads arrive and becomes read-only once
/// [`Report::finalize`] is called; later uploads go through a fresh merge
/// pass producing a new report, never in-place mutation of a finalized one.
#[derive(Debug, Clone, Default)]
pub struct Report {
    files: BTreeMap<String, ReportFile>,
    sessions: BTreeMap<SessionId, Session>,
    totals: OnceCell<Totals>,
    finalized: bool,
    warnings: Vec<String>,
}

impl Report {
    #[must_use]
    pub fn new() -> Report {
        Report::default()
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&ReportFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &ReportFile> {
        self.files.values()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn sessions(&self) -> &BTreeMap<SessionId, Session> {
        &self.sessions
    }

    /// The next free session id. Ids are dense and assigned in fold order.
    #[must_use]
    pub fn next_session_id(&self) -> SessionId {
        self.sessions
            .last_key_value()
            .map_or(0, |(&id, _)| id + 1)
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Mark the report read-only. Any later fold fails with
    /// [`CovmergeError::ReportFinalized`].
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Soft warnings accumulated from decoders and merge folds.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Report-level totals, cached until the next mutation.
    #[must_use]
    pub fn totals(&self) -> &Totals {
        self.totals
            .get_or_init(|| Totals::from_files(self.files.values()))
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.finalized {
            return Err(CovmergeError::ReportFinalized);
        }
        Ok(())
    }

    /// Fetch or create the file for `path`, invalidating the report-level
    /// totals cache. `path` must already be normalized.
    pub(crate) fn file_entry(&mut self, path: String) -> &mut ReportFile {
        self.totals.take();
        self.files
            .entry(path.clone())
            .or_insert_with(|| ReportFile::new(path))
    }

    pub(crate) fn attach_session(&mut self, session: Session) {
        debug_assert!(
            !self.sessions.contains_key(&session.id),
            "session ids are append-only and unique"
        );
        self.sessions.insert(session.id, session);
    }

    pub(crate) fn warn(&mut self, message: String) {
        tracing::warn!(target: "covmerge::report", "{message}");
        self.warnings.push(message);
    }
}

/// The transient output of one decoder invocation: the files and lines found
/// in a single uploaded document, tagged with the originating session id.
/// Fragments exist only to be folded into a [`Report`].
#[derive(Debug)]
pub struct ReportFragment {
    session_id: SessionId,
    files: BTreeMap<String, ReportFile>,
    warnings: Vec<String>,
}

impl ReportFragment {
    #[must_use]
    pub fn new(session_id: SessionId) -> ReportFragment {
        ReportFragment {
            session_id,
            files: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&ReportFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &ReportFile> {
        self.files.values()
    }

    /// Fetch or create the fragment's file for `path` (already normalized).
    pub fn file_entry(&mut self, path: String) -> &mut ReportFile {
        self.files
            .entry(path.clone())
            .or_insert_with(|| ReportFile::new(path))
    }

    /// Fold a whole decoded file in, joining duplicates by the same lattice
    /// rule used across sessions.
    pub fn push_file(&mut self, file: ReportFile) {
        self.file_entry(file.path().to_string()).join_file(&file);
    }

    /// Record a non-fatal decoding problem (a skipped entry, an ignored
    /// value) for observability.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "covmerge::decode", "{message}");
        self.warnings.push(message);
    }

    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<String, ReportFile>, Vec<String>) {
        (self.files, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = CoverageState> {
        prop_oneof![
            Just(CoverageState::Miss),
            Just(CoverageState::Partial),
            Just(CoverageState::Hit),
        ]
    }

    proptest! {
        #[test]
        fn join_is_idempotent(a in any_state()) {
            prop_assert_eq!(a.join(a), a);
        }

        #[test]
        fn join_is_commutative(a in any_state(), b in any_state()) {
            prop_assert_eq!(a.join(b), b.join(a));
        }

        #[test]
        fn join_is_associative(a in any_state(), b in any_state(), c in any_state()) {
            prop_assert_eq!(a.join(b).join(c), a.join(b.join(c)));
        }
    }

    #[test]
    fn test_state_from_hits() {
        assert_eq!(CoverageState::from_hits(0), CoverageState::Miss);
        assert_eq!(CoverageState::from_hits(3), CoverageState::Hit);
    }

    #[test]
    fn test_state_from_branches() {
        assert_eq!(CoverageState::from_branches(0, 2), CoverageState::Miss);
        assert_eq!(CoverageState::from_branches(1, 2), CoverageState::Partial);
        assert_eq!(CoverageState::from_branches(2, 2), CoverageState::Hit);
        assert_eq!(CoverageState::from_branches(0, 0), CoverageState::Miss);
    }

    #[test]
    fn test_line_record_joins_across_sessions() {
        let mut record = LineRecord::observed(0, CoverageState::Miss);
        record.join_record(&LineRecord::observed(1, CoverageState::Hit));

        assert_eq!(record.coverage(), CoverageState::Hit);
        assert_eq!(record.sessions().collect::<Vec<_>>(), vec![0, 1]);
        // Each session's own observation is preserved.
        assert_eq!(record.session_coverage(0), Some(CoverageState::Miss));
        assert_eq!(record.session_coverage(1), Some(CoverageState::Hit));
    }

    #[test]
    fn test_line_record_join_within_session() {
        // Two observations from the same session join, not overwrite.
        let mut record = LineRecord::observed(0, CoverageState::Hit);
        record.observe(0, CoverageState::Miss);
        assert_eq!(record.session_coverage(0), Some(CoverageState::Hit));
        assert_eq!(record.contributing_sessions(), 1);
    }

    #[test]
    fn test_line_record_branch_union() {
        let mut a = LineRecord::observed(0, CoverageState::Partial);
        a.observe_branch(0, true);
        a.observe_branch(1, false);

        let mut b = LineRecord::observed(1, CoverageState::Partial);
        b.observe_branch(1, true);

        a.join_record(&b);
        assert_eq!(a.branches.get(&0), Some(&true));
        // Taken in one session wins over untaken in another.
        assert_eq!(a.branches.get(&1), Some(&true));
    }

    #[test]
    fn test_line_record_rejoin_is_noop() {
        let mut a = LineRecord::observed(0, CoverageState::Hit);
        a.complexity = Some(3);
        let snapshot = a.clone();
        a.join_record(&snapshot.clone());
        assert_eq!(a, snapshot);
    }

    #[test]
    fn test_filter_remap() {
        let mut record = LineRecord::observed(0, CoverageState::Miss);
        record.observe(1, CoverageState::Hit);

        let mapping = BTreeMap::from([(1, 7)]);
        let remapped = record.filter_remap(&mapping).unwrap();
        assert_eq!(remapped.sessions().collect::<Vec<_>>(), vec![7]);
        assert_eq!(remapped.session_coverage(7), Some(CoverageState::Hit));

        let empty_mapping = BTreeMap::from([(9, 0)]);
        assert!(record.filter_remap(&empty_mapping).is_none());
    }

    #[test]
    fn test_report_file_record_joins_duplicates() {
        let mut file = ReportFile::new("src/lib.rs".to_string());
        file.record(4, LineRecord::observed(0, CoverageState::Miss));
        file.record(4, LineRecord::observed(0, CoverageState::Hit));

        assert_eq!(file.len(), 1);
        assert_eq!(file.get(4).unwrap().coverage(), CoverageState::Hit);
    }

    #[test]
    fn test_report_file_ignores_line_zero() {
        let mut file = ReportFile::new("src/lib.rs".to_string());
        file.record(0, LineRecord::observed(0, CoverageState::Hit));
        assert!(file.is_empty());
    }

    #[test]
    fn test_report_file_totals_invalidated_on_mutation() {
        let mut file = ReportFile::new("src/lib.rs".to_string());
        file.record(1, LineRecord::observed(0, CoverageState::Hit));
        assert_eq!(file.totals().hits, 1);

        file.record(2, LineRecord::observed(0, CoverageState::Miss));
        assert_eq!(file.totals().hits, 1);
        assert_eq!(file.totals().misses, 1);
    }

    #[test]
    fn test_report_next_session_id() {
        let mut report = Report::new();
        assert_eq!(report.next_session_id(), 0);
        report.attach_session(Session::new(0, ["unit".to_string()]));
        assert_eq!(report.next_session_id(), 1);
    }

    #[test]
    fn test_finalized_report_is_not_writable() {
        let mut report = Report::new();
        report.finalize();
        assert!(matches!(
            report.ensure_writable(),
            Err(CovmergeError::ReportFinalized)
        ));
    }

    #[test]
    fn test_carried_forward_preserves_ancestry() {
        let session = Session::new(3, ["unit".to_string()]);
        let carried = session.carried_forward(0);
        assert_eq!(carried.kind, SessionKind::CarriedForward { from: 3 });

        let carried_again = carried.carried_forward(5);
        assert_eq!(carried_again.kind, SessionKind::CarriedForward { from: 3 });
    }
}
