//! Merge engine: folds decoded fragments into a session's working report,
//! and folds batches of session reports into a commit report with per-flag
//! carry-forward.
//!
//! Folds take `&mut Report` deliberately: exactly one merge pass may touch a
//! commit's report at a time, and requiring exclusive access makes violating
//! that contract a compile error rather than a data race. Serializing merge
//! passes across workers (per-commit locking) is the caller's job.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::model::{Report, ReportFragment, Session, SessionId};

/// Fold a decoded fragment into `report` as `session`.
///
/// Total over any well-formed fragment: joins every line by the lattice
/// rule, unions branch outcomes and contributing sessions, and invalidates
/// cached totals on every touched file. Fails only when `report` is already
/// finalized, in which case `report` is left untouched.
pub fn fold_fragment(report: &mut Report, session: Session, fragment: ReportFragment) -> Result<()> {
    report.ensure_writable()?;
    debug_assert_eq!(
        session.id,
        fragment.session_id(),
        "fragment must be decoded under the session id it is folded as"
    );

    let session_id = session.id;
    let (files, warnings) = fragment.into_parts();
    for (path, file) in files {
        report.file_entry(path).join_file(&file);
    }
    for warning in warnings {
        report.warn(format!("session {session_id}: {warning}"));
    }
    report.attach_session(session);
    Ok(())
}

/// Fold a batch of per-session reports into a fresh commit report, carrying
/// forward stale flags from the previous finalized report.
///
/// Carry-forward is resolved per flag label: a flag with at least one fresh
/// session in the batch is owned by the batch, while a prior session bearing
/// any flag the batch did not re-run is carried forward unchanged under a
/// new session id. Lines covered under both carried and fresh flags join by
/// the usual lattice rule.
#[must_use]
pub fn merge_batch(batch: &[Report], prior: Option<&Report>) -> Report {
    let mut merged = Report::new();

    for report in batch {
        let mut mapping = BTreeMap::new();
        for (&old_id, session) in report.sessions() {
            let new_id = merged.next_session_id();
            let mut session = session.clone();
            session.id = new_id;
            merged.attach_session(session);
            mapping.insert(old_id, new_id);
        }
        fold_remapped(&mut merged, report, &mapping);
    }

    if let Some(prior) = prior {
        // Owned so the borrow of `merged` ends before sessions are attached.
        let batch_flags: BTreeSet<String> = merged
            .sessions()
            .values()
            .flat_map(|session| session.flags.iter().cloned())
            .collect();

        let mut mapping = BTreeMap::new();
        for (&old_id, session) in prior.sessions() {
            let has_stale_flag = session
                .flags
                .iter()
                .any(|flag| !batch_flags.contains(flag));
            if !session.flags.is_empty() && has_stale_flag {
                let new_id = merged.next_session_id();
                merged.attach_session(session.carried_forward(new_id));
                mapping.insert(old_id, new_id);
            }
        }
        if !mapping.is_empty() {
            tracing::debug!(
                target: "covmerge::merge",
                carried = mapping.len(),
                "carrying forward sessions for flags not re-run in this batch"
            );
            fold_remapped(&mut merged, prior, &mapping);
        }
    }

    merged
}

/// Join `source`'s lines into `target`, restricted to the sessions named in
/// `mapping` and re-keyed to their new ids.
fn fold_remapped(target: &mut Report, source: &Report, mapping: &BTreeMap<SessionId, SessionId>) {
    for file in source.files() {
        let remapped: Vec<_> = file
            .lines()
            .filter_map(|(number, record)| {
                record
                    .filter_remap(mapping)
                    .map(|remapped| (number, remapped))
            })
            .collect();
        if remapped.is_empty() {
            continue;
        }
        let target_file = target.file_entry(file.path().to_string());
        for (number, record) in remapped {
            target_file.record(number, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CovmergeError;
    use crate::model::{CoverageState, LineRecord, SessionKind};

    fn fragment_with(session: SessionId, path: &str, lines: &[(u32, CoverageState)]) -> ReportFragment {
        let mut fragment = ReportFragment::new(session);
        let file = fragment.file_entry(path.to_string());
        for &(number, state) in lines {
            file.record(number, LineRecord::observed(session, state));
        }
        fragment
    }

    fn session_with(id: SessionId, flags: &[&str]) -> Session {
        Session::new(id, flags.iter().map(|f| f.to_string()))
    }

    #[test]
    fn test_fold_fragment_joins_lines() {
        let mut report = Report::new();
        let hit = CoverageState::Hit;
        let miss = CoverageState::Miss;

        fold_fragment(
            &mut report,
            session_with(0, &["unit"]),
            fragment_with(0, "src/lib.rs", &[(1, hit), (2, miss)]),
        )
        .unwrap();
        fold_fragment(
            &mut report,
            session_with(1, &["integration"]),
            fragment_with(1, "src/lib.rs", &[(2, hit)]),
        )
        .unwrap();

        let file = report.file("src/lib.rs").unwrap();
        let line = file.get(2).unwrap();
        assert_eq!(line.coverage(), CoverageState::Hit);
        assert_eq!(line.sessions().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(report.sessions().len(), 2);
    }

    #[test]
    fn test_fold_into_finalized_report_fails() {
        let mut report = Report::new();
        fold_fragment(
            &mut report,
            session_with(0, &[]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();
        report.finalize();

        let result = fold_fragment(
            &mut report,
            session_with(1, &[]),
            fragment_with(1, "a.rs", &[(2, CoverageState::Hit)]),
        );
        assert!(matches!(result, Err(CovmergeError::ReportFinalized)));
        // The failed fold left the report untouched.
        assert_eq!(report.sessions().len(), 1);
        assert!(report.file("a.rs").unwrap().get(2).is_none());
    }

    #[test]
    fn test_refolding_same_fragment_keeps_line_state() {
        let mut report = Report::new();
        fold_fragment(
            &mut report,
            session_with(0, &[]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();
        let before = report.file("a.rs").unwrap().totals().clone();

        // Re-fold the same data under a new session: line states unchanged,
        // session bookkeeping reflects both folds.
        fold_fragment(
            &mut report,
            session_with(1, &[]),
            fragment_with(1, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();
        let file = report.file("a.rs").unwrap();
        assert_eq!(*file.totals(), before);
        assert_eq!(file.get(1).unwrap().contributing_sessions(), 2);
    }

    #[test]
    fn test_merge_batch_remaps_session_ids() {
        let mut a = Report::new();
        fold_fragment(
            &mut a,
            session_with(0, &["unit"]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();
        let mut b = Report::new();
        fold_fragment(
            &mut b,
            session_with(0, &["integration"]),
            fragment_with(0, "a.rs", &[(2, CoverageState::Hit)]),
        )
        .unwrap();

        let merged = merge_batch(&[a, b], None);
        assert_eq!(merged.sessions().len(), 2);
        let file = merged.file("a.rs").unwrap();
        // Second report's session 0 was re-keyed to 1.
        assert_eq!(file.get(2).unwrap().sessions().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_carry_forward_stale_flag() {
        // Prior commit ran unit and integration; the new batch re-runs only
        // unit. Integration coverage must be carried forward.
        let mut prior = Report::new();
        fold_fragment(
            &mut prior,
            session_with(0, &["unit"]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();
        fold_fragment(
            &mut prior,
            session_with(1, &["integration"]),
            fragment_with(1, "a.rs", &[(2, CoverageState::Hit)]),
        )
        .unwrap();
        prior.finalize();

        let mut fresh = Report::new();
        fold_fragment(
            &mut fresh,
            session_with(0, &["unit"]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Miss)]),
        )
        .unwrap();

        let merged = merge_batch(&[fresh], Some(&prior));
        assert_eq!(merged.sessions().len(), 2);

        let carried = &merged.sessions()[&1];
        assert_eq!(carried.kind, SessionKind::CarriedForward { from: 1 });
        assert!(carried.flags.contains("integration"));

        let file = merged.file("a.rs").unwrap();
        // Fresh unit data replaced the prior unit run: line 1 is now a miss.
        assert_eq!(file.get(1).unwrap().coverage(), CoverageState::Miss);
        // Carried integration data still covers line 2.
        assert_eq!(file.get(2).unwrap().coverage(), CoverageState::Hit);
        assert_eq!(file.get(2).unwrap().sessions().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_no_carry_forward_when_flag_re_run() {
        let mut prior = Report::new();
        fold_fragment(
            &mut prior,
            session_with(0, &["unit"]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();

        let mut fresh = Report::new();
        fold_fragment(
            &mut fresh,
            session_with(0, &["unit"]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Miss)]),
        )
        .unwrap();

        let merged = merge_batch(&[fresh], Some(&prior));
        assert_eq!(merged.sessions().len(), 1);
        assert_eq!(
            merged.file("a.rs").unwrap().get(1).unwrap().coverage(),
            CoverageState::Miss
        );
    }

    #[test]
    fn test_unflagged_prior_sessions_are_not_carried() {
        let mut prior = Report::new();
        fold_fragment(
            &mut prior,
            session_with(0, &[]),
            fragment_with(0, "a.rs", &[(1, CoverageState::Hit)]),
        )
        .unwrap();

        let merged = merge_batch(&[], Some(&prior));
        assert_eq!(merged.sessions().len(), 0);
        assert!(merged.file("a.rs").is_none());
    }
}
