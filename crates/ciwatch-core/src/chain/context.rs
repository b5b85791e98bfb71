//! Merged multi-build view of one suite within one analysis pass.
//!
//! All builds sharing a suite id are folded together; a test name's
//! occurrences across the merged builds decide whether it is currently
//! failing. One passing occurrence suppresses all failing occurrences of
//! the same name (a rerun that passed means the failure is not current),
//! while occurrence counts stay available for statistics.

use std::collections::BTreeMap;

use crate::history::RunHistory;
use crate::model::{BuildId, BuildRecord, TestOccurrence};

/// Weight applied to the critical-failure rate when ranking suites.
/// Empirically high enough that any suite with critical-failure history
/// sorts above pure-failure-rate suites.
pub const CRITICAL_SCORE_WEIGHT: f64 = 3.14;

/// All occurrences of one test name across the merged builds.
#[derive(Debug, Clone)]
pub struct TestMult {
    pub name_id: i32,
    occurrences: Vec<(BuildId, TestOccurrence)>,
}

impl TestMult {
    fn new(name_id: i32) -> Self {
        Self {
            name_id,
            occurrences: Vec::new(),
        }
    }

    pub fn occurrences(&self) -> impl Iterator<Item = &(BuildId, TestOccurrence)> {
        self.occurrences.iter()
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn failures_count(&self) -> usize {
        self.occurrences
            .iter()
            .filter(|(_, t)| t.failed_but_not_muted())
            .count()
    }

    pub fn passed_at_least_once(&self) -> bool {
        self.occurrences.iter().any(|(_, t)| t.passed)
    }

    /// Failing for reporting purposes: at least one counted failure and no
    /// passing occurrence among the merged builds.
    pub fn is_failing(&self) -> bool {
        self.failures_count() > 0 && !self.passed_at_least_once()
    }
}

/// Merged context of one suite id within one analysis pass.
#[derive(Debug, Clone)]
pub struct MultiBuildContext {
    pub suite_id: i32,
    pub branch_id: i32,
    /// Builds of this suite currently executing, per the latest history.
    pub running_builds: usize,
    /// Builds of this suite still waiting in the queue.
    pub queued_builds: usize,
    builds: Vec<BuildRecord>,
    tests: BTreeMap<i32, TestMult>,
}

impl MultiBuildContext {
    pub fn new(suite_id: i32, branch_id: i32) -> Self {
        Self {
            suite_id,
            branch_id,
            running_builds: 0,
            queued_builds: 0,
            builds: Vec::new(),
            tests: BTreeMap::new(),
        }
    }

    /// Adds one build. Placeholders and duplicate build ids are rejected;
    /// the context never holds two builds with the same id.
    pub fn add_build(&mut self, rec: BuildRecord) -> bool {
        if rec.is_placeholder() || self.builds.iter().any(|b| b.build.id == rec.build.id) {
            return false;
        }
        for test in &rec.tests {
            self.tests
                .entry(test.name_id)
                .or_insert_with(|| TestMult::new(test.name_id))
                .occurrences
                .push((rec.build.id, test.clone()));
        }
        self.builds.push(rec);
        true
    }

    pub fn builds(&self) -> &[BuildRecord] {
        &self.builds
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestMult> {
        self.tests.values()
    }

    pub fn total_tests(&self) -> usize {
        self.tests.len()
    }

    pub fn failing_tests(&self) -> Vec<&TestMult> {
        self.tests.values().filter(|t| t.is_failing()).collect()
    }

    pub fn has_critical_problem(&self) -> bool {
        self.builds.iter().any(BuildRecord::has_critical_problem)
    }

    /// Blended ranking score from historical statistics; a suite with no
    /// history scores zero.
    pub fn score(hist: Option<&RunHistory>) -> f64 {
        match hist {
            Some(h) => h.critical_fail_rate() * CRITICAL_SCORE_WEIGHT + h.fail_rate(),
            None => 0.0,
        }
    }
}

/// One ranked suite in the final chain result.
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub ctx: MultiBuildContext,
    pub score: f64,
}

/// Result of one whole chain analysis. Always returned, never thrown:
/// an unresolvable entry point is reported through `build_not_found`.
#[derive(Debug, Clone, Default)]
pub struct FullChainContext {
    pub build_not_found: bool,
    /// Suites ranked by score, most concerning first.
    pub suites: Vec<SuiteResult>,
}

impl FullChainContext {
    pub fn not_found() -> Self {
        Self {
            build_not_found: true,
            suites: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildRef, BuildState, BuildStatus, ChangePresence, Invocation, OutcomeCode};

    fn rec_with_test(build_id: BuildId, name_id: i32, passed: bool) -> BuildRecord {
        let mut rec = BuildRecord::new(BuildRef {
            id: build_id,
            suite_id: 1,
            branch_id: 2,
            state: BuildState::Finished,
            status: if passed {
                BuildStatus::Success
            } else {
                BuildStatus::Failure
            },
            start_ts: None,
            snapshot_deps: vec![],
        });
        rec.tests.push(TestOccurrence {
            name_id,
            passed,
            muted: false,
            ignored: false,
            duration_ms: None,
        });
        rec
    }

    #[test]
    fn one_pass_suppresses_merged_failures() {
        let mut ctx = MultiBuildContext::new(1, 2);
        ctx.add_build(rec_with_test(10, 7, false));
        assert_eq!(ctx.failing_tests().len(), 1);

        ctx.add_build(rec_with_test(11, 7, true));
        assert!(ctx.failing_tests().is_empty());

        // Statistics survive the suppression.
        let t = ctx.tests().next().unwrap();
        assert_eq!(t.failures_count(), 1);
        assert_eq!(t.occurrence_count(), 2);
    }

    #[test]
    fn duplicate_build_ids_and_placeholders_are_rejected() {
        let mut ctx = MultiBuildContext::new(1, 2);
        assert!(ctx.add_build(rec_with_test(10, 7, false)));
        assert!(!ctx.add_build(rec_with_test(10, 7, true)));
        assert!(!ctx.add_build(BuildRecord::placeholder(99)));
        assert_eq!(ctx.builds().len(), 1);
    }

    #[test]
    fn muted_failures_do_not_make_a_test_failing() {
        let mut rec = rec_with_test(10, 7, false);
        rec.tests[0].muted = true;
        let mut ctx = MultiBuildContext::new(1, 2);
        ctx.add_build(rec);
        assert!(ctx.failing_tests().is_empty());
    }

    #[test]
    fn score_blends_critical_and_plain_failure_rates() {
        let mut h = RunHistory::new();
        h.push(Invocation::new(1, OutcomeCode::Ok, ChangePresence::None));
        h.push(Invocation::new(
            2,
            OutcomeCode::CriticalFailure,
            ChangePresence::None,
        ));

        let score = MultiBuildContext::score(Some(&h));
        // One critical failure out of two runs: 0.5 * weight + 0.5.
        assert!((score - (0.5 * CRITICAL_SCORE_WEIGHT + 0.5)).abs() < 1e-9);
        assert_eq!(MultiBuildContext::score(None), 0.0);
    }

    #[test]
    fn critical_history_outranks_pure_failure_rate() {
        let mut always_failing = RunHistory::new();
        for id in 1..=10 {
            always_failing.push(Invocation::new(id, OutcomeCode::Failure, ChangePresence::None));
        }

        let mut half_critical = RunHistory::new();
        for id in 1..=5 {
            half_critical.push(Invocation::new(id, OutcomeCode::Ok, ChangePresence::None));
        }
        for id in 6..=10 {
            half_critical.push(Invocation::new(
                id,
                OutcomeCode::CriticalFailure,
                ChangePresence::None,
            ));
        }

        // Half-critical beats 100% plain failures, which is the point of the
        // weight: process-killing problems surface first.
        assert!(
            MultiBuildContext::score(Some(&half_critical))
                > MultiBuildContext::score(Some(&always_failing))
        );
    }
}
