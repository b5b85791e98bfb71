//! Outcome-sequence templates and their matcher.
//!
//! A template describes a contiguous outcome subsequence to find in a run
//! history. The position right after `before` is the trigger: its build id
//! is what a match reports. Detection is a pure function of
//! `(history, template)`.

use crate::errors::ConfigError;
use crate::model::{BuildId, Invocation, OutcomeCode};

use super::RunHistory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    before: Vec<OutcomeCode>,
    event_and_after: Vec<OutcomeCode>,
    must_be_at_start: bool,
    include_missing: bool,
}

impl EventTemplate {
    /// Builds a template, failing fast on a shape that can never match
    /// anything meaningful (no trigger position).
    pub fn new(
        before: Vec<OutcomeCode>,
        event_and_after: Vec<OutcomeCode>,
    ) -> Result<Self, ConfigError> {
        if event_and_after.is_empty() {
            return Err(ConfigError::MalformedTemplate(
                "trigger position must be inside the template; eventAndAfter is empty".to_string(),
            ));
        }
        Ok(Self {
            before,
            event_and_after,
            must_be_at_start: false,
            include_missing: false,
        })
    }

    /// Restrict matching to the very start of the history. Used to detect
    /// "this entity is brand new and its first runs already show the
    /// pattern".
    pub fn at_start(mut self) -> Self {
        self.must_be_at_start = true;
        self
    }

    /// Keep `Missing` entries in the matched sequence instead of filtering
    /// them out.
    pub fn include_missing(mut self) -> Self {
        self.include_missing = true;
        self
    }

    fn len(&self) -> usize {
        self.before.len() + self.event_and_after.len()
    }

    /// Build id of the trigger position on the most recent match, if any.
    ///
    /// Candidate start positions are scanned from the latest possible one
    /// down to 0, so a newer occurrence always wins over an older one.
    pub fn detect(&self, hist: &RunHistory) -> Option<BuildId> {
        let seq: Vec<&Invocation> = hist
            .invocations()
            .iter()
            .filter(|i| self.include_missing || i.status != OutcomeCode::Missing)
            .collect();

        let tpl_len = self.len();
        if seq.len() < tpl_len {
            return None;
        }

        if self.must_be_at_start {
            return self.check_at(&seq, 0);
        }

        (0..=seq.len() - tpl_len)
            .rev()
            .find_map(|idx| self.check_at(&seq, idx))
    }

    fn check_at(&self, seq: &[&Invocation], idx: usize) -> Option<BuildId> {
        let template = self.before.iter().chain(self.event_and_after.iter());
        for (t_idx, want) in template.enumerate() {
            let got = seq[idx + t_idx].status;
            let matched = match want {
                OutcomeCode::OkOrFailure => {
                    got == OutcomeCode::Ok || got == OutcomeCode::Failure
                }
                other => got == *other,
            };
            if !matched {
                return None;
            }
        }
        Some(seq[idx + self.before.len()].build_id)
    }
}

/// One-or-more passes followed by failures with no pass since: a stable new
/// breakage.
pub fn new_failure() -> EventTemplate {
    known(vec![OutcomeCode::Ok], vec![OutcomeCode::Failure])
}

/// Any completed run followed by a critical failure (timeout/crash).
pub fn new_critical_failure() -> EventTemplate {
    known(
        vec![OutcomeCode::OkOrFailure],
        vec![OutcomeCode::CriticalFailure],
    )
}

/// A brand-new entity whose very first recorded runs already fail.
pub fn new_contributed_test_failure() -> EventTemplate {
    known(vec![], vec![OutcomeCode::Failure]).at_start()
}

/// Stricter variant applied to flaky tests: several consecutive failures
/// are required before a regression is believed.
pub fn new_failure_for_flaky_test() -> EventTemplate {
    known(
        vec![OutcomeCode::Ok],
        vec![
            OutcomeCode::Failure,
            OutcomeCode::Failure,
            OutcomeCode::Failure,
        ],
    )
}

fn known(before: Vec<OutcomeCode>, event_and_after: Vec<OutcomeCode>) -> EventTemplate {
    EventTemplate {
        before,
        event_and_after,
        must_be_at_start: false,
        include_missing: false,
    }
}
