//! Per-test and per-suite run histories.
//!
//! A history is the append-only, build-ordered invocation sequence for one
//! `(server, entity, branch)` key. Counters (run count, failure rates, flip
//! count) are always derived from the sequence, never stored, so they cannot
//! drift from the data.

pub mod templates;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ciwatch_persist::{KvStore, StoreError};

use crate::model::{BuildRecord, ChangePresence, Invocation, OutcomeCode};
pub use templates::EventTemplate;

/// Flips without an attributed code change at or above this border mark a
/// test as flaky.
pub const FLAKY_STATUS_CHANGE_BORDER: usize = 1;

const NS_RUN_HIST: &str = "runhist";

/// Canonical name the default branch is tracked under in history keys.
pub const DEFAULT_BRANCH: &str = "<default>";

/// Canonical branch spelling for history keying, applied before a branch
/// name is interned. CI servers spell the default branch several ways;
/// keying on the raw spelling would split one branch's history across
/// multiple sequences and starve template detection.
pub fn normalize_branch(branch: Option<&str>) -> &str {
    match branch {
        None | Some("master") | Some("refs/heads/master") => DEFAULT_BRANCH,
        Some(other) => other,
    }
}

/// History key: one entity (test name or suite id) on one branch of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHistKey {
    pub srv_id: i32,
    /// Interned test name or suite id.
    pub entity_id: i32,
    pub branch_id: i32,
}

impl RunHistKey {
    pub fn new(srv_id: i32, entity_id: i32, branch_id: i32) -> Self {
        Self {
            srv_id,
            entity_id,
            branch_id,
        }
    }

    fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.srv_id, self.entity_id, self.branch_id)
    }
}

/// Ordered invocation sequence for one history key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    invocations: Vec<Invocation>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts keeping the strict build-id order; a second invocation for
    /// the same build id is dropped (the sequence is append-only and a
    /// build is observed at most once).
    pub fn push(&mut self, inv: Invocation) -> bool {
        match self
            .invocations
            .binary_search_by_key(&inv.build_id, |i| i.build_id)
        {
            Ok(_) => false,
            Err(pos) => {
                self.invocations.insert(pos, inv);
                true
            }
        }
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    /// Runs that actually count: mutes, ignores and missing entries excluded.
    pub fn runs_count(&self) -> usize {
        self.invocations
            .iter()
            .filter(|i| !i.status.is_muted_or_ignored() && i.status != OutcomeCode::Missing)
            .count()
    }

    pub fn failures_count(&self) -> usize {
        self.invocations
            .iter()
            .filter(|i| i.status.counts_as_failure())
            .count()
    }

    pub fn critical_failures_count(&self) -> usize {
        self.invocations
            .iter()
            .filter(|i| i.status == OutcomeCode::CriticalFailure)
            .count()
    }

    pub fn fail_rate(&self) -> f64 {
        let runs = self.runs_count();
        if runs == 0 {
            return 0.0;
        }
        self.failures_count() as f64 / runs as f64
    }

    pub fn critical_fail_rate(&self) -> f64 {
        let runs = self.runs_count();
        if runs == 0 {
            return 0.0;
        }
        self.critical_failures_count() as f64 / runs as f64
    }

    /// Pass/fail flips that happened with no incoming code change.
    ///
    /// A flip counts only when the current invocation carries no changes and
    /// the previous one's change state is known; otherwise the cause of the
    /// flip is simply unobserved. Missing entries are skipped entirely.
    pub fn status_changes_without_code_change(&self) -> usize {
        let mut flips = 0;
        let mut prev: Option<&Invocation> = None;

        for cur in &self.invocations {
            if cur.status == OutcomeCode::Missing {
                continue;
            }
            if let Some(prev) = prev {
                if prev.status != cur.status
                    && cur.changes == ChangePresence::None
                    && prev.changes != ChangePresence::Unknown
                {
                    flips += 1;
                }
            }
            prev = Some(cur);
        }
        flips
    }

    pub fn is_flaky(&self) -> bool {
        self.status_changes_without_code_change() >= FLAKY_STATUS_CHANGE_BORDER
    }

    /// Build id of the template's trigger position on first (most recent)
    /// match; see `EventTemplate::detect`.
    pub fn detect(&self, template: &EventTemplate) -> Option<i32> {
        template.detect(self)
    }
}

/// Durable run-history service, one per process, injected explicitly.
#[derive(Clone)]
pub struct RunHistoryStore {
    store: Arc<dyn KvStore>,
}

impl RunHistoryStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &RunHistKey) -> Result<Option<RunHistory>, StoreError> {
        let Some(raw) = self.store.get(NS_RUN_HIST, &key.storage_key())? else {
            return Ok(None);
        };
        let hist = serde_json::from_slice(&raw).map_err(|e| StoreError::Decode {
            ns: NS_RUN_HIST.to_string(),
            key: key.storage_key(),
            detail: e.to_string(),
        })?;
        Ok(Some(hist))
    }

    /// Appends one invocation under `key`. Read-modify-write per key; the
    /// store guarantees per-key atomicity only, which is all the core needs.
    pub fn record(&self, key: &RunHistKey, inv: Invocation) -> Result<bool, StoreError> {
        let mut hist = self.get(key)?.unwrap_or_default();
        if !hist.push(inv) {
            return Ok(false);
        }
        self.put(key, &hist)?;
        Ok(true)
    }

    fn put(&self, key: &RunHistKey, hist: &RunHistory) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(hist).map_err(|e| StoreError::Decode {
            ns: NS_RUN_HIST.to_string(),
            key: key.storage_key(),
            detail: e.to_string(),
        })?;
        self.store.put(NS_RUN_HIST, &key.storage_key(), &raw)
    }

    /// Folds one observed build into the histories: an invocation for each
    /// of its tests plus one suite-level invocation. Placeholders,
    /// unfinished builds and composite aggregates contribute nothing; a
    /// composite's outcome only restates the builds it wraps.
    pub fn sync_build(&self, srv_id: i32, rec: &BuildRecord) -> Result<(), StoreError> {
        if rec.is_placeholder() || rec.composite || !rec.build.is_finished() {
            return Ok(());
        }
        let changes = rec.change_presence();
        let branch_id = rec.build.branch_id;

        for test in &rec.tests {
            let key = RunHistKey::new(srv_id, test.name_id, branch_id);
            self.record(
                &key,
                Invocation::new(rec.build.id, test.outcome_code(), changes),
            )?;
        }

        if let Some(code) = rec.suite_outcome() {
            let key = RunHistKey::new(srv_id, rec.build.suite_id, branch_id);
            self.record(&key, Invocation::new(rec.build.id, code, changes))?;
        }
        Ok(())
    }
}
