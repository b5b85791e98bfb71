//! Compact data model for builds, test outcomes, and run-history entries.
//!
//! Strings (suite ids, branch names, test names) are interned to `i32`
//! through `ciwatch_persist::StringTable`; every structure here carries the
//! small-integer ids so histories and graphs stay cheap to store and compare.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Build identity as assigned by the CI server. Monotonically increasing,
/// assumed build-chronological.
pub type BuildId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
    Unknown,
}

/// One execution record of a CI suite. Immutable once `Finished`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    pub id: BuildId,
    /// Interned build-type (suite) identity.
    pub suite_id: i32,
    /// Interned branch name.
    pub branch_id: i32,
    pub state: BuildState,
    pub status: BuildStatus,
    pub start_ts: Option<i64>,
    /// Direct snapshot dependencies, by build id.
    pub snapshot_deps: Vec<BuildId>,
}

impl BuildRef {
    pub fn is_finished(&self) -> bool {
        self.state == BuildState::Finished
    }
}

/// Outcome of one test inside one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOccurrence {
    /// Interned test name.
    pub name_id: i32,
    pub passed: bool,
    pub muted: bool,
    pub ignored: bool,
    pub duration_ms: Option<u64>,
}

impl TestOccurrence {
    /// Failed and actually counted against the build (mutes and ignores
    /// are excluded from failure lists but kept for statistics).
    pub fn failed_but_not_muted(&self) -> bool {
        !self.passed && !self.muted && !self.ignored
    }

    pub fn outcome_code(&self) -> OutcomeCode {
        if self.ignored {
            OutcomeCode::Ignored
        } else if self.muted {
            if self.passed {
                OutcomeCode::OkMuted
            } else {
                OutcomeCode::FailureMuted
            }
        } else if self.passed {
            OutcomeCode::Ok
        } else {
            OutcomeCode::Failure
        }
    }
}

/// Build-level problem reported by the CI server (as opposed to an
/// individual test failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    ExecutionTimeout,
    Crash,
    OutOfMemory,
    ExitCode,
    FailedTests,
    SnapshotDepError,
    Other,
}

impl ProblemKind {
    /// Timeouts, crashes and OOMs abort the suite process itself; they rank
    /// above ordinary test failures everywhere in the pipeline.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ProblemKind::ExecutionTimeout | ProblemKind::Crash | ProblemKind::OutOfMemory
        )
    }
}

/// Full build record: the ref plus everything the analysis needs from the
/// CI server about this build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build: BuildRef,
    pub tests: Vec<TestOccurrence>,
    pub problems: Vec<ProblemKind>,
    /// Raw commit digests of the incoming changes.
    pub commits: Vec<Vec<u8>>,
    /// Composite builds aggregate other builds and carry no tests of their own.
    pub composite: bool,
    placeholder: bool,
}

impl BuildRecord {
    pub fn new(build: BuildRef) -> Self {
        Self {
            build,
            tests: Vec::new(),
            problems: Vec::new(),
            commits: Vec::new(),
            composite: false,
            placeholder: false,
        }
    }

    /// Synthetic stand-in for a build that could not be fetched. Kept as a
    /// leaf during chain resolution, excluded from every result set.
    pub fn placeholder(id: BuildId) -> Self {
        Self {
            build: BuildRef {
                id,
                suite_id: -1,
                branch_id: -1,
                state: BuildState::Finished,
                status: BuildStatus::Unknown,
                start_ts: None,
                snapshot_deps: Vec::new(),
            },
            tests: Vec::new(),
            problems: Vec::new(),
            commits: Vec::new(),
            composite: false,
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn has_critical_problem(&self) -> bool {
        self.problems.iter().any(ProblemKind::is_critical)
    }

    /// Change presence attributed to this build's invocations.
    pub fn change_presence(&self) -> ChangePresence {
        if self.placeholder {
            ChangePresence::Unknown
        } else if self.commits.is_empty() {
            ChangePresence::None
        } else {
            ChangePresence::Present
        }
    }

    /// Suite-level outcome for the run history, `None` while not finished.
    pub fn suite_outcome(&self) -> Option<OutcomeCode> {
        if self.placeholder || !self.build.is_finished() {
            return None;
        }
        if self.has_critical_problem() {
            return Some(OutcomeCode::CriticalFailure);
        }
        match self.build.status {
            BuildStatus::Success => Some(OutcomeCode::Ok),
            BuildStatus::Failure => Some(OutcomeCode::Failure),
            BuildStatus::Unknown => None,
        }
    }
}

/// Outcome code of one invocation, as stored in run histories.
///
/// `OkOrFailure` is a template-only wildcard: it never appears in stored
/// data, it matches either `Ok` or `Failure` during template detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OutcomeCode {
    Ok = 0,
    Failure = 1,
    OkOrFailure = 2,
    CriticalFailure = 3,
    Muted = 4,
    FailureMuted = 5,
    OkMuted = 6,
    Ignored = 7,
    Missing = 8,
}

impl OutcomeCode {
    pub fn is_muted_or_ignored(self) -> bool {
        matches!(
            self,
            OutcomeCode::Muted
                | OutcomeCode::FailureMuted
                | OutcomeCode::OkMuted
                | OutcomeCode::Ignored
        )
    }

    pub fn counts_as_failure(self) -> bool {
        matches!(self, OutcomeCode::Failure | OutcomeCode::CriticalFailure)
    }
}

/// Whether the invocation's build carried incoming code changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePresence {
    None,
    Present,
    Unknown,
}

/// Run-history element: one invocation of a test or suite in one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub build_id: BuildId,
    pub status: OutcomeCode,
    pub changes: ChangePresence,
}

impl Invocation {
    pub fn new(build_id: BuildId, status: OutcomeCode, changes: ChangePresence) -> Self {
        Self {
            build_id,
            status,
            changes,
        }
    }
}

/// How prior reruns of the same suite/branch are folded into analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunPolicy {
    None,
    Latest,
    All,
}

impl std::str::FromStr for RerunPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(RerunPolicy::None),
            "latest" => Ok(RerunPolicy::Latest),
            "all" => Ok(RerunPolicy::All),
            other => Err(ConfigError::UnknownRerunPolicy(other.to_string())),
        }
    }
}
