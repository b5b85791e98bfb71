//! Analysis core for continuous-integration build results.
//!
//! The pipeline turns a set of entry builds into an actionable report:
//!
//! 1. `chain` resolves the transitive snapshot-dependency closure of the
//!    entry builds, applies the rerun-substitution policy, and merges the
//!    result into per-suite multi-build contexts.
//! 2. `history` keeps a chronological outcome sequence per test/suite and
//!    branch, and matches outcome templates against it (new failure, new
//!    critical failure, newly contributed test, flaky demotion).
//! 3. `detect` classifies the failures of one analyzed chain and folds them
//!    into `defect`, where failures sharing one set of incoming commits
//!    collapse into a single tracked defect.
//!
//! Everything below the aggregation layer encodes absence explicitly: a
//! missing or unfetchable build degrades to a placeholder leaf, never an
//! error, so one bad dependency cannot abort a whole chain analysis.

pub mod chain;
pub mod defect;
pub mod detect;
pub mod errors;
pub mod history;
pub mod model;
pub mod observer;
pub mod report;
pub mod sched;
pub mod source;

pub use chain::{ChainAnalyzer, ChainOptions, FullChainContext};
pub use defect::{CommitSet, Defect, DefectRegistry};
pub use detect::{Issue, IssueDetector, NotificationSink};
pub use errors::ConfigError;
pub use history::{normalize_branch, EventTemplate, RunHistKey, RunHistory, RunHistoryStore};
pub use model::{BuildId, BuildRecord, BuildRef, Invocation, OutcomeCode, RerunPolicy};
pub use source::{Absent, CiDataSource};
