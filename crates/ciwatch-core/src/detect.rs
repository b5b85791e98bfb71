//! Issue detection over analyzed suites.
//!
//! An issue fires only on an event the history can vouch for: a template
//! match against the run sequence. Flaky tests are held to a stricter
//! template, so a single flip never pages anyone. Freshly registered
//! defects are flushed to the notification sink after a debounce window;
//! a compare-and-swap guard keeps at most one flush in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::chain::MultiBuildContext;
use crate::defect::{CommitSet, Defect, DefectBuild, DefectIssue, DefectRegistry, IssueType};
use crate::history::{templates, RunHistKey, RunHistory, RunHistoryStore};
use crate::model::BuildId;
use crate::source::{Absent, CiDataSource};

/// One detected issue, attributed to the build where its event happened.
#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub issue_type: IssueType,
    /// Interned test name, or the suite id for suite-level issues.
    pub name_id: i32,
    pub suite_id: i32,
    pub branch_id: i32,
    /// Build where the template event fired.
    pub build_id: BuildId,
    pub flaky_rate: f64,
}

/// Outbound notification seam, one call per flush.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, defects: &[Defect]) -> anyhow::Result<()>;
}

pub struct IssueDetector {
    srv_id: i32,
    history: RunHistoryStore,
    defects: DefectRegistry,
    source: Arc<dyn CiDataSource>,
    sink: Arc<dyn NotificationSink>,
    notify_pending: Arc<AtomicBool>,
    debounce: Duration,
}

impl IssueDetector {
    pub fn new(
        srv_id: i32,
        history: RunHistoryStore,
        defects: DefectRegistry,
        source: Arc<dyn CiDataSource>,
        sink: Arc<dyn NotificationSink>,
        debounce: Duration,
    ) -> Self {
        Self {
            srv_id,
            history,
            defects,
            source,
            sink,
            notify_pending: Arc::new(AtomicBool::new(false)),
            debounce,
        }
    }

    /// Detects issues for one merged suite context. A suite or test without
    /// any recorded history yields no issue: there is no sequence to match
    /// a template against, and that is not an error.
    pub fn detect_suite_issues(&self, ctx: &MultiBuildContext) -> anyhow::Result<Vec<Issue>> {
        let suite_key = RunHistKey::new(self.srv_id, ctx.suite_id, ctx.branch_id);
        let Some(suite_hist) = self.history.get(&suite_key)? else {
            debug!(suite_id = ctx.suite_id, "no suite history yet, skipping");
            return Ok(Vec::new());
        };

        let mut issues = Vec::new();

        if ctx.has_critical_problem() {
            if let Some(build_id) = suite_hist.detect(&templates::new_critical_failure()) {
                issues.push(Issue {
                    issue_type: IssueType::NewCriticalFailure,
                    name_id: ctx.suite_id,
                    suite_id: ctx.suite_id,
                    branch_id: ctx.branch_id,
                    build_id,
                    flaky_rate: flaky_rate(&suite_hist),
                });
            }
        }

        for test in ctx.failing_tests() {
            let key = RunHistKey::new(self.srv_id, test.name_id, ctx.branch_id);
            let Some(hist) = self.history.get(&key)? else {
                continue;
            };
            if let Some(issue) = self.detect_test_issue(ctx, test.name_id, &hist) {
                issues.push(issue);
            }
        }

        if !issues.is_empty() {
            info!(
                suite_id = ctx.suite_id,
                count = issues.len(),
                "issues detected"
            );
        }
        Ok(issues)
    }

    /// Template cascade for one failing test: a failure at the very start of
    /// the history is a contributed failure, otherwise a plain new failure.
    /// A flaky history demotes the plain match to the stricter repeated
    /// pattern.
    fn detect_test_issue(
        &self,
        ctx: &MultiBuildContext,
        name_id: i32,
        hist: &RunHistory,
    ) -> Option<Issue> {
        let rate = flaky_rate(hist);
        let issue = |issue_type, build_id| Issue {
            issue_type,
            name_id,
            suite_id: ctx.suite_id,
            branch_id: ctx.branch_id,
            build_id,
            flaky_rate: rate,
        };

        if let Some(build_id) = hist.detect(&templates::new_contributed_test_failure()) {
            return Some(issue(IssueType::NewContributedTestFailure, build_id));
        }

        let build_id = hist.detect(&templates::new_failure())?;
        if !hist.is_flaky() {
            return Some(issue(IssueType::NewFailure, build_id));
        }

        let build_id = hist.detect(&templates::new_failure_for_flaky_test())?;
        Some(issue(IssueType::NewFailureForFlakyTest, build_id))
    }

    /// Folds detected issues into the defect registry and schedules a
    /// notification flush. Commit sets come from the event builds; a build
    /// whose changes cannot be fetched contributes an empty set.
    pub async fn register_issues(&self, issues: &[Issue]) -> anyhow::Result<Vec<Defect>> {
        let mut commit_cache: HashMap<BuildId, CommitSet> = HashMap::new();
        let mut touched = Vec::new();

        for issue in issues {
            let commits = match commit_cache.get(&issue.build_id) {
                Some(cs) => cs.clone(),
                None => {
                    let cs = self.fetch_commits(issue.build_id).await;
                    commit_cache.insert(issue.build_id, cs.clone());
                    cs
                }
            };
            let build = DefectBuild {
                suite_id: issue.suite_id,
                issues: vec![DefectIssue {
                    issue_type: issue.issue_type,
                    name_id: issue.name_id,
                    flaky_rate: issue.flaky_rate,
                }],
            };
            let defect = self.defects.merge(
                self.srv_id,
                issue.branch_id,
                &commits,
                issue.build_id,
                build,
            )?;
            touched.push(defect);
        }

        if !touched.is_empty() {
            self.schedule_flush();
        }
        Ok(touched)
    }

    async fn fetch_commits(&self, build_id: BuildId) -> CommitSet {
        match self.source.build(build_id).await {
            Ok(rec) => CommitSet::new(rec.commits.clone()),
            Err(Absent::NotFound) => CommitSet::default(),
            Err(Absent::Transient(detail)) => {
                warn!(build_id, %detail, "commits unavailable, recording empty set");
                CommitSet::default()
            }
        }
    }

    /// First caller after an idle period wins the CAS and owns the flush;
    /// later callers piggyback on the pending one.
    fn schedule_flush(&self) {
        if self
            .notify_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let defects = self.defects.clone();
        let sink = self.sink.clone();
        let pending = self.notify_pending.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            pending.store(false, Ordering::Release);
            if let Err(e) = flush_unnotified(&defects, sink.as_ref()).await {
                warn!(error = %e, "defect notification flush failed");
            }
        });
    }
}

async fn flush_unnotified(
    defects: &DefectRegistry,
    sink: &dyn NotificationSink,
) -> anyhow::Result<()> {
    let fresh: Vec<Defect> = defects
        .load_all_open()?
        .into_iter()
        .filter(|d| !d.notified)
        .collect();
    if fresh.is_empty() {
        return Ok(());
    }
    sink.notify(&fresh).await?;
    for d in &fresh {
        defects.mark_notified(d.id)?;
    }
    info!(count = fresh.len(), "defect notifications sent");
    Ok(())
}

fn flaky_rate(hist: &RunHistory) -> f64 {
    let runs = hist.runs_count();
    if runs == 0 {
        return 0.0;
    }
    hist.status_changes_without_code_change() as f64 / runs as f64
}
