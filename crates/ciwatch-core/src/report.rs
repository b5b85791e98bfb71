//! Serializable snapshot of one analysis pass.
//!
//! The report is the outward face of the core: interned ids are resolved
//! back to strings, suites keep their ranked order, and the schema carries
//! an explicit version so consumers can detect shape changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use ciwatch_persist::StringTable;

use crate::chain::{FullChainContext, TestMult};
use crate::defect::{Defect, IssueType};
use crate::detect::Issue;
use crate::model::BuildId;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub schema_version: u32,
    /// RFC 3339 timestamp of report generation.
    pub generated_at: String,
    pub build_not_found: bool,
    pub suites: Vec<SuiteSummary>,
    /// Defects touched by this pass, newest analysis first.
    pub defects: Vec<DefectSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub branch: String,
    pub score: f64,
    pub total_tests: usize,
    pub running_builds: usize,
    pub queued_builds: usize,
    pub failed_tests: Vec<TestSummary>,
    pub new_issues: Vec<IssueSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub name: String,
    pub failure_count: usize,
    pub occurrence_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub issue_type: IssueType,
    pub name: String,
    pub build_id: BuildId,
    pub flaky_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectSummary {
    pub id: i32,
    pub branch: String,
    /// Hex-rendered digests of the commits blamed for the defect.
    pub commits: Vec<String>,
    /// Suites involved, in build-id order.
    pub suites: Vec<String>,
    pub resolved: bool,
}

impl ChainReport {
    /// Builds the report from a ranked chain result, the issues its suites
    /// produced and the defects those issues touched. Ids with no interned
    /// string render as `#<id>`.
    pub fn build(
        ctx: &FullChainContext,
        issues: &[Issue],
        defects: &[Defect],
        strings: &StringTable,
    ) -> Self {
        let name_of = |id: i32| strings.string_of(id).unwrap_or_else(|| format!("#{id}"));

        let suites = ctx
            .suites
            .iter()
            .map(|s| {
                let failed_tests = s
                    .ctx
                    .failing_tests()
                    .iter()
                    .map(|t: &&TestMult| TestSummary {
                        name: name_of(t.name_id),
                        failure_count: t.failures_count(),
                        occurrence_count: t.occurrence_count(),
                    })
                    .collect();
                let new_issues = issues
                    .iter()
                    .filter(|i| i.suite_id == s.ctx.suite_id && i.branch_id == s.ctx.branch_id)
                    .map(|i| IssueSummary {
                        issue_type: i.issue_type,
                        name: name_of(i.name_id),
                        build_id: i.build_id,
                        flaky_rate: i.flaky_rate,
                    })
                    .collect();
                SuiteSummary {
                    suite: name_of(s.ctx.suite_id),
                    branch: name_of(s.ctx.branch_id),
                    score: s.score,
                    total_tests: s.ctx.total_tests(),
                    running_builds: s.ctx.running_builds,
                    queued_builds: s.ctx.queued_builds,
                    failed_tests,
                    new_issues,
                }
            })
            .collect();

        let defects = defects
            .iter()
            .map(|d| DefectSummary {
                id: d.id,
                branch: name_of(d.branch_id),
                commits: d.commits.to_hex(),
                suites: d
                    .involved_builds
                    .values()
                    .map(|b| name_of(b.suite_id))
                    .collect(),
                resolved: d.is_resolved(),
            })
            .collect();

        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at: Utc::now().to_rfc3339(),
            build_not_found: ctx.build_not_found,
            suites,
            defects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MultiBuildContext, SuiteResult};
    use crate::model::{
        BuildRef, BuildRecord, BuildState, BuildStatus, TestOccurrence,
    };
    use ciwatch_persist::MemKv;
    use std::sync::Arc;

    fn strings() -> StringTable {
        StringTable::open(Arc::new(MemKv::new())).unwrap()
    }

    fn failing_suite(suite_id: i32, branch_id: i32, name_id: i32) -> SuiteResult {
        let mut rec = BuildRecord::new(BuildRef {
            id: 50,
            suite_id,
            branch_id,
            state: BuildState::Finished,
            status: BuildStatus::Failure,
            start_ts: None,
            snapshot_deps: vec![],
        });
        rec.tests.push(TestOccurrence {
            name_id,
            passed: false,
            muted: false,
            ignored: false,
            duration_ms: None,
        });
        let mut ctx = MultiBuildContext::new(suite_id, branch_id);
        ctx.add_build(rec);
        SuiteResult { ctx, score: 1.5 }
    }

    #[test]
    fn report_resolves_interned_names() {
        let tbl = strings();
        let suite_id = tbl.id_of("Pds1").unwrap();
        let branch_id = tbl.id_of("master").unwrap();
        let test_id = tbl.id_of("uniqueFailedTest").unwrap();

        let ctx = FullChainContext {
            build_not_found: false,
            suites: vec![failing_suite(suite_id, branch_id, test_id)],
        };
        let issues = vec![Issue {
            issue_type: IssueType::NewFailure,
            name_id: test_id,
            suite_id,
            branch_id,
            build_id: 50,
            flaky_rate: 0.0,
        }];

        let report = ChainReport::build(&ctx, &issues, &[], &tbl);
        assert_eq!(report.schema_version, REPORT_SCHEMA_VERSION);
        assert!(!report.build_not_found);

        let suite = &report.suites[0];
        assert_eq!(suite.suite, "Pds1");
        assert_eq!(suite.branch, "master");
        assert_eq!(suite.failed_tests[0].name, "uniqueFailedTest");
        assert_eq!(suite.new_issues.len(), 1);
        assert_eq!(suite.new_issues[0].name, "uniqueFailedTest");
    }

    #[test]
    fn unknown_ids_render_as_numeric_placeholders() {
        let ctx = FullChainContext {
            build_not_found: false,
            suites: vec![failing_suite(7, 8, 9)],
        };
        let report = ChainReport::build(&ctx, &[], &[], &strings());
        assert_eq!(report.suites[0].suite, "#7");
        assert_eq!(report.suites[0].failed_tests[0].name, "#9");
    }

    #[test]
    fn defect_commits_render_as_hex() {
        use crate::defect::{CommitSet, DefectBuild};
        use std::collections::BTreeMap;

        let tbl = strings();
        let branch_id = tbl.id_of("master").unwrap();
        let suite_id = tbl.id_of("Cache1").unwrap();

        let mut involved_builds = BTreeMap::new();
        involved_builds.insert(
            100,
            DefectBuild {
                suite_id,
                issues: vec![],
            },
        );
        let defect = Defect {
            id: 1,
            srv_id: 1,
            branch_id,
            commits: CommitSet::new(vec![b"\xde\xad\xbe\xef".to_vec()]),
            detected_ts: 0,
            involved_builds,
            resolved_by: None,
            notified: false,
        };

        let ctx = FullChainContext::not_found();
        let report = ChainReport::build(&ctx, &[], &[defect], &tbl);
        let summary = &report.defects[0];
        assert_eq!(summary.commits, vec!["deadbeef".to_string()]);
        assert_eq!(summary.branch, "master");
        assert_eq!(summary.suites, vec!["Cache1".to_string()]);
        assert!(!summary.resolved);
    }

    #[test]
    fn report_round_trips_through_json() {
        let ctx = FullChainContext::not_found();
        let report = ChainReport::build(&ctx, &[], &[], &strings());
        let json = serde_json::to_string(&report).unwrap();
        let back: ChainReport = serde_json::from_str(&json).unwrap();
        assert!(back.build_not_found);
        assert!(back.suites.is_empty());
    }
}
