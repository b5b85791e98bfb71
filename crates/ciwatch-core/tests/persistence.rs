//! State survives a process restart: histories, defects and watch items all
//! live behind the kv store, so reopening the same database resumes where
//! the previous run left off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ciwatch_core::chain::{ChainAnalyzer, ChainOptions};
use ciwatch_core::defect::{DefectRegistry, IssueType};
use ciwatch_core::detect::{Issue, IssueDetector, NotificationSink};
use ciwatch_core::model::{BuildRecord, BuildRef, BuildState, BuildStatus, TestOccurrence};
use ciwatch_core::source::{CiDataSource, FakeCiSource};
use ciwatch_core::{Defect, RunHistKey, RunHistoryStore};
use ciwatch_persist::{KvStore, SqliteKv, StringTable};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _defects: &[Defect]) -> anyhow::Result<()> {
        Ok(())
    }
}

fn failing_build(id: i32, suite_id: i32, branch_id: i32, name_id: i32) -> BuildRecord {
    let mut rec = BuildRecord::new(BuildRef {
        id,
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
    rec
}

#[tokio::test]
async fn analysis_state_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ciwatch.db");

    let (suite_id, branch_id, test_id);
    {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&path).unwrap());
        let strings = StringTable::open(kv.clone()).unwrap();
        suite_id = strings.id_of("Pds1").unwrap();
        branch_id = strings.id_of("master").unwrap();
        test_id = strings.id_of("someTest").unwrap();

        let source = Arc::new(FakeCiSource::new());
        source.add_build(failing_build(10, suite_id, branch_id, test_id));

        let history = RunHistoryStore::new(kv.clone());
        let analyzer = ChainAnalyzer::new(
            source.clone() as Arc<dyn CiDataSource>,
            history,
            1,
        );
        analyzer
            .analyze(&[10], &ChainOptions::default())
            .await
            .unwrap();

        let detector = IssueDetector::new(
            1,
            RunHistoryStore::new(kv.clone()),
            DefectRegistry::new(kv),
            source as Arc<dyn CiDataSource>,
            Arc::new(NullSink),
            Duration::from_millis(1),
        );
        detector
            .register_issues(&[Issue {
                issue_type: IssueType::NewContributedTestFailure,
                name_id: test_id,
                suite_id,
                branch_id,
                build_id: 10,
                flaky_rate: 0.0,
            }])
            .await
            .unwrap();
    }

    // Fresh handles on the same file see the interned names, the recorded
    // history and the registered defect.
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&path).unwrap());
    let strings = StringTable::open(kv.clone()).unwrap();
    assert_eq!(strings.lookup("Pds1"), Some(suite_id));
    assert_eq!(strings.string_of(test_id).as_deref(), Some("someTest"));

    let history = RunHistoryStore::new(kv.clone());
    let hist = history
        .get(&RunHistKey::new(1, test_id, branch_id))
        .unwrap()
        .unwrap();
    assert_eq!(hist.failures_count(), 1);

    let defects = DefectRegistry::new(kv);
    let all = defects.load_all().unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].involves_build(10));
}
