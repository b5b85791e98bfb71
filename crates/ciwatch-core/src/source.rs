//! Boundary to the CI server.
//!
//! The core never talks HTTP itself; it consumes this narrow async trait.
//! "Not found" and "transient error" are both acceptable absent results for
//! graceful degradation, but they are kept distinct so operators can tell
//! them apart in logs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::{BuildId, BuildRecord, BuildRef};

/// Why a fetch produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Absent {
    /// The referenced record does not exist on the server.
    NotFound,
    /// The fetch failed (timeout, connection error); the record may exist.
    Transient(String),
}

pub type Fetch<T> = Result<T, Absent>;

#[async_trait]
pub trait CiDataSource: Send + Sync {
    /// Full build record by id.
    async fn build(&self, id: BuildId) -> Fetch<BuildRecord>;

    /// All known builds of one suite on one branch, any state.
    async fn build_history(&self, suite_id: i32, branch_id: i32) -> Fetch<Vec<BuildRef>>;
}

/// Degrades an absent fetch to a placeholder leaf, logging the two absence
/// classes differently: not-found is expected churn, transient failures are
/// operator-relevant.
pub fn build_or_placeholder(id: BuildId, fetched: Fetch<BuildRecord>) -> BuildRecord {
    match fetched {
        Ok(rec) => rec,
        Err(Absent::NotFound) => {
            debug!(build_id = id, "build not found, keeping ref as leaf");
            BuildRecord::placeholder(id)
        }
        Err(Absent::Transient(detail)) => {
            warn!(build_id = id, %detail, "build fetch failed, keeping ref as leaf");
            BuildRecord::placeholder(id)
        }
    }
}

/// Scripted in-memory data source for tests.
#[derive(Default)]
pub struct FakeCiSource {
    inner: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    builds: HashMap<BuildId, BuildRecord>,
    history: HashMap<(i32, i32), Vec<BuildRef>>,
    transient: std::collections::HashSet<BuildId>,
}

impl FakeCiSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a build and appends it to its suite/branch history.
    pub fn add_build(&self, rec: BuildRecord) {
        let mut state = self.inner.lock().expect("fake source lock");
        let key = (rec.build.suite_id, rec.build.branch_id);
        state.history.entry(key).or_default().push(rec.build.clone());
        state.builds.insert(rec.build.id, rec);
    }

    /// Registers a build without exposing it through history queries.
    pub fn add_build_outside_history(&self, rec: BuildRecord) {
        let mut state = self.inner.lock().expect("fake source lock");
        state.builds.insert(rec.build.id, rec);
    }

    /// Makes `build(id)` fail with a transient error.
    pub fn fail_transiently(&self, id: BuildId) {
        let mut state = self.inner.lock().expect("fake source lock");
        state.transient.insert(id);
    }
}

#[async_trait]
impl CiDataSource for FakeCiSource {
    async fn build(&self, id: BuildId) -> Fetch<BuildRecord> {
        let state = self.inner.lock().expect("fake source lock");
        if state.transient.contains(&id) {
            return Err(Absent::Transient("scripted fetch failure".to_string()));
        }
        state.builds.get(&id).cloned().ok_or(Absent::NotFound)
    }

    async fn build_history(&self, suite_id: i32, branch_id: i32) -> Fetch<Vec<BuildRef>> {
        let state = self.inner.lock().expect("fake source lock");
        Ok(state
            .history
            .get(&(suite_id, branch_id))
            .cloned()
            .unwrap_or_default())
    }
}
