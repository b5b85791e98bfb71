//! Defect registry: one tracked record per code change that broke something.
//!
//! Deduplication is by commit set, not by build: every failing build whose
//! changes hash to the same set of commits lands in the same defect, however
//! many times detection re-runs. A build already recorded anywhere in the
//! registry short-circuits the merge, resolved defects included, so a
//! re-detected old failure never reopens as a fresh record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ciwatch_persist::{KvStore, StoreError};

use crate::model::BuildId;

const NS_DEFECTS: &str = "defects";

fn decode_err(key: &str, e: serde_json::Error) -> StoreError {
    StoreError::Decode {
        ns: NS_DEFECTS.to_string(),
        key: key.to_string(),
        detail: e.to_string(),
    }
}

/// Set of commit hashes, order-independent. Two sets compare equal when
/// they contain the same hashes regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSet {
    hashes: Vec<Vec<u8>>,
}

impl CommitSet {
    pub fn new(mut hashes: Vec<Vec<u8>>) -> Self {
        hashes.sort();
        hashes.dedup();
        Self { hashes }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn hashes(&self) -> &[Vec<u8>] {
        &self.hashes
    }

    pub fn to_hex(&self) -> Vec<String> {
        self.hashes.iter().map(hex::encode).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    NewFailure,
    NewCriticalFailure,
    NewContributedTestFailure,
    NewFailureForFlakyTest,
}

/// One detected issue attached to a defect build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectIssue {
    pub issue_type: IssueType,
    /// Interned name of the test or suite the issue is about.
    pub name_id: i32,
    /// Status-change rate of the entity's history at detection time.
    pub flaky_rate: f64,
}

/// One build involved in a defect, with the issues it contributed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefectBuild {
    pub suite_id: i32,
    pub issues: Vec<DefectIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defect {
    pub id: i32,
    pub srv_id: i32,
    pub branch_id: i32,
    pub commits: CommitSet,
    pub detected_ts: i64,
    pub involved_builds: BTreeMap<BuildId, DefectBuild>,
    /// Interned user id, set when a human closes the defect.
    pub resolved_by: Option<i32>,
    pub notified: bool,
}

impl Defect {
    pub fn is_resolved(&self) -> bool {
        self.resolved_by.is_some()
    }

    pub fn involves_build(&self, build_id: BuildId) -> bool {
        self.involved_builds.contains_key(&build_id)
    }
}

#[derive(Clone)]
pub struct DefectRegistry {
    store: Arc<dyn KvStore>,
}

impl DefectRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Folds one failing build into the registry and returns the owning
    /// defect. Merge order: a defect already involving this build wins
    /// outright (resolved or not) and absorbs any issues it did not yet
    /// carry for that build, then an open defect with the same commit set
    /// on the same server, then a brand-new record.
    ///
    /// The scan-then-insert sequence is not atomic across processes; a
    /// concurrent merge of the same commit set can produce two records. The
    /// registry is written by a single detector task, so the race is
    /// tolerated rather than locked against.
    pub fn merge(
        &self,
        srv_id: i32,
        branch_id: i32,
        commits: &CommitSet,
        build_id: BuildId,
        build: DefectBuild,
    ) -> Result<Defect, StoreError> {
        let all = self.load_all()?;

        if let Some(existing) = all.iter().find(|d| d.involves_build(build_id)) {
            let mut defect = existing.clone();
            if let Some(tracked) = defect.involved_builds.get_mut(&build_id) {
                let mut changed = false;
                for issue in build.issues {
                    if !tracked.issues.contains(&issue) {
                        tracked.issues.push(issue);
                        changed = true;
                    }
                }
                if changed {
                    self.save(&defect)?;
                }
            }
            return Ok(defect);
        }

        if let Some(open) = all
            .iter()
            .find(|d| !d.is_resolved() && d.srv_id == srv_id && d.commits == *commits)
        {
            let mut defect = open.clone();
            defect.involved_builds.insert(build_id, build);
            self.save(&defect)?;
            return Ok(defect);
        }

        let id = self.next_id()?;
        let mut involved_builds = BTreeMap::new();
        involved_builds.insert(build_id, build);
        let defect = Defect {
            id,
            srv_id,
            branch_id,
            commits: commits.clone(),
            detected_ts: Utc::now().timestamp_millis(),
            involved_builds,
            resolved_by: None,
            notified: false,
        };
        debug!(defect_id = id, build_id, "registered new defect");
        self.save(&defect)?;
        Ok(defect)
    }

    /// Zero never names a defect; callers treat it as "no id".
    fn next_id(&self) -> Result<i32, StoreError> {
        loop {
            let id = self.store.next_seq(NS_DEFECTS)?;
            if id != 0 {
                return Ok(id as i32);
            }
        }
    }

    pub fn save(&self, defect: &Defect) -> Result<(), StoreError> {
        let key = Self::key(defect.id);
        let bytes = serde_json::to_vec(defect).map_err(|e| decode_err(&key, e))?;
        self.store.put(NS_DEFECTS, &key, &bytes)
    }

    pub fn load(&self, id: i32) -> Result<Option<Defect>, StoreError> {
        let key = Self::key(id);
        match self.store.get(NS_DEFECTS, &key)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| decode_err(&key, e))?,
            )),
            None => Ok(None),
        }
    }

    pub fn load_all(&self) -> Result<Vec<Defect>, StoreError> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.scan(NS_DEFECTS)? {
            out.push(serde_json::from_slice(&bytes).map_err(|e| decode_err(&key, e))?);
        }
        Ok(out)
    }

    pub fn load_all_open(&self) -> Result<Vec<Defect>, StoreError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|d: &Defect| !d.is_resolved())
            .collect())
    }

    pub fn resolve(&self, id: i32, user_id: i32) -> Result<bool, StoreError> {
        let Some(mut defect) = self.load(id)? else {
            return Ok(false);
        };
        if defect.is_resolved() {
            return Ok(false);
        }
        defect.resolved_by = Some(user_id);
        self.save(&defect)?;
        Ok(true)
    }

    pub fn mark_notified(&self, id: i32) -> Result<(), StoreError> {
        if let Some(mut defect) = self.load(id)? {
            if !defect.notified {
                defect.notified = true;
                self.save(&defect)?;
            }
        }
        Ok(())
    }

    /// Zero-padded so kv scans come back in id order.
    fn key(id: i32) -> String {
        format!("{id:010}")
    }
}
