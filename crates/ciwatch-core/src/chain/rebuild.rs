//! Rerun-substitution policy.
//!
//! Given the builds of one suite inside a resolved chain, decide which
//! builds actually enter the analysis: the chain's own builds (`None`),
//! only the most recent rebuild from history (`Latest`), or the chain's
//! builds plus the freshest unclaimed history entries (`All`).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::model::{BuildId, BuildRef, RerunPolicy};
use crate::source::{Absent, CiDataSource};

/// Request-scoped dedup set. The first caller to claim an id owns it;
/// placeholder ids are never registered here.
pub type ClaimedSet = Arc<Mutex<HashSet<BuildId>>>;

pub fn claim(claimed: &ClaimedSet, id: BuildId) -> bool {
    claimed.lock().expect("claimed set lock").insert(id)
}

/// Applies the rerun policy to one suite group, returning the working set
/// of build ids and claiming any newly selected id. `cnt_limit` is the
/// original entry-point count, reused uniformly as the history cap.
pub async fn replace_with_recent(
    source: &Arc<dyn CiDataSource>,
    policy: RerunPolicy,
    group: &[BuildRef],
    cnt_limit: usize,
    claimed: &ClaimedSet,
) -> Vec<BuildId> {
    let group_ids: Vec<BuildId> = group.iter().map(|b| b.id).collect();
    if group.is_empty() || policy == RerunPolicy::None {
        return group_ids;
    }

    // The freshest group member decides which suite/branch history to ask for.
    let Some(freshest) = group.iter().max_by_key(|b| b.id) else {
        return group_ids;
    };

    let history = match source
        .build_history(freshest.suite_id, freshest.branch_id)
        .await
    {
        Ok(history) => history,
        Err(Absent::NotFound) => Vec::new(),
        Err(Absent::Transient(detail)) => {
            warn!(
                suite_id = freshest.suite_id,
                %detail,
                "build history unavailable, keeping chain builds as-is"
            );
            return group_ids;
        }
    };

    let mut finished: Vec<&BuildRef> = history.iter().filter(|b| b.is_finished()).collect();
    finished.sort_by_key(|b| std::cmp::Reverse(b.id));

    // `None` returned early above; only the history-consulting modes remain.
    if policy == RerunPolicy::Latest {
        // Most recent finished rebuild, falling back to the chain's own
        // build when history has nothing newer to offer.
        let chosen = finished.first().map(|b| b.id).unwrap_or(freshest.id);
        claim(claimed, chosen);
        vec![chosen]
    } else {
        let mut selected = group_ids;
        let extra = finished
            .iter()
            .map(|b| b.id)
            .filter(|&id| claim(claimed, id))
            .take(cnt_limit);
        selected.extend(extra);
        selected
    }
}
