//! Transitive expansion of entry builds into the full chain.
//!
//! Expansion is breadth-first to an explicit, bounded depth: dependency
//! graphs in this domain are shallow, and the bound keeps pathological
//! cycles harmless. A build that cannot be fetched stays in the chain as a
//! placeholder leaf; partial data beats aborting the whole chain.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::model::{BuildId, BuildRecord};
use crate::source::{build_or_placeholder, CiDataSource};

/// Outcome of one chain resolution. Placeholder ids are tracked separately:
/// a placeholder never owns a dedup slot, so a later selection round may
/// retry the same id.
pub struct ResolvedChains {
    /// Real builds only, deduplicated by id.
    pub builds: BTreeMap<BuildId, BuildRecord>,
    /// Ids that degraded to placeholders.
    pub placeholders: HashSet<BuildId>,
}

pub async fn load_all_builds(
    source: Arc<dyn CiDataSource>,
    entry_points: &[BuildId],
    expand_depth: usize,
    parallel: usize,
) -> anyhow::Result<ResolvedChains> {
    let mut builds: BTreeMap<BuildId, BuildRecord> = BTreeMap::new();
    let mut placeholders: HashSet<BuildId> = HashSet::new();

    let mut frontier: Vec<BuildId> = Vec::new();
    let mut seen: HashSet<BuildId> = HashSet::new();
    for &id in entry_points {
        if seen.insert(id) {
            frontier.push(id);
        }
    }

    // Level 0 fetches the entry points themselves; each further level
    // expands one layer of snapshot dependencies.
    for level in 0..=expand_depth {
        if frontier.is_empty() {
            break;
        }
        debug!(level, count = frontier.len(), "resolving chain level");

        let fetched = fetch_all(&source, &frontier, parallel).await?;

        frontier = Vec::new();
        for rec in fetched {
            let id = rec.build.id;
            if rec.is_placeholder() {
                placeholders.insert(id);
                continue;
            }
            if level < expand_depth {
                for &dep in &rec.build.snapshot_deps {
                    if seen.insert(dep) {
                        frontier.push(dep);
                    }
                }
            }
            builds.insert(id, rec);
        }
    }

    Ok(ResolvedChains {
        builds,
        placeholders,
    })
}

/// Fetches one frontier in parallel over the bounded pool; absent results
/// come back as placeholders.
pub async fn fetch_all(
    source: &Arc<dyn CiDataSource>,
    ids: &[BuildId],
    parallel: usize,
) -> anyhow::Result<Vec<BuildRecord>> {
    let sem = Arc::new(Semaphore::new(parallel.max(1)));
    let mut join_set = JoinSet::new();

    for &id in ids {
        let permit = sem.clone().acquire_owned().await?;
        let source = source.clone();
        join_set.spawn(async move {
            let _permit = permit;
            build_or_placeholder(id, source.build(id).await)
        });
    }

    let mut out = Vec::with_capacity(ids.len());
    while let Some(res) = join_set.join_next().await {
        out.push(res?);
    }
    Ok(out)
}
