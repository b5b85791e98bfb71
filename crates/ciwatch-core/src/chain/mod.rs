//! Chain analysis pipeline: resolve, select reruns, merge, rank.
//!
//! The pipeline is two parallel phases separated by a barrier. Phase one
//! applies the rerun policy to every suite group concurrently; only after
//! all groups finish does phase two fetch the newly selected builds. The
//! barrier keeps the request-scoped claimed set consistent: no fetch can
//! race a selection that might still claim the same id.

pub mod context;
pub mod rebuild;
pub mod resolver;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::history::{RunHistKey, RunHistoryStore};
use crate::model::{BuildId, BuildRecord, BuildRef, BuildState, RerunPolicy};
use crate::source::{Absent, CiDataSource};

pub use context::{FullChainContext, MultiBuildContext, SuiteResult, TestMult};
pub use rebuild::ClaimedSet;

/// Knobs for one analysis pass.
#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub rerun_policy: RerunPolicy,
    /// How many dependency layers below the entry points to expand.
    pub expand_depth: usize,
    /// Bounded parallelism for fetches and per-suite selection.
    pub parallel: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            rerun_policy: RerunPolicy::None,
            expand_depth: 2,
            parallel: 4,
        }
    }
}

pub struct ChainAnalyzer {
    source: Arc<dyn CiDataSource>,
    history: RunHistoryStore,
    srv_id: i32,
}

impl ChainAnalyzer {
    pub fn new(source: Arc<dyn CiDataSource>, history: RunHistoryStore, srv_id: i32) -> Self {
        Self {
            source,
            history,
            srv_id,
        }
    }

    /// Analyzes the chains rooted at `entry_points`. Missing CI data never
    /// fails the pass: unresolvable entries degrade to `build_not_found`,
    /// unfetchable builds are dropped from the merged view.
    pub async fn analyze(
        &self,
        entry_points: &[BuildId],
        opts: &ChainOptions,
    ) -> anyhow::Result<FullChainContext> {
        if entry_points.is_empty() {
            return Ok(FullChainContext::not_found());
        }

        let resolved = resolver::load_all_builds(
            self.source.clone(),
            entry_points,
            opts.expand_depth,
            opts.parallel,
        )
        .await?;
        if resolved.builds.is_empty() {
            debug!(?entry_points, "no entry build could be resolved");
            return Ok(FullChainContext::not_found());
        }

        let claimed: ClaimedSet =
            Arc::new(Mutex::new(resolved.builds.keys().copied().collect()));

        let mut groups: BTreeMap<i32, Vec<BuildRef>> = BTreeMap::new();
        for rec in resolved.builds.values() {
            groups
                .entry(rec.build.suite_id)
                .or_default()
                .push(rec.build.clone());
        }

        // Phase one: rerun selection per suite group. Joining the whole set
        // is the barrier before any phase-two fetch.
        let selections = self
            .select_all(&groups, opts, entry_points.len(), &claimed)
            .await?;

        // Phase two: fetch builds the selection added beyond the chain.
        let mut builds = resolved.builds;
        let missing: Vec<BuildId> = selections
            .values()
            .flatten()
            .copied()
            .filter(|id| !builds.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), "fetching rerun-selected builds");
            for rec in resolver::fetch_all(&self.source, &missing, opts.parallel).await? {
                if !rec.is_placeholder() {
                    builds.insert(rec.build.id, rec);
                }
            }
        }

        self.sync_histories(&selections, &builds)?;

        let mut suites = Vec::with_capacity(selections.len());
        for (&suite_id, sel) in &selections {
            let Some(branch_id) = sel
                .iter()
                .find_map(|id| builds.get(id).map(|r| r.build.branch_id))
            else {
                continue;
            };
            let mut ctx = MultiBuildContext::new(suite_id, branch_id);
            for id in sel {
                if let Some(rec) = builds.get(id) {
                    ctx.add_build(rec.clone());
                }
            }
            if ctx.is_empty() {
                continue;
            }
            self.fill_build_counts(&mut ctx).await;
            let hist = self
                .history
                .get(&RunHistKey::new(self.srv_id, suite_id, branch_id))?;
            let score = MultiBuildContext::score(hist.as_ref());
            suites.push(SuiteResult { ctx, score });
        }

        // Rank most concerning first; suite id keeps equal scores stable.
        suites.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.ctx.suite_id.cmp(&b.ctx.suite_id))
        });

        info!(
            suites = suites.len(),
            placeholders = resolved.placeholders.len(),
            "chain analysis complete"
        );
        Ok(FullChainContext {
            build_not_found: false,
            suites,
        })
    }

    /// Counts this suite's currently running and queued builds from the
    /// branch history. Absent history leaves the counts at zero; the counts
    /// are advisory and never block the analysis.
    async fn fill_build_counts(&self, ctx: &mut MultiBuildContext) {
        let history = match self
            .source
            .build_history(ctx.suite_id, ctx.branch_id)
            .await
        {
            Ok(history) => history,
            Err(Absent::NotFound) => return,
            Err(Absent::Transient(detail)) => {
                debug!(suite_id = ctx.suite_id, %detail, "build counts unavailable");
                return;
            }
        };
        for b in &history {
            match b.state {
                BuildState::Running => ctx.running_builds += 1,
                BuildState::Queued => ctx.queued_builds += 1,
                BuildState::Finished => {}
            }
        }
    }

    async fn select_all(
        &self,
        groups: &BTreeMap<i32, Vec<BuildRef>>,
        opts: &ChainOptions,
        cnt_limit: usize,
        claimed: &ClaimedSet,
    ) -> anyhow::Result<HashMap<i32, Vec<BuildId>>> {
        let sem = Arc::new(Semaphore::new(opts.parallel.max(1)));
        let mut join_set = JoinSet::new();

        for (&suite_id, group) in groups {
            let permit = sem.clone().acquire_owned().await?;
            let source = self.source.clone();
            let claimed = claimed.clone();
            let group = group.clone();
            let policy = opts.rerun_policy;
            join_set.spawn(async move {
                let _permit = permit;
                let sel =
                    rebuild::replace_with_recent(&source, policy, &group, cnt_limit, &claimed)
                        .await;
                (suite_id, sel)
            });
        }

        let mut selections = HashMap::with_capacity(groups.len());
        while let Some(res) = join_set.join_next().await {
            let (suite_id, sel) = res?;
            selections.insert(suite_id, sel);
        }
        Ok(selections)
    }

    /// Feeds every build that entered the analysis into the run history,
    /// once per build id even when reruns overlap the chain.
    fn sync_histories(
        &self,
        selections: &HashMap<i32, Vec<BuildId>>,
        builds: &BTreeMap<BuildId, BuildRecord>,
    ) -> anyhow::Result<()> {
        let mut synced: HashSet<BuildId> = HashSet::new();
        for id in selections.values().flatten() {
            if !synced.insert(*id) {
                continue;
            }
            if let Some(rec) = builds.get(id) {
                self.history.sync_build(self.srv_id, rec)?;
            }
        }
        Ok(())
    }
}
