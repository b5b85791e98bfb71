//! Watching queued and running builds to completion.
//!
//! Watch items are persisted so a restart picks the list back up. Each poll
//! checks every watched build once; an item leaves the list only after its
//! build finished and the handler accepted it, so a failing handler retries
//! on the next poll.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ciwatch_persist::{KvStore, StoreError};

use crate::model::{BuildId, BuildRecord};
use crate::source::{Absent, CiDataSource};

const NS_OBSERVER: &str = "observer";

/// One persisted build under observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchItem {
    pub build_id: BuildId,
    pub srv_id: i32,
    /// Polls that came back without the build; stuck items surface in logs.
    pub misses: u32,
}

impl WatchItem {
    pub fn new(build_id: BuildId, srv_id: i32) -> Self {
        Self {
            build_id,
            srv_id,
            misses: 0,
        }
    }
}

/// Called when a watched build reaches the finished state.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn on_finished(&self, srv_id: i32, rec: &BuildRecord) -> anyhow::Result<()>;
}

pub struct BuildObserver {
    store: Arc<dyn KvStore>,
    source: Arc<dyn CiDataSource>,
}

impl BuildObserver {
    pub fn new(store: Arc<dyn KvStore>, source: Arc<dyn CiDataSource>) -> Self {
        Self { store, source }
    }

    pub fn watch(&self, item: WatchItem) -> Result<(), StoreError> {
        debug!(build_id = item.build_id, "observing build");
        self.put(&item)
    }

    pub fn watched(&self) -> Result<Vec<WatchItem>, StoreError> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.scan(NS_OBSERVER)? {
            out.push(serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
                ns: NS_OBSERVER.to_string(),
                key,
                detail: e.to_string(),
            })?);
        }
        Ok(out)
    }

    /// One pass over the watch list. Returns how many builds completed and
    /// left the list. Unfetchable builds stay watched with a bumped miss
    /// count; handler failures keep the item for the next pass.
    pub async fn poll_once(&self, handler: &dyn WatchHandler) -> anyhow::Result<usize> {
        let mut completed = 0;

        for mut item in self.watched()? {
            let rec = match self.source.build(item.build_id).await {
                Ok(rec) => rec,
                Err(Absent::NotFound) | Err(Absent::Transient(_)) => {
                    item.misses += 1;
                    if item.misses % 10 == 0 {
                        warn!(
                            build_id = item.build_id,
                            misses = item.misses,
                            "watched build still unavailable"
                        );
                    }
                    self.put(&item)?;
                    continue;
                }
            };

            if !rec.build.is_finished() {
                continue;
            }

            if let Err(e) = handler.on_finished(item.srv_id, &rec).await {
                warn!(build_id = item.build_id, error = %e, "watch handler failed, will retry");
                continue;
            }
            self.store.remove(NS_OBSERVER, &Self::key(item.build_id))?;
            completed += 1;
        }

        if completed > 0 {
            info!(completed, "watched builds completed");
        }
        Ok(completed)
    }

    fn put(&self, item: &WatchItem) -> Result<(), StoreError> {
        let key = Self::key(item.build_id);
        let bytes = serde_json::to_vec(item).map_err(|e| StoreError::Decode {
            ns: NS_OBSERVER.to_string(),
            key: key.clone(),
            detail: e.to_string(),
        })?;
        self.store.put(NS_OBSERVER, &key, &bytes)
    }

    fn key(build_id: BuildId) -> String {
        format!("{build_id:010}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildRef, BuildState, BuildStatus};
    use crate::source::FakeCiSource;
    use ciwatch_persist::MemKv;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingHandler {
        finished: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                finished: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl WatchHandler for CountingHandler {
        async fn on_finished(&self, _srv_id: i32, _rec: &BuildRecord) -> anyhow::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("handler hiccup");
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn build(id: BuildId, state: BuildState) -> BuildRecord {
        BuildRecord::new(BuildRef {
            id,
            suite_id: 1,
            branch_id: 1,
            state,
            status: BuildStatus::Success,
            start_ts: None,
            snapshot_deps: vec![],
        })
    }

    fn observer(src: &Arc<FakeCiSource>) -> BuildObserver {
        BuildObserver::new(Arc::new(MemKv::new()), src.clone() as Arc<dyn CiDataSource>)
    }

    #[tokio::test]
    async fn finished_builds_leave_the_watch_list() {
        let src = Arc::new(FakeCiSource::new());
        src.add_build(build(10, BuildState::Running));
        src.add_build(build(11, BuildState::Finished));

        let obs = observer(&src);
        obs.watch(WatchItem::new(10, 1)).unwrap();
        obs.watch(WatchItem::new(11, 1)).unwrap();

        let handler = CountingHandler::new();
        assert_eq!(obs.poll_once(&handler).await.unwrap(), 1);
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);

        let left: Vec<BuildId> = obs.watched().unwrap().iter().map(|w| w.build_id).collect();
        assert_eq!(left, vec![10]);

        // The running build finishes; the next poll drains it.
        src.add_build(build(10, BuildState::Finished));
        assert_eq!(obs.poll_once(&handler).await.unwrap(), 1);
        assert!(obs.watched().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_keeps_the_item_for_retry() {
        let src = Arc::new(FakeCiSource::new());
        src.add_build(build(10, BuildState::Finished));

        let obs = observer(&src);
        obs.watch(WatchItem::new(10, 1)).unwrap();

        let handler = CountingHandler::new();
        handler.fail_next.store(true, Ordering::SeqCst);
        assert_eq!(obs.poll_once(&handler).await.unwrap(), 0);
        assert_eq!(obs.watched().unwrap().len(), 1);

        assert_eq!(obs.poll_once(&handler).await.unwrap(), 1);
        assert!(obs.watched().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_builds_accumulate_misses() {
        let src = Arc::new(FakeCiSource::new());
        let obs = observer(&src);
        obs.watch(WatchItem::new(99, 1)).unwrap();

        let handler = CountingHandler::new();
        obs.poll_once(&handler).await.unwrap();
        obs.poll_once(&handler).await.unwrap();

        let items = obs.watched().unwrap();
        assert_eq!(items[0].misses, 2);
    }
}
