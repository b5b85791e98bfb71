//! Periodic background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs `task` forever at a fixed period. One failing iteration is logged
/// and the loop keeps going; a background task must outlive any single bad
/// poll.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!(task = name, "periodic tick");
            if let Err(e) = task().await {
                warn!(task = name, error = %e, "periodic task iteration failed");
            }
        }
    })
}
