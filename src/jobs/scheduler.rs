// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Run `task` every `period` until `shutdown` flips to true.
///
/// The first run happens one period after spawning. Ticks missed while a run
/// is in progress are not made up. Shutdown is only observed between runs, so
/// a run in progress always completes.
///
/// A zero period means the task is disabled: nothing is spawned and `None`
/// is returned.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> Option<JoinHandle<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        info!(task = name, "Periodic task disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(task = name, "Periodic task tick");
                    task().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(task = name, "Periodic task stopped");
    }))
}
