//! Periodic background jobs.

use std::future::Future;
use std::time::Duration;

use log::info;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Runs `job` every `period` until `cancel` fires.
///
/// The first run happens one period after start.  Runs never overlap: a
/// tick that comes due while a run is still going is skipped.  A run in
/// progress when `cancel` fires is dropped at its next await point.
pub async fn run_periodic<F, Fut>(
    name: &str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!("Starting {} (every {:?})", name, period);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("{} abandoned its current run", name);
                        break;
                    }
                    _ = job() => {}
                }
            }
        }
    }
    info!("{} stopped", name);
}
