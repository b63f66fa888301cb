use rally_booking::ExpirationSweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Run the expiration sweep every `period` until `shutdown` flips to `true`.
pub fn spawn_sweeper(
    sweeper: Arc<ExpirationSweeper>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Expiration sweeper started, every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = sweeper.run_once().await;
                    debug!(?report, "sweep finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Expiration sweeper stopped");
    })
}
