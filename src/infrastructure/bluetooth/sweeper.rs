//! Periodic absence sweep over the discovery table.

use crate::infrastructure::bluetooth::service::Inner;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Starts the sweeper. It stops by itself once the coordinator is gone.
pub(crate) fn spawn(inner: Weak<Inner>, every: Duration, runtime: &Handle) -> AbortHandle {
    runtime
        .spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.sweep();
            }
            debug!("Absence sweeper stopped");
        })
        .abort_handle()
}
