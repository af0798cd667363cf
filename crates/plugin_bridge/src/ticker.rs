//! Fixed-rate clock driving frame broadcasts.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::BridgeHandle;

/// Calls [`BridgeHandle::on_tick`] every `period` until `shutdown` is cancelled
/// or the server goes away.
pub fn spawn_ticker(
    handle: BridgeHandle,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticks.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    if handle.on_tick().is_err() {
                        debug!("Plugin server gone, stopping ticker");
                        break;
                    }
                }
            }
        }
    })
}
