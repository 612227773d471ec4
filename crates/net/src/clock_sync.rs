//! Clock sync task
//!
//! Samples the server's time endpoint: back to back while the estimator's
//! window fills, then on a steady period to follow drift.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use unison_core::clock::CLOCK_STEADY_PERIOD;
use unison_core::{wall_clock, ClockEstimator};

use crate::client::Client;
use crate::error::Error;

/// Estimator shared between the sync task and its readers
pub type SharedClock = Arc<Mutex<ClockEstimator>>;

pub fn lock_clock(clock: &SharedClock) -> MutexGuard<'_, ClockEstimator> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Estimated server wall time now, if the estimate is available
pub fn server_now(clock: &SharedClock) -> Option<f64> {
    lock_clock(clock).server_now()
}

/// Fold one exchange into the estimator, returning the delay before the next
fn observe(clock: &SharedClock, sent: f64, received: f64, reported: f64) -> std::time::Duration {
    let mut estimator = lock_clock(clock);
    let was_full = estimator.is_full();
    let sample = estimator.record(sent, received, reported);
    debug!(
        offset = sample.offset,
        round_trip = sample.round_trip,
        "Clock sample"
    );
    if !was_full && estimator.is_full() {
        info!(
            diagnostic = %estimator.diagnostic(),
            "Clock estimate available"
        );
    }
    estimator.next_delay()
}

/// Keep `clock` fed until shutdown or until the connection closes
pub async fn run_clock_sync(
    client: Client,
    clock: SharedClock,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let sent = wall_clock();
        let delay = match client.server_time().await {
            Ok(reported) => observe(&clock, sent, wall_clock(), reported),
            Err(Error::ConnectionClosed | Error::NotConnected) => break,
            Err(e) => {
                warn!(error = %e, "Clock sample failed");
                CLOCK_STEADY_PERIOD
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => break,
        }
    }
    debug!("Clock sync stopped");
}
