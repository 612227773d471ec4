//! Convergence task
//!
//! Owns the single pending re-check of the playback controller. Every new
//! snapshot or freshly loaded track discards the pending re-check and runs
//! a pass straight away; each pass schedules at most one successor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info};
use unison_core::{Action, ConvergenceController, Player, Snapshot};

use crate::client::Client;
use crate::clock_sync::{server_now, SharedClock};
use crate::error::Error;

/// Player shared between the convergence task, the prefetcher and the UI
pub type SharedPlayer = Arc<Mutex<dyn Player>>;

pub fn lock_player(player: &SharedPlayer) -> MutexGuard<'_, dyn Player + 'static> {
    player.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slack added to a track-end re-check so the player has reached the end
const END_SLACK: Duration = Duration::from_millis(50);

enum Pass {
    /// Run again at the given time, or wait for the next event
    Recheck(Option<Instant>),
    /// The head finished while rolling: ask for the next track
    Advance { version: u32 },
}

fn pass(controller: &ConvergenceController, snapshot: &Snapshot, player: &SharedPlayer, clock: &SharedClock) -> Pass {
    let state = &snapshot.room_state;
    let mut player = lock_player(player);

    // The prefetcher loads the head; until then there is nothing to steer
    if state.head().is_none() || player.loaded() != state.head() {
        player.pause();
        return Pass::Recheck(None);
    }

    if state.play_state.is_rolling() && player.is_ended() {
        player.pause();
        return Pass::Advance {
            version: state.version,
        };
    }

    let verdict = controller.converge(&mut *player, &state.play_state, server_now(clock));
    debug!(
        mode = state.play_state.mode_name(),
        correction = ?verdict.correction,
        position = player.position(),
        "Convergence pass"
    );

    let mut recheck = verdict.recheck;
    if state.play_state.is_rolling() && player.is_playing() {
        if let Some(duration) = player.duration() {
            let remaining = Duration::from_secs_f64((duration - player.position()).max(0.0));
            let until_end = remaining + END_SLACK;
            recheck = Some(recheck.map_or(until_end, |r| r.min(until_end)));
        }
    }
    Pass::Recheck(recheck.map(|d| Instant::now() + d))
}

/// Steer `player` towards the room's play state until shutdown
pub async fn run_convergence(
    client: Client,
    player: SharedPlayer,
    clock: SharedClock,
    loaded: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let controller = ConvergenceController::default();
    let mut snapshots = client.watch();
    let mut advanced_at: Option<u32> = None;

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        // The previous pass's deadline is dropped; each pass sets its own
        let deadline = match pass(&controller, &snapshot, &player, &clock) {
            Pass::Recheck(next) => next,
            Pass::Advance { version } => {
                if advanced_at != Some(version) {
                    advanced_at = Some(version);
                    info!(version, "Track ended, advancing");
                    let client = client.clone();
                    tokio::spawn(async move {
                        match client.control_at(version, Action::Next).await {
                            Ok(_) => {}
                            Err(Error::Conflict(_)) => {
                                debug!("Another participant advanced first");
                            }
                            Err(e) => debug!(error = %e, "Advance failed"),
                        }
                    });
                }
                None
            }
        };

        let recheck = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = loaded.notified() => {}
            _ = recheck => {}
            _ = shutdown.recv() => break,
        }
    }

    lock_player(&player).pause();
    debug!("Convergence stopped");
}
