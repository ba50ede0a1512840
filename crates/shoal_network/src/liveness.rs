//! Liveness sweep — the periodic task that ages sessions and evicts them.
//!
//! The sweep takes the session write guard and, while still holding it, the
//! file index write guard for evictions. A heartbeat therefore lands either
//! before the sweep (and refreshes the session) or after it (and finds the
//! token gone). It can never revive an evicted session or its files.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::LivenessConfig;
use crate::file_index::FileIndex;
use crate::session::{SessionStore, SweepReport};

/// Run one sweep at `now`.
pub fn sweep(
    sessions: &SessionStore,
    files: &FileIndex,
    liveness: &LivenessConfig,
    now: Instant,
) -> SweepReport {
    let mut sessions = sessions.write();
    let report = sessions.sweep(now, liveness);

    for peer in &report.went_stale {
        debug!("Peer {peer} is stale");
    }
    for peer in &report.went_offline {
        info!("Peer {peer} went offline");
    }
    if !report.evicted.is_empty() {
        let mut files = files.write();
        for peer in &report.evicted {
            let dropped = files.remove_owner(peer);
            info!("Evicted session of {peer} ({dropped} shared file(s) removed)");
        }
    }
    report
}

/// Sweep every `liveness.sweep_interval` until shutdown.
pub async fn run_sweeper(
    sessions: Arc<SessionStore>,
    files: Arc<FileIndex>,
    liveness: LivenessConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(liveness.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&sessions, &files, &liveness, Instant::now());
            }
            _ = shutdown.recv() => {
                debug!("Liveness sweeper shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
