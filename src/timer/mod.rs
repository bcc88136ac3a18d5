// Protocol timers.
//
// RFC 3261 gives the family: T1 = 500 ms (RTT estimate), T2 = 4 s (maximum
// retransmit interval), T4 = 5 s (maximum time a message stays in the
// network). The application-level eviction windows below are what the
// engine actually enforces; the sweep task walks every table on a fixed
// tick and retires whatever aged out.

use std::sync::Arc;
use std::time::Duration;

use crate::proxy::ProxyCore;

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

/// Dialogs idle this long are retired (with a Timeout CDR if unflushed).
pub const DIALOG_TIMEOUT: Duration = Duration::from_secs(3600);
/// Pending-request entries older than this are dropped.
pub const PENDING_CLEANUP: Duration = Duration::from_secs(300);
/// Invite-branch entries (CANCEL matching) live roughly 64·T1.
pub const BRANCH_CLEANUP: Duration = Duration::from_secs(60);
/// CDR tombstones are kept this long to absorb late retransmissions.
pub const FLUSHED_MAX_AGE: Duration = Duration::from_secs(3600);
/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic sweep task. Runs until the process exits; each tick is one
/// synchronous pass over the tables.
pub async fn run_sweeper(core: Arc<ProxyCore>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    // The first tick fires immediately; skip it so startup stays quiet.
    interval.tick().await;
    loop {
        interval.tick().await;
        tracing::trace!(tag = "TIMER-SWEEP", "sweep tick");
        core.sweep_once();
    }
}
