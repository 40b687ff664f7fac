//! Background sweepers: DLM heartbeat monitor and MNTR-ack timeout.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::push::{self, StatusChange};
use crate::state::CoreState;

/// Scan the link registry on an interval; a DLM silent past the timeout
/// is cleared and its links go down with reason=timeout. The DOWN events
/// drive session suspension and transport closure elsewhere.
pub async fn run_heartbeat_monitor(state: CoreState, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.config().south.monitor_interval_sec);
    let timeout = state.config().heartbeat_timeout();
    info!(
        interval_sec = interval.as_secs(),
        timeout_sec = timeout.as_secs(),
        "heartbeat monitor started"
    );
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = state.links().sweep_expired(timeout);
                for link in removed {
                    warn!(%link, "DLM heartbeat timeout");
                }
            }
        }
    }
    debug!("heartbeat monitor stopped");
}

/// Force-close sessions whose MNTR went unacknowledged past the timeout.
/// No grace: the session is removed, its bearer released, its transport
/// handle dropped.
pub async fn run_ack_sweeper(state: CoreState, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.config().push.ack_sweep_interval_sec);
    let timeout = state.config().mntr_ack_timeout();
    info!(
        interval_sec = interval.as_secs(),
        timeout_sec = timeout.as_secs(),
        "MNTR ack sweeper started"
    );
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let closed = state.sessions().sweep_ack_timeouts(timeout);
                if closed.is_empty() {
                    continue;
                }
                for session in &closed {
                    if let (Some(link), Some(bearer)) =
                        (session.assigned_link.as_deref(), session.bearer_id)
                    {
                        if let Err(e) = state.links().release_bearer(link, bearer) {
                            debug!(link, bearer, error = %e, "bearer release on ack timeout");
                        }
                    }
                    state.clients().remove(&session.session_id);
                }
                push::broadcast_mscr(&state, StatusChange::ClientLeave).await;
            }
        }
    }
    debug!("MNTR ack sweeper stopped");
}
