//! Push engine (CIC): server-initiated MNTR and MSCR notifications.
//!
//! - MNTR announces per-session parameter changes, gated by storm
//!   suppression, and tracks MNTA acknowledgements.
//! - MSCR broadcasts status snapshots to subscribed sessions.
//! - [`run_events`] turns link registry events into the derived
//!   notifications: suspend-and-notify on link down, resume on link up,
//!   grant adjustments on bandwidth changes.
//!
//! The state mutation behind every MNTR is applied to the session
//! registry before the message is handed to the transport; that ordering
//! is observable by clients and part of the contract.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use magic_mih::{LinkParameters, MAX_BEARERS};
use magic_proto::commands::{
    CommReportParams, DlmAvailability, DlmInfo, NotifyRequest, StatusBroadcast,
};
use magic_proto::{MagicStatus, ServerMessage};

use crate::config::PushSection;
use crate::registry::{LinkEntry, LinkEvent, Session, SessionState};
use crate::state::CoreState;

/// What changed, for MSCR targeting.
#[derive(Debug, Clone)]
pub enum StatusChange {
    /// A client authenticated (magic-level).
    ClientJoin,
    /// A client session ended (magic-level).
    ClientLeave,
    /// A DLM became available or unavailable (dlm-level).
    DlmAvailability { link: String, available: bool },
}

// ─── MNTR ───────────────────────────────────────────────────────────────────

/// Storm-suppression gate.
///
/// Unless forced: a qualitative change (either side of the transition is
/// zero, or the session was never notified) always goes out; otherwise
/// the minimum interval and the relative-change threshold both apply.
pub fn should_send_mntr(
    cfg: &PushSection,
    session: &Session,
    new_bw_kbps: u32,
    force: bool,
    now: Instant,
) -> bool {
    if force {
        return true;
    }
    let last_notified = session.last_notified_bw_kbps;
    let qualitative = new_bw_kbps == 0 || matches!(last_notified, None | Some(0));
    if qualitative {
        return true;
    }
    if let Some(sent_at) = session.last_mntr_sent {
        if now.duration_since(sent_at).as_secs() < cfg.mntr_min_interval_sec {
            debug!(session = %session.session_id, "MNTR suppressed: inside minimum interval");
            return false;
        }
    }
    let old = last_notified.expect("qualitative handled above");
    let change_percent = (new_bw_kbps.abs_diff(old) as u64 * 100 / old as u64) as u32;
    if change_percent < cfg.mntr_change_threshold_percent {
        debug!(
            session = %session.session_id,
            change_percent,
            threshold = cfg.mntr_change_threshold_percent,
            "MNTR suppressed: below change threshold"
        );
        return false;
    }
    true
}

/// Build and send one MNTR. Returns whether it was actually sent.
///
/// The ack bookkeeping is stamped before the message leaves; a transport
/// failure rolls the pending flag back.
pub async fn send_mntr(
    state: &CoreState,
    session_id: &str,
    report: CommReportParams,
    status: MagicStatus,
    error_message: Option<String>,
    force: bool,
) -> bool {
    let Some(session) = state.sessions().lookup(session_id) else {
        return false;
    };
    let new_bw_kbps = report
        .granted_bw_kbps
        .map(|f| f as u32)
        .unwrap_or(session.granted_bw_kbps);

    if !should_send_mntr(&state.config().push, &session, new_bw_kbps, force, Instant::now()) {
        state.counters().mntr_suppressed.fetch_add(1, Ordering::Relaxed);
        return false;
    }

    let (hop_by_hop, end_to_end) = state.next_pairing();
    let notify = ServerMessage::Notify(NotifyRequest {
        session_id: session_id.to_owned(),
        destination_realm: Some(session.client_realm.clone()),
        report,
        magic_status: status,
        error_message,
    })
    .into_message()
    .with_pairing(hop_by_hop, end_to_end);

    // Bookkeeping first: the send is announced only after the state
    // reflects it.
    state.sessions().mark_mntr_sent(session_id, new_bw_kbps);

    let delivered = match state.clients().get(session_id) {
        Some(handle) => handle.tx.try_send(notify).is_ok(),
        None => false,
    };
    if delivered {
        state.counters().mntr_sent.fetch_add(1, Ordering::Relaxed);
        info!(session = session_id, %status, bw = new_bw_kbps, "MNTR sent");
        true
    } else {
        state.sessions().clear_pending_ack(session_id);
        state.counters().mntr_failed.fetch_add(1, Ordering::Relaxed);
        warn!(session = session_id, "MNTR send failed (no transport)");
        false
    }
}

/// MNTA arrived.
pub fn ack_mntr(state: &CoreState, session_id: &str) {
    if state.sessions().ack_mntr(session_id) {
        debug!(session = session_id, "MNTA received");
    } else {
        debug!(session = session_id, "unexpected MNTA ignored");
    }
}

// ─── MSCR ───────────────────────────────────────────────────────────────────

/// DLM-Info for one registry entry, with an availability override for
/// transitions that have already been applied.
pub fn build_dlm_info(
    state: &CoreState,
    entry: &LinkEntry,
    available: Option<bool>,
) -> DlmInfo {
    let max_return = state
        .config()
        .find_datalink(&entry.name)
        .map(|d| d.max_return_bw_kbps as f32)
        .filter(|&bw| bw > 0.0);
    DlmInfo {
        dlm_name: entry.name.clone(),
        available: match available.unwrap_or(entry.link_up) {
            true => DlmAvailability::Yes,
            false => DlmAvailability::No,
        },
        max_links: MAX_BEARERS as u32,
        max_bandwidth_kbps: entry.capabilities.max_bandwidth_kbps as f32,
        max_return_bandwidth_kbps: max_return,
        allocated_links: entry.active_bearer_count() as u32,
        allocated_bandwidth_kbps: entry.allocated_forward_kbps() as f32,
        allocated_return_bandwidth_kbps: Some(entry.allocated_return_kbps() as f32),
        qos_levels: vec![0, 1, 2],
    }
}

fn broadcast_targets(sessions: Vec<Session>, change: &StatusChange) -> Vec<Session> {
    sessions
        .into_iter()
        .filter(|s| match change {
            StatusChange::ClientJoin | StatusChange::ClientLeave => s.subscribed_magic_level(),
            StatusChange::DlmAvailability { .. } => s.subscribed_dlm_level(),
        })
        .collect()
}

/// Broadcast an MSCR snapshot for a status change to every session whose
/// subscription covers it. A session whose transport rejects the send
/// loses its subscription (cost control).
pub async fn broadcast_mscr(state: &CoreState, change: StatusChange) {
    let targets = broadcast_targets(state.sessions().find_subscribed(), &change);
    if targets.is_empty() {
        return;
    }
    let registered_clients = state.sessions().count() as u32;
    let dlm_list: Option<Vec<DlmInfo>> = match &change {
        StatusChange::DlmAvailability { link, available } => state
            .links()
            .find(link)
            .map(|entry| vec![build_dlm_info(state, &entry, Some(*available))]),
        _ => None,
    };

    for session in targets {
        let (hop_by_hop, end_to_end) = state.next_pairing();
        let bcast = ServerMessage::StatusBroadcast(StatusBroadcast {
            session_id: session.session_id.clone(),
            destination_realm: Some(session.client_realm.clone()),
            registered_clients: session
                .subscribed_magic_level()
                .then_some(registered_clients),
            dlm_list: if session.subscribed_dlm_level() {
                dlm_list.clone()
            } else {
                None
            },
        })
        .into_message()
        .with_pairing(hop_by_hop, end_to_end);
        let delivered = match state.clients().get(&session.session_id) {
            Some(handle) => handle.tx.try_send(bcast).is_ok(),
            None => false,
        };
        if delivered {
            state.counters().mscr_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!(
                session = %session.session_id,
                "MSCR send failed, dropping status subscription"
            );
            let _ = state.sessions().set_subscription(&session.session_id, 0);
        }
    }
}

/// The initial snapshot pushed right after a successful subscription:
/// registered-clients count and the full DLM list, per the subscribed
/// bits.
pub async fn send_initial_snapshot(state: &CoreState, session_id: &str) {
    let Some(session) = state.sessions().lookup(session_id) else {
        return;
    };
    if !session.status_subscription_active {
        return;
    }
    let dlm_list = session.subscribed_dlm_level().then(|| {
        state
            .links()
            .snapshot()
            .iter()
            .map(|entry| build_dlm_info(state, entry, None))
            .collect::<Vec<_>>()
    });
    let (hop_by_hop, end_to_end) = state.next_pairing();
    let bcast = ServerMessage::StatusBroadcast(StatusBroadcast {
        session_id: session.session_id.clone(),
        destination_realm: Some(session.client_realm.clone()),
        registered_clients: session
            .subscribed_magic_level()
            .then_some(state.sessions().count() as u32),
        dlm_list,
    })
    .into_message()
    .with_pairing(hop_by_hop, end_to_end);
    if let Some(handle) = state.clients().get(session_id) {
        if handle.tx.try_send(bcast).is_ok() {
            state.counters().mscr_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─── Derived events ─────────────────────────────────────────────────────────

/// React to one link event: suspend/resume bound sessions with their
/// MNTRs, adjust grants on bandwidth movement, and broadcast DLM
/// availability.
pub async fn handle_link_event(state: &CoreState, event: LinkEvent) {
    match event {
        LinkEvent::Up { link } => {
            for session in state.sessions().sessions_on_link(&link) {
                if session.state != SessionState::Suspended {
                    continue;
                }
                match state.sessions().resume(&session.session_id) {
                    Ok(resumed) => {
                        let report = CommReportParams {
                            profile_name: resumed.profile_name.clone(),
                            granted_bw_kbps: Some(resumed.granted_bw_kbps as f32),
                            granted_return_bw_kbps: Some(resumed.granted_ret_bw_kbps as f32),
                            ..CommReportParams::default()
                        };
                        send_mntr(
                            state,
                            &resumed.session_id,
                            report,
                            MagicStatus::Success,
                            None,
                            false,
                        )
                        .await;
                    }
                    Err(e) => warn!(session = %session.session_id, error = %e, "resume failed"),
                }
            }
            broadcast_mscr(
                state,
                StatusChange::DlmAvailability {
                    link,
                    available: true,
                },
            )
            .await;
        }
        LinkEvent::Down { link, reason, text } => {
            for session in state.sessions().sessions_on_link(&link) {
                if session.state != SessionState::Active {
                    continue;
                }
                // Suspend first; announce after.
                match state.sessions().suspend(&session.session_id) {
                    Ok(suspended) => {
                        let report = CommReportParams {
                            profile_name: suspended.profile_name.clone(),
                            granted_bw_kbps: Some(0.0),
                            granted_return_bw_kbps: Some(0.0),
                            ..CommReportParams::default()
                        };
                        send_mntr(
                            state,
                            &suspended.session_id,
                            report,
                            MagicStatus::LinkError,
                            Some(format!("link {link} down ({reason}): {text}")),
                            false,
                        )
                        .await;
                    }
                    Err(e) => warn!(session = %session.session_id, error = %e, "suspend failed"),
                }
            }
            broadcast_mscr(
                state,
                StatusChange::DlmAvailability {
                    link,
                    available: false,
                },
            )
            .await;
        }
        LinkEvent::ParamReport { link, params } => {
            handle_bandwidth_change(state, &link, &params).await;
        }
        LinkEvent::GoingDown {
            link,
            time_to_down_ms,
            reason,
        } => {
            // Early warning only; the entry is still up.
            info!(%link, time_to_down_ms, %reason, "link going down, awaiting DOWN");
        }
        LinkEvent::Detected { link } => {
            info!(%link, "new link detected");
        }
    }
}

/// Move grants toward the serving link's available bandwidth: shrink when
/// the link can no longer carry the grant, restore toward the policy
/// target when capacity returns. Suppression applies to the resulting
/// MNTRs; the grant update itself always lands.
async fn handle_bandwidth_change(state: &CoreState, link: &str, params: &LinkParameters) {
    let cap = params.available_bw_kbps;
    for session in state.sessions().sessions_on_link(link) {
        if session.state != SessionState::Active {
            continue;
        }
        let new_grant = session.target_bw_kbps.min(cap);
        if new_grant == session.granted_bw_kbps {
            continue;
        }
        let shrinking = new_grant < session.granted_bw_kbps;
        let updated = match state.sessions().update_grant(
            &session.session_id,
            new_grant,
            session.granted_ret_bw_kbps,
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "grant update failed");
                continue;
            }
        };
        let report = CommReportParams {
            profile_name: updated.profile_name.clone(),
            granted_bw_kbps: Some(updated.granted_bw_kbps as f32),
            granted_return_bw_kbps: Some(updated.granted_ret_bw_kbps as f32),
            ..CommReportParams::default()
        };
        let status = if shrinking {
            MagicStatus::NoFreeBandwidth
        } else {
            MagicStatus::Success
        };
        send_mntr(state, &updated.session_id, report, status, None, false).await;
    }
}

/// Force-send the FORCED_REROUTING MNTR after a session was rebound to a
/// new link. The session registry already reflects the move.
pub async fn notify_handover(state: &CoreState, session_id: &str) {
    let Some(session) = state.sessions().lookup(session_id) else {
        return;
    };
    let report = CommReportParams {
        profile_name: session.profile_name.clone(),
        granted_bw_kbps: Some(session.granted_bw_kbps as f32),
        granted_return_bw_kbps: Some(session.granted_ret_bw_kbps as f32),
        gateway_ip: session.gateway_ip,
        dlm_name: session.assigned_link.clone(),
        ..CommReportParams::default()
    };
    send_mntr(
        state,
        session_id,
        report,
        MagicStatus::ForcedRerouting,
        None,
        true,
    )
    .await;
}

/// Long-running task: drain link events into derived notifications.
pub async fn run_events(
    state: CoreState,
    mut events: broadcast::Receiver<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(event) => handle_link_event(&state, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "push engine lagged behind link events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("push event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn push_cfg() -> PushSection {
        PushSection {
            mntr_min_interval_sec: 1,
            mntr_change_threshold_percent: 10,
            mntr_ack_timeout_sec: 5,
            ack_sweep_interval_sec: 1,
        }
    }

    fn session_with(last_notified: Option<u32>, sent_secs_ago: Option<u64>) -> Session {
        let reg = crate::registry::SessionRegistry::new(2);
        let s = reg.create("AC1", "realm", "IP_DATA").unwrap();
        let mut s = reg.lookup(&s.session_id).unwrap();
        s.last_notified_bw_kbps = last_notified;
        s.last_mntr_sent = sent_secs_ago.map(|secs| Instant::now() - Duration::from_secs(secs));
        s
    }

    #[test]
    fn first_notification_always_sends() {
        let s = session_with(None, None);
        assert!(should_send_mntr(&push_cfg(), &s, 1000, false, Instant::now()));
    }

    #[test]
    fn qualitative_zero_always_sends() {
        // To zero.
        let s = session_with(Some(1000), Some(0));
        assert!(should_send_mntr(&push_cfg(), &s, 0, false, Instant::now()));
        // From zero.
        let s = session_with(Some(0), Some(0));
        assert!(should_send_mntr(&push_cfg(), &s, 1000, false, Instant::now()));
    }

    #[test]
    fn interval_suppresses() {
        let s = session_with(Some(1000), Some(0));
        assert!(!should_send_mntr(&push_cfg(), &s, 2000, false, Instant::now()));
    }

    #[test]
    fn threshold_suppresses_small_change() {
        let s = session_with(Some(1000), Some(10));
        // 5% < 10% threshold.
        assert!(!should_send_mntr(&push_cfg(), &s, 1050, false, Instant::now()));
        // 15% passes.
        assert!(should_send_mntr(&push_cfg(), &s, 1150, false, Instant::now()));
    }

    #[test]
    fn force_bypasses_everything() {
        let s = session_with(Some(1000), Some(0));
        assert!(should_send_mntr(&push_cfg(), &s, 1001, true, Instant::now()));
    }

    #[test]
    fn broadcast_targeting_by_level() {
        let reg = crate::registry::SessionRegistry::new(4);
        let magic = reg.create("A", "r", "P").unwrap();
        reg.set_state(&magic.session_id, SessionState::Authenticated).unwrap();
        reg.set_subscription(&magic.session_id, 0b001).unwrap();
        let dlm = reg.create("B", "r", "P").unwrap();
        reg.set_state(&dlm.session_id, SessionState::Authenticated).unwrap();
        reg.set_subscription(&dlm.session_id, 0b010).unwrap();

        let join = broadcast_targets(reg.find_subscribed(), &StatusChange::ClientJoin);
        assert_eq!(join.len(), 1);
        assert_eq!(join[0].client_id, "A");

        let availability = broadcast_targets(
            reg.find_subscribed(),
            &StatusChange::DlmAvailability {
                link: "SATCOM".into(),
                available: false,
            },
        );
        assert_eq!(availability.len(), 1);
        assert_eq!(availability[0].client_id, "B");
    }
}
