//! Command handlers for the client-facing vocabulary.
//!
//! Each handler computes under the registry locks, releases them, and
//! returns a typed answer; the connection machinery does the writing.
//! No handler ever blocks on a DLM — bearer accounting is local to the
//! Link Registry.

use std::time::Instant;

use tracing::{info, warn};

use magic_mih::{CosId, QosParam};
use magic_proto::commands::{
    AuthAnswer, AuthRequest, CommAnswer, CommAnswerParams, CommRequest, NetworkConfiguration,
    StatusAnswer, StatusSubscribe, TerminationAnswer,
};
use magic_proto::{MagicStatus, ResultCode};

use crate::policy::{self, PolicyDenial, PolicyRequest};
use crate::push::{self, StatusChange};
use crate::registry::SessionState;
use crate::state::CoreState;

/// MCAR → MCAA. On success the returned session id is bound to the
/// connection for push delivery and cleanup.
pub async fn authenticate(state: &CoreState, req: AuthRequest) -> (AuthAnswer, Option<String>) {
    let client_id = req.credentials.user_name.clone();
    let failure = |result_code, magic_status, text: &str| AuthAnswer {
        session_id: None,
        result_code,
        magic_status,
        error_message: Some(text.to_owned()),
        network: None,
    };

    let Some(profile) = state.config().find_client(&client_id).cloned() else {
        warn!(client = %client_id, "authentication for unknown client");
        return (
            failure(
                ResultCode::AuthenticationFailed,
                MagicStatus::Failure,
                "unknown client",
            ),
            None,
        );
    };
    if !profile.enabled {
        return (
            failure(
                ResultCode::AuthenticationFailed,
                MagicStatus::Failure,
                "client profile disabled",
            ),
            None,
        );
    }

    // The realm is stored now, from the request; it is never recovered
    // from the client id later.
    let realm = req.origin_realm.as_deref().unwrap_or("client.local");
    let session = match state.sessions().create(&client_id, realm, "") {
        Ok(session) => session,
        Err(e) => {
            warn!(client = %client_id, error = %e, "session table full");
            return (
                failure(
                    ResultCode::InsufficientResources,
                    MagicStatus::InsufficientResources,
                    "session table full",
                ),
                None,
            );
        }
    };

    if req.credentials.client_password != profile.password {
        // CONNECTING -> CLOSED, entry removed.
        let _ = state.sessions().set_state(&session.session_id, SessionState::Closed);
        state.sessions().close(&session.session_id);
        warn!(client = %client_id, "invalid credentials");
        return (
            failure(
                ResultCode::InvalidCredentials,
                MagicStatus::Failure,
                "invalid credentials",
            ),
            None,
        );
    }

    let session = match state
        .sessions()
        .set_state(&session.session_id, SessionState::Authenticated)
    {
        Ok(session) => session,
        Err(e) => {
            state.sessions().close(&session.session_id);
            warn!(error = %e, "authentication transition failed");
            return (
                failure(ResultCode::ServiceUnavailable, MagicStatus::Failure, "internal error"),
                None,
            );
        }
    };

    info!(client = %client_id, session = %session.session_id, realm, "client authenticated");
    push::broadcast_mscr(state, StatusChange::ClientJoin).await;

    let config = state.config();
    let answer = AuthAnswer {
        session_id: Some(session.session_id.clone()),
        result_code: ResultCode::Success,
        magic_status: MagicStatus::Success,
        error_message: None,
        network: Some(NetworkConfiguration {
            assigned_ip: profile.assigned_ip,
            gateway: None,
            dns_primary: config.north.dns_primary,
            dns_secondary: config.north.dns_secondary,
            bandwidth_cap_kbps: profile.max_forward_kbps,
            session_timeout_sec: config.core.session_timeout_sec,
        }),
    };
    (answer, Some(session.session_id))
}

/// MCCR → MCCA: policy decision, bearer allocation, session binding.
pub async fn communication(state: &CoreState, req: CommRequest) -> CommAnswer {
    let session_id = req.session_id.clone();
    let failure = |result_code, magic_status, text: String| CommAnswer {
        session_id: session_id.clone(),
        result_code,
        magic_status,
        error_message: Some(text),
        params: None,
    };

    let Some(session) = state.sessions().lookup(&req.session_id) else {
        return failure(
            ResultCode::InvalidRequest,
            MagicStatus::Failure,
            "unknown session".into(),
        );
    };
    // Credentials must match the authenticated identity.
    if req.credentials.user_name != session.client_id {
        return failure(
            ResultCode::InvalidCredentials,
            MagicStatus::Failure,
            "credentials do not match session".into(),
        );
    }
    match state.config().find_client(&session.client_id) {
        Some(profile) if profile.password == req.credentials.client_password => {}
        _ => {
            return failure(
                ResultCode::InvalidCredentials,
                MagicStatus::Failure,
                "invalid credentials".into(),
            );
        }
    }

    let params = &req.params;
    // Flight inputs ride along with the request.
    state.adif().update_flight(
        params.flight_phase.as_deref(),
        params.altitude_m.map(f64::from),
    );

    let requested_bw = params.requested_bw_kbps.unwrap_or(0);
    let requested_ret_bw = params.requested_return_bw_kbps.unwrap_or(0);
    let policy_request = PolicyRequest {
        client_id: &session.client_id,
        profile_name: &params.profile_name,
        requested_bw_kbps: requested_bw,
        requested_ret_bw_kbps: requested_ret_bw,
        priority_class: params.priority_class.unwrap_or(0),
        qos_level: params.qos_level.unwrap_or(0),
        preferred_link: params.dlm_name.as_deref(),
        flight_phase: params.flight_phase.as_deref(),
    };

    let links = state.links().snapshot();
    let adif = state.adif().snapshot();
    let decision = match policy::select_path(state.config(), &links, &adif, &policy_request) {
        Ok(decision) => decision,
        Err(denial) => {
            let (result_code, magic_status) = denial_codes(&denial);
            warn!(session = %session.session_id, %denial, "policy denied request");
            return failure(result_code, magic_status, denial.to_string());
        }
    };

    // Hysteresis: an ACTIVE session only moves when the new link is
    // clearly better and the dwell time has passed.
    let mut chosen = decision.link_name.clone();
    if session.state == SessionState::Active {
        let new_entry = links.iter().find(|l| l.name == chosen);
        let new_pct = new_entry.map(|e| e.available_bw_percent()).unwrap_or(0);
        if !policy::can_switch_link(
            &state.config().switching,
            &session,
            &chosen,
            new_pct,
            Instant::now(),
        ) {
            if let Some(current) = session.assigned_link.clone() {
                chosen = current;
            }
        }
    }

    let Some(entry) = links.iter().find(|l| l.name == chosen) else {
        return failure(
            ResultCode::ServiceUnavailable,
            MagicStatus::LinkNotAvailable,
            "selected link vanished".into(),
        );
    };

    // Allocate on the target first; only then release any old bearer. A
    // failed allocation leaves the session exactly where it was.
    let qos = QosParam {
        cos: cos_for_level(decision.qos_level),
        forward_rate_kbps: decision.granted_bw_kbps,
        return_rate_kbps: decision.granted_ret_bw_kbps,
        ..QosParam::default()
    };
    if let Err(e) = qos.validate() {
        return failure(
            ResultCode::InvalidRequest,
            MagicStatus::QosNotSupported,
            format!("qos not supported: {e}"),
        );
    }
    let old_binding = session
        .assigned_link
        .as_ref()
        .zip(session.bearer_id)
        .map(|(l, b)| (l.clone(), b));
    // A re-grant on the same link releases its old bearer first so the
    // slot (and id) is reused rather than leaked.
    if let Some((ref old_link, old_bearer)) = old_binding {
        if *old_link == chosen {
            if let Err(e) = state.links().release_bearer(old_link, old_bearer) {
                warn!(link = %old_link, bearer = old_bearer, error = %e, "stale bearer release failed");
            }
        }
    }
    let bearer_id = match state.links().allocate_bearer(&chosen, qos) {
        Ok(bearer_id) => bearer_id,
        Err(e) => {
            let (result_code, magic_status) = e.to_north_codes();
            return failure(result_code, magic_status, e.to_string());
        }
    };
    if let Some((ref old_link, old_bearer)) = old_binding {
        if *old_link != chosen {
            if let Err(e) = state.links().release_bearer(old_link, old_bearer) {
                warn!(link = %old_link, bearer = old_bearer, error = %e, "old bearer release failed");
            }
        }
    }

    let gateway_ip = Some(entry.params.gateway).filter(|ip| !ip.is_unspecified());
    let was_active_elsewhere = session.state == SessionState::Active
        && session.assigned_link.as_deref() != Some(chosen.as_str());
    let activated = match state.sessions().activate(
        &session.session_id,
        &params.profile_name,
        &chosen,
        bearer_id,
        decision.granted_bw_kbps,
        decision.granted_ret_bw_kbps,
        decision.qos_level,
        gateway_ip,
        entry.available_bw_percent(),
    ) {
        Ok(activated) => activated,
        Err(e) => {
            // Roll the bearer back; nothing else changed.
            let _ = state.links().release_bearer(&chosen, bearer_id);
            let (result_code, magic_status) = e.to_north_codes();
            return failure(result_code, magic_status, e.to_string());
        }
    };

    if was_active_elsewhere {
        // The move is already recorded; the reroute notification follows.
        push::notify_handover(state, &activated.session_id).await;
    }

    info!(
        session = %activated.session_id,
        link = %chosen,
        bearer = bearer_id,
        granted = decision.granted_bw_kbps,
        class = %decision.traffic_class,
        "communication granted"
    );

    CommAnswer {
        session_id: req.session_id,
        result_code: ResultCode::Success,
        magic_status: MagicStatus::Success,
        error_message: None,
        params: Some(CommAnswerParams {
            profile_name: params.profile_name.clone(),
            granted_bw_kbps: decision.granted_bw_kbps as f32,
            granted_return_bw_kbps: decision.granted_ret_bw_kbps as f32,
            priority_type: 1,
            priority_class: params.priority_class.unwrap_or(0),
            qos_level: decision.qos_level,
            accounting_enabled: false,
            keep_request: false,
            auto_detect: 0,
            session_timeout_sec: state.config().core.session_timeout_sec,
            flight_phase: params.flight_phase.clone(),
            altitude_range: None,
            airport: None,
            gateway_ip,
            dlm_name: chosen,
            link_number: bearer_id as u32,
        }),
    }
}

fn denial_codes(denial: &PolicyDenial) -> (ResultCode, MagicStatus) {
    match denial {
        PolicyDenial::UnknownClient(_) | PolicyDenial::ClientDisabled(_) => {
            (ResultCode::AuthorizationFailed, MagicStatus::Failure)
        }
        PolicyDenial::BandwidthExceedsProfile { .. } => (
            ResultCode::InsufficientResources,
            MagicStatus::NoFreeBandwidth,
        ),
        PolicyDenial::NoRulesets | PolicyDenial::NoRule(_) => {
            (ResultCode::ServiceUnavailable, MagicStatus::Failure)
        }
        PolicyDenial::NoSuitableLink => (
            ResultCode::ServiceUnavailable,
            MagicStatus::LinkNotAvailable,
        ),
    }
}

/// Map the answer's QoS level onto a bearer class of service.
fn cos_for_level(qos_level: u32) -> CosId {
    match qos_level {
        0 => CosId::BestEffort,
        1 => CosId::Interactive,
        _ => CosId::ExpeditedForwarding,
    }
}

/// MSCR (subscribe) → MSCA.
pub fn subscribe(state: &CoreState, req: StatusSubscribe) -> StatusAnswer {
    match state.sessions().set_subscription(&req.session_id, req.level) {
        Ok(session) => {
            info!(
                session = %req.session_id,
                level = session.subscribed_status_level,
                "status subscription updated"
            );
            StatusAnswer {
                session_id: req.session_id,
                result_code: ResultCode::Success,
            }
        }
        Err(_) => StatusAnswer {
            session_id: req.session_id,
            result_code: ResultCode::InvalidRequest,
        },
    }
}

/// STR → STA.
pub async fn terminate(state: &CoreState, session_id: &str) -> TerminationAnswer {
    let existed = teardown_session(state, session_id).await;
    if existed {
        push::broadcast_mscr(state, StatusChange::ClientLeave).await;
    }
    TerminationAnswer {
        session_id: session_id.to_owned(),
        result_code: if existed {
            ResultCode::Success
        } else {
            ResultCode::InvalidRequest
        },
    }
}

/// Release the session's bearer, unbind its link, mark it CLOSED.
/// Returns whether a session actually existed.
pub async fn teardown_session(state: &CoreState, session_id: &str) -> bool {
    let Some(session) = state.sessions().close(session_id) else {
        return false;
    };
    if let (Some(link), Some(bearer)) = (session.assigned_link.as_deref(), session.bearer_id) {
        if let Err(e) = state.links().release_bearer(link, bearer) {
            // The link may already be gone; its bearers died with it.
            tracing::debug!(link, bearer, error = %e, "bearer release on teardown");
        }
    }
    true
}
