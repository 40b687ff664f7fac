//! Shared helpers for the integration tests: an in-process core with
//! fake client transports, driven through the same dispatch paths the
//! daemon wires up.
#![allow(dead_code)] // not every test binary uses every helper

use tokio::sync::mpsc;

use magic_core::north::handlers;
use magic_core::state::ClientHandle;
use magic_core::{Config, CoreState};
use magic_mih::primitives::{ExtLinkRegisterRequest, LinkUpIndication};
use magic_mih::{LinkCapabilities, LinkParameters, LinkTupleId, LinkType, Primitive};
use magic_proto::commands::{
    AuthRequest, ClientCredentials, CommAnswer, CommRequest, CommRequestParams,
};
use magic_proto::{Message, ServerMessage};

pub const BASE_CONFIG: &str = r#"
    [core]
    max_sessions = 8

    [switching]
    min_dwell_time_sec = 0
    hysteresis_percent = 20

    [[datalinks]]
    name = "SATCOM"
    link_type = "satcom-ku"
    max_forward_bw_kbps = 30000
    max_return_bw_kbps = 2000
    latency_ms = 600
    cost_factor = 0.5

    [[datalinks]]
    name = "CELLULAR"
    link_type = "lte"
    max_forward_bw_kbps = 50000
    max_return_bw_kbps = 50000
    latency_ms = 50
    cost_factor = 0.05

    [[clients]]
    client_id = "AC1"
    password = "cabin-secret"
    max_forward_kbps = 20000

    [[traffic_classes]]
    id = "VOICE"
    profile_patterns = ["VOICE*"]

    [[traffic_classes]]
    id = "DATA"
    profile_patterns = ["IP_*"]

    [[traffic_classes]]
    id = "BEST_EFFORT"
    default = true

    [[rulesets]]
    flight_phase = "CRUISE"

    [[rulesets.rules]]
    traffic_class = "VOICE"

    [[rulesets.rules.preferences]]
    link_name = "CELLULAR"
    ranking = 1
    max_latency_ms = 100

    [[rulesets.rules]]
    traffic_class = "DATA"

    [[rulesets.rules.preferences]]
    link_name = "CELLULAR"
    ranking = 1

    [[rulesets.rules.preferences]]
    link_name = "SATCOM"
    ranking = 2

    [[rulesets.rules]]
    traffic_class = "BEST_EFFORT"

    [[rulesets.rules.preferences]]
    link_name = "SATCOM"
    ranking = 1

    [[rulesets.rules.preferences]]
    link_name = "CELLULAR"
    ranking = 2
"#;

pub fn core(config_toml: &str) -> CoreState {
    let config: Config = toml::from_str(config_toml).expect("test config parses");
    config.validate().expect("test config is valid");
    CoreState::new(config)
}

pub fn satcom_caps() -> LinkCapabilities {
    LinkCapabilities {
        max_bandwidth_kbps: 30_000,
        typical_latency_ms: 600,
        cost_per_mb: 50,
        coverage: 1,
        security_level: 3,
        mtu: 1500,
        is_asymmetric: true,
    }
}

pub fn cellular_caps() -> LinkCapabilities {
    LinkCapabilities {
        max_bandwidth_kbps: 50_000,
        typical_latency_ms: 50,
        cost_per_mb: 5,
        coverage: 2,
        security_level: 3,
        mtu: 1500,
        is_asymmetric: false,
    }
}

pub fn tuple(name: &str, link_type: LinkType) -> LinkTupleId {
    LinkTupleId::new(link_type, name, "if0")
}

/// Register a DLM and bring its link up through the south dispatcher.
pub fn register_and_up(
    state: &CoreState,
    name: &str,
    link_type: LinkType,
    caps: LinkCapabilities,
) {
    let confirm = magic_core::south::dispatch::dispatch(
        state,
        Primitive::ExtLinkRegisterRequest(ExtLinkRegisterRequest {
            link: tuple(name, link_type),
            capabilities: caps,
            dlm_pid: 1000,
        }),
    );
    match confirm {
        Some(Primitive::ExtLinkRegisterConfirm(cnf)) => {
            assert_eq!(cnf.status, magic_mih::Status::Success, "registration of {name}");
        }
        other => panic!("unexpected registration reply {other:?}"),
    }
    magic_core::south::dispatch::dispatch(
        state,
        Primitive::LinkUp(LinkUpIndication {
            link: tuple(name, link_type),
            params: LinkParameters {
                link_state: magic_mih::LinkState::Up,
                available_bw_kbps: caps.max_bandwidth_kbps,
                ..LinkParameters::default()
            },
            up_timestamp: 1_700_000_000,
        }),
    );
}

pub fn credentials(client: &str, password: &str) -> ClientCredentials {
    ClientCredentials {
        user_name: client.into(),
        client_password: password.into(),
        server_password: None,
    }
}

/// Authenticate and wire a fake client transport for push delivery.
/// Returns the session id and the receiving end of the transport.
pub async fn authenticate(
    state: &CoreState,
    client: &str,
    password: &str,
) -> (String, mpsc::Receiver<Message>) {
    let (answer, bound) = handlers::authenticate(
        state,
        AuthRequest {
            credentials: credentials(client, password),
            origin_realm: Some("cabin.example".into()),
        },
    )
    .await;
    assert!(answer.result_code.is_success(), "auth failed: {answer:?}");
    let session_id = bound.expect("session bound on success");
    let (tx, rx) = mpsc::channel(16);
    state.clients().insert(session_id.clone(), ClientHandle { tx });
    (session_id, rx)
}

/// Issue an MCCR through the north handler.
pub async fn request_bandwidth(
    state: &CoreState,
    session_id: &str,
    profile: &str,
    bw_kbps: u32,
) -> CommAnswer {
    handlers::communication(
        state,
        CommRequest {
            session_id: session_id.to_owned(),
            credentials: credentials("AC1", "cabin-secret"),
            params: CommRequestParams {
                profile_name: profile.into(),
                requested_bw_kbps: Some(bw_kbps),
                requested_return_bw_kbps: Some(0),
                flight_phase: Some("CRUISE".into()),
                ..CommRequestParams::default()
            },
        },
    )
    .await
}

/// Drain one queued push message and parse it.
pub fn next_push(rx: &mut mpsc::Receiver<Message>) -> Option<ServerMessage> {
    let message = rx.try_recv().ok()?;
    Some(ServerMessage::from_message(&message).expect("push message parses"))
}
