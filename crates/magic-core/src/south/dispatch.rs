//! Translation of decoded MIH primitives into registry operations.
//!
//! [`dispatch`] is transport-agnostic: it takes one primitive and returns
//! the confirm/ack to send back, if the primitive calls for one. The
//! transports own framing, peers and lifetimes.

use tracing::{debug, warn};

use magic_mih::primitives::{
    ExtHeartbeatAck, ExtLinkRegisterConfirm, LinkResourceConfirm, LinkResourceRequest,
};
use magic_mih::{Primitive, ResourceAction, Status};

use crate::state::CoreState;

/// Unix timestamp in seconds, for ack echoes.
pub(crate) fn unix_now() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

/// Handle one south-bound primitive; the returned primitive, if any, is
/// the reply to frame back to the sender.
pub fn dispatch(state: &CoreState, primitive: Primitive) -> Option<Primitive> {
    match primitive {
        Primitive::ExtLinkRegisterRequest(req) => {
            let result = state.links().register(
                &req.link.link_name,
                req.link.link_type,
                &req.link.attach_point,
                req.capabilities,
                req.dlm_pid,
            );
            let confirm = match result {
                Ok(assigned_id) => ExtLinkRegisterConfirm {
                    status: Status::Success,
                    assigned_id,
                    message: format!("registered as {assigned_id}"),
                },
                Err(e) => {
                    warn!(link = %req.link.link_name, error = %e, "registration rejected");
                    ExtLinkRegisterConfirm {
                        status: e.to_mih_status(),
                        assigned_id: 0,
                        message: e.to_string(),
                    }
                }
            };
            Some(Primitive::ExtLinkRegisterConfirm(confirm))
        }

        Primitive::LinkUp(ind) => {
            if let Err(e) = state.links().mark_up(&ind.link.link_name, ind.params) {
                warn!(link = %ind.link.link_name, error = %e, "link-up for unknown link");
            }
            None
        }

        Primitive::LinkDown(ind) => {
            if let Err(e) =
                state
                    .links()
                    .mark_down(&ind.link.link_name, ind.reason, &ind.reason_text)
            {
                warn!(link = %ind.link.link_name, error = %e, "link-down for unknown link");
            }
            None
        }

        Primitive::LinkGoingDown(ind) => {
            if let Err(e) =
                state
                    .links()
                    .going_down(&ind.link.link_name, ind.time_to_down_ms, ind.reason)
            {
                warn!(link = %ind.link.link_name, error = %e, "going-down for unknown link");
            }
            None
        }

        Primitive::LinkDetected(ind) => {
            debug!(
                link = %ind.link.link_name,
                bw = ind.max_bandwidth_kbps,
                signal = ind.signal_dbm,
                "link detected"
            );
            state.links().detected(&ind.link.link_name);
            None
        }

        Primitive::LinkParametersReport(ind) => {
            if let Err(e) = state.links().update_parameters(&ind.link.link_name, ind.params) {
                warn!(link = %ind.link.link_name, error = %e, "parameter report for unknown link");
            }
            None
        }

        Primitive::ExtParametersReport(report) => {
            // Aviation metrics feed the ADIF position used by policy
            // coverage checks.
            state.adif().update_position(
                report.latitude_deg(),
                report.longitude_deg(),
                report.altitude_m as f64,
            );
            if let Err(e) = state
                .links()
                .update_parameters(&report.link.link_name, report.params)
            {
                warn!(link = %report.link.link_name, error = %e, "extended report for unknown link");
            }
            None
        }

        Primitive::LinkResourceRequest(req) => Some(Primitive::LinkResourceConfirm(
            handle_resource_request(state, req),
        )),

        Primitive::ExtHeartbeat(hb) => {
            let ack_status = match hb.health {
                magic_mih::HealthStatus::Ok => 0,
                _ => 1,
            };
            if let Err(e) = state.links().heartbeat(&hb.link.link_name, hb.health) {
                debug!(link = %hb.link.link_name, error = %e, "heartbeat from unknown link");
            }
            Some(Primitive::ExtHeartbeatAck(ExtHeartbeatAck {
                ack_status,
                server_timestamp: unix_now(),
            }))
        }

        // Confirms and acks never originate from a DLM.
        other => {
            warn!(code = format_args!("{:#06x}", other.code()), "unexpected primitive direction");
            None
        }
    }
}

fn handle_resource_request(state: &CoreState, req: LinkResourceRequest) -> LinkResourceConfirm {
    let link = req.link.clone();
    match req.action {
        ResourceAction::Request => {
            let Some(qos) = req.qos else {
                return LinkResourceConfirm {
                    link,
                    status: Status::QosNotSupported,
                    bearer_id: None,
                };
            };
            match state.links().allocate_bearer(&link.link_name, qos) {
                Ok(bearer_id) => LinkResourceConfirm {
                    link,
                    status: Status::Success,
                    bearer_id: Some(bearer_id),
                },
                Err(e) => LinkResourceConfirm {
                    link,
                    status: e.to_mih_status(),
                    bearer_id: None,
                },
            }
        }
        ResourceAction::Release => {
            let Some(bearer_id) = req.bearer_id else {
                return LinkResourceConfirm {
                    link,
                    status: Status::InvalidBearer,
                    bearer_id: None,
                };
            };
            match state.links().release_bearer(&link.link_name, bearer_id) {
                Ok(()) => LinkResourceConfirm {
                    link,
                    status: Status::Success,
                    bearer_id: Some(bearer_id),
                },
                Err(e) => LinkResourceConfirm {
                    link,
                    status: e.to_mih_status(),
                    bearer_id: Some(bearer_id),
                },
            }
        }
    }
}

/// The link a primitive concerns, for keep-alive stamping on the
/// connectionless transports.
pub fn primitive_link(primitive: &Primitive) -> Option<&str> {
    match primitive {
        Primitive::ExtLinkRegisterRequest(p) => Some(&p.link.link_name),
        Primitive::LinkUp(p) => Some(&p.link.link_name),
        Primitive::LinkDown(p) => Some(&p.link.link_name),
        Primitive::LinkGoingDown(p) => Some(&p.link.link_name),
        Primitive::LinkDetected(p) => Some(&p.link.link_name),
        Primitive::LinkParametersReport(p) => Some(&p.link.link_name),
        Primitive::ExtParametersReport(p) => Some(&p.link.link_name),
        Primitive::LinkResourceRequest(p) => Some(&p.link.link_name),
        Primitive::ExtHeartbeat(p) => Some(&p.link.link_name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::CoreState;
    use magic_mih::primitives::{ExtHeartbeat, ExtLinkRegisterRequest, LinkUpIndication};
    use magic_mih::{
        HealthStatus, LinkCapabilities, LinkParameters, LinkTupleId, LinkType, QosParam,
    };

    fn state() -> CoreState {
        let config: Config = toml::from_str(
            r#"
            [[datalinks]]
            name = "SATCOM"
            link_type = "satcom-ku"
            max_forward_bw_kbps = 30000
            latency_ms = 600
            "#,
        )
        .unwrap();
        CoreState::new(config)
    }

    fn tuple() -> LinkTupleId {
        LinkTupleId::new(LinkType::SatcomKu, "SATCOM", "sat0")
    }

    fn caps() -> LinkCapabilities {
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

    fn register(state: &CoreState) {
        let reply = dispatch(
            state,
            Primitive::ExtLinkRegisterRequest(ExtLinkRegisterRequest {
                link: tuple(),
                capabilities: caps(),
                dlm_pid: 99,
            }),
        );
        match reply {
            Some(Primitive::ExtLinkRegisterConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::Success);
                assert!(cnf.assigned_id > 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn register_then_up() {
        let state = state();
        register(&state);
        let reply = dispatch(
            &state,
            Primitive::LinkUp(LinkUpIndication {
                link: tuple(),
                params: LinkParameters::default(),
                up_timestamp: 0,
            }),
        );
        assert!(reply.is_none());
        assert!(state.links().find("SATCOM").unwrap().link_up);
    }

    #[test]
    fn register_off_catalog_rejected() {
        let state = state();
        let reply = dispatch(
            &state,
            Primitive::ExtLinkRegisterRequest(ExtLinkRegisterRequest {
                link: LinkTupleId::new(LinkType::Wifi80211, "GATE_WIFI", "wl0"),
                capabilities: caps(),
                dlm_pid: 1,
            }),
        );
        match reply {
            Some(Primitive::ExtLinkRegisterConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::LinkNotAvailable);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn resource_request_allocates_and_releases() {
        let state = state();
        register(&state);

        let qos = QosParam {
            forward_rate_kbps: 500,
            ..QosParam::default()
        };
        let reply = dispatch(
            &state,
            Primitive::LinkResourceRequest(LinkResourceRequest {
                link: tuple(),
                action: ResourceAction::Request,
                bearer_id: None,
                qos: Some(qos),
            }),
        );
        let bearer_id = match reply {
            Some(Primitive::LinkResourceConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::Success);
                cnf.bearer_id.unwrap()
            }
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(bearer_id, 1);

        let reply = dispatch(
            &state,
            Primitive::LinkResourceRequest(LinkResourceRequest {
                link: tuple(),
                action: ResourceAction::Release,
                bearer_id: Some(bearer_id),
                qos: None,
            }),
        );
        match reply {
            Some(Primitive::LinkResourceConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::Success);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn resource_request_without_qos_is_qos_not_supported() {
        let state = state();
        register(&state);
        let reply = dispatch(
            &state,
            Primitive::LinkResourceRequest(LinkResourceRequest {
                link: tuple(),
                action: ResourceAction::Request,
                bearer_id: None,
                qos: None,
            }),
        );
        match reply {
            Some(Primitive::LinkResourceConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::QosNotSupported);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn release_of_unknown_bearer_is_invalid() {
        let state = state();
        register(&state);
        let reply = dispatch(
            &state,
            Primitive::LinkResourceRequest(LinkResourceRequest {
                link: tuple(),
                action: ResourceAction::Release,
                bearer_id: Some(7),
                qos: None,
            }),
        );
        match reply {
            Some(Primitive::LinkResourceConfirm(cnf)) => {
                assert_eq!(cnf.status, Status::InvalidBearer);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn heartbeat_is_acked() {
        let state = state();
        register(&state);
        let reply = dispatch(
            &state,
            Primitive::ExtHeartbeat(ExtHeartbeat {
                link: tuple(),
                health: HealthStatus::Warning,
                tx_bytes: 1,
                rx_bytes: 2,
                active_bearers: 0,
            }),
        );
        match reply {
            Some(Primitive::ExtHeartbeatAck(ack)) => {
                assert_eq!(ack.ack_status, 1, "warning is reflected in the ack");
                assert!(ack.server_timestamp > 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn ext_report_feeds_adif() {
        let state = state();
        register(&state);
        dispatch(
            &state,
            Primitive::ExtParametersReport(magic_mih::primitives::ExtParametersReport {
                link: tuple(),
                params: LinkParameters::default(),
                altitude_m: 10_000,
                latitude_micro: 48_856_600,
                longitude_micro: 2_352_200,
                ground_speed_kts: 470,
            }),
        );
        let adif = state.adif().snapshot();
        assert!(adif.has_position());
        assert!((adif.latitude_deg.unwrap() - 48.8566).abs() < 1e-6);
        assert_eq!(adif.altitude_m, Some(10_000.0));
    }
}
