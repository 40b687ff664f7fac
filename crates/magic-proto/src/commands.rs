//! Typed command vocabulary: MCAR/MCAA, MCCR/MCCA, MNTR/MNTA, MSCR/MSCA
//! and session termination, with one sum type per direction.
//!
//! [`ClientCommand`] is everything the core can receive; [`ServerMessage`]
//! is everything it can send. Conversion to and from the generic
//! [`Message`] representation is strict — a request that does not parse is
//! a protocol error, not a guess.

use std::net::Ipv4Addr;

use crate::avp::{Avp, AvpValue, Group, Message, ProtoError};
use crate::codes::{MagicStatus, ResultCode};
use crate::dictionary::{avps, commands, dictionary};

// ─── Grouped AVP payloads ───────────────────────────────────────────────────

/// Client-Credentials group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub user_name: String,
    pub client_password: String,
    pub server_password: Option<String>,
}

impl ClientCredentials {
    fn to_avp(&self) -> Avp {
        let mut children = vec![
            Avp::utf8(avps::USER_NAME, &self.user_name),
            Avp::utf8(avps::CLIENT_PASSWORD, &self.client_password),
        ];
        if let Some(ref sp) = self.server_password {
            children.push(Avp::utf8(avps::SERVER_PASSWORD, sp));
        }
        Avp::grouped(avps::CLIENT_CREDENTIALS, children)
    }

    fn from_group(group: &[Avp]) -> Result<Self, ProtoError> {
        let g = Group(group);
        Ok(ClientCredentials {
            user_name: g.require_utf8(avps::USER_NAME)?.to_owned(),
            client_password: g.require_utf8(avps::CLIENT_PASSWORD)?.to_owned(),
            server_password: g.find_utf8(avps::SERVER_PASSWORD).map(str::to_owned),
        })
    }
}

/// Communication-Request-Parameters group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommRequestParams {
    pub profile_name: String,
    pub requested_bw_kbps: Option<u32>,
    pub requested_return_bw_kbps: Option<u32>,
    pub priority_class: Option<u32>,
    pub qos_level: Option<u32>,
    /// Preferred link, when the client has one.
    pub dlm_name: Option<String>,
    pub flight_phase: Option<String>,
    pub altitude_m: Option<u32>,
}

impl CommRequestParams {
    fn to_avp(&self) -> Avp {
        let mut children = vec![Avp::utf8(avps::PROFILE_NAME, &self.profile_name)];
        if let Some(bw) = self.requested_bw_kbps {
            children.push(Avp::unsigned32(avps::REQUESTED_BANDWIDTH, bw));
        }
        if let Some(bw) = self.requested_return_bw_kbps {
            children.push(Avp::unsigned32(avps::REQUESTED_RETURN_BANDWIDTH, bw));
        }
        if let Some(pc) = self.priority_class {
            children.push(Avp::unsigned32(avps::PRIORITY_CLASS, pc));
        }
        if let Some(q) = self.qos_level {
            children.push(Avp::unsigned32(avps::QOS_LEVEL, q));
        }
        if let Some(ref name) = self.dlm_name {
            children.push(Avp::utf8(avps::DLM_NAME, name));
        }
        if let Some(ref phase) = self.flight_phase {
            children.push(Avp::utf8(avps::FLIGHT_PHASE, phase));
        }
        if let Some(alt) = self.altitude_m {
            children.push(Avp::unsigned32(avps::ALTITUDE, alt));
        }
        Avp::grouped(avps::COMM_REQUEST_PARAMETERS, children)
    }

    fn from_group(group: &[Avp]) -> Result<Self, ProtoError> {
        let g = Group(group);
        Ok(CommRequestParams {
            profile_name: g.require_utf8(avps::PROFILE_NAME)?.to_owned(),
            requested_bw_kbps: g.find_u32(avps::REQUESTED_BANDWIDTH),
            requested_return_bw_kbps: g.find_u32(avps::REQUESTED_RETURN_BANDWIDTH),
            priority_class: g.find_u32(avps::PRIORITY_CLASS),
            qos_level: g.find_u32(avps::QOS_LEVEL),
            dlm_name: g.find_utf8(avps::DLM_NAME).map(str::to_owned),
            flight_phase: g.find_utf8(avps::FLIGHT_PHASE).map(str::to_owned),
            altitude_m: g.find_u32(avps::ALTITUDE),
        })
    }
}

/// Communication-Answer-Parameters group.
#[derive(Debug, Clone, PartialEq)]
pub struct CommAnswerParams {
    pub profile_name: String,
    pub granted_bw_kbps: f32,
    pub granted_return_bw_kbps: f32,
    /// 1 = Blocking, 2 = Preemption.
    pub priority_type: u32,
    pub priority_class: u32,
    /// 0 = BE, 1 = AF, 2 = EF.
    pub qos_level: u32,
    pub accounting_enabled: bool,
    pub keep_request: bool,
    pub auto_detect: u32,
    pub session_timeout_sec: u32,
    pub flight_phase: Option<String>,
    pub altitude_range: Option<String>,
    pub airport: Option<String>,
    pub gateway_ip: Option<Ipv4Addr>,
    pub dlm_name: String,
    pub link_number: u32,
}

impl CommAnswerParams {
    fn to_avp(&self) -> Avp {
        let mut children = vec![
            Avp::utf8(avps::PROFILE_NAME, &self.profile_name),
            Avp::float32(avps::GRANTED_BANDWIDTH, self.granted_bw_kbps),
            Avp::float32(avps::GRANTED_RETURN_BANDWIDTH, self.granted_return_bw_kbps),
            Avp::unsigned32(avps::PRIORITY_TYPE, self.priority_type),
            Avp::unsigned32(avps::PRIORITY_CLASS, self.priority_class),
            Avp::unsigned32(avps::QOS_LEVEL, self.qos_level),
            Avp::unsigned32(avps::ACCOUNTING_ENABLED, self.accounting_enabled as u32),
            Avp::unsigned32(avps::KEEP_REQUEST, self.keep_request as u32),
            Avp::unsigned32(avps::AUTO_DETECT, self.auto_detect),
            Avp::unsigned32(avps::SESSION_TIMEOUT, self.session_timeout_sec),
            Avp::utf8(avps::DLM_NAME, &self.dlm_name),
            Avp::unsigned32(avps::LINK_NUMBER, self.link_number),
        ];
        if let Some(ref phase) = self.flight_phase {
            children.push(Avp::utf8(avps::FLIGHT_PHASE, phase));
        }
        if let Some(ref range) = self.altitude_range {
            children.push(Avp::utf8(avps::ALTITUDE_RANGE, range));
        }
        if let Some(ref airport) = self.airport {
            children.push(Avp::utf8(avps::AIRPORT, airport));
        }
        if let Some(gw) = self.gateway_ip {
            children.push(Avp::address(avps::GATEWAY_IP_ADDRESS, gw));
        }
        Avp::grouped(avps::COMM_ANSWER_PARAMETERS, children)
    }

    fn from_group(group: &[Avp]) -> Result<Self, ProtoError> {
        let g = Group(group);
        let missing = |code| ProtoError::MissingAvp(dictionary().name_of(code));
        Ok(CommAnswerParams {
            profile_name: g.require_utf8(avps::PROFILE_NAME)?.to_owned(),
            granted_bw_kbps: g
                .find_f32(avps::GRANTED_BANDWIDTH)
                .ok_or_else(|| missing(avps::GRANTED_BANDWIDTH))?,
            granted_return_bw_kbps: g
                .find_f32(avps::GRANTED_RETURN_BANDWIDTH)
                .ok_or_else(|| missing(avps::GRANTED_RETURN_BANDWIDTH))?,
            priority_type: g.find_u32(avps::PRIORITY_TYPE).unwrap_or(1),
            priority_class: g.find_u32(avps::PRIORITY_CLASS).unwrap_or(0),
            qos_level: g.find_u32(avps::QOS_LEVEL).unwrap_or(0),
            accounting_enabled: g.find_u32(avps::ACCOUNTING_ENABLED).unwrap_or(0) != 0,
            keep_request: g.find_u32(avps::KEEP_REQUEST).unwrap_or(0) != 0,
            auto_detect: g.find_u32(avps::AUTO_DETECT).unwrap_or(0),
            session_timeout_sec: g.find_u32(avps::SESSION_TIMEOUT).unwrap_or(0),
            flight_phase: g.find_utf8(avps::FLIGHT_PHASE).map(str::to_owned),
            altitude_range: g.find_utf8(avps::ALTITUDE_RANGE).map(str::to_owned),
            airport: g.find_utf8(avps::AIRPORT).map(str::to_owned),
            gateway_ip: g.find_address(avps::GATEWAY_IP_ADDRESS),
            dlm_name: g.require_utf8(avps::DLM_NAME)?.to_owned(),
            link_number: g
                .find_u32(avps::LINK_NUMBER)
                .ok_or_else(|| missing(avps::LINK_NUMBER))?,
        })
    }
}

/// Communication-Report-Parameters group — only changed fields present.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommReportParams {
    pub profile_name: String,
    pub granted_bw_kbps: Option<f32>,
    pub granted_return_bw_kbps: Option<f32>,
    pub priority_type: Option<u32>,
    pub priority_class: Option<u32>,
    pub qos_level: Option<u32>,
    pub gateway_ip: Option<Ipv4Addr>,
    /// New link identifiers on reroute.
    pub dlm_name: Option<String>,
}

impl CommReportParams {
    fn to_avp(&self) -> Avp {
        let mut children = vec![Avp::utf8(avps::PROFILE_NAME, &self.profile_name)];
        if let Some(bw) = self.granted_bw_kbps {
            children.push(Avp::float32(avps::GRANTED_BANDWIDTH, bw));
        }
        if let Some(bw) = self.granted_return_bw_kbps {
            children.push(Avp::float32(avps::GRANTED_RETURN_BANDWIDTH, bw));
        }
        if let Some(pt) = self.priority_type {
            children.push(Avp::unsigned32(avps::PRIORITY_TYPE, pt));
        }
        if let Some(pc) = self.priority_class {
            children.push(Avp::unsigned32(avps::PRIORITY_CLASS, pc));
        }
        if let Some(q) = self.qos_level {
            children.push(Avp::unsigned32(avps::QOS_LEVEL, q));
        }
        if let Some(gw) = self.gateway_ip {
            children.push(Avp::address(avps::GATEWAY_IP_ADDRESS, gw));
        }
        if let Some(ref name) = self.dlm_name {
            children.push(Avp::utf8(avps::DLM_NAME, name));
        }
        Avp::grouped(avps::COMM_REPORT_PARAMETERS, children)
    }

    fn from_group(group: &[Avp]) -> Result<Self, ProtoError> {
        let g = Group(group);
        Ok(CommReportParams {
            profile_name: g.require_utf8(avps::PROFILE_NAME)?.to_owned(),
            granted_bw_kbps: g.find_f32(avps::GRANTED_BANDWIDTH),
            granted_return_bw_kbps: g.find_f32(avps::GRANTED_RETURN_BANDWIDTH),
            priority_type: g.find_u32(avps::PRIORITY_TYPE),
            priority_class: g.find_u32(avps::PRIORITY_CLASS),
            qos_level: g.find_u32(avps::QOS_LEVEL),
            gateway_ip: g.find_address(avps::GATEWAY_IP_ADDRESS),
            dlm_name: g.find_utf8(avps::DLM_NAME).map(str::to_owned),
        })
    }
}

/// DLM availability in DLM-Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DlmAvailability {
    Yes = 1,
    No = 2,
    Unknown = 3,
}

impl DlmAvailability {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(DlmAvailability::Yes),
            2 => Some(DlmAvailability::No),
            3 => Some(DlmAvailability::Unknown),
            _ => None,
        }
    }
}

/// One DLM-Info entry in the MSCR DLM-List.
#[derive(Debug, Clone, PartialEq)]
pub struct DlmInfo {
    pub dlm_name: String,
    pub available: DlmAvailability,
    pub max_links: u32,
    pub max_bandwidth_kbps: f32,
    pub max_return_bandwidth_kbps: Option<f32>,
    pub allocated_links: u32,
    pub allocated_bandwidth_kbps: f32,
    pub allocated_return_bandwidth_kbps: Option<f32>,
    pub qos_levels: Vec<u32>,
}

impl DlmInfo {
    fn to_avp(&self) -> Avp {
        let mut children = vec![
            Avp::utf8(avps::DLM_NAME, &self.dlm_name),
            Avp::unsigned32(avps::DLM_AVAILABLE, self.available as u32),
            Avp::unsigned32(avps::DLM_MAX_LINKS, self.max_links),
            Avp::float32(avps::DLM_MAX_BANDWIDTH, self.max_bandwidth_kbps),
            Avp::unsigned32(avps::DLM_ALLOCATED_LINKS, self.allocated_links),
            Avp::float32(avps::DLM_ALLOCATED_BANDWIDTH, self.allocated_bandwidth_kbps),
        ];
        if let Some(bw) = self.max_return_bandwidth_kbps {
            children.push(Avp::float32(avps::DLM_MAX_RETURN_BANDWIDTH, bw));
        }
        if let Some(bw) = self.allocated_return_bandwidth_kbps {
            children.push(Avp::float32(avps::DLM_ALLOCATED_RETURN_BANDWIDTH, bw));
        }
        children.push(Avp::grouped(
            avps::DLM_QOS_LEVEL_LIST,
            self.qos_levels
                .iter()
                .map(|&q| Avp::unsigned32(avps::QOS_LEVEL, q))
                .collect(),
        ));
        Avp::grouped(avps::DLM_INFO, children)
    }

    fn from_group(group: &[Avp]) -> Result<Self, ProtoError> {
        let g = Group(group);
        let missing = |code| ProtoError::MissingAvp(dictionary().name_of(code));
        let qos_levels = group
            .iter()
            .find(|a| a.code == avps::DLM_QOS_LEVEL_LIST)
            .and_then(|a| match a.value {
                AvpValue::Grouped(ref children) => Some(
                    children
                        .iter()
                        .filter_map(|c| match c.value {
                            AvpValue::Unsigned32(v) if c.code == avps::QOS_LEVEL => Some(v),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default();
        Ok(DlmInfo {
            dlm_name: g.require_utf8(avps::DLM_NAME)?.to_owned(),
            available: g
                .find_u32(avps::DLM_AVAILABLE)
                .and_then(DlmAvailability::from_u32)
                .ok_or_else(|| missing(avps::DLM_AVAILABLE))?,
            max_links: g.find_u32(avps::DLM_MAX_LINKS).unwrap_or(0),
            max_bandwidth_kbps: g.find_f32(avps::DLM_MAX_BANDWIDTH).unwrap_or(0.0),
            max_return_bandwidth_kbps: g.find_f32(avps::DLM_MAX_RETURN_BANDWIDTH),
            allocated_links: g.find_u32(avps::DLM_ALLOCATED_LINKS).unwrap_or(0),
            allocated_bandwidth_kbps: g.find_f32(avps::DLM_ALLOCATED_BANDWIDTH).unwrap_or(0.0),
            allocated_return_bandwidth_kbps: g.find_f32(avps::DLM_ALLOCATED_RETURN_BANDWIDTH),
            qos_levels,
        })
    }
}

/// Network-Configuration block returned in MCAA.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkConfiguration {
    pub assigned_ip: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    pub bandwidth_cap_kbps: u32,
    pub session_timeout_sec: u32,
}

impl NetworkConfiguration {
    fn to_avp(&self) -> Avp {
        let mut children = Vec::new();
        if let Some(ip) = self.assigned_ip {
            children.push(Avp::address(avps::ASSIGNED_IP_ADDRESS, ip));
        }
        if let Some(gw) = self.gateway {
            children.push(Avp::address(avps::GATEWAY_IP_ADDRESS, gw));
        }
        if let Some(dns) = self.dns_primary {
            children.push(Avp::address(avps::DNS_PRIMARY, dns));
        }
        if let Some(dns) = self.dns_secondary {
            children.push(Avp::address(avps::DNS_SECONDARY, dns));
        }
        children.push(Avp::unsigned32(avps::BANDWIDTH_CAP, self.bandwidth_cap_kbps));
        children.push(Avp::unsigned32(avps::SESSION_TIMEOUT, self.session_timeout_sec));
        Avp::grouped(avps::NETWORK_CONFIGURATION, children)
    }

    fn from_group(group: &[Avp]) -> Self {
        let g = Group(group);
        NetworkConfiguration {
            assigned_ip: g.find_address(avps::ASSIGNED_IP_ADDRESS),
            gateway: g.find_address(avps::GATEWAY_IP_ADDRESS),
            dns_primary: g.find_address(avps::DNS_PRIMARY),
            dns_secondary: g.find_address(avps::DNS_SECONDARY),
            bandwidth_cap_kbps: g.find_u32(avps::BANDWIDTH_CAP).unwrap_or(0),
            session_timeout_sec: g.find_u32(avps::SESSION_TIMEOUT).unwrap_or(0),
        }
    }
}

// ─── Client → core ──────────────────────────────────────────────────────────

/// MCAR.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub credentials: ClientCredentials,
    /// Realm announced by the client, stored on the session at auth time.
    pub origin_realm: Option<String>,
}

/// MCCR.
#[derive(Debug, Clone, PartialEq)]
pub struct CommRequest {
    pub session_id: String,
    pub credentials: ClientCredentials,
    pub params: CommRequestParams,
}

/// Client-side MSCR: subscribe to status broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSubscribe {
    pub session_id: String,
    /// 3-bit mask: bit 0 = magic-level, bit 1 = dlm-level.
    pub level: u32,
}

/// MNTA.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyAnswer {
    pub session_id: String,
    pub result_code: ResultCode,
}

/// MSCA.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusAnswer {
    pub session_id: String,
    pub result_code: ResultCode,
}

/// STR.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationRequest {
    pub session_id: String,
}

/// Everything the core can receive from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Auth(AuthRequest),
    Communication(CommRequest),
    StatusSubscribe(StatusSubscribe),
    Termination(TerminationRequest),
    NotifyAck(NotifyAnswer),
    StatusAck(StatusAnswer),
}

impl ClientCommand {
    /// Parse a decoded message into the typed vocabulary. Validates the
    /// message against the dictionary first.
    pub fn from_message(msg: &Message) -> Result<Self, ProtoError> {
        dictionary().validate_request(msg)?;
        match (msg.code, msg.request) {
            (commands::CLIENT_AUTHENTICATION, true) => {
                let creds =
                    ClientCredentials::from_group(msg.require_grouped(avps::CLIENT_CREDENTIALS)?)?;
                Ok(ClientCommand::Auth(AuthRequest {
                    credentials: creds,
                    origin_realm: msg.find_utf8(avps::ORIGIN_REALM).map(str::to_owned),
                }))
            }
            (commands::COMMUNICATION, true) => Ok(ClientCommand::Communication(CommRequest {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                credentials: ClientCredentials::from_group(
                    msg.require_grouped(avps::CLIENT_CREDENTIALS)?,
                )?,
                params: CommRequestParams::from_group(
                    msg.require_grouped(avps::COMM_REQUEST_PARAMETERS)?,
                )?,
            })),
            (commands::STATUS_CHANGE, true) => Ok(ClientCommand::StatusSubscribe(StatusSubscribe {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                level: msg.require_u32(avps::STATUS_SUBSCRIPTION_LEVEL)?,
            })),
            (commands::SESSION_TERMINATION, true) => {
                Ok(ClientCommand::Termination(TerminationRequest {
                    session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                }))
            }
            (commands::MODIFY_NOTIFICATION, false) => Ok(ClientCommand::NotifyAck(NotifyAnswer {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                    .ok_or(ProtoError::InvalidValue("Result-Code"))?,
            })),
            (commands::STATUS_CHANGE, false) => Ok(ClientCommand::StatusAck(StatusAnswer {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                    .ok_or(ProtoError::InvalidValue("Result-Code"))?,
            })),
            (code, _) => Err(ProtoError::UnknownCommand(code)),
        }
    }

    /// Encode the client-side form, used by test tooling and the session
    /// state tests.
    pub fn into_message(self) -> Message {
        match self {
            ClientCommand::Auth(req) => {
                let mut m_avps = vec![req.credentials.to_avp()];
                if let Some(realm) = req.origin_realm {
                    m_avps.push(Avp::utf8(avps::ORIGIN_REALM, realm));
                }
                Message::request(commands::CLIENT_AUTHENTICATION, m_avps)
            }
            ClientCommand::Communication(req) => Message::request(
                commands::COMMUNICATION,
                vec![
                    Avp::utf8(avps::SESSION_ID, req.session_id),
                    req.credentials.to_avp(),
                    req.params.to_avp(),
                ],
            ),
            ClientCommand::StatusSubscribe(req) => Message::request(
                commands::STATUS_CHANGE,
                vec![
                    Avp::utf8(avps::SESSION_ID, req.session_id),
                    Avp::unsigned32(avps::STATUS_SUBSCRIPTION_LEVEL, req.level),
                ],
            ),
            ClientCommand::Termination(req) => Message::request(
                commands::SESSION_TERMINATION,
                vec![Avp::utf8(avps::SESSION_ID, req.session_id)],
            ),
            ClientCommand::NotifyAck(ans) => Message::answer(
                commands::MODIFY_NOTIFICATION,
                vec![
                    Avp::utf8(avps::SESSION_ID, ans.session_id),
                    Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32),
                ],
            ),
            ClientCommand::StatusAck(ans) => Message::answer(
                commands::STATUS_CHANGE,
                vec![
                    Avp::utf8(avps::SESSION_ID, ans.session_id),
                    Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32),
                ],
            ),
        }
    }
}

// ─── Core → client ──────────────────────────────────────────────────────────

/// MCAA.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthAnswer {
    pub session_id: Option<String>,
    pub result_code: ResultCode,
    pub magic_status: MagicStatus,
    pub error_message: Option<String>,
    pub network: Option<NetworkConfiguration>,
}

/// MCCA.
#[derive(Debug, Clone, PartialEq)]
pub struct CommAnswer {
    pub session_id: String,
    pub result_code: ResultCode,
    pub magic_status: MagicStatus,
    pub error_message: Option<String>,
    pub params: Option<CommAnswerParams>,
}

/// MNTR — server-initiated session parameter change.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyRequest {
    pub session_id: String,
    pub destination_realm: Option<String>,
    pub report: CommReportParams,
    pub magic_status: MagicStatus,
    pub error_message: Option<String>,
}

/// Server-side MSCR: status snapshot broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBroadcast {
    pub session_id: String,
    pub destination_realm: Option<String>,
    /// Present when the target subscribed to magic-level status.
    pub registered_clients: Option<u32>,
    /// Present when the target subscribed to dlm-level status.
    pub dlm_list: Option<Vec<DlmInfo>>,
}

/// STA.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationAnswer {
    pub session_id: String,
    pub result_code: ResultCode,
}

/// Everything the core can send to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthAnswer(AuthAnswer),
    CommAnswer(CommAnswer),
    Notify(NotifyRequest),
    StatusBroadcast(StatusBroadcast),
    SubscribeAnswer(StatusAnswer),
    TerminationAnswer(TerminationAnswer),
}

impl ServerMessage {
    /// Lower into the generic message form.
    pub fn into_message(self) -> Message {
        match self {
            ServerMessage::AuthAnswer(ans) => {
                let mut m_avps = Vec::new();
                if let Some(sid) = ans.session_id {
                    m_avps.push(Avp::utf8(avps::SESSION_ID, sid));
                }
                m_avps.push(Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32));
                m_avps.push(Avp::unsigned32(
                    avps::MAGIC_STATUS_CODE,
                    ans.magic_status as u32,
                ));
                if let Some(err) = ans.error_message {
                    m_avps.push(Avp::utf8(avps::ERROR_MESSAGE, err));
                }
                if let Some(net) = ans.network {
                    m_avps.push(net.to_avp());
                }
                Message::answer(commands::CLIENT_AUTHENTICATION, m_avps)
            }
            ServerMessage::CommAnswer(ans) => {
                let mut m_avps = vec![
                    Avp::utf8(avps::SESSION_ID, ans.session_id),
                    Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32),
                    Avp::unsigned32(avps::MAGIC_STATUS_CODE, ans.magic_status as u32),
                ];
                if let Some(err) = ans.error_message {
                    m_avps.push(Avp::utf8(avps::ERROR_MESSAGE, err));
                }
                if let Some(params) = ans.params {
                    m_avps.push(params.to_avp());
                }
                Message::answer(commands::COMMUNICATION, m_avps)
            }
            ServerMessage::Notify(req) => {
                let mut m_avps = vec![Avp::utf8(avps::SESSION_ID, req.session_id)];
                if let Some(realm) = req.destination_realm {
                    m_avps.push(Avp::utf8(avps::DESTINATION_REALM, realm));
                }
                m_avps.push(req.report.to_avp());
                m_avps.push(Avp::unsigned32(
                    avps::MAGIC_STATUS_CODE,
                    req.magic_status as u32,
                ));
                if let Some(err) = req.error_message {
                    m_avps.push(Avp::utf8(avps::ERROR_MESSAGE, err));
                }
                Message::request(commands::MODIFY_NOTIFICATION, m_avps)
            }
            ServerMessage::StatusBroadcast(bcast) => {
                let mut m_avps = vec![Avp::utf8(avps::SESSION_ID, bcast.session_id)];
                if let Some(realm) = bcast.destination_realm {
                    m_avps.push(Avp::utf8(avps::DESTINATION_REALM, realm));
                }
                if let Some(count) = bcast.registered_clients {
                    m_avps.push(Avp::unsigned32(avps::REGISTERED_CLIENTS, count));
                }
                if let Some(dlms) = bcast.dlm_list {
                    m_avps.push(Avp::grouped(
                        avps::DLM_LIST,
                        dlms.iter().map(DlmInfo::to_avp).collect(),
                    ));
                }
                Message::request(commands::STATUS_CHANGE, m_avps)
            }
            ServerMessage::SubscribeAnswer(ans) => Message::answer(
                commands::STATUS_CHANGE,
                vec![
                    Avp::utf8(avps::SESSION_ID, ans.session_id),
                    Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32),
                ],
            ),
            ServerMessage::TerminationAnswer(ans) => Message::answer(
                commands::SESSION_TERMINATION,
                vec![
                    Avp::utf8(avps::SESSION_ID, ans.session_id),
                    Avp::unsigned32(avps::RESULT_CODE, ans.result_code as u32),
                ],
            ),
        }
    }

    /// Parse a server message on the client side. Used by client tooling
    /// and round-trip tests.
    pub fn from_message(msg: &Message) -> Result<Self, ProtoError> {
        match (msg.code, msg.request) {
            (commands::CLIENT_AUTHENTICATION, false) => {
                Ok(ServerMessage::AuthAnswer(AuthAnswer {
                    session_id: msg.find_utf8(avps::SESSION_ID).map(str::to_owned),
                    result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                        .ok_or(ProtoError::InvalidValue("Result-Code"))?,
                    magic_status: MagicStatus::from_u32(msg.require_u32(avps::MAGIC_STATUS_CODE)?)
                        .ok_or(ProtoError::InvalidValue("MAGIC-Status-Code"))?,
                    error_message: msg.find_utf8(avps::ERROR_MESSAGE).map(str::to_owned),
                    network: msg
                        .find_grouped(avps::NETWORK_CONFIGURATION)
                        .map(NetworkConfiguration::from_group),
                }))
            }
            (commands::COMMUNICATION, false) => Ok(ServerMessage::CommAnswer(CommAnswer {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                    .ok_or(ProtoError::InvalidValue("Result-Code"))?,
                magic_status: MagicStatus::from_u32(msg.require_u32(avps::MAGIC_STATUS_CODE)?)
                    .ok_or(ProtoError::InvalidValue("MAGIC-Status-Code"))?,
                error_message: msg.find_utf8(avps::ERROR_MESSAGE).map(str::to_owned),
                params: msg
                    .find_grouped(avps::COMM_ANSWER_PARAMETERS)
                    .map(CommAnswerParams::from_group)
                    .transpose()?,
            })),
            (commands::MODIFY_NOTIFICATION, true) => Ok(ServerMessage::Notify(NotifyRequest {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                destination_realm: msg.find_utf8(avps::DESTINATION_REALM).map(str::to_owned),
                report: CommReportParams::from_group(
                    msg.require_grouped(avps::COMM_REPORT_PARAMETERS)?,
                )?,
                magic_status: MagicStatus::from_u32(msg.require_u32(avps::MAGIC_STATUS_CODE)?)
                    .ok_or(ProtoError::InvalidValue("MAGIC-Status-Code"))?,
                error_message: msg.find_utf8(avps::ERROR_MESSAGE).map(str::to_owned),
            })),
            (commands::STATUS_CHANGE, true) => {
                let dlm_list = msg
                    .find_grouped(avps::DLM_LIST)
                    .map(|children| {
                        children
                            .iter()
                            .filter_map(|a| match a.value {
                                AvpValue::Grouped(ref g) if a.code == avps::DLM_INFO => {
                                    Some(DlmInfo::from_group(g))
                                }
                                _ => None,
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;
                Ok(ServerMessage::StatusBroadcast(StatusBroadcast {
                    session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                    destination_realm: msg.find_utf8(avps::DESTINATION_REALM).map(str::to_owned),
                    registered_clients: msg.find_u32(avps::REGISTERED_CLIENTS),
                    dlm_list,
                }))
            }
            (commands::STATUS_CHANGE, false) => Ok(ServerMessage::SubscribeAnswer(StatusAnswer {
                session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                    .ok_or(ProtoError::InvalidValue("Result-Code"))?,
            })),
            (commands::SESSION_TERMINATION, false) => {
                Ok(ServerMessage::TerminationAnswer(TerminationAnswer {
                    session_id: msg.require_utf8(avps::SESSION_ID)?.to_owned(),
                    result_code: ResultCode::from_u32(msg.require_u32(avps::RESULT_CODE)?)
                        .ok_or(ProtoError::InvalidValue("Result-Code"))?,
                }))
            }
            (code, _) => Err(ProtoError::UnknownCommand(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ClientCredentials {
        ClientCredentials {
            user_name: "AC1".into(),
            client_password: "hunter2".into(),
            server_password: None,
        }
    }

    #[test]
    fn mcar_roundtrip() {
        let cmd = ClientCommand::Auth(AuthRequest {
            credentials: creds(),
            origin_realm: Some("cabin.example".into()),
        });
        let msg = cmd.clone().into_message();
        let decoded = Message::decode(msg.encode().freeze()).unwrap();
        assert_eq!(ClientCommand::from_message(&decoded).unwrap(), cmd);
    }

    #[test]
    fn mccr_roundtrip() {
        let cmd = ClientCommand::Communication(CommRequest {
            session_id: "ses_01".into(),
            credentials: creds(),
            params: CommRequestParams {
                profile_name: "IP_DATA".into(),
                requested_bw_kbps: Some(1000),
                requested_return_bw_kbps: Some(200),
                priority_class: Some(4),
                qos_level: Some(1),
                dlm_name: None,
                flight_phase: Some("CRUISE".into()),
                altitude_m: Some(10_668),
            },
        });
        let msg = cmd.clone().into_message();
        let decoded = Message::decode(msg.encode().freeze()).unwrap();
        assert_eq!(ClientCommand::from_message(&decoded).unwrap(), cmd);
    }

    #[test]
    fn mccr_without_session_id_is_protocol_error() {
        let msg = Message::request(
            commands::COMMUNICATION,
            vec![
                creds().to_avp(),
                CommRequestParams {
                    profile_name: "VOICE".into(),
                    ..CommRequestParams::default()
                }
                .to_avp(),
            ],
        );
        let decoded = Message::decode(msg.encode().freeze()).unwrap();
        assert_eq!(
            ClientCommand::from_message(&decoded),
            Err(ProtoError::MissingAvp("Session-Id"))
        );
    }

    #[test]
    fn mcaa_roundtrip() {
        let ans = ServerMessage::AuthAnswer(AuthAnswer {
            session_id: Some("ses_02".into()),
            result_code: ResultCode::Success,
            magic_status: MagicStatus::Success,
            error_message: None,
            network: Some(NetworkConfiguration {
                assigned_ip: Some(Ipv4Addr::new(10, 44, 7, 12)),
                gateway: Some(Ipv4Addr::new(10, 44, 7, 1)),
                dns_primary: Some(Ipv4Addr::new(10, 44, 0, 53)),
                dns_secondary: None,
                bandwidth_cap_kbps: 10_000,
                session_timeout_sec: 3600,
            }),
        });
        let decoded = Message::decode(ans.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ServerMessage::from_message(&decoded).unwrap(), ans);
    }

    #[test]
    fn mcca_roundtrip() {
        let ans = ServerMessage::CommAnswer(CommAnswer {
            session_id: "ses_03".into(),
            result_code: ResultCode::Success,
            magic_status: MagicStatus::Success,
            error_message: None,
            params: Some(CommAnswerParams {
                profile_name: "IP_DATA".into(),
                granted_bw_kbps: 1000.0,
                granted_return_bw_kbps: 200.0,
                priority_type: 1,
                priority_class: 4,
                qos_level: 1,
                accounting_enabled: false,
                keep_request: true,
                auto_detect: 0,
                session_timeout_sec: 3600,
                flight_phase: None,
                altitude_range: None,
                airport: None,
                gateway_ip: Some(Ipv4Addr::new(10, 44, 0, 1)),
                dlm_name: "CELLULAR".into(),
                link_number: 1,
            }),
        });
        let decoded = Message::decode(ans.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ServerMessage::from_message(&decoded).unwrap(), ans);
    }

    #[test]
    fn mntr_roundtrip_with_only_changed_fields() {
        let notify = ServerMessage::Notify(NotifyRequest {
            session_id: "ses_04".into(),
            destination_realm: Some("cabin.example".into()),
            report: CommReportParams {
                profile_name: "VOICE".into(),
                granted_bw_kbps: Some(0.0),
                ..CommReportParams::default()
            },
            magic_status: MagicStatus::LinkError,
            error_message: Some("link CELLULAR lost".into()),
        });
        let decoded = Message::decode(notify.clone().into_message().encode().freeze()).unwrap();
        let parsed = ServerMessage::from_message(&decoded).unwrap();
        assert_eq!(parsed, notify);
        match parsed {
            ServerMessage::Notify(n) => {
                assert_eq!(n.report.granted_bw_kbps, Some(0.0));
                assert_eq!(n.report.granted_return_bw_kbps, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mscr_broadcast_roundtrip() {
        let bcast = ServerMessage::StatusBroadcast(StatusBroadcast {
            session_id: "ses_05".into(),
            destination_realm: None,
            registered_clients: Some(3),
            dlm_list: Some(vec![DlmInfo {
                dlm_name: "SATCOM".into(),
                available: DlmAvailability::Yes,
                max_links: 8,
                max_bandwidth_kbps: 30_000.0,
                max_return_bandwidth_kbps: Some(2_000.0),
                allocated_links: 2,
                allocated_bandwidth_kbps: 1_500.0,
                allocated_return_bandwidth_kbps: None,
                qos_levels: vec![0, 1, 2],
            }]),
        });
        let decoded = Message::decode(bcast.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ServerMessage::from_message(&decoded).unwrap(), bcast);
    }

    #[test]
    fn mscr_subscribe_and_ack_roundtrip() {
        let sub = ClientCommand::StatusSubscribe(StatusSubscribe {
            session_id: "ses_06".into(),
            level: 0b011,
        });
        let decoded = Message::decode(sub.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ClientCommand::from_message(&decoded).unwrap(), sub);

        let ack = ClientCommand::StatusAck(StatusAnswer {
            session_id: "ses_06".into(),
            result_code: ResultCode::Success,
        });
        let decoded = Message::decode(ack.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ClientCommand::from_message(&decoded).unwrap(), ack);
    }

    #[test]
    fn termination_roundtrip() {
        let term = ClientCommand::Termination(TerminationRequest {
            session_id: "ses_07".into(),
        });
        let decoded = Message::decode(term.clone().into_message().encode().freeze()).unwrap();
        assert_eq!(ClientCommand::from_message(&decoded).unwrap(), term);
    }
}
