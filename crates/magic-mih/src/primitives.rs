//! MIH primitives honoured on the south-bound interface.
//!
//! Code ranges:
//! - `0x01xx` request/confirm
//! - `0x02xx` indications
//! - `0x03xx` ARINC 839 Link_Resource
//! - `0x8xxx` MAGIC vendor extensions (register, heartbeat, extended report)
//!
//! Each payload defines its wire layout through an `encode`/`decode` pair;
//! [`Primitive::decode`] discriminates strictly on the primitive code. An
//! unknown code or a short payload is a protocol error, never a guess.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::types::{
    BearerId, HealthStatus, LinkCapabilities, LinkDownReason, LinkParameters, LinkTupleId,
    QosParam, ResourceAction, Status,
};
use crate::{get_fixed_str, put_fixed_str};

/// Stable primitive codes.
pub mod codes {
    pub const LINK_DETECTED_IND: u16 = 0x0201;
    pub const LINK_UP_IND: u16 = 0x0202;
    pub const LINK_DOWN_IND: u16 = 0x0203;
    pub const LINK_GOING_DOWN_IND: u16 = 0x0204;
    pub const LINK_PARAMETERS_REPORT_IND: u16 = 0x0205;

    pub const LINK_RESOURCE_REQ: u16 = 0x0301;
    pub const LINK_RESOURCE_CNF: u16 = 0x0302;

    pub const EXT_LINK_REGISTER_REQ: u16 = 0x8101;
    pub const EXT_LINK_REGISTER_CNF: u16 = 0x8102;
    pub const EXT_LINK_PARAMETERS_REPORT: u16 = 0x8204;
    pub const EXT_HEARTBEAT: u16 = 0x8F01;
    pub const EXT_HEARTBEAT_ACK: u16 = 0x8F02;
}

/// Wire-level decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown primitive code {0:#06x}")]
    UnknownPrimitive(u16),
    #[error("truncated or malformed payload for primitive {0:#06x}")]
    Malformed(u16),
}

// ─── Registration (vendor extension) ────────────────────────────────────────

/// Ext_Link_Register.Request — dynamic DLM discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtLinkRegisterRequest {
    pub link: LinkTupleId,
    pub capabilities: LinkCapabilities,
    pub dlm_pid: u32,
}

impl ExtLinkRegisterRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        self.capabilities.encode(buf);
        buf.put_u32_le(self.dlm_pid);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        let capabilities = LinkCapabilities::decode(buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        Some(ExtLinkRegisterRequest {
            link,
            capabilities,
            dlm_pid: buf.get_u32_le(),
        })
    }
}

/// Ext_Link_Register.Confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtLinkRegisterConfirm {
    pub status: Status,
    /// Numeric id assigned by the core, valid when status is SUCCESS.
    pub assigned_id: u32,
    pub message: String,
}

impl ExtLinkRegisterConfirm {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_u32_le(self.assigned_id);
        put_fixed_str(buf, &self.message, 128);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 + 4 + 128 {
            return None;
        }
        let status = Status::from_u8(buf.get_u8())?;
        let assigned_id = buf.get_u32_le();
        let message = get_fixed_str(buf, 128)?;
        Some(ExtLinkRegisterConfirm {
            status,
            assigned_id,
            message,
        })
    }
}

// ─── Link state indications ─────────────────────────────────────────────────

/// Link_Up.Indication with the link's initial parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkUpIndication {
    pub link: LinkTupleId,
    pub params: LinkParameters,
    /// Unix timestamp, seconds.
    pub up_timestamp: u32,
}

impl LinkUpIndication {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        self.params.encode(buf);
        buf.put_u32_le(self.up_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        let params = LinkParameters::decode(buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        Some(LinkUpIndication {
            link,
            params,
            up_timestamp: buf.get_u32_le(),
        })
    }
}

/// Link_Down.Indication.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDownIndication {
    pub link: LinkTupleId,
    pub reason: LinkDownReason,
    pub reason_text: String,
    pub down_timestamp: u32,
}

impl LinkDownIndication {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u8(self.reason as u8);
        put_fixed_str(buf, &self.reason_text, 64);
        buf.put_u32_le(self.down_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 1 + 64 + 4 {
            return None;
        }
        let reason = LinkDownReason::from_u8(buf.get_u8());
        let reason_text = get_fixed_str(buf, 64)?;
        let down_timestamp = buf.get_u32_le();
        Some(LinkDownIndication {
            link,
            reason,
            reason_text,
            down_timestamp,
        })
    }
}

/// Link_Going_Down.Indication — early warning before a loss.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkGoingDownIndication {
    pub link: LinkTupleId,
    pub time_to_down_ms: u32,
    pub reason: LinkDownReason,
    /// Prediction confidence, 0..=100.
    pub confidence: u8,
    pub reason_text: String,
}

impl LinkGoingDownIndication {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u32_le(self.time_to_down_ms);
        buf.put_u8(self.reason as u8);
        buf.put_u8(self.confidence);
        put_fixed_str(buf, &self.reason_text, 64);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 4 + 1 + 1 + 64 {
            return None;
        }
        let time_to_down_ms = buf.get_u32_le();
        let reason = LinkDownReason::from_u8(buf.get_u8());
        let confidence = buf.get_u8();
        let reason_text = get_fixed_str(buf, 64)?;
        Some(LinkGoingDownIndication {
            link,
            time_to_down_ms,
            reason,
            confidence,
            reason_text,
        })
    }
}

/// Link_Detected.Indication — a new usable link was found.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDetectedIndication {
    pub link: LinkTupleId,
    pub max_bandwidth_kbps: u32,
    pub signal_dbm: i32,
    pub signal_quality: u8,
    pub security_level: u8,
    pub detected_timestamp: u32,
}

impl LinkDetectedIndication {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u32_le(self.max_bandwidth_kbps);
        buf.put_i32_le(self.signal_dbm);
        buf.put_u8(self.signal_quality);
        buf.put_u8(self.security_level);
        buf.put_u32_le(self.detected_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 4 + 4 + 1 + 1 + 4 {
            return None;
        }
        Some(LinkDetectedIndication {
            link,
            max_bandwidth_kbps: buf.get_u32_le(),
            signal_dbm: buf.get_i32_le(),
            signal_quality: buf.get_u8(),
            security_level: buf.get_u8(),
            detected_timestamp: buf.get_u32_le(),
        })
    }
}

/// Link_Parameters_Report.Indication (standard push report).
#[derive(Debug, Clone, PartialEq)]
pub struct LinkParametersReportIndication {
    pub link: LinkTupleId,
    /// Bitmap of which parameter groups changed.
    pub changed_params: u16,
    pub params: LinkParameters,
    pub report_timestamp: u32,
}

impl LinkParametersReportIndication {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u16_le(self.changed_params);
        self.params.encode(buf);
        buf.put_u32_le(self.report_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 2 {
            return None;
        }
        let changed_params = buf.get_u16_le();
        let params = LinkParameters::decode(buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        Some(LinkParametersReportIndication {
            link,
            changed_params,
            params,
            report_timestamp: buf.get_u32_le(),
        })
    }
}

/// Vendor extended report carrying aviation metrics alongside the standard
/// parameters. Feeds both the link registry and the aircraft position used
/// by policy coverage checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtParametersReport {
    pub link: LinkTupleId,
    pub params: LinkParameters,
    pub altitude_m: u32,
    /// Degrees × 1e6.
    pub latitude_micro: i32,
    /// Degrees × 1e6.
    pub longitude_micro: i32,
    pub ground_speed_kts: u16,
}

impl ExtParametersReport {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        self.params.encode(buf);
        buf.put_u32_le(self.altitude_m);
        buf.put_i32_le(self.latitude_micro);
        buf.put_i32_le(self.longitude_micro);
        buf.put_u16_le(self.ground_speed_kts);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        let params = LinkParameters::decode(buf)?;
        if buf.remaining() < 4 + 4 + 4 + 2 {
            return None;
        }
        Some(ExtParametersReport {
            link,
            params,
            altitude_m: buf.get_u32_le(),
            latitude_micro: buf.get_i32_le(),
            longitude_micro: buf.get_i32_le(),
            ground_speed_kts: buf.get_u16_le(),
        })
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude_micro as f64 / 1e6
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude_micro as f64 / 1e6
    }
}

// ─── Resource management ────────────────────────────────────────────────────

/// Link_Resource.Request — allocate or release a bearer.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkResourceRequest {
    pub link: LinkTupleId,
    pub action: ResourceAction,
    pub bearer_id: Option<BearerId>,
    pub qos: Option<QosParam>,
}

impl LinkResourceRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u8(self.action as u8);
        match self.bearer_id {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u8(id);
            }
            None => buf.put_u8(0),
        }
        match &self.qos {
            Some(qos) => {
                buf.put_u8(1);
                qos.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 2 {
            return None;
        }
        let action = ResourceAction::from_u8(buf.get_u8())?;
        let bearer_id = match buf.get_u8() {
            0 => None,
            1 => {
                if !buf.has_remaining() {
                    return None;
                }
                Some(buf.get_u8())
            }
            _ => return None,
        };
        if !buf.has_remaining() {
            return None;
        }
        let qos = match buf.get_u8() {
            0 => None,
            1 => Some(QosParam::decode(buf)?),
            _ => return None,
        };
        Some(LinkResourceRequest {
            link,
            action,
            bearer_id,
            qos,
        })
    }
}

/// Link_Resource.Confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkResourceConfirm {
    pub link: LinkTupleId,
    pub status: Status,
    pub bearer_id: Option<BearerId>,
}

impl LinkResourceConfirm {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u8(self.status as u8);
        match self.bearer_id {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u8(id);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 2 {
            return None;
        }
        let status = Status::from_u8(buf.get_u8())?;
        let bearer_id = match buf.get_u8() {
            0 => None,
            1 => {
                if !buf.has_remaining() {
                    return None;
                }
                Some(buf.get_u8())
            }
            _ => return None,
        };
        Some(LinkResourceConfirm {
            link,
            status,
            bearer_id,
        })
    }
}

// ─── Liveness (vendor extension) ────────────────────────────────────────────

/// Ext_Heartbeat — periodic health check from a DLM.
///
/// This frame is also accepted bare (no transport header) on the UDP
/// listener used by lightweight DLM prototypes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtHeartbeat {
    pub link: LinkTupleId,
    pub health: HealthStatus,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub active_bearers: u32,
}

impl ExtHeartbeat {
    pub const ENCODED_LEN: usize = LinkTupleId::ENCODED_LEN + 1 + 8 + 8 + 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        self.link.encode(buf);
        buf.put_u8(self.health as u8);
        buf.put_u64_le(self.tx_bytes);
        buf.put_u64_le(self.rx_bytes);
        buf.put_u32_le(self.active_bearers);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let link = LinkTupleId::decode(buf)?;
        if buf.remaining() < 1 + 8 + 8 + 4 {
            return None;
        }
        let health = HealthStatus::from_u8(buf.get_u8())?;
        Some(ExtHeartbeat {
            link,
            health,
            tx_bytes: buf.get_u64_le(),
            rx_bytes: buf.get_u64_le(),
            active_bearers: buf.get_u32_le(),
        })
    }
}

/// Ext_Heartbeat_Ack — echoes a core timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtHeartbeatAck {
    /// 0 = OK, 1 = warning received.
    pub ack_status: u8,
    /// Unix timestamp, seconds.
    pub server_timestamp: u32,
}

impl ExtHeartbeatAck {
    pub const ENCODED_LEN: usize = 5;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ack_status);
        buf.put_u32_le(self.server_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(ExtHeartbeatAck {
            ack_status: buf.get_u8(),
            server_timestamp: buf.get_u32_le(),
        })
    }
}

// ─── Sum type ───────────────────────────────────────────────────────────────

/// A decoded south-bound primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    LinkDetected(LinkDetectedIndication),
    LinkUp(LinkUpIndication),
    LinkDown(LinkDownIndication),
    LinkGoingDown(LinkGoingDownIndication),
    LinkParametersReport(LinkParametersReportIndication),
    LinkResourceRequest(LinkResourceRequest),
    LinkResourceConfirm(LinkResourceConfirm),
    ExtLinkRegisterRequest(ExtLinkRegisterRequest),
    ExtLinkRegisterConfirm(ExtLinkRegisterConfirm),
    ExtParametersReport(ExtParametersReport),
    ExtHeartbeat(ExtHeartbeat),
    ExtHeartbeatAck(ExtHeartbeatAck),
}

impl Primitive {
    /// The primitive's wire code.
    pub fn code(&self) -> u16 {
        match self {
            Primitive::LinkDetected(_) => codes::LINK_DETECTED_IND,
            Primitive::LinkUp(_) => codes::LINK_UP_IND,
            Primitive::LinkDown(_) => codes::LINK_DOWN_IND,
            Primitive::LinkGoingDown(_) => codes::LINK_GOING_DOWN_IND,
            Primitive::LinkParametersReport(_) => codes::LINK_PARAMETERS_REPORT_IND,
            Primitive::LinkResourceRequest(_) => codes::LINK_RESOURCE_REQ,
            Primitive::LinkResourceConfirm(_) => codes::LINK_RESOURCE_CNF,
            Primitive::ExtLinkRegisterRequest(_) => codes::EXT_LINK_REGISTER_REQ,
            Primitive::ExtLinkRegisterConfirm(_) => codes::EXT_LINK_REGISTER_CNF,
            Primitive::ExtParametersReport(_) => codes::EXT_LINK_PARAMETERS_REPORT,
            Primitive::ExtHeartbeat(_) => codes::EXT_HEARTBEAT,
            Primitive::ExtHeartbeatAck(_) => codes::EXT_HEARTBEAT_ACK,
        }
    }

    /// Encode the payload (without any transport framing).
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Primitive::LinkDetected(p) => p.encode(buf),
            Primitive::LinkUp(p) => p.encode(buf),
            Primitive::LinkDown(p) => p.encode(buf),
            Primitive::LinkGoingDown(p) => p.encode(buf),
            Primitive::LinkParametersReport(p) => p.encode(buf),
            Primitive::LinkResourceRequest(p) => p.encode(buf),
            Primitive::LinkResourceConfirm(p) => p.encode(buf),
            Primitive::ExtLinkRegisterRequest(p) => p.encode(buf),
            Primitive::ExtLinkRegisterConfirm(p) => p.encode(buf),
            Primitive::ExtParametersReport(p) => p.encode(buf),
            Primitive::ExtHeartbeat(p) => p.encode(buf),
            Primitive::ExtHeartbeatAck(p) => p.encode(buf),
        }
    }

    /// Decode a payload for the given primitive code.
    pub fn decode(code: u16, buf: &mut impl Buf) -> Result<Self, WireError> {
        let malformed = || WireError::Malformed(code);
        match code {
            codes::LINK_DETECTED_IND => LinkDetectedIndication::decode(buf)
                .map(Primitive::LinkDetected)
                .ok_or_else(malformed),
            codes::LINK_UP_IND => LinkUpIndication::decode(buf)
                .map(Primitive::LinkUp)
                .ok_or_else(malformed),
            codes::LINK_DOWN_IND => LinkDownIndication::decode(buf)
                .map(Primitive::LinkDown)
                .ok_or_else(malformed),
            codes::LINK_GOING_DOWN_IND => LinkGoingDownIndication::decode(buf)
                .map(Primitive::LinkGoingDown)
                .ok_or_else(malformed),
            codes::LINK_PARAMETERS_REPORT_IND => LinkParametersReportIndication::decode(buf)
                .map(Primitive::LinkParametersReport)
                .ok_or_else(malformed),
            codes::LINK_RESOURCE_REQ => LinkResourceRequest::decode(buf)
                .map(Primitive::LinkResourceRequest)
                .ok_or_else(malformed),
            codes::LINK_RESOURCE_CNF => LinkResourceConfirm::decode(buf)
                .map(Primitive::LinkResourceConfirm)
                .ok_or_else(malformed),
            codes::EXT_LINK_REGISTER_REQ => ExtLinkRegisterRequest::decode(buf)
                .map(Primitive::ExtLinkRegisterRequest)
                .ok_or_else(malformed),
            codes::EXT_LINK_REGISTER_CNF => ExtLinkRegisterConfirm::decode(buf)
                .map(Primitive::ExtLinkRegisterConfirm)
                .ok_or_else(malformed),
            codes::EXT_LINK_PARAMETERS_REPORT => ExtParametersReport::decode(buf)
                .map(Primitive::ExtParametersReport)
                .ok_or_else(malformed),
            codes::EXT_HEARTBEAT => ExtHeartbeat::decode(buf)
                .map(Primitive::ExtHeartbeat)
                .ok_or_else(malformed),
            codes::EXT_HEARTBEAT_ACK => ExtHeartbeatAck::decode(buf)
                .map(Primitive::ExtHeartbeatAck)
                .ok_or_else(malformed),
            other => Err(WireError::UnknownPrimitive(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CosId, LinkType};
    use proptest::prelude::*;

    fn tuple(name: &str) -> LinkTupleId {
        LinkTupleId::new(LinkType::SatcomKu, name, "sat0")
    }

    fn roundtrip(p: Primitive) -> Primitive {
        let mut buf = BytesMut::new();
        p.encode_payload(&mut buf);
        Primitive::decode(p.code(), &mut buf.freeze()).unwrap()
    }

    #[test]
    fn register_roundtrip() {
        let p = Primitive::ExtLinkRegisterRequest(ExtLinkRegisterRequest {
            link: tuple("LINK_SATCOM"),
            capabilities: LinkCapabilities {
                max_bandwidth_kbps: 30_000,
                typical_latency_ms: 600,
                cost_per_mb: 50,
                coverage: 1,
                security_level: 3,
                mtu: 1500,
                is_asymmetric: true,
            },
            dlm_pid: 4242,
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn register_confirm_roundtrip() {
        let p = Primitive::ExtLinkRegisterConfirm(ExtLinkRegisterConfirm {
            status: Status::Success,
            assigned_id: 7,
            message: "registered".into(),
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn link_up_down_roundtrip() {
        let up = Primitive::LinkUp(LinkUpIndication {
            link: tuple("LINK_CELL"),
            params: LinkParameters::default(),
            up_timestamp: 1_700_000_000,
        });
        assert_eq!(roundtrip(up.clone()), up);

        let down = Primitive::LinkDown(LinkDownIndication {
            link: tuple("LINK_CELL"),
            reason: LinkDownReason::SignalLoss,
            reason_text: "RSSI below threshold".into(),
            down_timestamp: 1_700_000_060,
        });
        assert_eq!(roundtrip(down.clone()), down);
    }

    #[test]
    fn going_down_roundtrip() {
        let p = Primitive::LinkGoingDown(LinkGoingDownIndication {
            link: tuple("LINK_WIFI"),
            time_to_down_ms: 5000,
            reason: LinkDownReason::CoverageLost,
            confidence: 85,
            reason_text: "leaving gate coverage".into(),
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn detected_roundtrip() {
        let p = Primitive::LinkDetected(LinkDetectedIndication {
            link: tuple("LINK_WIFI"),
            max_bandwidth_kbps: 80_000,
            signal_dbm: -52,
            signal_quality: 91,
            security_level: 2,
            detected_timestamp: 1_700_000_123,
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn parameters_report_roundtrip() {
        let p = Primitive::LinkParametersReport(LinkParametersReportIndication {
            link: tuple("LINK_SATCOM"),
            changed_params: 0b1010_0001,
            params: LinkParameters::default(),
            report_timestamp: 1_700_000_200,
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn ext_report_roundtrip() {
        let p = Primitive::ExtParametersReport(ExtParametersReport {
            link: tuple("LINK_SATCOM"),
            params: LinkParameters::default(),
            altitude_m: 10_668,
            latitude_micro: 48_856_600,
            longitude_micro: 2_352_200,
            ground_speed_kts: 480,
        });
        let q = roundtrip(p.clone());
        assert_eq!(q, p);
        if let Primitive::ExtParametersReport(r) = q {
            assert!((r.latitude_deg() - 48.8566).abs() < 1e-6);
            assert!((r.longitude_deg() - 2.3522).abs() < 1e-6);
        }
    }

    #[test]
    fn resource_request_optional_fields() {
        // Allocation: qos present, no bearer id yet.
        let alloc = Primitive::LinkResourceRequest(LinkResourceRequest {
            link: tuple("LINK_SATCOM"),
            action: ResourceAction::Request,
            bearer_id: None,
            qos: Some(QosParam {
                cos: CosId::Video,
                forward_rate_kbps: 4000,
                ..QosParam::default()
            }),
        });
        assert_eq!(roundtrip(alloc.clone()), alloc);

        // Release: bearer id present, no qos.
        let release = Primitive::LinkResourceRequest(LinkResourceRequest {
            link: tuple("LINK_SATCOM"),
            action: ResourceAction::Release,
            bearer_id: Some(2),
            qos: None,
        });
        assert_eq!(roundtrip(release.clone()), release);
    }

    #[test]
    fn resource_confirm_roundtrip() {
        let p = Primitive::LinkResourceConfirm(LinkResourceConfirm {
            link: tuple("LINK_SATCOM"),
            status: Status::InsufficientResources,
            bearer_id: None,
        });
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let hb = Primitive::ExtHeartbeat(ExtHeartbeat {
            link: tuple("LINK_CELL"),
            health: HealthStatus::Warning,
            tx_bytes: 123_456_789,
            rx_bytes: 987_654_321,
            active_bearers: 3,
        });
        assert_eq!(roundtrip(hb.clone()), hb);

        let ack = Primitive::ExtHeartbeatAck(ExtHeartbeatAck {
            ack_status: 1,
            server_timestamp: 1_700_000_300,
        });
        assert_eq!(roundtrip(ack.clone()), ack);
    }

    #[test]
    fn unknown_code_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        assert_eq!(
            Primitive::decode(0x0107, &mut buf.freeze()),
            Err(WireError::UnknownPrimitive(0x0107))
        );
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let hb = ExtHeartbeat {
            link: tuple("LINK_CELL"),
            health: HealthStatus::Ok,
            tx_bytes: 1,
            rx_bytes: 2,
            active_bearers: 0,
        };
        let mut buf = BytesMut::new();
        hb.encode(&mut buf);
        let mut short = buf.freeze().slice(..ExtHeartbeat::ENCODED_LEN - 3);
        assert_eq!(
            Primitive::decode(codes::EXT_HEARTBEAT, &mut short),
            Err(WireError::Malformed(codes::EXT_HEARTBEAT))
        );
    }

    proptest! {
        #[test]
        fn proptest_heartbeat_roundtrip(
            tx in any::<u64>(),
            rx in any::<u64>(),
            bearers in 0u32..=16,
            health in 0u8..=2,
        ) {
            let hb = ExtHeartbeat {
                link: tuple("LINK_PROP"),
                health: HealthStatus::from_u8(health).unwrap(),
                tx_bytes: tx,
                rx_bytes: rx,
                active_bearers: bearers,
            };
            let mut buf = BytesMut::new();
            hb.encode(&mut buf);
            prop_assert_eq!(buf.len(), ExtHeartbeat::ENCODED_LEN);
            let decoded = ExtHeartbeat::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, hb);
        }

        #[test]
        fn proptest_qos_roundtrip(
            fwd in 1u32..=1_000_000,
            ret in 0u32..=1_000_000,
            loss in 0.0f32..=1.0,
            cos in 0u8..=7,
        ) {
            let qos = QosParam {
                cos: CosId::from_u8(cos).unwrap(),
                forward_rate_kbps: fwd,
                return_rate_kbps: ret,
                loss_rate: loss,
                ..QosParam::default()
            };
            prop_assert!(qos.validate().is_ok());
            let mut buf = BytesMut::new();
            qos.encode(&mut buf);
            let decoded = QosParam::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, qos);
        }
    }
}
