//! MIH data types (ARINC 839 sections 2.3 and 2.4).
//!
//! Enumerations carry their stable wire values; composite types define
//! their wire layout through `encode`/`decode` pairs, little-endian.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};

use crate::{get_fixed_str, put_fixed_str};

/// Bearer slots per link.
pub const MAX_BEARERS: usize = 8;

/// Bearer identifier, unique within its owning link (1..=MAX_BEARERS).
pub type BearerId = u8;

// ─── Link type ──────────────────────────────────────────────────────────────

/// Link technology, with the ARINC 839 aviation extensions.
///
/// - `0x00..=0x0F` IEEE 802.x
/// - `0x10..=0x1F` 3GPP cellular
/// - `0x20..=0x2F` satellite
/// - `0x30..=0x3F` aviation-specific
/// - `0x80..=0xFF` vendor extension range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Generic,
    Ethernet,
    Wifi80211,
    Umts,
    LteFdd,
    LteTdd,
    Nr5g,
    Inmarsat,
    SatcomL,
    SatcomKu,
    SatcomKa,
    Iridium,
    Vdl2,
    Hfdl,
    Ldacs,
    AirToGround,
    Vendor(u8),
}

impl LinkType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(LinkType::Generic),
            0x01 => Some(LinkType::Ethernet),
            0x02 => Some(LinkType::Wifi80211),
            0x10 => Some(LinkType::Umts),
            0x12 => Some(LinkType::LteFdd),
            0x13 => Some(LinkType::LteTdd),
            0x15 => Some(LinkType::Nr5g),
            0x20 => Some(LinkType::Inmarsat),
            0x21 => Some(LinkType::SatcomL),
            0x22 => Some(LinkType::SatcomKu),
            0x23 => Some(LinkType::SatcomKa),
            0x24 => Some(LinkType::Iridium),
            0x30 => Some(LinkType::Vdl2),
            0x33 => Some(LinkType::Hfdl),
            0x35 => Some(LinkType::Ldacs),
            0x36 => Some(LinkType::AirToGround),
            0x80..=0xFF => Some(LinkType::Vendor(v)),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            LinkType::Generic => 0x00,
            LinkType::Ethernet => 0x01,
            LinkType::Wifi80211 => 0x02,
            LinkType::Umts => 0x10,
            LinkType::LteFdd => 0x12,
            LinkType::LteTdd => 0x13,
            LinkType::Nr5g => 0x15,
            LinkType::Inmarsat => 0x20,
            LinkType::SatcomL => 0x21,
            LinkType::SatcomKu => 0x22,
            LinkType::SatcomKa => 0x23,
            LinkType::Iridium => 0x24,
            LinkType::Vdl2 => 0x30,
            LinkType::Hfdl => 0x33,
            LinkType::Ldacs => 0x35,
            LinkType::AirToGround => 0x36,
            LinkType::Vendor(v) => v,
        }
    }

    /// Satellite family (stable geostationary or LEO constellations).
    pub fn is_satellite(self) -> bool {
        matches!(
            self,
            LinkType::Inmarsat
                | LinkType::SatcomL
                | LinkType::SatcomKu
                | LinkType::SatcomKa
                | LinkType::Iridium
        )
    }

    /// 3GPP cellular family.
    pub fn is_cellular(self) -> bool {
        matches!(
            self,
            LinkType::Umts | LinkType::LteFdd | LinkType::LteTdd | LinkType::Nr5g
        )
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkType::Generic => "generic",
            LinkType::Ethernet => "ethernet",
            LinkType::Wifi80211 => "802.11",
            LinkType::Umts => "umts",
            LinkType::LteFdd => "lte-fdd",
            LinkType::LteTdd => "lte-tdd",
            LinkType::Nr5g => "5g-nr",
            LinkType::Inmarsat => "inmarsat",
            LinkType::SatcomL => "satcom-l",
            LinkType::SatcomKu => "satcom-ku",
            LinkType::SatcomKa => "satcom-ka",
            LinkType::Iridium => "iridium",
            LinkType::Vdl2 => "vdl2",
            LinkType::Hfdl => "hfdl",
            LinkType::Ldacs => "ldacs",
            LinkType::AirToGround => "atg",
            LinkType::Vendor(v) => return write!(f, "vendor-{v:#04x}"),
        };
        f.write_str(s)
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(LinkType::Generic),
            "ethernet" => Ok(LinkType::Ethernet),
            "802.11" | "wifi" => Ok(LinkType::Wifi80211),
            "umts" => Ok(LinkType::Umts),
            "lte-fdd" | "lte" => Ok(LinkType::LteFdd),
            "lte-tdd" => Ok(LinkType::LteTdd),
            "5g-nr" | "5g" => Ok(LinkType::Nr5g),
            "inmarsat" => Ok(LinkType::Inmarsat),
            "satcom-l" => Ok(LinkType::SatcomL),
            "satcom-ku" => Ok(LinkType::SatcomKu),
            "satcom-ka" => Ok(LinkType::SatcomKa),
            "iridium" => Ok(LinkType::Iridium),
            "vdl2" => Ok(LinkType::Vdl2),
            "hfdl" => Ok(LinkType::Hfdl),
            "ldacs" => Ok(LinkType::Ldacs),
            "atg" => Ok(LinkType::AirToGround),
            other => other
                .strip_prefix("vendor-")
                .and_then(|hex| u8::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
                .filter(|v| *v >= 0x80)
                .map(LinkType::Vendor)
                .ok_or_else(|| format!("unknown link type: {other}")),
        }
    }
}

// ─── Status / state enums ───────────────────────────────────────────────────

/// MIH operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Failure = 1,
    InsufficientResources = 2,
    InvalidBearer = 3,
    LinkNotAvailable = 4,
    QosNotSupported = 5,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Status::Success),
            1 => Some(Status::Failure),
            2 => Some(Status::InsufficientResources),
            3 => Some(Status::InvalidBearer),
            4 => Some(Status::LinkNotAvailable),
            5 => Some(Status::QosNotSupported),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
            Status::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Status::InvalidBearer => "INVALID_BEARER",
            Status::LinkNotAvailable => "LINK_NOT_AVAILABLE",
            Status::QosNotSupported => "QOS_NOT_SUPPORTED",
        };
        f.write_str(s)
    }
}

/// Link operational state carried in parameter reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Down = 0,
    Up = 1,
    GoingDown = 2,
    GoingUp = 3,
}

impl LinkState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LinkState::Down),
            1 => Some(LinkState::Up),
            2 => Some(LinkState::GoingDown),
            3 => Some(LinkState::GoingUp),
            _ => None,
        }
    }
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkDownReason {
    Explicit = 0,
    SignalLoss = 1,
    Handover = 2,
    Failure = 3,
    PowerOff = 4,
    LowBattery = 5,
    Timeout = 6,
    CoverageLost = 7,
    Unknown = 255,
}

impl LinkDownReason {
    /// Total conversion — unrecognized values fold into `Unknown`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LinkDownReason::Explicit,
            1 => LinkDownReason::SignalLoss,
            2 => LinkDownReason::Handover,
            3 => LinkDownReason::Failure,
            4 => LinkDownReason::PowerOff,
            5 => LinkDownReason::LowBattery,
            6 => LinkDownReason::Timeout,
            7 => LinkDownReason::CoverageLost,
            _ => LinkDownReason::Unknown,
        }
    }
}

impl fmt::Display for LinkDownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkDownReason::Explicit => "explicit-disconnect",
            LinkDownReason::SignalLoss => "signal-loss",
            LinkDownReason::Handover => "handover",
            LinkDownReason::Failure => "link-failure",
            LinkDownReason::PowerOff => "power-off",
            LinkDownReason::LowBattery => "low-battery",
            LinkDownReason::Timeout => "timeout",
            LinkDownReason::CoverageLost => "coverage-lost",
            LinkDownReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// DLM health reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Ok = 0,
    Warning = 1,
    Error = 2,
}

impl HealthStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HealthStatus::Ok),
            1 => Some(HealthStatus::Warning),
            2 => Some(HealthStatus::Error),
            _ => None,
        }
    }
}

/// Resource operation in Link_Resource.Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceAction {
    Request = 0,
    Release = 1,
}

impl ResourceAction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ResourceAction::Request),
            1 => Some(ResourceAction::Release),
            _ => None,
        }
    }
}

/// Class-of-service identifier, mirroring the DSCP-aligned QoS levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CosId {
    #[default]
    BestEffort = 0,
    Background = 1,
    Video = 2,
    Voice = 3,
    Interactive = 4,
    Signaling = 5,
    NetworkControl = 6,
    ExpeditedForwarding = 7,
}

impl CosId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CosId::BestEffort),
            1 => Some(CosId::Background),
            2 => Some(CosId::Video),
            3 => Some(CosId::Voice),
            4 => Some(CosId::Interactive),
            5 => Some(CosId::Signaling),
            6 => Some(CosId::NetworkControl),
            7 => Some(CosId::ExpeditedForwarding),
            _ => None,
        }
    }
}

impl fmt::Display for CosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CosId::BestEffort => "BEST_EFFORT",
            CosId::Background => "BACKGROUND",
            CosId::Video => "VIDEO",
            CosId::Voice => "VOICE",
            CosId::Interactive => "INTERACTIVE",
            CosId::Signaling => "SIGNALING",
            CosId::NetworkControl => "NETWORK_CONTROL",
            CosId::ExpeditedForwarding => "EXPEDITED_FORWARDING",
        };
        f.write_str(s)
    }
}

// ─── Link tuple ─────────────────────────────────────────────────────────────

/// Identifies one physical link: technology, symbolic name, attach point.
///
/// Two links are the same link iff their `link_name` matches; the registry
/// keys on the name.
///
/// Wire layout: type (1) + name (32, NUL-padded) + attach point (32) = 65.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTupleId {
    pub link_type: LinkType,
    pub link_name: String,
    pub attach_point: String,
}

impl LinkTupleId {
    pub const ENCODED_LEN: usize = 65;

    pub fn new(link_type: LinkType, name: impl Into<String>, attach: impl Into<String>) -> Self {
        LinkTupleId {
            link_type,
            link_name: name.into(),
            attach_point: attach.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.link_type.as_u8());
        put_fixed_str(buf, &self.link_name, 32);
        put_fixed_str(buf, &self.attach_point, 32);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let link_type = LinkType::from_u8(buf.get_u8())?;
        let link_name = get_fixed_str(buf, 32)?;
        let attach_point = get_fixed_str(buf, 32)?;
        Some(LinkTupleId {
            link_type,
            link_name,
            attach_point,
        })
    }
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Static link capabilities announced at registration.
///
/// Wire layout: max bw (4) + latency (4) + cost (4) + coverage (1) +
/// security (1) + mtu (2) + asymmetric (1) = 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapabilities {
    pub max_bandwidth_kbps: u32,
    pub typical_latency_ms: u32,
    /// Traffic cost in hundredths of a cent per MB.
    pub cost_per_mb: u32,
    /// Coverage class: 0=none, 1=global, 2=terrestrial, 3=gate.
    pub coverage: u8,
    /// 1 (lowest) to 5 (highest).
    pub security_level: u8,
    pub mtu: u16,
    pub is_asymmetric: bool,
}

impl LinkCapabilities {
    pub const ENCODED_LEN: usize = 17;

    /// Registration-time sanity checks.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_bandwidth_kbps == 0 {
            return Err("max bandwidth must be non-zero");
        }
        if self.typical_latency_ms == 0 {
            return Err("typical latency must be non-zero");
        }
        if self.coverage > 3 {
            return Err("coverage class out of range");
        }
        if self.security_level == 0 || self.security_level > 5 {
            return Err("security level must be 1..=5");
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.max_bandwidth_kbps);
        buf.put_u32_le(self.typical_latency_ms);
        buf.put_u32_le(self.cost_per_mb);
        buf.put_u8(self.coverage);
        buf.put_u8(self.security_level);
        buf.put_u16_le(self.mtu);
        buf.put_u8(self.is_asymmetric as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(LinkCapabilities {
            max_bandwidth_kbps: buf.get_u32_le(),
            typical_latency_ms: buf.get_u32_le(),
            cost_per_mb: buf.get_u32_le(),
            coverage: buf.get_u8(),
            security_level: buf.get_u8(),
            mtu: buf.get_u16_le(),
            is_asymmetric: buf.get_u8() != 0,
        })
    }
}

impl Default for LinkCapabilities {
    fn default() -> Self {
        LinkCapabilities {
            max_bandwidth_kbps: 1000,
            typical_latency_ms: 100,
            cost_per_mb: 0,
            coverage: 0,
            security_level: 1,
            mtu: 1500,
            is_asymmetric: false,
        }
    }
}

// ─── QoS ────────────────────────────────────────────────────────────────────

/// QoS contract for a bearer.
///
/// Wire layout: cos (1) + fwd (4) + ret (4) + min/avg/max delay (12) +
/// jitter (4) + loss f32 (4) = 29.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QosParam {
    pub cos: CosId,
    /// Forward link (ground to aircraft) rate, kbps.
    pub forward_rate_kbps: u32,
    /// Return link (aircraft to ground) rate, kbps.
    pub return_rate_kbps: u32,
    pub min_delay_ms: u32,
    pub avg_delay_ms: u32,
    pub max_delay_ms: u32,
    pub delay_jitter_ms: u32,
    /// Target packet loss rate, 0.0..=1.0.
    pub loss_rate: f32,
}

impl QosParam {
    pub const ENCODED_LEN: usize = 29;

    /// At least one direction must carry bandwidth; loss rate in [0, 1].
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.forward_rate_kbps == 0 && self.return_rate_kbps == 0 {
            return Err("forward and return rate cannot both be zero");
        }
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err("loss rate outside [0, 1]");
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.cos as u8);
        buf.put_u32_le(self.forward_rate_kbps);
        buf.put_u32_le(self.return_rate_kbps);
        buf.put_u32_le(self.min_delay_ms);
        buf.put_u32_le(self.avg_delay_ms);
        buf.put_u32_le(self.max_delay_ms);
        buf.put_u32_le(self.delay_jitter_ms);
        buf.put_f32_le(self.loss_rate);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let cos = CosId::from_u8(buf.get_u8())?;
        Some(QosParam {
            cos,
            forward_rate_kbps: buf.get_u32_le(),
            return_rate_kbps: buf.get_u32_le(),
            min_delay_ms: buf.get_u32_le(),
            avg_delay_ms: buf.get_u32_le(),
            max_delay_ms: buf.get_u32_le(),
            delay_jitter_ms: buf.get_u32_le(),
            loss_rate: buf.get_f32_le(),
        })
    }
}

// ─── Link parameters ────────────────────────────────────────────────────────

/// Dynamic link parameters, pushed in reports and Link_Up.
///
/// Wire layout (44 bytes): tx (4) + rx (4) + signal i32 (4) + quality (1) +
/// state (1) + latency (4) + jitter (4) + loss f32 (4) + available bw (4) +
/// ip (4) + netmask (4) + gateway (4) + active bearers (2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkParameters {
    pub tx_rate_kbps: u32,
    pub rx_rate_kbps: u32,
    pub signal_dbm: i32,
    /// 0..=100, higher is better.
    pub signal_quality: u8,
    pub link_state: LinkState,
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub loss_rate: f32,
    pub available_bw_kbps: u32,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub active_bearers: u16,
}

impl LinkParameters {
    pub const ENCODED_LEN: usize = 44;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.tx_rate_kbps);
        buf.put_u32_le(self.rx_rate_kbps);
        buf.put_i32_le(self.signal_dbm);
        buf.put_u8(self.signal_quality);
        buf.put_u8(self.link_state as u8);
        buf.put_u32_le(self.latency_ms);
        buf.put_u32_le(self.jitter_ms);
        buf.put_f32_le(self.loss_rate);
        buf.put_u32_le(self.available_bw_kbps);
        buf.put_slice(&self.ip.octets());
        buf.put_slice(&self.netmask.octets());
        buf.put_slice(&self.gateway.octets());
        buf.put_u16_le(self.active_bearers);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let tx_rate_kbps = buf.get_u32_le();
        let rx_rate_kbps = buf.get_u32_le();
        let signal_dbm = buf.get_i32_le();
        let signal_quality = buf.get_u8();
        let link_state = LinkState::from_u8(buf.get_u8())?;
        let latency_ms = buf.get_u32_le();
        let jitter_ms = buf.get_u32_le();
        let loss_rate = buf.get_f32_le();
        let available_bw_kbps = buf.get_u32_le();
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let ip = Ipv4Addr::from(octets);
        buf.copy_to_slice(&mut octets);
        let netmask = Ipv4Addr::from(octets);
        buf.copy_to_slice(&mut octets);
        let gateway = Ipv4Addr::from(octets);
        let active_bearers = buf.get_u16_le();
        Some(LinkParameters {
            tx_rate_kbps,
            rx_rate_kbps,
            signal_dbm,
            signal_quality,
            link_state,
            latency_ms,
            jitter_ms,
            loss_rate,
            available_bw_kbps,
            ip,
            netmask,
            gateway,
            active_bearers,
        })
    }
}

impl Default for LinkParameters {
    fn default() -> Self {
        LinkParameters {
            tx_rate_kbps: 0,
            rx_rate_kbps: 0,
            signal_dbm: 0,
            signal_quality: 0,
            link_state: LinkState::Down,
            latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            available_bw_kbps: 0,
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            active_bearers: 0,
        }
    }
}
