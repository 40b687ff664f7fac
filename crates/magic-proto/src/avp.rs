//! AVP and message codec.
//!
//! Wire layout follows the Diameter conventions, network byte order:
//!
//! ```text
//! Message header (20 bytes):
//!   version (1) | length (u24)   — total message length
//!   flags (1)   | code (u24)     — R bit 0x80 marks a request
//!   application id (u32)
//!   hop-by-hop id (u32)
//!   end-to-end id (u32)
//!
//! AVP header:
//!   code (u32)
//!   flags (1)   | length (u24)   — V bit 0x80, M bit 0x40; length
//!                                  excludes padding
//!   [vendor id (u32) when V]
//!   data, zero-padded to a 4-byte boundary
//! ```
//!
//! AVP data is not self-describing; decoding consults the
//! [dictionary](crate::dictionary) for each attribute's value kind. An
//! unknown attribute with the M bit set is a protocol error; unknown
//! optional attributes are skipped.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::dictionary::{dictionary, AvpType, MAGIC_APPLICATION_ID};

/// Protocol version carried in the message header.
pub const PROTOCOL_VERSION: u8 = 1;
/// Message header size.
pub const MESSAGE_HEADER_LEN: usize = 20;
/// Upper bound on a framed message.
pub const MAX_FRAME_LEN: usize = 16384;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_ERROR: u8 = 0x20;
const AVP_FLAG_VENDOR: u8 = 0x80;
const AVP_FLAG_MANDATORY: u8 = 0x40;

/// North-bound codec failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("truncated frame")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("frame length {0} outside bounds")]
    BadLength(usize),
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
    #[error("unknown mandatory AVP {0}")]
    UnknownMandatoryAvp(u32),
    #[error("missing required AVP {0}")]
    MissingAvp(&'static str),
    #[error("invalid value in AVP {0}")]
    InvalidValue(&'static str),
    #[error("malformed AVP {0}")]
    MalformedAvp(u32),
}

// ─── Values ─────────────────────────────────────────────────────────────────

/// A typed AVP value.
#[derive(Debug, Clone, PartialEq)]
pub enum AvpValue {
    Utf8(String),
    OctetString(Vec<u8>),
    Unsigned32(u32),
    Unsigned64(u64),
    Integer32(i32),
    Float32(f32),
    Address(Ipv4Addr),
    Grouped(Vec<Avp>),
}

impl AvpValue {
    pub fn kind(&self) -> AvpType {
        match self {
            AvpValue::Utf8(_) => AvpType::Utf8String,
            AvpValue::OctetString(_) => AvpType::OctetString,
            AvpValue::Unsigned32(_) => AvpType::Unsigned32,
            AvpValue::Unsigned64(_) => AvpType::Unsigned64,
            AvpValue::Integer32(_) => AvpType::Integer32,
            AvpValue::Float32(_) => AvpType::Float32,
            AvpValue::Address(_) => AvpType::Address,
            AvpValue::Grouped(_) => AvpType::Grouped,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            AvpValue::Utf8(s) => s.len(),
            AvpValue::OctetString(b) => b.len(),
            AvpValue::Unsigned32(_) | AvpValue::Integer32(_) | AvpValue::Float32(_) => 4,
            AvpValue::Unsigned64(_) => 8,
            // Address: 2-byte family tag + IPv4 octets.
            AvpValue::Address(_) => 6,
            AvpValue::Grouped(children) => children.iter().map(Avp::encoded_len).sum(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpValue::Utf8(s) => buf.put_slice(s.as_bytes()),
            AvpValue::OctetString(b) => buf.put_slice(b),
            AvpValue::Unsigned32(v) => buf.put_u32(*v),
            AvpValue::Unsigned64(v) => buf.put_u64(*v),
            AvpValue::Integer32(v) => buf.put_i32(*v),
            AvpValue::Float32(v) => buf.put_f32(*v),
            AvpValue::Address(ip) => {
                buf.put_u16(1); // address family: IPv4
                buf.put_slice(&ip.octets());
            }
            AvpValue::Grouped(children) => {
                for child in children {
                    child.encode(buf);
                }
            }
        }
    }

    fn decode(typ: AvpType, code: u32, mut data: Bytes) -> Result<Self, ProtoError> {
        let malformed = || ProtoError::MalformedAvp(code);
        match typ {
            AvpType::Utf8String => String::from_utf8(data.to_vec())
                .map(AvpValue::Utf8)
                .map_err(|_| malformed()),
            AvpType::OctetString => Ok(AvpValue::OctetString(data.to_vec())),
            AvpType::Unsigned32 => {
                if data.len() != 4 {
                    return Err(malformed());
                }
                Ok(AvpValue::Unsigned32(data.get_u32()))
            }
            AvpType::Unsigned64 => {
                if data.len() != 8 {
                    return Err(malformed());
                }
                Ok(AvpValue::Unsigned64(data.get_u64()))
            }
            AvpType::Integer32 => {
                if data.len() != 4 {
                    return Err(malformed());
                }
                Ok(AvpValue::Integer32(data.get_i32()))
            }
            AvpType::Float32 => {
                if data.len() != 4 {
                    return Err(malformed());
                }
                Ok(AvpValue::Float32(data.get_f32()))
            }
            AvpType::Address => {
                if data.len() != 6 || data.get_u16() != 1 {
                    return Err(malformed());
                }
                let mut octets = [0u8; 4];
                data.copy_to_slice(&mut octets);
                Ok(AvpValue::Address(Ipv4Addr::from(octets)))
            }
            AvpType::Grouped => Ok(AvpValue::Grouped(decode_avps(data)?)),
        }
    }
}

// ─── AVP ────────────────────────────────────────────────────────────────────

/// One attribute-value pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub mandatory: bool,
    pub vendor_id: Option<u32>,
    pub value: AvpValue,
}

impl Avp {
    /// Build an AVP with flags taken from the dictionary definition.
    pub fn new(code: u32, value: AvpValue) -> Self {
        let dict = dictionary();
        Avp {
            code,
            mandatory: dict.is_mandatory(code),
            vendor_id: dict.vendor_of(code),
            value,
        }
    }

    pub fn utf8(code: u32, s: impl Into<String>) -> Self {
        Avp::new(code, AvpValue::Utf8(s.into()))
    }

    pub fn unsigned32(code: u32, v: u32) -> Self {
        Avp::new(code, AvpValue::Unsigned32(v))
    }

    pub fn unsigned64(code: u32, v: u64) -> Self {
        Avp::new(code, AvpValue::Unsigned64(v))
    }

    pub fn float32(code: u32, v: f32) -> Self {
        Avp::new(code, AvpValue::Float32(v))
    }

    pub fn address(code: u32, ip: Ipv4Addr) -> Self {
        Avp::new(code, AvpValue::Address(ip))
    }

    pub fn grouped(code: u32, children: Vec<Avp>) -> Self {
        Avp::new(code, AvpValue::Grouped(children))
    }

    fn header_len(&self) -> usize {
        if self.vendor_id.is_some() {
            12
        } else {
            8
        }
    }

    /// Total on-wire size including padding.
    fn encoded_len(&self) -> usize {
        let unpadded = self.header_len() + self.value.encoded_len();
        (unpadded + 3) & !3
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let data_len = self.value.encoded_len();
        let length = self.header_len() + data_len;
        let mut flags = 0u8;
        if self.vendor_id.is_some() {
            flags |= AVP_FLAG_VENDOR;
        }
        if self.mandatory {
            flags |= AVP_FLAG_MANDATORY;
        }
        buf.put_u32(self.code);
        buf.put_u8(flags);
        put_u24(buf, length as u32);
        if let Some(vendor) = self.vendor_id {
            buf.put_u32(vendor);
        }
        self.value.encode(buf);
        let padding = (4 - (length % 4)) % 4;
        buf.put_bytes(0, padding);
    }
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

fn get_u24(buf: &mut impl Buf) -> u32 {
    let hi = buf.get_u8() as u32;
    let mid = buf.get_u8() as u32;
    let lo = buf.get_u8() as u32;
    (hi << 16) | (mid << 8) | lo
}

/// Decode a run of AVPs from `data` until it is exhausted.
///
/// Unknown optional AVPs are skipped; an unknown AVP with the M bit set
/// aborts with [`ProtoError::UnknownMandatoryAvp`].
fn decode_avps(mut data: Bytes) -> Result<Vec<Avp>, ProtoError> {
    let dict = dictionary();
    let mut avps = Vec::new();
    while data.has_remaining() {
        if data.remaining() < 8 {
            return Err(ProtoError::Truncated);
        }
        let code = data.get_u32();
        let flags = data.get_u8();
        let length = get_u24(&mut data) as usize;
        let header_len = if flags & AVP_FLAG_VENDOR != 0 { 12 } else { 8 };
        if length < header_len {
            return Err(ProtoError::MalformedAvp(code));
        }
        let vendor_id = if flags & AVP_FLAG_VENDOR != 0 {
            if data.remaining() < 4 {
                return Err(ProtoError::Truncated);
            }
            Some(data.get_u32())
        } else {
            None
        };
        let data_len = length - header_len;
        if data.remaining() < data_len {
            return Err(ProtoError::Truncated);
        }
        let raw = data.copy_to_bytes(data_len);
        // Padding may legitimately be absent at the very end of the frame.
        let padded = (data_len + 3) & !3;
        let pad = (padded - data_len).min(data.remaining());
        data.advance(pad);

        match dict.lookup(code) {
            Some(def) => {
                let value = AvpValue::decode(def.typ, code, raw)?;
                avps.push(Avp {
                    code,
                    mandatory: flags & AVP_FLAG_MANDATORY != 0,
                    vendor_id,
                    value,
                });
            }
            None if flags & AVP_FLAG_MANDATORY != 0 => {
                return Err(ProtoError::UnknownMandatoryAvp(code));
            }
            None => {} // unknown optional: skip
        }
    }
    Ok(avps)
}

// ─── Message ────────────────────────────────────────────────────────────────

/// A decoded north-bound message: command header plus AVP list.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub code: u32,
    pub request: bool,
    pub error: bool,
    pub hop_by_hop: u32,
    pub end_to_end: u32,
    pub avps: Vec<Avp>,
}

impl Message {
    pub fn request(code: u32, avps: Vec<Avp>) -> Self {
        Message {
            code,
            request: true,
            error: false,
            hop_by_hop: 0,
            end_to_end: 0,
            avps,
        }
    }

    pub fn answer(code: u32, avps: Vec<Avp>) -> Self {
        Message {
            code,
            request: false,
            error: false,
            hop_by_hop: 0,
            end_to_end: 0,
            avps,
        }
    }

    /// Echo the pairing identifiers of `req` into this answer.
    pub fn answering(mut self, req_hop_by_hop: u32, req_end_to_end: u32) -> Self {
        self.hop_by_hop = req_hop_by_hop;
        self.end_to_end = req_end_to_end;
        self
    }

    /// Assign fresh pairing identifiers to a server-initiated request.
    pub fn with_pairing(self, hop_by_hop: u32, end_to_end: u32) -> Self {
        self.answering(hop_by_hop, end_to_end)
    }

    pub fn encode(&self) -> BytesMut {
        let avp_len: usize = self.avps.iter().map(Avp::encoded_len).sum();
        let total = MESSAGE_HEADER_LEN + avp_len;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(PROTOCOL_VERSION);
        put_u24(&mut buf, total as u32);
        let mut flags = 0u8;
        if self.request {
            flags |= FLAG_REQUEST;
        }
        if self.error {
            flags |= FLAG_ERROR;
        }
        buf.put_u8(flags);
        put_u24(&mut buf, self.code);
        buf.put_u32(MAGIC_APPLICATION_ID);
        buf.put_u32(self.hop_by_hop);
        buf.put_u32(self.end_to_end);
        for avp in &self.avps {
            avp.encode(&mut buf);
        }
        buf
    }

    /// Decode one complete frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtoError> {
        if frame.remaining() < MESSAGE_HEADER_LEN {
            return Err(ProtoError::Truncated);
        }
        let version = frame.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::BadVersion(version));
        }
        let length = get_u24(&mut frame) as usize;
        if length < MESSAGE_HEADER_LEN || length > MAX_FRAME_LEN {
            return Err(ProtoError::BadLength(length));
        }
        if frame.remaining() + 4 < length {
            return Err(ProtoError::Truncated);
        }
        let flags = frame.get_u8();
        let code = get_u24(&mut frame);
        let _application_id = frame.get_u32();
        let hop_by_hop = frame.get_u32();
        let end_to_end = frame.get_u32();
        let avps = decode_avps(frame.copy_to_bytes(length - MESSAGE_HEADER_LEN))?;
        Ok(Message {
            code,
            request: flags & FLAG_REQUEST != 0,
            error: flags & FLAG_ERROR != 0,
            hop_by_hop,
            end_to_end,
            avps,
        })
    }

    /// Read the total frame length from the first four header bytes, for
    /// length-prefixed reads off a stream.
    pub fn peek_frame_len(header: [u8; 4]) -> Result<usize, ProtoError> {
        if header[0] != PROTOCOL_VERSION {
            return Err(ProtoError::BadVersion(header[0]));
        }
        let length =
            ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
        if length < MESSAGE_HEADER_LEN || length > MAX_FRAME_LEN {
            return Err(ProtoError::BadLength(length));
        }
        Ok(length)
    }

    // ── AVP accessors ──────────────────────────────────────────────────

    pub fn find(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    pub fn find_utf8(&self, code: u32) -> Option<&str> {
        match self.find(code)?.value {
            AvpValue::Utf8(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn find_u32(&self, code: u32) -> Option<u32> {
        match self.find(code)?.value {
            AvpValue::Unsigned32(v) => Some(v),
            _ => None,
        }
    }

    pub fn find_f32(&self, code: u32) -> Option<f32> {
        match self.find(code)?.value {
            AvpValue::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn find_address(&self, code: u32) -> Option<Ipv4Addr> {
        match self.find(code)?.value {
            AvpValue::Address(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn find_grouped(&self, code: u32) -> Option<&[Avp]> {
        match self.find(code)?.value {
            AvpValue::Grouped(ref children) => Some(children),
            _ => None,
        }
    }

    pub fn require_utf8(&self, code: u32) -> Result<&str, ProtoError> {
        self.find_utf8(code)
            .ok_or(ProtoError::MissingAvp(dictionary().name_of(code)))
    }

    pub fn require_u32(&self, code: u32) -> Result<u32, ProtoError> {
        self.find_u32(code)
            .ok_or(ProtoError::MissingAvp(dictionary().name_of(code)))
    }

    pub fn require_grouped(&self, code: u32) -> Result<&[Avp], ProtoError> {
        self.find_grouped(code)
            .ok_or(ProtoError::MissingAvp(dictionary().name_of(code)))
    }
}

/// Accessors over a grouped AVP's children.
pub(crate) struct Group<'a>(pub &'a [Avp]);

impl<'a> Group<'a> {
    pub fn find_utf8(&self, code: u32) -> Option<&'a str> {
        self.0.iter().find(|a| a.code == code).and_then(|a| match a.value {
            AvpValue::Utf8(ref s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn find_u32(&self, code: u32) -> Option<u32> {
        self.0.iter().find(|a| a.code == code).and_then(|a| match a.value {
            AvpValue::Unsigned32(v) => Some(v),
            _ => None,
        })
    }

    pub fn find_f32(&self, code: u32) -> Option<f32> {
        self.0.iter().find(|a| a.code == code).and_then(|a| match a.value {
            AvpValue::Float32(v) => Some(v),
            _ => None,
        })
    }

    pub fn find_address(&self, code: u32) -> Option<Ipv4Addr> {
        self.0.iter().find(|a| a.code == code).and_then(|a| match a.value {
            AvpValue::Address(ip) => Some(ip),
            _ => None,
        })
    }

    pub fn require_utf8(&self, code: u32) -> Result<&'a str, ProtoError> {
        self.find_utf8(code)
            .ok_or(ProtoError::MissingAvp(dictionary().name_of(code)))
    }
}
