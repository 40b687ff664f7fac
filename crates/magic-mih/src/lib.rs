//! # MAGIC MIH Wire Protocol
//!
//! South-bound protocol between the Connection Manager Core and the Data
//! Link Managers (DLMs), following the ARINC 839 profile of IEEE 802.21
//! Media-Independent Handover with the MAGIC vendor extensions.
//!
//! This crate is pure codec — no I/O:
//! - **Data types** — link tuple, capabilities, parameters, QoS ([`types`])
//! - **Primitives** — typed payloads with explicit little-endian
//!   encode/decode and the [`Primitive`] sum type keyed by primitive code
//!   ([`primitives`])
//! - **Transport framing** — the 12-byte stream header, the 2-byte datagram
//!   code, raw UDP heartbeat frames and the transaction counter
//!   ([`transport`])
//!
//! Everything on this wire is little-endian. Payloads are defined
//! byte-for-byte by the encode/decode pairs here; nothing relies on native
//! struct layout.

pub mod primitives;
pub mod transport;
pub mod types;

pub use primitives::{codes, Primitive, WireError};
pub use types::{
    BearerId, CosId, HealthStatus, LinkCapabilities, LinkDownReason, LinkParameters, LinkState,
    LinkTupleId, LinkType, QosParam, ResourceAction, Status, MAX_BEARERS,
};

use bytes::{Buf, BufMut, BytesMut};

/// Write `s` as a fixed-size, zero-padded field. Longer strings are
/// truncated at a character boundary.
pub(crate) fn put_fixed_str(buf: &mut BytesMut, s: &str, len: usize) {
    let mut bytes = s.as_bytes();
    if bytes.len() > len {
        let mut cut = len;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        bytes = &bytes[..cut];
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, len - bytes.len());
}

/// Read a fixed-size field, stopping at the first NUL.
pub(crate) fn get_fixed_str(buf: &mut impl Buf, len: usize) -> Option<String> {
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_roundtrip() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "LINK_SATCOM", 32);
        assert_eq!(buf.len(), 32);
        let s = get_fixed_str(&mut buf.freeze(), 32).unwrap();
        assert_eq!(s, "LINK_SATCOM");
    }

    #[test]
    fn fixed_str_truncates_long_input() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "0123456789", 4);
        assert_eq!(buf.len(), 4);
        let s = get_fixed_str(&mut buf.freeze(), 4).unwrap();
        assert_eq!(s, "0123");
    }

    #[test]
    fn fixed_str_truncates_at_char_boundary() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "aé", 2); // 'é' is 2 bytes, would split
        assert_eq!(buf.len(), 2);
        let s = get_fixed_str(&mut buf.freeze(), 2).unwrap();
        assert_eq!(s, "a");
    }

    #[test]
    fn fixed_str_short_buffer() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"abc");
        assert!(get_fixed_str(&mut buf.freeze(), 8).is_none());
    }
}
