//! Transport framing for the three south-bound delivery modes.
//!
//! - **Stream** (Unix SOCK_STREAM): every message is prefixed by the
//!   12-byte [`StreamHeader`] — primitive code, total length, transaction
//!   id, timestamp.
//! - **Datagram** (Unix SOCK_DGRAM): a 2-byte primitive code followed by
//!   the payload, one message per datagram, no transaction id.
//! - **UDP heartbeat**: a bare `Ext_Heartbeat` payload with no header at
//!   all, used by lightweight DLM prototypes to announce presence.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::primitives::{Primitive, WireError};

/// Default stream socket path.
pub const DEFAULT_STREAM_SOCKET: &str = "/tmp/magic_core.sock";
/// Default datagram socket path.
pub const DEFAULT_DGRAM_SOCKET: &str = "/tmp/mihf.sock";
/// Default UDP heartbeat port.
pub const DEFAULT_HEARTBEAT_PORT: u16 = 1947;
/// Upper bound on any framed message, header included.
pub const MAX_MESSAGE_SIZE: usize = 4096;
/// Datagram prefix: just the primitive code.
pub const DGRAM_HEADER_LEN: usize = 2;

// ─── Stream header ──────────────────────────────────────────────────────────

/// 12-byte header prefixed to every stream-mode message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub primitive: u16,
    /// Total message length, this header included.
    pub length: u16,
    /// Pairs requests with confirms.
    pub transaction_id: u32,
    /// Unix timestamp, seconds.
    pub timestamp: u32,
}

impl StreamHeader {
    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.primitive);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.transaction_id);
        buf.put_u32_le(self.timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(StreamHeader {
            primitive: buf.get_u16_le(),
            length: buf.get_u16_le(),
            transaction_id: buf.get_u32_le(),
            timestamp: buf.get_u32_le(),
        })
    }

    /// Length of the payload that follows the header, or `None` when the
    /// header announces an impossible length.
    pub fn payload_len(&self) -> Option<usize> {
        let total = self.length as usize;
        if total < Self::ENCODED_LEN || total > MAX_MESSAGE_SIZE {
            return None;
        }
        Some(total - Self::ENCODED_LEN)
    }
}

/// Frame a primitive for stream transport.
pub fn frame_stream(prim: &Primitive, transaction_id: u32, timestamp: u32) -> BytesMut {
    let mut payload = BytesMut::new();
    prim.encode_payload(&mut payload);
    let mut buf = BytesMut::with_capacity(StreamHeader::ENCODED_LEN + payload.len());
    StreamHeader {
        primitive: prim.code(),
        length: (StreamHeader::ENCODED_LEN + payload.len()) as u16,
        transaction_id,
        timestamp,
    }
    .encode(&mut buf);
    buf.extend_from_slice(&payload);
    buf
}

// ─── Datagram framing ───────────────────────────────────────────────────────

/// Frame a primitive for datagram transport: 2-byte code + payload.
pub fn frame_dgram(prim: &Primitive) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16_le(prim.code());
    prim.encode_payload(&mut buf);
    buf
}

/// Decode one datagram (2-byte code + payload).
pub fn decode_dgram(mut data: Bytes) -> Result<Primitive, WireError> {
    if data.remaining() < DGRAM_HEADER_LEN {
        return Err(WireError::Malformed(0));
    }
    let code = data.get_u16_le();
    Primitive::decode(code, &mut data)
}

// ─── Transaction counter ────────────────────────────────────────────────────

/// Monotonic transaction-id source owned by the transport layer.
///
/// Ids start at 1; 0 is reserved for unsolicited indications.
#[derive(Debug)]
pub struct TransactionCounter {
    next: AtomicU32,
}

impl TransactionCounter {
    pub const fn new() -> Self {
        TransactionCounter {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // Wrapped; skip the reserved value.
            self.next.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{codes, ExtHeartbeat, ExtHeartbeatAck};
    use crate::types::{HealthStatus, LinkTupleId, LinkType};

    fn heartbeat() -> Primitive {
        Primitive::ExtHeartbeat(ExtHeartbeat {
            link: LinkTupleId::new(LinkType::LteFdd, "LINK_CELL", "wwan0"),
            health: HealthStatus::Ok,
            tx_bytes: 10,
            rx_bytes: 20,
            active_bearers: 1,
        })
    }

    #[test]
    fn stream_frame_roundtrip() {
        let framed = frame_stream(&heartbeat(), 42, 1_700_000_000);
        let mut buf = framed.freeze();
        let header = StreamHeader::decode(&mut buf).unwrap();
        assert_eq!(header.primitive, codes::EXT_HEARTBEAT);
        assert_eq!(header.transaction_id, 42);
        assert_eq!(header.payload_len(), Some(buf.remaining()));
        let prim = Primitive::decode(header.primitive, &mut buf).unwrap();
        assert_eq!(prim, heartbeat());
    }

    #[test]
    fn stream_header_rejects_bad_length() {
        let short = StreamHeader {
            primitive: codes::EXT_HEARTBEAT,
            length: 4,
            transaction_id: 1,
            timestamp: 0,
        };
        assert_eq!(short.payload_len(), None);

        let huge = StreamHeader {
            length: u16::MAX,
            ..short
        };
        assert_eq!(huge.payload_len(), None);
    }

    #[test]
    fn dgram_roundtrip() {
        let framed = frame_dgram(&heartbeat());
        let prim = decode_dgram(framed.freeze()).unwrap();
        assert_eq!(prim, heartbeat());
    }

    #[test]
    fn dgram_too_short() {
        assert!(decode_dgram(Bytes::from_static(&[0x01])).is_err());
    }

    #[test]
    fn dgram_ack_roundtrip() {
        let ack = Primitive::ExtHeartbeatAck(ExtHeartbeatAck {
            ack_status: 0,
            server_timestamp: 7,
        });
        let framed = frame_dgram(&ack);
        assert_eq!(decode_dgram(framed.freeze()).unwrap(), ack);
    }

    #[test]
    fn transaction_ids_are_monotonic_and_nonzero() {
        let counter = TransactionCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(a >= 1);
        assert!(b > a);
    }
}
