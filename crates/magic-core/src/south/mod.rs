//! South-bound servers: the three MIH transports.
//!
//! - Stream (Unix SOCK_STREAM): full transport header, one task per
//!   connected DLM; losing the connection takes the DLM's links down.
//! - Datagram (Unix SOCK_DGRAM): 2-byte code framing, connectionless;
//!   every message doubles as a keep-alive.
//! - UDP heartbeat listener: bare heartbeat frames from lightweight DLM
//!   prototypes, also keep-alive only.

pub mod dispatch;

use std::path::Path;

use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UdpSocket, UnixDatagram, UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use magic_mih::transport::{
    decode_dgram, frame_dgram, frame_stream, StreamHeader, TransactionCounter, MAX_MESSAGE_SIZE,
};
use magic_mih::{LinkDownReason, Primitive, WireError};

use crate::registry::LinkEvent;
use crate::state::CoreState;

use dispatch::{dispatch as dispatch_primitive, primitive_link, unix_now};

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ─── Stream server ──────────────────────────────────────────────────────────

/// Accept loop for the stream transport.
pub async fn run_stream_server(
    state: CoreState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let path = state.config().south.stream_socket.clone();
    remove_stale_socket(&path)
        .with_context(|| format!("clearing stale socket {}", path.display()))?;
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding stream socket {}", path.display()))?;
    info!(path = %path.display(), "south stream server up");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "DLM accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_dlm_connection(state, stream, shutdown).await;
                });
            }
        }
    }
    let _ = std::fs::remove_file(&path);
    info!("south stream server stopped");
    Ok(())
}

async fn handle_dlm_connection(
    state: CoreState,
    mut stream: UnixStream,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("DLM connected on stream transport");
    let transactions = TransactionCounter::new();
    // Links this connection registered; they go down with the transport.
    let mut owned_links: Vec<String> = Vec::new();
    // Liveness removal must also close this transport.
    let mut events = state.links().subscribe();
    // Frames accumulate here; read_buf is safe to cancel mid-frame.
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);

    'conn: loop {
        // Drain every complete frame before touching the socket again.
        loop {
            let (header, payload) = match parse_stream_frame(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bad DLM frame, dropping connection");
                    break 'conn;
                }
            };
            let primitive = match Primitive::decode(header.primitive, &mut payload.clone()) {
                Ok(primitive) => primitive,
                Err(WireError::UnknownPrimitive(code)) => {
                    // The link survives an unknown code.
                    warn!(code = format_args!("{code:#06x}"), "unknown primitive, ignoring");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "malformed primitive, dropping connection");
                    break 'conn;
                }
            };
            let registering = match primitive {
                Primitive::ExtLinkRegisterRequest(ref req) => Some(req.link.link_name.clone()),
                _ => None,
            };
            let reply = dispatch_primitive(&state, primitive);
            if let (Some(name), Some(Primitive::ExtLinkRegisterConfirm(cnf))) =
                (registering, reply.as_ref())
            {
                // This transport owns the link once the registration sticks.
                if cnf.status == magic_mih::Status::Success && !owned_links.contains(&name) {
                    owned_links.push(name);
                }
            }
            if let Some(reply) = reply {
                let transaction_id = if header.transaction_id != 0 {
                    header.transaction_id
                } else {
                    transactions.next()
                };
                let framed = frame_stream(&reply, transaction_id, unix_now());
                if stream.write_all(&framed).await.is_err() {
                    break 'conn;
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                if let Ok(LinkEvent::Down { link, reason: LinkDownReason::Timeout, .. }) = event {
                    if owned_links.iter().any(|l| *l == link) {
                        warn!(%link, "owned link timed out, closing DLM transport");
                        owned_links.retain(|l| *l != link);
                        if owned_links.is_empty() {
                            return;
                        }
                    }
                }
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break, // clean EOF
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "DLM transport error, dropping connection");
                        break;
                    }
                }
            }
        }
    }

    // Transport gone: every link this DLM registered goes down.
    for link in owned_links {
        state
            .links()
            .remove(&link, LinkDownReason::Explicit, "DLM transport closed");
    }
    debug!("DLM disconnected from stream transport");
}

/// Pop one complete frame off the accumulation buffer, or report how
/// things stand: `Ok(None)` means more bytes are needed.
fn parse_stream_frame(buf: &mut BytesMut) -> Result<Option<(StreamHeader, Bytes)>, String> {
    if buf.len() < StreamHeader::ENCODED_LEN {
        return Ok(None);
    }
    let header =
        StreamHeader::decode(&mut &buf[..StreamHeader::ENCODED_LEN]).expect("fixed-size header");
    let payload_len = header
        .payload_len()
        .ok_or_else(|| format!("bad frame length {}", header.length))?;
    let total = StreamHeader::ENCODED_LEN + payload_len;
    if buf.len() < total {
        return Ok(None);
    }
    let mut frame = buf.split_to(total);
    frame.advance(StreamHeader::ENCODED_LEN);
    Ok(Some((header, frame.freeze())))
}

// ─── Datagram server ────────────────────────────────────────────────────────

/// Receive loop for the datagram transport. Every message is an implicit
/// keep-alive for the link it names.
pub async fn run_dgram_server(
    state: CoreState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let path = state.config().south.dgram_socket.clone();
    remove_stale_socket(&path)
        .with_context(|| format!("clearing stale socket {}", path.display()))?;
    let socket = UnixDatagram::bind(&path)
        .with_context(|| format!("binding datagram socket {}", path.display()))?;
    info!(path = %path.display(), "south datagram server up");

    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "datagram receive error");
                    continue;
                }
            },
        };
        let primitive = match decode_dgram(Bytes::copy_from_slice(&buf[..len])) {
            Ok(primitive) => primitive,
            Err(e) => {
                warn!(error = %e, "malformed datagram, ignoring");
                continue;
            }
        };
        if let Some(link) = primitive_link(&primitive) {
            state.links().touch(link);
        }
        let reply = dispatch_primitive(&state, primitive);
        if let (Some(reply), Some(peer_path)) = (reply, peer.as_pathname()) {
            if let Err(e) = socket.send_to(&frame_dgram(&reply), peer_path).await {
                debug!(error = %e, "datagram reply failed");
            }
        }
    }
    let _ = std::fs::remove_file(&path);
    info!("south datagram server stopped");
    Ok(())
}

// ─── UDP heartbeat listener ─────────────────────────────────────────────────

/// Receive loop for bare heartbeat frames announcing DLM presence.
pub async fn run_heartbeat_listener(
    state: CoreState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let port = state.config().south.heartbeat_port;
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding UDP heartbeat listener on port {port}"))?;
    socket
        .set_broadcast(true)
        .context("enabling broadcast on heartbeat socket")?;
    info!(port, "UDP heartbeat listener up");

    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "heartbeat receive error");
                    continue;
                }
            },
        };
        // No header at all on this path: the payload is the heartbeat.
        let Some(hb) = magic_mih::primitives::ExtHeartbeat::decode(&mut &buf[..len]) else {
            debug!(%peer, "undecodable heartbeat frame, ignoring");
            continue;
        };
        state.links().touch(&hb.link.link_name);
        if let Some(reply) = dispatch_primitive(&state, Primitive::ExtHeartbeat(hb)) {
            let mut out = BytesMut::new();
            reply.encode_payload(&mut out);
            if let Err(e) = socket.send_to(&out, peer).await {
                debug!(error = %e, "heartbeat ack failed");
            }
        }
    }
    info!("UDP heartbeat listener stopped");
    Ok(())
}
