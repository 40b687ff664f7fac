//! North-bound interface: the Diameter-style TCP listener and the
//! per-connection read/dispatch/write machinery.
//!
//! One connection hosts one authenticated session. All outbound traffic
//! for a connection — answers and server-initiated pushes alike — flows
//! through one mpsc channel into a single writer task, so nothing ever
//! holds a registry lock across a socket write and per-session ordering
//! is the channel order.

pub mod handlers;

use std::net::SocketAddr;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use magic_proto::dictionary::avps;
use magic_proto::{Avp, ClientCommand, MagicStatus, Message, ProtoError, ResultCode, ServerMessage};

use crate::push;
use crate::state::{ClientHandle, CoreState};

/// Accept loop.
pub async fn run(state: CoreState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = state.config().north.listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding north listener on {addr}"))?;
    info!(%addr, "north-bound listener up");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "client accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(state, stream, peer, shutdown).await;
                });
            }
        }
    }
    info!("north-bound listener stopped");
    Ok(())
}

async fn handle_connection(
    state: CoreState,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, "client connected");
    let (mut rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(write_loop(wr, rx));

    // The session this connection authenticated, for cleanup.
    let mut bound_session: Option<String> = None;

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut rd) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break, // peer closed
            Err(e) => {
                warn!(%peer, error = %e, "client transport error, dropping connection");
                break;
            }
        };
        let message = match Message::decode(frame.freeze()) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "malformed client frame, dropping connection");
                break;
            }
        };
        let pairing = (message.hop_by_hop, message.end_to_end);
        match ClientCommand::from_message(&message) {
            Ok(command) => {
                if !dispatch(&state, &tx, &mut bound_session, command, pairing).await {
                    break;
                }
            }
            Err(e) => {
                // Protocol-level failure: the answer is structured, the
                // connection survives.
                warn!(%peer, error = %e, "protocol error in client command");
                let answer =
                    protocol_failure(message.code, message.find_utf8(avps::SESSION_ID), &e)
                        .answering(pairing.0, pairing.1);
                if tx.send(answer).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup: the session dies with its transport.
    if let Some(session_id) = bound_session {
        state.clients().remove(&session_id);
        if handlers::teardown_session(&state, &session_id).await {
            push::broadcast_mscr(&state, push::StatusChange::ClientLeave).await;
        }
    }
    drop(tx);
    let _ = writer.await;
    debug!(%peer, "client disconnected");
}

/// Dispatch one parsed command. Returns false when the connection should
/// close.
async fn dispatch(
    state: &CoreState,
    tx: &mpsc::Sender<Message>,
    bound_session: &mut Option<String>,
    command: ClientCommand,
    pairing: (u32, u32),
) -> bool {
    match command {
        ClientCommand::Auth(req) => {
            let (answer, session_id) = handlers::authenticate(state, req).await;
            if let Some(session_id) = session_id {
                state
                    .clients()
                    .insert(session_id.clone(), ClientHandle { tx: tx.clone() });
                *bound_session = Some(session_id);
            }
            send_answer(tx, ServerMessage::AuthAnswer(answer), pairing).await
        }
        ClientCommand::Communication(req) => {
            let answer = handlers::communication(state, req).await;
            send_answer(tx, ServerMessage::CommAnswer(answer), pairing).await
        }
        ClientCommand::StatusSubscribe(req) => {
            let session_id = req.session_id.clone();
            let answer = handlers::subscribe(state, req);
            let ok = answer.result_code.is_success();
            if !send_answer(tx, ServerMessage::SubscribeAnswer(answer), pairing).await {
                return false;
            }
            if ok {
                // The initial snapshot follows the MSCA on the same
                // channel, preserving order.
                push::send_initial_snapshot(state, &session_id).await;
            }
            true
        }
        ClientCommand::Termination(req) => {
            let answer = handlers::terminate(state, &req.session_id).await;
            state.clients().remove(&req.session_id);
            if bound_session.as_deref() == Some(req.session_id.as_str()) {
                *bound_session = None;
            }
            send_answer(tx, ServerMessage::TerminationAnswer(answer), pairing).await
        }
        ClientCommand::NotifyAck(ack) => {
            if !ack.result_code.is_success() {
                warn!(session = %ack.session_id, code = %ack.result_code, "MNTA with error");
            }
            // Either way the client answered; the pending flag clears.
            push::ack_mntr(state, &ack.session_id);
            true
        }
        ClientCommand::StatusAck(ack) => {
            if !ack.result_code.is_success() {
                warn!(
                    session = %ack.session_id,
                    code = %ack.result_code,
                    "MSCA with error, dropping status subscription"
                );
                let _ = state.sessions().set_subscription(&ack.session_id, 0);
            }
            true
        }
    }
}

async fn send_answer(
    tx: &mpsc::Sender<Message>,
    message: ServerMessage,
    (hop_by_hop, end_to_end): (u32, u32),
) -> bool {
    tx.send(message.into_message().answering(hop_by_hop, end_to_end))
        .await
        .is_ok()
}

/// Read one length-prefixed frame. `Ok(None)` is a clean EOF.
async fn read_frame(rd: &mut OwnedReadHalf) -> Result<Option<BytesMut>, std::io::Error> {
    let mut header = [0u8; 4];
    match rd.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let total = Message::peek_frame_len(header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let mut frame = BytesMut::with_capacity(total);
    frame.extend_from_slice(&header);
    frame.resize(total, 0);
    rd.read_exact(&mut frame[4..]).await?;
    Ok(Some(frame))
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if wr.write_all(&message.encode()).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
}

/// Structured failure for a request that did not parse: Result-Code,
/// MAGIC-Status-Code and a readable Error-Message, echoing the command
/// code the client used.
pub fn protocol_failure(code: u32, session_id: Option<&str>, error: &ProtoError) -> Message {
    let mut m_avps = Vec::new();
    if let Some(sid) = session_id {
        m_avps.push(Avp::utf8(avps::SESSION_ID, sid));
    }
    m_avps.push(Avp::unsigned32(
        avps::RESULT_CODE,
        ResultCode::InvalidRequest as u32,
    ));
    m_avps.push(Avp::unsigned32(
        avps::MAGIC_STATUS_CODE,
        MagicStatus::Failure as u32,
    ));
    m_avps.push(Avp::utf8(avps::ERROR_MESSAGE, error.to_string()));
    let mut message = Message::answer(code, m_avps);
    message.error = true;
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_failure_is_error_answer() {
        let failure = protocol_failure(9002, Some("ses_x"), &ProtoError::MissingAvp("Session-Id"));
        assert!(!failure.request);
        assert!(failure.error);
        assert_eq!(
            failure.find_u32(avps::RESULT_CODE),
            Some(ResultCode::InvalidRequest as u32)
        );
        assert_eq!(failure.find_utf8(avps::SESSION_ID), Some("ses_x"));
        assert!(failure.find_utf8(avps::ERROR_MESSAGE).is_some());
    }
}
