//! Per-connection state machine.
//!
//! Gate (origin + per-IP rate) → awaiting-handshake (HELLO within 5 s) →
//! admitted (input / subscribe / edit dispatch) → closed. Inbound frames for
//! one connection are handled sequentially on its task; every outbound frame
//! goes through the connection's writer task.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::edits;
use crate::network::Ctx;
use crate::registry::{self, AdmissionInfo, HandshakeOutcome, HelloArgs};
use crate::streamer;
use crate::world::send_frame;
use shared::coords::{WORLD_BLOCKS_XZ, WORLD_BLOCKS_Y};
use shared::frames::{
    ClientFrame, ErrorCode, ServerFrame, Vec3, CLOSE_INVALID_ORIGIN, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR, CLOSE_RATE_LIMITED,
};
use shared::{HANDSHAKE_TIMEOUT, MAX_FRAME_BYTES, PROTOCOL_VERSION};

/// Inputs whose sequence regresses further than this trigger a RESYNC.
const RESYNC_WINDOW: u32 = 64;

enum Inbound {
    Frame(ClientFrame),
    Malformed(String),
    Oversize,
    Binary,
    Gone,
}

/// Reads the next meaningful inbound message.
async fn read_inbound(reader: &mut SplitStream<WebSocketStream<TcpStream>>) -> Inbound {
    loop {
        match reader.next().await {
            None | Some(Err(_)) => return Inbound::Gone,
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_BYTES {
                    return Inbound::Oversize;
                }
                return match serde_json::from_str(&text) {
                    Ok(frame) => Inbound::Frame(frame),
                    Err(err) => Inbound::Malformed(err.to_string()),
                };
            }
            Some(Ok(Message::Binary(payload))) => {
                if payload.len() > MAX_FRAME_BYTES {
                    return Inbound::Oversize;
                }
                return Inbound::Binary;
            }
            Some(Ok(Message::Close(_))) => return Inbound::Gone,
            // Ping/pong are handled by the transport.
            Some(Ok(_)) => continue,
        }
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &'static str) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    })));
}

fn send_error(
    tx: &mpsc::UnboundedSender<Message>,
    code: ErrorCode,
    message: impl Into<String>,
    fatal: bool,
) {
    send_frame(
        tx,
        &ServerFrame::Error {
            protocol_version: PROTOCOL_VERSION,
            code,
            message: message.into(),
            fatal,
        },
    );
}

/// Fatal errors carry an ERROR frame, then a normal closure.
fn send_fatal(tx: &mpsc::UnboundedSender<Message>, code: ErrorCode, message: impl Into<String>) {
    send_error(tx, code, message, true);
    send_close(tx, CLOSE_NORMAL, "fatal error");
}

/// Accepts one WebSocket connection and drives it to completion.
pub async fn handle_connection(ctx: Arc<Ctx>, stream: TcpStream, addr: SocketAddr) {
    let mut origin: Option<String> = None;
    let ws = match accept_hdr_async(stream, |req: &Request, response: Response| {
        origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(err) => {
            debug!("websocket upgrade with {addr} failed: {err}");
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_write.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    run_session(&ctx, &mut ws_read, &tx, addr, origin).await;

    drop(tx);
    let _ = writer.await;
}

async fn run_session(
    ctx: &Arc<Ctx>,
    ws_read: &mut SplitStream<WebSocketStream<TcpStream>>,
    tx: &mpsc::UnboundedSender<Message>,
    addr: SocketAddr,
    origin: Option<String>,
) {
    // Gate: per-source-IP rate window, then origin allowlist.
    if !ctx.connection_rate_ok(addr.ip()) {
        warn!("connection from {addr} exceeded the rate window");
        send_close(tx, CLOSE_RATE_LIMITED, "connection rate exceeded");
        return;
    }
    if !ctx.config.origin_allowed(origin.as_deref()) {
        warn!("connection from {addr} rejected: origin {origin:?} not allowed");
        send_close(tx, CLOSE_INVALID_ORIGIN, "origin not allowed");
        return;
    }

    // Awaiting-handshake: the first frame must be HELLO within the window.
    let admission = loop {
        let inbound = match timeout(HANDSHAKE_TIMEOUT, read_inbound(ws_read)).await {
            Ok(inbound) => inbound,
            Err(_) => {
                send_fatal(tx, ErrorCode::AuthFailed, "handshake timed out");
                return;
            }
        };
        let hello = match inbound {
            Inbound::Frame(ClientFrame::Hello {
                protocol_version,
                registry_version,
                generator_version,
                jwt,
                world_id,
            }) => HelloArgs {
                protocol_version,
                registry_version,
                generator_version,
                jwt,
                world_id,
            },
            Inbound::Frame(_) => {
                send_fatal(tx, ErrorCode::AuthFailed, "expected HELLO");
                return;
            }
            Inbound::Malformed(err) => {
                send_fatal(tx, ErrorCode::AuthFailed, format!("malformed handshake: {err}"));
                return;
            }
            Inbound::Oversize => {
                send_close(tx, CLOSE_PROTOCOL_ERROR, "frame too large");
                return;
            }
            Inbound::Binary => {
                send_close(tx, CLOSE_PROTOCOL_ERROR, "text frames only");
                return;
            }
            Inbound::Gone => return,
        };

        match registry::admit(ctx, hello, tx).await {
            HandshakeOutcome::Admitted(info) => break info,
            HandshakeOutcome::Redirected { url } => {
                info!("redirecting {addr} to {url}");
                send_frame(
                    tx,
                    &ServerFrame::Redirect {
                        protocol_version: PROTOCOL_VERSION,
                        url,
                    },
                );
                send_close(tx, CLOSE_NORMAL, "redirected");
                return;
            }
            HandshakeOutcome::Rejected {
                code,
                message,
                fatal,
            } => {
                info!("handshake from {addr} rejected: {code} ({message})");
                send_error(tx, code, message, fatal);
                if fatal {
                    send_close(tx, CLOSE_NORMAL, "handshake rejected");
                    return;
                }
                // Non-fatal rejection (world full): another HELLO may follow.
            }
        }
    };

    // Admitted: dispatch inbound frames until the connection goes away.
    loop {
        match read_inbound(ws_read).await {
            Inbound::Gone => break,
            Inbound::Oversize => {
                send_close(tx, CLOSE_PROTOCOL_ERROR, "frame too large");
                break;
            }
            Inbound::Binary => {
                send_error(tx, ErrorCode::InvalidRequest, "text frames only", false)
            }
            Inbound::Malformed(err) => send_error(
                tx,
                ErrorCode::InvalidRequest,
                format!("could not parse frame: {err}"),
                false,
            ),
            Inbound::Frame(frame) => dispatch(ctx, &admission, frame, tx).await,
        }
    }

    registry::depart(ctx, &admission.world, &admission.player_id).await;
}

async fn dispatch(
    ctx: &Arc<Ctx>,
    admission: &AdmissionInfo,
    frame: ClientFrame,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match frame {
        ClientFrame::Hello { .. } => {
            send_error(tx, ErrorCode::InvalidRequest, "already admitted", false)
        }
        ClientFrame::Input {
            protocol_version: _,
            sequence,
            position,
            velocity,
            yaw,
            pitch,
            inputs: _,
        } => apply_input(admission, sequence, position, velocity, yaw, pitch).await,
        ClientFrame::Subscribe {
            protocol_version: _,
            subscribe,
            unsubscribe,
        } => {
            streamer::handle_subscribe(ctx, &admission.world, &admission.player_id, subscribe, unsubscribe)
                .await
        }
        ClientFrame::BlockEditRequest {
            protocol_version: _,
            request_id,
            x,
            y,
            z,
            block_id,
        } => {
            edits::handle_edit(ctx, &admission.world, &admission.player_id, request_id, x, y, z, block_id)
                .await
        }
    }
}

/// Applies a motion update with coarse clamping only.
pub async fn apply_input(
    admission: &AdmissionInfo,
    sequence: u32,
    position: Vec3,
    velocity: Vec3,
    yaw: f32,
    pitch: f32,
) {
    let mut data = admission.world.state.lock().await;
    let participant = match data.participants.get_mut(&admission.player_id) {
        Some(participant) => participant,
        None => return,
    };
    participant.touch();

    if sequence <= participant.last_input_sequence {
        if participant.last_input_sequence - sequence > RESYNC_WINDOW {
            // The input stream restarted; hand the authoritative state back.
            let frame = ServerFrame::Resync {
                protocol_version: PROTOCOL_VERSION,
                position: participant.position,
                last_input_sequence: participant.last_input_sequence,
            };
            send_frame(&participant.tx, &frame);
        }
        return;
    }

    participant.position = Vec3::new(
        position.x.clamp(0.0, WORLD_BLOCKS_XZ as f32),
        position.y.clamp(0.0, WORLD_BLOCKS_Y as f32),
        position.z.clamp(0.0, WORLD_BLOCKS_XZ as f32),
    );
    participant.velocity = velocity;
    participant.yaw = yaw;
    participant.pitch = pitch;
    participant.last_input_sequence = sequence;
}
