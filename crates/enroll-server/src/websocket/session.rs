//! One observer connection from upgrade to disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use enroll_core::ids::SessionId;
use enroll_runtime::EnrollService;
use enroll_runtime::gateway::ForwardEnd;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ConnectionGuard, Liveness};
use super::gateway::{Inbound, WsGateway, frame};

const OUTBOUND_CAPACITY: usize = 256;

/// Per-connection parameters.
pub struct ObserverParams {
    /// Session being observed.
    pub session_id: SessionId,
    /// Replay events after this sequence number.
    pub after_seq: u64,
    /// Interval between server Ping frames.
    pub ping_interval: Duration,
    /// Disconnect after this long without a Pong.
    pub pong_timeout: Duration,
    /// Server-wide shutdown.
    pub shutdown: CancellationToken,
}

/// Run one observer connection.
///
/// Three parts share a connection token; whichever ends first cancels the
/// others:
/// - the writer drains the outbound channel and sends Ping frames
/// - the pump forwards session events as `status_update` frames
/// - the reader answers `ping` and `get_status`
#[instrument(skip_all, fields(session_id = %params.session_id, after = params.after_seq))]
pub async fn run_observer(
    ws: WebSocket,
    service: Arc<EnrollService>,
    params: ObserverParams,
    _slot: ConnectionGuard,
) {
    let ObserverParams {
        session_id,
        after_seq,
        ping_interval,
        pong_timeout,
        shutdown,
    } = params;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let liveness = Arc::new(Liveness::new());
    let cancel = shutdown.child_token();

    info!("observer connected");
    let established = frame(
        "connection.established",
        json!({ "sessionId": session_id, "after": after_seq }),
    );
    if ws_tx.send(Message::Text(established.into())).await.is_err() {
        return;
    }

    let writer = {
        let liveness = Arc::clone(&liveness);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            let _ = ping.tick().await;
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if ws_tx.send(msg).await.is_err() || closing {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if liveness.silent_for() > pong_timeout {
                            warn!(timeout_ms = pong_timeout.as_millis() as u64, "observer unresponsive, disconnecting");
                            break;
                        }
                        if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            cancel.cancel();
        })
    };

    let pump = {
        let service = Arc::clone(&service);
        let session_id = session_id.clone();
        let cancel = cancel.clone();
        let mut gateway = WsGateway::new(out_tx.clone());
        tokio::spawn(async move {
            let end = tokio::select! {
                end = service.forward(&session_id, after_seq, &mut gateway) => end,
                () = cancel.cancelled() => return,
            };
            match end {
                Ok(ForwardEnd::TopicClosed { last_seq }) => {
                    debug!(last_seq, "session closed, ending observer");
                    let _ = gateway
                        .send(Message::Text(
                            frame("session_closed", json!({ "lastSeq": last_seq })).into(),
                        ))
                        .await;
                    let _ = gateway.send(Message::Close(None)).await;
                }
                Ok(ForwardEnd::Disconnected { last_seq }) => {
                    debug!(last_seq, "observer went away");
                    cancel.cancel();
                }
                Err(e) => {
                    let _ = gateway
                        .send(Message::Text(
                            frame("error", json!({ "message": e.to_string() })).into(),
                        ))
                        .await;
                    let _ = gateway.send(Message::Close(None)).await;
                }
            }
        })
    };

    loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            () = cancel.cancelled() => break,
        };
        let Some(Ok(msg)) = next else { break };
        liveness.touch();
        let reply = match msg {
            Message::Text(text) => reply_to(Inbound::parse(text.as_str()), &service, &session_id),
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };
        if out_tx.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }

    cancel.cancel();
    drop(out_tx);
    let _ = tokio::join!(writer, pump);
    info!("observer disconnected");
}

fn reply_to(inbound: Inbound, service: &EnrollService, session_id: &SessionId) -> String {
    match inbound {
        Inbound::Ping => "pong".to_owned(),
        Inbound::GetStatus => match service.status(session_id).map(|s| serde_json::to_value(&s)) {
            Ok(Ok(status)) => frame("status", status),
            Ok(Err(e)) => frame("error", json!({ "message": e.to_string() })),
            Err(e) => frame("error", json!({ "message": e.to_string() })),
        },
        Inbound::Unknown => frame("error", json!({ "message": "unsupported message" })),
    }
}
