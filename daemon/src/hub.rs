//! Subscription hub: the WebSocket gateway between clients and project
//! orchestrators.
//!
//! One connection per (client, project). On join the hub replays the
//! transcript tail (or everything after `from_seq`), then streams live
//! events. Inbound frames are the literal `"ping"` keepalive or JSON
//! command envelopes; outbound frames mirror canonical events. A
//! subscriber that cannot keep up is closed with code 4001 and must
//! reconnect with `subscribe_from_seq`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use overture_events::{
    ClientCommand, OutboundFrame, StoredMessage, CLOSE_NORMAL, CLOSE_PROJECT_UNKNOWN,
    CLOSE_SLOW_CONSUMER, CLOSE_UNAUTHORIZED, KEEPALIVE_PING, KEEPALIVE_PONG,
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapters::Availability;
use crate::error::DaemonError;
use crate::orchestrator::OrchestratorHandle;
use crate::state::DaemonState;

/// A client ping is expected at least every 60 s; this much silence
/// closes the connection.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/agents/availability", get(availability_handler))
        .route("/v1/ws/projects/{project_id}", get(ws_upgrade_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Registry snapshot for the homepage status grid.
async fn availability_handler(
    State(state): State<Arc<DaemonState>>,
) -> Json<HashMap<String, Availability>> {
    let snapshot = state.registry.availability_snapshot().await;
    Json(
        snapshot
            .into_iter()
            .map(|(kind, availability)| (kind.as_str().to_string(), availability))
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// Reconnect replay cursor: deliver every persisted event with
    /// seq greater than this.
    pub from_seq: Option<u64>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<DaemonState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, project_id, query, state))
}

async fn handle_connection(
    socket: WebSocket,
    project_id: String,
    query: WsQuery,
    state: Arc<DaemonState>,
) {
    if let Some(expected) = &state.token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!(project = %project_id, "rejecting unauthenticated subscriber");
            close(socket, CLOSE_UNAUTHORIZED, "unauthorized").await;
            return;
        }
    }

    let handle = match state.orchestrator(&project_id).await {
        Ok(handle) => handle,
        Err(DaemonError::ProjectUnknown(_)) => {
            close(socket, CLOSE_PROJECT_UNKNOWN, "unknown project").await;
            return;
        }
        Err(e) => {
            debug!(project = %project_id, error = %e, "orchestrator unavailable");
            close(socket, CLOSE_NORMAL, "orchestrator unavailable").await;
            return;
        }
    };

    let mut sub = match handle.subscribe(query.from_seq).await {
        Ok(sub) => sub,
        Err(e) => {
            debug!(project = %project_id, error = %e, "subscribe failed");
            close(socket, CLOSE_NORMAL, "orchestrator unavailable").await;
            return;
        }
    };

    info!(project = %project_id, subscriber = sub.subscriber_id, "client subscribed");
    let (mut sender, mut receiver) = socket.split();

    let mut last_sent_seq: u64 = 0;
    let mut sent_any = false;
    for row in &sub.replay {
        if send_frame(&mut sender, row).await.is_err() {
            handle.unsubscribe(sub.subscriber_id);
            return;
        }
        last_sent_seq = row.seq;
        sent_any = true;
    }

    let mut idle_deadline = Instant::now() + KEEPALIVE_IDLE;
    let close_info: Option<(u16, &'static str)> = loop {
        tokio::select! {
            _ = sub.slow.cancelled() => {
                break Some((CLOSE_SLOW_CONSUMER, "slow_consumer"));
            }
            item = sub.rx.recv() => match item {
                Some(row) => {
                    if row.seq > last_sent_seq {
                        if send_frame(&mut sender, &row).await.is_err() {
                            break None;
                        }
                        last_sent_seq = row.seq;
                        sent_any = true;
                    }
                }
                None => {
                    // The sender is dropped right after the slow token
                    // fires; prefer the more specific close code.
                    if sub.slow.is_cancelled() {
                        break Some((CLOSE_SLOW_CONSUMER, "slow_consumer"));
                    }
                    break Some((CLOSE_NORMAL, "orchestrator stopped"));
                }
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    idle_deadline = Instant::now() + KEEPALIVE_IDLE;
                    if text.as_str() == KEEPALIVE_PING {
                        if sender
                            .send(Message::Text(KEEPALIVE_PONG.into()))
                            .await
                            .is_err()
                        {
                            break None;
                        }
                    } else if handle_frame(
                        text.as_str(),
                        &project_id,
                        &state,
                        &handle,
                        &mut sender,
                        &mut last_sent_seq,
                        &mut sent_any,
                    )
                    .await
                    .is_err()
                    {
                        break None;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    idle_deadline = Instant::now() + KEEPALIVE_IDLE;
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                    idle_deadline = Instant::now() + KEEPALIVE_IDLE;
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Err(e)) => {
                    debug!(project = %project_id, error = %e, "websocket error");
                    break None;
                }
            },
            _ = tokio::time::sleep_until(idle_deadline) => {
                break Some((CLOSE_NORMAL, "keepalive timeout"));
            }
        }
    };

    handle.unsubscribe(sub.subscriber_id);
    if let Some((code, reason)) = close_info {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
    info!(project = %project_id, "client disconnected");
}

/// Dispatch one JSON command frame. Command-level failures answer the
/// offending client with an `error{kind=protocol}` frame and leave other
/// subscribers untouched; `Err` means the socket itself is dead.
#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    text: &str,
    project_id: &str,
    state: &Arc<DaemonState>,
    handle: &OrchestratorHandle,
    sender: &mut SplitSink<WebSocket, Message>,
    last_sent_seq: &mut u64,
    sent_any: &mut bool,
) -> Result<(), axum::Error> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            return send_protocol_error(sender, format!("malformed frame: {e}")).await;
        }
    };

    match command {
        ClientCommand::Submit(request) => {
            if let Some(problem) = image_containment_error(project_id, state, &request).await {
                return send_protocol_error(sender, problem).await;
            }
            match handle.submit(request).await {
                Ok(request_id) => {
                    debug!(project = %project_id, request = %request_id, "submit accepted");
                    Ok(())
                }
                Err(e) => send_protocol_error(sender, e.to_string()).await,
            }
        }
        ClientCommand::Cancel { request_id } => match handle.cancel(&request_id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                send_protocol_error(sender, format!("request {request_id} not found")).await
            }
            Err(e) => send_protocol_error(sender, e.to_string()).await,
        },
        ClientCommand::SubscribeFromSeq { seq } => {
            // Before anything was delivered this is a full replay from
            // seq; afterwards only events this connection has not seen,
            // so per-connection seq order is preserved.
            let after = if *sent_any {
                seq.max(*last_sent_seq)
            } else {
                seq
            };
            match state.messages.list_since(project_id, after).await {
                Ok(rows) => {
                    for row in rows {
                        send_frame(sender, &row).await?;
                        *last_sent_seq = row.seq;
                        *sent_any = true;
                    }
                    Ok(())
                }
                Err(e) => send_protocol_error(sender, e.to_string()).await,
            }
        }
    }
}

/// Image attachments must already live inside the project workspace.
async fn image_containment_error(
    project_id: &str,
    state: &Arc<DaemonState>,
    request: &overture_events::SubmitRequest,
) -> Option<String> {
    if request.images.is_empty() {
        return None;
    }
    let project = state.projects.get(project_id).await?;
    for image in &request.images {
        let path = std::path::Path::new(&image.path);
        let contained = path.is_absolute()
            && path
                .components()
                .all(|c| !matches!(c, std::path::Component::ParentDir))
            && path.starts_with(&project.workspace);
        if !contained {
            return Some(format!(
                "image path escapes the project workspace: {}",
                image.path
            ));
        }
    }
    None
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    row: &StoredMessage,
) -> Result<(), axum::Error> {
    let frame = OutboundFrame::from_message(row);
    sender.send(Message::Text(frame.to_json().into())).await
}

async fn send_protocol_error(
    sender: &mut SplitSink<WebSocket, Message>,
    message: String,
) -> Result<(), axum::Error> {
    let frame = OutboundFrame::protocol_error(message);
    sender.send(Message::Text(frame.to_json().into())).await
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
