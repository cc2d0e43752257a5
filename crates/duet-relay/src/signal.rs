//! WebSocket signaling endpoint: one socket per identity, frames routed by `target_id`.

use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duet_common::helpers::{is_valid_identity, unix_timestamp};
use duet_common::relay_errors::{INVALID_MESSAGE, SEND_FAILED, TARGET_NOT_CONNECTED, VALIDATION_ERROR};
use duet_common::{SignalMessage, SignalType, CLOSE_POLICY_VIOLATION};

use crate::state::RelayState;

const WS_OUTBOX_CAPACITY: usize = 128;

pub(crate) fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Ping,
    Relay {
        kind: String,
        target_id: String,
        payload: Value,
    },
}

/// Decode a text frame. The error is the reply to send back.
///
/// `type` is kept as the raw string so kinds this relay does not know are
/// still forwarded untouched.
pub(crate) fn parse_inbound(text: &str) -> Result<Inbound, SignalMessage> {
    let mut object: Map<String, Value> = match serde_json::from_str(text) {
        Ok(Value::Object(object)) => object,
        Ok(_) => {
            return Err(SignalMessage::relay_error(
                INVALID_MESSAGE,
                "message must be a JSON object",
            ))
        }
        Err(e) => {
            return Err(SignalMessage::relay_error(
                INVALID_MESSAGE,
                format!("invalid JSON: {e}"),
            ))
        }
    };

    let kind = match object.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => kind.to_string(),
        _ => {
            return Err(SignalMessage::relay_error(
                VALIDATION_ERROR,
                "message type is required",
            ))
        }
    };
    if kind == SignalType::Ping.as_str() {
        return Ok(Inbound::Ping);
    }

    let target_id = match object.get("target_id").and_then(Value::as_str) {
        Some(target) if !target.trim().is_empty() => target.trim().to_string(),
        _ => {
            return Err(SignalMessage::relay_error(
                VALIDATION_ERROR,
                "target_id is required",
            ))
        }
    };

    let payload = object
        .remove("payload")
        .filter(|p| !p.is_null())
        .or_else(|| object.remove("data").filter(|d| !d.is_null()))
        .unwrap_or_else(|| Value::Object(Map::new()));

    Ok(Inbound::Relay {
        kind,
        target_id,
        payload,
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: String, state: RelayState) {
    let user_id = user_id.trim().to_string();
    let (mut sender, mut receiver) = socket.split();

    if !is_valid_identity(&user_id) {
        warn!("rejecting signaling connection with invalid user id {:?}", user_id);
        state.metrics.record_error();
        let _ = sender
            .send(close_message(CLOSE_POLICY_VIOLATION, "Invalid user ID"))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let conn_id = state.register(&user_id, tx.clone()).await;
    info!("{} connected ({})", user_id, conn_id);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("socket error for {}: {}", user_id, e);
                        break;
                    }
                    None => break,
                };
                state.touch(&user_id, conn_id).await;

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        state.metrics.record_error();
                        reply(
                            &tx,
                            &SignalMessage::relay_error(INVALID_MESSAGE, "binary frames are not supported"),
                        )
                        .await;
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > state.config.max_message_bytes {
                    state.metrics.record_error();
                    reply(
                        &tx,
                        &SignalMessage::relay_error(INVALID_MESSAGE, "message too large"),
                    )
                    .await;
                    continue;
                }

                handle_text(&state, &user_id, &tx, &text).await;
            }
        }
    }

    if state.unregister(&user_id, conn_id).await {
        info!("{} disconnected", user_id);
    } else {
        debug!("{} connection {} closed after replacement", user_id, conn_id);
    }
}

async fn handle_text(state: &RelayState, user_id: &str, tx: &mpsc::Sender<Message>, text: &str) {
    match parse_inbound(text) {
        Ok(Inbound::Ping) => {
            let pong = SignalMessage::new(SignalType::Pong).with_timestamp(unix_timestamp());
            reply(tx, &pong).await;
        }
        Ok(Inbound::Relay {
            kind,
            target_id,
            payload,
        }) => relay_message(state, user_id, tx, kind, target_id, payload).await,
        Err(error) => {
            state.metrics.record_error();
            debug!("rejecting frame from {}: {:?}", user_id, error.message);
            reply(tx, &error.from_sender(user_id).with_timestamp(unix_timestamp())).await;
        }
    }
}

async fn relay_message(
    state: &RelayState,
    user_id: &str,
    tx: &mpsc::Sender<Message>,
    kind: String,
    target_id: String,
    payload: Value,
) {
    let Some(target_tx) = state.sender_for(&target_id).await else {
        state.metrics.record_error();
        debug!("{} -> {} dropped: target offline", user_id, target_id);
        let mut error = SignalMessage::relay_error(
            TARGET_NOT_CONNECTED,
            format!("User {target_id} is not connected"),
        )
        .from_sender(user_id)
        .to(target_id.as_str())
        .with_timestamp(unix_timestamp());
        error.available_users = Some(state.connected_users().await);
        reply(tx, &error).await;
        return;
    };

    let envelope = json!({
        "type": kind,
        "sender_id": user_id,
        "target_id": target_id,
        "timestamp": unix_timestamp(),
        "payload": payload,
    });
    if let Err(e) = target_tx.try_send(Message::Text(envelope.to_string())) {
        state.metrics.record_error();
        warn!("failed to deliver {} from {} to {}: {}", kind, user_id, target_id, e);
        let error = SignalMessage::relay_error(SEND_FAILED, format!("Failed to send message: {e}"))
            .from_sender(user_id)
            .to(target_id.as_str())
            .with_timestamp(unix_timestamp());
        reply(tx, &error).await;
        return;
    }

    state.metrics.record_relayed();
    debug!("relayed {} {} -> {}", kind, user_id, target_id);

    if kind == SignalType::Offer.as_str() {
        let mut ack = SignalMessage::new(SignalType::OfferSent)
            .to(target_id)
            .with_timestamp(unix_timestamp());
        ack.status = Some("delivered".to_string());
        reply(tx, &ack).await;
    } else if kind == SignalType::CallRequest.as_str() {
        info!("call request from {} to {}", user_id, target_id);
    }
}

async fn reply(tx: &mpsc::Sender<Message>, msg: &SignalMessage) -> bool {
    match msg.to_json() {
        Ok(text) => tx.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("failed to encode relay reply: {}", e);
            false
        }
    }
}
