//! WebSocket transport for one registered connection.
//!
//! The socket is split: a writer task drains the connection's outbound queue
//! onto the sink, and the read loop feeds frames to
//! [`ConnectionManager::handle_inbound`]. Both stop on the connection's
//! cancel token. On cancel the writer flushes what is already queued, then
//! sends a close frame carrying the close reason.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tether_core::ConnectionId;
use tether_protocol::{CloseReason, Message};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::manager::{ConnectionManager, Registration};

/// How long to wait for the writer to flush and close after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Event name of the first message on every connection.
pub const ESTABLISHED_EVENT: &str = "connection.established";

/// Serve one upgraded socket until it closes.
#[instrument(skip_all, fields(connection_id = %registration.connection.id))]
pub async fn run_ws_session(
    socket: WebSocket,
    registration: Registration,
    manager: Arc<ConnectionManager>,
) {
    let Registration {
        connection,
        outbound,
        resume_token,
        resumed,
        state,
    } = registration;
    let id = connection.id.clone();
    let (sink, mut stream) = socket.split();

    let established = Message::notification(
        ESTABLISHED_EVENT,
        json!({
            "connection_id": id,
            "session_id": connection.session_id(),
            "resume_token": resume_token,
            "resumed": resumed,
            "state": state,
        }),
    );
    if let Err(e) = manager.send(&id, &established).await {
        debug!(error = %e, "established notice not queued");
    }

    let writer = tokio::spawn(write_loop(sink, outbound, Arc::clone(&connection)));

    let cancel = connection.cancel_token().clone();
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                break connection.close_reason().unwrap_or(CloseReason::ServerShutdown);
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => inbound(&manager, &id, text.as_bytes()).await,
                Some(Ok(WsMessage::Binary(bytes))) => inbound(&manager, &id, &bytes).await,
                Some(Ok(WsMessage::Pong(_))) => manager.on_pong(&id),
                // axum answers transport pings itself
                Some(Ok(WsMessage::Ping(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(f) if f.code != CloseReason::Normal.close_code() => CloseReason::GoingAway,
                        _ => CloseReason::Normal,
                    };
                }
                Some(Err(e)) => {
                    debug!(error = %e, "socket read failed");
                    break CloseReason::GoingAway;
                }
                None => break CloseReason::GoingAway,
            }
        }
    };

    // no-op when the manager already closed the connection
    let _ = manager.disconnect(&id, reason).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("writer did not finish in {WRITER_DRAIN_TIMEOUT:?}");
    }
}

async fn inbound(manager: &ConnectionManager, id: &ConnectionId, bytes: &[u8]) {
    match manager.handle_inbound(id, bytes).await {
        Ok(Some(message)) => {
            debug!(message_type = message.message_type.as_str(), "application message");
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "inbound frame not handled"),
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    connection: Arc<Connection>,
) {
    let cancel = connection.cancel_token().clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(text) => {
                    if sink.send(text_frame(&text)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // flush what was queued before the close, nothing after
    outbound.close();
    while let Some(text) = outbound.recv().await {
        if sink.send(text_frame(&text)).await.is_err() {
            return;
        }
    }

    let reason = connection
        .close_reason()
        .unwrap_or(CloseReason::ServerShutdown);
    let frame = CloseFrame {
        code: reason.close_code(),
        reason: close_text(reason).into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
    let _ = sink.close().await;
}

fn text_frame(text: &str) -> WsMessage {
    WsMessage::Text(text.into())
}

/// Close frame text: `REASON_CODE: description`.
pub fn close_text(reason: CloseReason) -> String {
    format!("{}: {}", reason.as_str(), reason.description())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_text_leads_with_reason_code() {
        let text = close_text(CloseReason::HeartbeatTimeout);
        assert!(text.starts_with("HEARTBEAT_TIMEOUT: "));
        // must fit a control frame
        for reason in CloseReason::ALL {
            assert!(close_text(reason).len() <= 123);
        }
    }
}
