//! Socket pumps: each WebSocket gets a writer task draining the relay's
//! outbound channel and a reader loop feeding frames back to the relay actor.
//! The pumps never touch relay state directly.

use std::sync::atomic::Ordering;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use relay_core::{ClientFrameOut, ExtFrameOut, RelayHandle};
use tracing::debug;

pub async fn run_client_socket(relay: RelayHandle, client_id: String, mut socket: WebSocket) {
    let connection = match relay.client_connect(client_id.clone()).await {
        Ok(connection) => connection,
        Err(reject) => {
            debug!(target: "relay-server", %client_id, reason = %reject.reason, "client rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: reject.code,
                    reason: reject.reason.into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let client_key = connection.client_key;
    let mut outbound = connection.outbound;
    let queued_bytes = connection.queued_bytes;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                ClientFrameOut::Text(text) => {
                    let len = text.len();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                    queued_bytes.fetch_sub(len, Ordering::AcqRel);
                }
                ClientFrameOut::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => relay.client_text(client_key.clone(), text).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    relay.client_closed(client_key).await;
    writer.abort();
}

pub async fn run_extension_socket(relay: RelayHandle, socket: WebSocket) {
    let Some(connection) = relay.extension_connect().await else {
        return;
    };
    let conn = connection.conn;
    let mut outbound = connection.outbound;

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                ExtFrameOut::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                ExtFrameOut::Ping => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                ExtFrameOut::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => relay.extension_text(conn, text).await,
            Ok(Message::Binary(bytes)) => relay.extension_binary(conn, bytes).await,
            Ok(Message::Pong(_)) => relay.extension_pong(conn).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    relay.extension_closed(conn).await;
    writer.abort();
}
