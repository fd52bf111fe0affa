//! WebSocket upgrade and session handling.
//!
//! The read loop hands the reunited transport here once a request targets the
//! configured WebSocket path. The session task owns the protocol stream;
//! outbound frames from [`WsSocket`] handles and server broadcasts arrive
//! through an unbounded channel, so senders never block on a slow peer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::http::RequestHead;
use crate::respond;
use crate::server::dispatch::Dispatcher;
use crate::track::conn::ConnHandle;
use crate::track::{BoxTransport, Registry};

/// A message received from a WebSocket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Sending on a session that has already ended.
#[derive(Debug, Error)]
#[error("websocket session closed")]
pub struct WsSendError;

/// Handle to one live WebSocket session.
///
/// Cheap to clone and usable from any task; sends queue a frame for the
/// session task to deliver, so they never block.
#[derive(Clone)]
pub struct WsSocket {
    conn_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

impl WsSocket {
    /// Identifier of the connection carrying this session. Stable for the
    /// session's lifetime; useful as a map key in callbacks.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queues a text frame for delivery.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsSendError> {
        self.sender
            .send(Message::text(text.into()))
            .map_err(|_| WsSendError)
    }

    /// Serializes `value` as JSON and queues it as a text frame.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), WsSendError> {
        let text = serde_json::to_string(value).map_err(|e| {
            error!(conn_id = self.conn_id, error = %e, "failed to serialize websocket payload");
            WsSendError
        })?;
        self.send_text(text)
    }

    /// Queues a close frame; the session ends after it is delivered.
    pub fn close(&self) -> Result<(), WsSendError> {
        self.sender
            .send(Message::Close(None))
            .map_err(|_| WsSendError)
    }
}

impl std::fmt::Debug for WsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSocket")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

/// Validates the upgrade request and runs the session to completion.
///
/// An invalid upgrade gets a 400 and closes the connection. On shutdown the
/// session sends a close frame before ending, so peers see a clean close
/// rather than a dropped transport.
pub(crate) async fn run_session(
    registry: &Arc<Registry>,
    conn: &Arc<ConnHandle>,
    mut stream: BoxTransport,
    head: &RequestHead,
    dispatcher: &Arc<Dispatcher>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let Some(config) = dispatcher.websocket() else {
        return;
    };

    let key = match upgrade_key(head) {
        Some(key) => key,
        None => {
            warn!(conn_id = conn.id(), path = %head.path(), "invalid websocket upgrade request");
            let response = respond::bad_request(head.path()).keep_alive(false);
            if let Err(e) = stream.write_all(&response.into_bytes()).await {
                debug!(conn_id = conn.id(), error = %e, "failed to send upgrade rejection");
            }
            return;
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let handshake = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    if let Err(e) = stream.write_all(handshake.as_bytes()).await {
        warn!(conn_id = conn.id(), error = %e, "failed to send websocket handshake");
        return;
    }

    let ws_stream = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    let (mut sink, mut source) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    conn.bind_websocket(tx.clone());
    let socket = WsSocket {
        conn_id: conn.id(),
        sender: tx,
    };

    info!(conn_id = conn.id(), peer = %conn.peer(), "websocket session opened");
    if let Some(callback) = &config.on_open {
        call_guarded(conn.id(), "on_open", callback(socket.clone())).await;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    let is_close = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        if !registry.is_closed() {
                            debug!(conn_id = conn.id(), error = %e, "websocket send failed");
                        }
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(callback) = &config.on_message {
                        let msg = WsMessage::Text(text.as_str().to_owned());
                        call_guarded(conn.id(), "on_message", callback(socket.clone(), msg)).await;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(callback) = &config.on_message {
                        let msg = WsMessage::Binary(data.to_vec());
                        call_guarded(conn.id(), "on_message", callback(socket.clone(), msg)).await;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    if !registry.is_closed() {
                        warn!(conn_id = conn.id(), error = %e, "websocket protocol error");
                        if let Some(callback) = &config.on_error {
                            call_guarded(conn.id(), "on_error", callback(socket.clone(), e.to_string())).await;
                        }
                    }
                    break;
                }
            },
            // discard the watch Ref before awaiting so the session future stays Send
            _ = async { let _ = shutdown.wait_for(|closing| *closing).await; } => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    conn.clear_websocket();
    if let Some(callback) = &config.on_close {
        call_guarded(conn.id(), "on_close", callback(socket.clone())).await;
    }
    let _ = sink.close().await;
    info!(conn_id = conn.id(), "websocket session closed");
}

fn upgrade_key(head: &RequestHead) -> Option<String> {
    let upgrade = head.headers().get("upgrade")?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    head.headers()
        .get("sec-websocket-key")
        .map(|key| key.trim().to_owned())
}

/// Runs a user callback, containing any panic so the session (and the drain
/// that waits on it) survives.
async fn call_guarded<F>(conn_id: u64, name: &str, fut: F)
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!(conn_id, callback = name, "websocket callback panicked");
    }
}
