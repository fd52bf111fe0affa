//! An embeddable HTTP and WebSocket server built around graceful shutdown.
//!
//! The crate serves three kinds of traffic under one listener, plain TCP or
//! TLS: static files under a path prefix, a generic async HTTP handler under
//! a path prefix, and a WebSocket endpoint with lifecycle callbacks and
//! server-wide broadcast. What distinguishes it is the lifecycle guarantee:
//! [`Server::close`] stops accepting, disconnects every connection, and
//! waits for every in-flight request handler before it resolves, so an
//! embedding application can shut down without leaking tasks or cutting off
//! responses mid-write.
//!
//! [`Server::status`] exposes a live snapshot of listener, connection,
//! WebSocket, and request activity at every level of that hierarchy.
//!
//! # Quick start
//!
//! ```no_run
//! use quiesce::{HttpConfig, Response, Server, ServerConfig, WebSocketConfig};
//!
//! # async fn run() -> Result<(), quiesce::ServerError> {
//! let config = ServerConfig::new("127.0.0.1:8080")
//!     .http(HttpConfig::new("/api", |req| async move {
//!         let name = req.text().unwrap_or("world").to_owned();
//!         Ok(Response::ok().body(format!("hello, {name}")))
//!     }))
//!     .websocket(WebSocketConfig::new("/ws").on_message(|socket, msg| async move {
//!         if let quiesce::WsMessage::Text(text) = msg {
//!             let _ = socket.send_text(text);
//!         }
//!     }));
//!
//! let server = Server::bind(config).await?;
//! server.broadcast_text("server is up");
//! server.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod http;
pub mod server;

mod files;
mod respond;
mod tls;
mod track;
mod ws;

pub use config::{BoxError, FilesConfig, HttpConfig, ServerConfig, TlsConfig, WebSocketConfig};
pub use http::{Headers, Method, Response, StatusCode};
pub use server::{Server, ServerError, ServerRequest};
pub use track::ServerStatus;
pub use ws::{WsMessage, WsSendError, WsSocket};
