//! The request view handed to handlers, and the single-use response channel
//! each request task writes through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::http::{Headers, Method, RequestHead, Response};
use crate::server::Server;
use crate::track::conn::ConnHandle;

/// A parsed request with its body, as seen by an HTTP handler.
///
/// Carries a handle back to the owning [`Server`], so handlers can broadcast
/// or inspect [`status`](Server::status) without capturing the server in
/// their closure.
pub struct ServerRequest {
    server: Server,
    head: RequestHead,
    body: Bytes,
}

impl ServerRequest {
    pub(crate) fn new(server: Server, head: RequestHead, body: Bytes) -> Self {
        Self { server, head, body }
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    /// Request path, without the query string.
    pub fn path(&self) -> &str {
        self.head.path()
    }

    /// Raw query string, without the leading `?`. Empty when absent.
    pub fn query(&self) -> &str {
        self.head.query().unwrap_or("")
    }

    pub fn headers(&self) -> &Headers {
        self.head.headers()
    }

    /// Raw request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The server this request arrived on.
    pub fn server(&self) -> &Server {
        &self.server
    }
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", self.method())
            .field("path", &self.path())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Single-use response channel for one request task.
///
/// A second send on the same request is a bug in the dispatch path; it is
/// logged and dropped rather than corrupting the connection's byte stream.
pub(crate) struct ResponseSender {
    conn: Arc<ConnHandle>,
    request_id: u64,
    method: Method,
    path: String,
    sent: AtomicBool,
}

impl ResponseSender {
    pub(crate) fn new(conn: Arc<ConnHandle>, request_id: u64, method: Method, path: String) -> Self {
        Self {
            conn,
            request_id,
            method,
            path,
            sent: AtomicBool::new(false),
        }
    }

    pub(crate) async fn send(&self, response: Response) {
        if self.sent.swap(true, Ordering::SeqCst) {
            warn!(
                conn_id = self.conn.id(),
                request_id = self.request_id,
                method = %self.method,
                path = %self.path,
                "duplicate response dropped"
            );
            return;
        }
        // write failures and closed connections are logged at the flush site
        self.conn.submit_response(self.request_id, response).await;
    }
}
