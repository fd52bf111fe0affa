//! Request routing and the request-task boundary.
//!
//! Routing precedence: file prefix, then HTTP handler prefix, then the exact
//! root redirect, then 404. The WebSocket path never reaches here; the read
//! loop intercepts it before admitting a request.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error};

use crate::config::{FilesConfig, HttpConfig, WebSocketConfig};
use crate::files;
use crate::http::Response;
use crate::respond;
use crate::server::request::{ResponseSender, ServerRequest};
use crate::server::Server;

/// Immutable routing table built once at bind time.
pub(crate) struct Dispatcher {
    files: Option<FilesConfig>,
    http: Option<HttpConfig>,
    websocket: Option<WebSocketConfig>,
    root_redirect: Option<String>,
    server: Server,
}

impl Dispatcher {
    pub(crate) fn new(
        files: Option<FilesConfig>,
        http: Option<HttpConfig>,
        websocket: Option<WebSocketConfig>,
        root_redirect: Option<String>,
        server: Server,
    ) -> Self {
        Self {
            files,
            http,
            websocket,
            root_redirect,
            server,
        }
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    /// True when `path` is exactly the configured WebSocket endpoint.
    pub(crate) fn is_websocket_path(&self, path: &str) -> bool {
        match &self.websocket {
            Some(ws) => ws.path == path,
            None => false,
        }
    }

    pub(crate) fn websocket(&self) -> Option<&WebSocketConfig> {
        self.websocket.as_ref()
    }

    async fn route(&self, request: ServerRequest) -> Response {
        let path = request.path().to_owned();

        if let Some(files) = &self.files {
            if path.starts_with(&files.path) {
                return files::handle(files, &path).await;
            }
        }

        if let Some(http) = &self.http {
            if path.starts_with(&http.path) {
                return match (http.handler)(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!(path = %path, error = %e, "request handler failed");
                        respond::server_error()
                    }
                };
            }
        }

        if path == "/" {
            if let Some(location) = &self.root_redirect {
                return respond::redirect(location);
            }
        }

        respond::not_found(&path)
    }
}

/// Runs one request to completion and sends exactly one response.
///
/// A panicking handler is contained here: the panic is logged and mapped to
/// the generic 500 envelope, and the connection stays usable.
pub(crate) async fn handle_request(
    dispatcher: Arc<Dispatcher>,
    request: ServerRequest,
    sender: ResponseSender,
) {
    let method = request.method().clone();
    let path = request.path().to_owned();
    debug!(method = %method, path = %path, "dispatching request");

    let response = match AssertUnwindSafe(dispatcher.route(request)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!(method = %method, path = %path, "request handler panicked");
            respond::server_error()
        }
    };

    sender.send(response).await;
}
