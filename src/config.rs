//! Server configuration: listen address, TLS material, and the optional
//! file-serving, HTTP-handler, WebSocket, and root-redirect collaborators.
//!
//! Everything is immutable once [`crate::Server::bind`] has consumed it.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::http::Response;
use crate::server::request::ServerRequest;
use crate::ws::{WsMessage, WsSocket};

/// Boxed error type carried from handlers to the request-task boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send>>;

/// Type-erased async HTTP handler.
pub(crate) type HttpHandler = Arc<dyn Fn(ServerRequest) -> HandlerFuture + Send + Sync>;

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) type OpenCallback = Arc<dyn Fn(WsSocket) -> CallbackFuture + Send + Sync>;
pub(crate) type MessageCallback = Arc<dyn Fn(WsSocket, WsMessage) -> CallbackFuture + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(WsSocket, String) -> CallbackFuture + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(WsSocket) -> CallbackFuture + Send + Sync>;

/// Top-level server configuration.
///
/// Only the listen address is required; every collaborator is optional.
///
/// # Examples
///
/// ```no_run
/// use quiesce::{HttpConfig, Response, ServerConfig};
///
/// let config = ServerConfig::new("127.0.0.1:8080")
///     .root_redirect("/app/")
///     .http(HttpConfig::new("/api", |_req| async {
///         Ok(Response::ok().body("hello"))
///     }));
/// ```
pub struct ServerConfig {
    pub(crate) listen: String,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) files: Option<FilesConfig>,
    pub(crate) http: Option<HttpConfig>,
    pub(crate) websocket: Option<WebSocketConfig>,
    pub(crate) root_redirect: Option<String>,
}

impl ServerConfig {
    /// Creates a configuration listening on `addr` (e.g. `"127.0.0.1:8080"`).
    ///
    /// Port 0 selects an ephemeral port; see [`crate::Server::local_addr`].
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            listen: addr.into(),
            tls: None,
            files: None,
            http: None,
            websocket: None,
            root_redirect: None,
        }
    }

    /// Enables the TLS listener variant with PEM certificate material.
    #[must_use]
    pub fn tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Enables static file serving under a path prefix.
    #[must_use]
    pub fn files(mut self, files: FilesConfig) -> Self {
        self.files = Some(files);
        self
    }

    /// Enables the generic HTTP handler under a path prefix.
    #[must_use]
    pub fn http(mut self, http: HttpConfig) -> Self {
        self.http = Some(http);
        self
    }

    /// Enables the WebSocket endpoint.
    #[must_use]
    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = Some(websocket);
        self
    }

    /// Redirects exact requests for `/` to `location` with a 302.
    #[must_use]
    pub fn root_redirect(mut self, location: impl Into<String>) -> Self {
        self.root_redirect = Some(location.into());
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("tls", &self.tls)
            .field("files", &self.files)
            .field("http", &self.http)
            .field("websocket", &self.websocket)
            .field("root_redirect", &self.root_redirect)
            .finish()
    }
}

/// PEM certificate material for the TLS listener variant.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub(crate) cert_path: PathBuf,
    pub(crate) key_path: PathBuf,
}

/// Static file serving configuration.
#[derive(Debug, Clone)]
pub struct FilesConfig {
    pub(crate) path: String,
    pub(crate) root_dir: PathBuf,
    pub(crate) dir_listing: bool,
}

impl FilesConfig {
    /// Serves files from `root_dir` for requests under the `path` prefix.
    pub fn new(path: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root_dir: root_dir.into(),
            dir_listing: false,
        }
    }

    /// Enables HTML directory listings for directories without an `index.html`.
    #[must_use]
    pub fn dir_listing(mut self, enabled: bool) -> Self {
        self.dir_listing = enabled;
        self
    }
}

/// Generic HTTP handler configuration: a path prefix and an async handler.
pub struct HttpConfig {
    pub(crate) path: String,
    pub(crate) handler: HttpHandler,
}

impl HttpConfig {
    /// Dispatches requests under the `path` prefix to `handler`.
    ///
    /// The handler returns `Ok(Response)` or any boxed error; errors are
    /// mapped to a 500 JSON envelope at the request-task boundary.
    pub fn new<F, Fut>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ServerRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
    {
        Self {
            path: path.into(),
            handler: Arc::new(move |req| Box::pin(handler(req))),
        }
    }
}

impl fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConfig").field("path", &self.path).finish_non_exhaustive()
    }
}

/// WebSocket endpoint configuration: an exact path and optional callbacks.
///
/// Callbacks on one socket are invoked sequentially from that socket's
/// session task; callbacks for different sockets run independently.
pub struct WebSocketConfig {
    pub(crate) path: String,
    pub(crate) on_open: Option<OpenCallback>,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

impl WebSocketConfig {
    /// Upgrades connections requesting exactly `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            on_open: None,
            on_message: None,
            on_error: None,
            on_close: None,
        }
    }

    /// Called once when a session opens.
    #[must_use]
    pub fn on_open<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(WsSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_open = Some(Arc::new(move |socket| Box::pin(callback(socket))));
        self
    }

    /// Called for every text or binary message received.
    #[must_use]
    pub fn on_message<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(WsSocket, WsMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message = Some(Arc::new(move |socket, msg| Box::pin(callback(socket, msg))));
        self
    }

    /// Called when the session fails with a protocol or transport error.
    #[must_use]
    pub fn on_error<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(WsSocket, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |socket, err| Box::pin(callback(socket, err))));
        self
    }

    /// Called once when the session ends, whatever the reason.
    #[must_use]
    pub fn on_close<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(WsSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |socket| Box::pin(callback(socket))));
        self
    }
}

impl fmt::Debug for WebSocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConfig").field("path", &self.path).finish_non_exhaustive()
    }
}
