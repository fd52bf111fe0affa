//! The server facade: bind, run, observe, and close.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::tls;
use crate::track::{accept_loop, lock, Registry, ServerStatus};

pub(crate) mod dispatch;
pub(crate) mod request;

pub use request::ServerRequest;

use dispatch::Dispatcher;

/// Failure to bring a server up.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("no private key found in {path}")]
    NoPrivateKey { path: String },
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct Shared {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    closing: AtomicBool,
    done: watch::Sender<bool>,
    on_close: Mutex<Vec<CloseCallback>>,
}

/// A running server. Cheap to clone; all clones observe and control the same
/// underlying instance.
///
/// The server runs in background tasks from the moment [`bind`](Self::bind)
/// returns. [`close`](Self::close) stops accepting, disconnects every
/// connection, waits for in-flight request handlers, then runs close
/// callbacks. Dropping the last clone does NOT close the server; call
/// `close` explicitly.
///
/// # Examples
///
/// ```no_run
/// use quiesce::{Response, HttpConfig, Server, ServerConfig};
///
/// # async fn run() -> Result<(), quiesce::ServerError> {
/// let server = Server::bind(
///     ServerConfig::new("127.0.0.1:0")
///         .http(HttpConfig::new("/", |_req| async { Ok(Response::ok()) })),
/// )
/// .await?;
/// println!("listening on {}", server.local_addr());
/// server.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let acceptor = match &config.tls {
            Some(tls_config) => Some(tls::build_acceptor(tls_config)?),
            None => None,
        };

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(Registry::new());
        let (done, _) = watch::channel(false);
        let server = Server {
            shared: Arc::new(Shared {
                local_addr,
                registry: Arc::clone(&registry),
                closing: AtomicBool::new(false),
                done,
                on_close: Mutex::new(Vec::new()),
            }),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            config.files,
            config.http,
            config.websocket,
            config.root_redirect,
            server.clone(),
        ));

        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&registry),
            listener,
            acceptor,
            dispatcher,
        ));
        registry.set_accept_task(accept_task);

        info!(addr = %local_addr, tls = config.tls.is_some(), "server listening");
        Ok(server)
    }

    /// The address the listener is bound to. Useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// True once [`close`](Self::close) has been called on any clone.
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Point-in-time snapshot of listener, connection, and request activity.
    pub fn status(&self) -> ServerStatus {
        self.shared.registry.status()
    }

    /// Closes the server: stops accepting, disconnects every connection,
    /// waits for all in-flight request handlers, then runs close callbacks.
    ///
    /// Safe to call from multiple tasks: the first caller performs the
    /// shutdown, every other caller waits for it to finish.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            self.done().await;
            return;
        }

        info!(status = ?self.status(), "closing server");
        self.shared.registry.close().await;

        let callbacks: Vec<CloseCallback> = lock(&self.shared.on_close).drain(..).collect();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("close callback panicked");
            }
        }

        // send_replace stores the value even with no waiter subscribed, so
        // late done() callers and repeat close() callers still resolve
        self.shared.done.send_replace(true);
        info!("server closed");
    }

    /// Resolves once the server has fully closed. Never resolves if nobody
    /// calls [`close`](Self::close).
    pub async fn done(&self) {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Registers a callback to run after the drain completes, before
    /// [`done`](Self::done) resolves. Callbacks registered after `close` has
    /// begun may not run.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.shared.on_close).push(Box::new(callback));
    }

    /// Sends a text frame to every live WebSocket session. No-op once the
    /// server is closing.
    pub fn broadcast_text(&self, text: impl Into<String>) {
        if self.is_closing() {
            debug!("broadcast skipped, server is closing");
            return;
        }
        self.shared.registry.broadcast(Message::text(text.into()));
    }

    /// Serializes `value` as JSON and sends it to every live WebSocket
    /// session. Serialization failures are logged and dropped.
    pub fn broadcast_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(text) => self.broadcast_text(text),
            Err(e) => error!(error = %e, "failed to serialize broadcast payload"),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}
