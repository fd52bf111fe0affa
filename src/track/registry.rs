//! Top-level bookkeeping: the accept loop, the map of live connections, and
//! the ordered drain that `Server::close` relies on.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::server::dispatch::Dispatcher;
use crate::track::conn::{run_conn, ConnHandle};
use crate::track::{lock, next_id};

/// Point-in-time view of server activity, taken under the registry lock.
///
/// Task-level fields probe `JoinHandle::is_finished`, so a task that has
/// completed but not yet been removed from its map shows up in the entry
/// count and not in the running count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// The registry is still accepting new connections.
    pub listener_active: bool,
    /// The accept-loop task itself has not finished.
    pub listener_task_active: bool,
    /// Connections currently tracked.
    pub active_connections: usize,
    /// Tracked connections with a live WebSocket session.
    pub active_websockets: usize,
    /// Request entries tracked across all connections.
    pub active_requests: usize,
    /// Request tasks that have not finished yet.
    pub active_request_tasks_running: usize,
}

struct ConnEntry {
    conn: Arc<ConnHandle>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    closed: bool,
    accept_task: Option<JoinHandle<()>>,
    conns: HashMap<u64, ConnEntry>,
}

/// Registry of every live connection, shared between the accept loop, the
/// connection tasks, and the server facade.
pub(crate) struct Registry {
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                closed: false,
                accept_task: None,
                conns: HashMap::new(),
            }),
            shutdown,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        next_id(&self.next_conn_id)
    }

    pub(crate) fn set_accept_task(&self, task: JoinHandle<()>) {
        lock(&self.inner).accept_task = Some(task);
    }

    /// Subscribes to the shutdown signal; resolves true once closing begins.
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Tracks a new connection and its task. Returns false when the registry
    /// has already closed; the caller must let the task terminate itself.
    pub(crate) fn admit(&self, conn: Arc<ConnHandle>, task: JoinHandle<()>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return false;
        }
        inner.conns.insert(
            conn.id(),
            ConnEntry {
                conn,
                task: Some(task),
            },
        );
        true
    }

    pub(crate) fn untrack(&self, conn_id: u64) {
        lock(&self.inner).conns.remove(&conn_id);
    }

    /// Closes the listener and drains every tracked connection.
    ///
    /// The sequence: mark closed and take every task handle under the lock,
    /// signal shutdown, force-close every transport, then await each
    /// connection's requests and its task. Idempotent at the registry level
    /// because the second caller finds `closed` already set and nothing left
    /// to take.
    pub(crate) async fn close(&self) {
        let (conns, accept_task) = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            let conns: Vec<(Arc<ConnHandle>, Option<JoinHandle<()>>)> = inner
                .conns
                .values_mut()
                .map(|entry| (Arc::clone(&entry.conn), entry.task.take()))
                .collect();
            (conns, inner.accept_task.take())
        };

        // send_replace stores the value even when no receiver is subscribed
        // yet, so an accept loop that has not been polled still sees it
        self.shutdown.send_replace(true);

        for (conn, _) in &conns {
            conn.close_transport().await;
        }

        let drains = conns.into_iter().map(|(conn, task)| async move {
            conn.settle_requests().await;
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(conn_id = conn.id(), error = %e, "connection task failed during drain");
                }
            }
        });
        join_all(drains).await;

        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop task failed during drain");
            }
        }
    }

    /// Snapshot of current activity, taken under one brief lock.
    pub(crate) fn status(&self) -> ServerStatus {
        let inner = lock(&self.inner);
        let listener_task_active = inner
            .accept_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);

        let mut active_websockets = 0;
        let mut active_requests = 0;
        let mut active_request_tasks_running = 0;
        for entry in inner.conns.values() {
            if entry.conn.has_websocket() {
                active_websockets += 1;
            }
            let (total, running) = entry.conn.request_counts();
            active_requests += total;
            active_request_tasks_running += running;
        }

        ServerStatus {
            listener_active: !inner.closed,
            listener_task_active,
            active_connections: inner.conns.len(),
            active_websockets,
            active_requests,
            active_request_tasks_running,
        }
    }

    /// Queues `message` to every live WebSocket session.
    ///
    /// Senders are collected under the lock and used after releasing it. A
    /// send failure means the session ended concurrently; it is logged and
    /// skipped.
    pub(crate) fn broadcast(&self, message: Message) {
        let senders: Vec<(u64, tokio::sync::mpsc::UnboundedSender<Message>)> = {
            let inner = lock(&self.inner);
            inner
                .conns
                .values()
                .filter_map(|entry| {
                    entry
                        .conn
                        .websocket_sender()
                        .map(|sender| (entry.conn.id(), sender))
                })
                .collect()
        };

        for (conn_id, sender) in senders {
            if sender.send(message.clone()).is_err() {
                debug!(conn_id, "websocket session ended before broadcast delivery");
            }
        }
    }
}

/// Accepts connections until the shutdown signal fires.
///
/// Each accepted stream gets its own `ConnHandle` and task. The task waits on
/// a ready signal before running, so it cannot untrack itself from the
/// registry before `admit` has tracked it. When `admit` refuses (the registry
/// closed concurrently), dropping the ready sender terminates the task.
pub(crate) async fn accept_loop(
    registry: Arc<Registry>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
) {
    let mut shutdown = registry.shutdown_rx();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait_for(|closing| *closing) => break,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if registry.is_closed() {
                    break;
                }
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let conn = Arc::new(ConnHandle::new(registry.next_conn_id(), peer));
        debug!(conn_id = conn.id(), peer = %peer, "connection accepted");

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let task_registry = Arc::clone(&registry);
        let task_conn = Arc::clone(&conn);
        let task_tls = tls.clone();
        let task_dispatcher = Arc::clone(&dispatcher);
        let task = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                // registry closed before this connection was admitted
                return;
            }
            run_conn(task_registry, task_conn, stream, task_tls, task_dispatcher).await;
        });

        if registry.admit(Arc::clone(&conn), task) {
            let _ = ready_tx.send(());
        }
    }
}
