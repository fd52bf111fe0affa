//! One tracked connection: the transport halves, the read loop pulling
//! successive request units, and the map of in-flight request tasks.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::http::{RequestError, RequestHead, Response, StatusCode};
use crate::respond;
use crate::server::dispatch::{handle_request, Dispatcher};
use crate::server::request::{ResponseSender, ServerRequest};
use crate::track::{lock, next_id, BoxTransport, Registry};
use crate::ws;

/// Maximum bytes buffered for a single request before it is rejected (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Finished responses waiting for their turn on the wire.
///
/// `order` holds request ids in admission order; `ready` holds responses of
/// handlers that have completed. A response goes out only when its id reaches
/// the queue front, so pipelined responses leave in request order however the
/// handlers interleave.
#[derive(Default)]
struct PendingResponses {
    order: VecDeque<u64>,
    ready: HashMap<u64, Response>,
}

/// Shared handle to one tracked connection.
///
/// The read loop owns the read half of the transport; the write half lives
/// here so that completed request tasks can flush responses, and so the
/// registry can force-close the transport by taking it away.
pub(crate) struct ConnHandle {
    id: u64,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxTransport>>>,
    requests: Mutex<HashMap<u64, JoinHandle<()>>>,
    responses: Mutex<PendingResponses>,
    next_request_id: AtomicU64,
    websocket: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl ConnHandle {
    pub(crate) fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            writer: tokio::sync::Mutex::new(None),
            requests: Mutex::new(HashMap::new()),
            responses: Mutex::new(PendingResponses::default()),
            next_request_id: AtomicU64::new(1),
            websocket: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        next_id(&self.next_request_id)
    }

    async fn attach_writer(&self, writer: WriteHalf<BoxTransport>) {
        *self.writer.lock().await = Some(writer);
    }

    async fn take_writer(&self) -> Option<WriteHalf<BoxTransport>> {
        self.writer.lock().await.take()
    }

    /// Reserves a response slot for a request. Called from the read loop in
    /// admission order, before the request's handler task can complete.
    pub(crate) fn queue_response_slot(&self, request_id: u64) {
        lock(&self.responses).order.push_back(request_id);
    }

    /// Stores a finished request's response and flushes every response now
    /// ready at the front of the admission-order queue.
    ///
    /// The writer lock is held for the whole flush, so concurrent completers
    /// cannot interleave their writes; whichever task holds the lock writes
    /// all responses that are due, in order. A write failure drops the write
    /// half and the remaining responses are logged as undeliverable.
    pub(crate) async fn submit_response(&self, request_id: u64, response: Response) {
        lock(&self.responses).ready.insert(request_id, response);

        let mut guard = self.writer.lock().await;
        loop {
            let next = {
                let mut pending = lock(&self.responses);
                match pending.order.front().copied() {
                    Some(front) => match pending.ready.remove(&front) {
                        Some(ready) => {
                            pending.order.pop_front();
                            Some((front, ready))
                        }
                        None => None,
                    },
                    None => None,
                }
            };
            let Some((id, ready)) = next else { break };

            let Some(writer) = guard.as_mut() else {
                debug!(
                    conn_id = self.id,
                    request_id = id,
                    "connection closed before response could be sent"
                );
                continue;
            };
            let bytes = ready.into_bytes();
            if let Err(e) = writer.write_all(&bytes).await {
                *guard = None;
                warn!(conn_id = self.id, request_id = id, error = %e, "failed to write response");
                continue;
            }
            if let Err(e) = writer.flush().await {
                *guard = None;
                warn!(conn_id = self.id, request_id = id, error = %e, "failed to write response");
            }
        }
    }

    /// Force-closes the transport's write side, best-effort.
    pub(crate) async fn close_transport(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(conn_id = self.id, error = %e, "transport shutdown failed");
            }
        }
    }

    fn track_request(&self, request_id: u64, handle: JoinHandle<()>) {
        lock(&self.requests).insert(request_id, handle);
    }

    pub(crate) fn untrack_request(&self, request_id: u64) {
        lock(&self.requests).remove(&request_id);
    }

    /// Returns `(active, running)` request counts: entries in the map, and
    /// entries whose task has not finished yet. `is_finished` is a
    /// non-consuming probe, so this never blocks or double-awaits.
    pub(crate) fn request_counts(&self) -> (usize, usize) {
        let requests = lock(&self.requests);
        let running = requests.values().filter(|h| !h.is_finished()).count();
        (requests.len(), running)
    }

    /// Waits for every in-flight request task, success or failure.
    ///
    /// Failures (panicked handler tasks) are logged, never propagated, so one
    /// misbehaving request cannot block the drain of the others.
    pub(crate) async fn settle_requests(&self) {
        let handles: Vec<(u64, JoinHandle<()>)> = lock(&self.requests).drain().collect();
        if handles.is_empty() {
            return;
        }
        let results = join_all(
            handles
                .into_iter()
                .map(|(request_id, handle)| async move { (request_id, handle.await) }),
        )
        .await;
        for (request_id, result) in results {
            if let Err(e) = result {
                warn!(
                    conn_id = self.id,
                    request_id,
                    error = %e,
                    "request task failed during drain"
                );
            }
        }
    }

    /// Binds the WebSocket session's outbound channel to this connection.
    /// At most one session per connection.
    pub(crate) fn bind_websocket(&self, sender: mpsc::UnboundedSender<Message>) {
        *lock(&self.websocket) = Some(sender);
    }

    pub(crate) fn clear_websocket(&self) {
        *lock(&self.websocket) = None;
    }

    pub(crate) fn websocket_sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        lock(&self.websocket)
            .as_ref()
            .filter(|sender| !sender.is_closed())
            .cloned()
    }

    pub(crate) fn has_websocket(&self) -> bool {
        self.websocket_sender().is_some()
    }
}

/// Why the read loop stopped.
enum ReadOutcome {
    /// End of stream, shutdown, or a fatal read/parse error.
    Closed,
    /// The peer requested the configured WebSocket upgrade path.
    Upgrade(RequestHead),
}

/// Runs one connection to completion: optional TLS handshake, the read loop,
/// an optional WebSocket session, then teardown.
///
/// Teardown order matters: remaining request tasks are settled before the
/// transport is closed, so responses for pipelined requests still go out
/// when the peer merely half-closed its side.
pub(crate) async fn run_conn(
    registry: Arc<Registry>,
    conn: Arc<ConnHandle>,
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
) {
    let mut shutdown = registry.shutdown_rx();

    let transport: BoxTransport = match tls {
        Some(acceptor) => {
            tokio::select! {
                handshake = acceptor.accept(stream) => match handshake {
                    Ok(tls_stream) => Box::new(tls_stream) as BoxTransport,
                    Err(e) => {
                        if !registry.is_closed() {
                            warn!(peer = %conn.peer(), error = %e, "TLS handshake failed");
                        }
                        registry.untrack(conn.id());
                        return;
                    }
                },
                _ = shutdown.wait_for(|closing| *closing) => {
                    registry.untrack(conn.id());
                    return;
                }
            }
        }
        None => Box::new(stream),
    };

    let (mut read_half, write_half) = tokio::io::split(transport);
    conn.attach_writer(write_half).await;

    let outcome = read_loop(&registry, &conn, &mut read_half, &dispatcher, &mut shutdown).await;

    if let ReadOutcome::Upgrade(head) = outcome {
        // responses for requests pipelined before the upgrade go out first
        conn.settle_requests().await;
        match conn.take_writer().await {
            Some(write_half) => {
                let stream = read_half.unsplit(write_half);
                ws::run_session(&registry, &conn, stream, &head, &dispatcher, &mut shutdown).await;
            }
            None => debug!(conn_id = conn.id(), "transport closed before websocket upgrade"),
        }
    }

    conn.settle_requests().await;
    conn.close_transport().await;
    registry.untrack(conn.id());
    debug!(conn_id = conn.id(), peer = %conn.peer(), "connection closed");
}

/// Pulls successive request units off the transport.
///
/// All complete requests already buffered are admitted before reading again,
/// and the loop never waits for a handler to finish before pulling the next
/// unit, which is what gives pipelined, concurrently handled requests per
/// connection.
async fn read_loop(
    registry: &Arc<Registry>,
    conn: &Arc<ConnHandle>,
    read_half: &mut ReadHalf<BoxTransport>,
    dispatcher: &Arc<Dispatcher>,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // admit everything already buffered
        while !buf.is_empty() {
            let (head, body_offset) = match RequestHead::parse(&buf) {
                Ok(parsed) => parsed,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "malformed request head");
                    let response = respond::bad_request("").keep_alive(false);
                    // queued behind any pipelined responses still in flight
                    let request_id = conn.next_request_id();
                    conn.queue_response_slot(request_id);
                    conn.submit_response(request_id, response).await;
                    return ReadOutcome::Closed;
                }
            };

            let content_length = head.content_length().unwrap_or(0);
            let total = body_offset + content_length;
            if buf.len() < total {
                break;
            }

            let frame = buf.split_to(total).freeze();
            let body = frame.slice(body_offset..);

            if dispatcher.is_websocket_path(head.path()) {
                return ReadOutcome::Upgrade(head);
            }

            let keep_alive = head.is_keep_alive();
            spawn_request(conn, dispatcher, head, body);
            if !keep_alive {
                return ReadOutcome::Closed;
            }
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(conn_id = conn.id(), "request too large");
            let response = Response::new(StatusCode::PayloadTooLarge).keep_alive(false);
            let request_id = conn.next_request_id();
            conn.queue_response_slot(request_id);
            conn.submit_response(request_id, response).await;
            return ReadOutcome::Closed;
        }

        let read = tokio::select! {
            read = read_half.read_buf(&mut buf) => read,
            _ = shutdown.wait_for(|closing| *closing) => return ReadOutcome::Closed,
        };

        match read {
            Ok(0) => {
                debug!(conn_id = conn.id(), "connection closed by peer");
                return ReadOutcome::Closed;
            }
            Ok(_) => {}
            Err(e) => {
                if !registry.is_closed() {
                    warn!(conn_id = conn.id(), error = %e, "connection read failed");
                }
                return ReadOutcome::Closed;
            }
        }
    }
}

/// Admits one request: spawns its handler task and records it in the
/// connection's active map.
///
/// The task first waits on the `tracked` signal so it cannot untrack itself
/// before it has been tracked, however fast the handler completes.
fn spawn_request(
    conn: &Arc<ConnHandle>,
    dispatcher: &Arc<Dispatcher>,
    head: RequestHead,
    body: Bytes,
) {
    let request_id = conn.next_request_id();
    conn.queue_response_slot(request_id);
    let request = ServerRequest::new(dispatcher.server().clone(), head, body);
    let sender = ResponseSender::new(
        Arc::clone(conn),
        request_id,
        request.method().clone(),
        request.path().to_owned(),
    );

    let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
    let task_conn = Arc::clone(conn);
    let task_dispatcher = Arc::clone(dispatcher);
    let handle = tokio::spawn(async move {
        let _ = tracked_rx.await;
        handle_request(task_dispatcher, request, sender).await;
        task_conn.untrack_request(request_id);
    });

    conn.track_request(request_id, handle);
    let _ = tracked_tx.send(());
}
