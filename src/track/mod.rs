//! Concurrent bookkeeping across the three nested lifetimes of the server:
//! listener → connection → request.
//!
//! [`Registry`] owns the accept loop and the map of live connections; each
//! [`conn::ConnHandle`] owns its read loop and the map of its in-flight request
//! tasks. Shutdown cascades top-down (registry close → transport force-close)
//! and completion signals flow bottom-up (request task ends → connection
//! drains → registry drains).
//!
//! All shared maps live behind non-async mutexes with strictly non-awaiting
//! critical sections, so insert and remove are atomic with respect to task
//! switches. The drain paths collect task handles under the lock and await
//! them after releasing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) mod conn;
pub(crate) mod registry;

pub(crate) use registry::{accept_loop, Registry};
pub use registry::ServerStatus;

/// Object-safe transport: a plain TCP stream or a TLS-wrapped one.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type BoxTransport = Box<dyn Transport>;

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Draws the next id from a wrapping monotonic counter, skipping the zero
/// sentinel on wraparound.
pub(crate) fn next_id(counter: &AtomicU64) -> u64 {
    let mut id = counter.fetch_add(1, Ordering::Relaxed);
    if id == 0 {
        id = counter.fetch_add(1, Ordering::Relaxed);
    }
    id
}
