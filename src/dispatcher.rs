//! Routing of accepted connections to backends
//!
//! All dispatch decisions run on one task, reading connections from a
//! queue. The accept loop feeds that queue, and so do retry timers: a
//! connection that found no ready backend is put back after a delay instead
//! of blocking the queue while it waits.

use crate::backend::{BackendHandle, LoadGuard};
use crate::config::ServerConfig;
use crate::connection::BoxedConnection;
use crate::error::DispatchError;
use crate::pool::SharedPool;
use crate::responder::RejectionResponder;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// What to do with a connection when no backend is ready
#[derive(Debug, Clone)]
pub enum Backpressure {
    /// Dispatch the connection again after `delay`
    Retry { delay: Duration },
    /// Answer with a fixed payload and close
    Reject(RejectionResponder),
}

impl Backpressure {
    pub fn from_config(config: &ServerConfig) -> Self {
        match config.rejection_payload() {
            Some(payload) => Backpressure::Reject(RejectionResponder::new(payload)),
            None => Backpressure::Retry {
                delay: config.retry_delay(),
            },
        }
    }
}

/// Result of a single dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the backend with this id; `load` is its load afterwards.
    /// A backend that stopped listening after selection is only noticed by
    /// the relay, which then closes the connection and releases the load.
    Bound { backend: usize, load: usize },
    /// The connection could not be handed over and was dropped
    BindFailed { backend: usize },
    /// No backend ready; the rejection payload was sent
    Rejected,
    /// No backend ready; the connection comes back after `delay`
    Requeued { delay: Duration },
}

pub struct ConnectionDispatcher {
    pool: SharedPool,
    backpressure: Backpressure,
    tx: mpsc::UnboundedSender<BoxedConnection>,
    rx: mpsc::UnboundedReceiver<BoxedConnection>,
}

impl ConnectionDispatcher {
    pub fn new(pool: SharedPool, backpressure: Backpressure) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool,
            backpressure,
            tx,
            rx,
        }
    }

    /// Queue for connections to be dispatched by [`run`](Self::run)
    pub fn sender(&self) -> mpsc::UnboundedSender<BoxedConnection> {
        self.tx.clone()
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Route one connection.
    ///
    /// Only pool exhaustion is an error; everything that can go wrong with a
    /// single connection is settled here.
    pub fn dispatch(&self, conn: BoxedConnection) -> Result<DispatchOutcome, DispatchError> {
        let selected = self.pool.lock().select_least_loaded()?;

        if let Some(handle) = selected {
            let backend = handle.id();
            let id = conn.id();
            if bind_connection(&handle, conn) {
                let load = handle.load();
                debug!(connection = %id, backend, load, "Connection bound");
                return Ok(DispatchOutcome::Bound { backend, load });
            }
            return Ok(DispatchOutcome::BindFailed { backend });
        }

        match &self.backpressure {
            Backpressure::Reject(responder) => {
                responder.respond(conn);
                Ok(DispatchOutcome::Rejected)
            }
            Backpressure::Retry { delay } => {
                let delay = *delay;
                debug!(connection = %conn.id(), delay_ms = delay.as_millis() as u64, "No backend ready, retrying later");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tx.send(conn) {
                        debug!(connection = %e.0.id(), "Dispatcher gone, dropping connection");
                    }
                });
                Ok(DispatchOutcome::Requeued { delay })
            }
        }
    }

    /// Dispatch queued connections until shutdown or pool exhaustion
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                conn = self.rx.recv() => {
                    let Some(conn) = conn else {
                        return Ok(());
                    };
                    if let Err(e) = self.dispatch(conn) {
                        error!(code = e.code(), "{}", e);
                        return Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Dispatcher shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Wire load accounting into `conn` and bind it to `handle`.
///
/// Load goes up when the connection is established and down when it
/// finishes. If binding fails, any load the attempt added is given back
/// before returning `false`.
pub fn bind_connection(handle: &Arc<BackendHandle>, mut conn: BoxedConnection) -> bool {
    let id = conn.id();
    let slot: Arc<Mutex<Option<LoadGuard>>> = Arc::default();

    {
        let handle = Arc::clone(handle);
        let slot = Arc::clone(&slot);
        conn.on_connect(Box::new(move || {
            *slot.lock() = Some(handle.acquire());
        }));
    }
    conn.on_data(Box::new(|chunk| chunk));
    conn.on_response(Box::new(|chunk| chunk));
    {
        let slot = Arc::clone(&slot);
        conn.on_finish(Box::new(move || {
            drop(slot.lock().take());
        }));
    }

    match conn.bind(handle.address()) {
        Ok(()) => true,
        Err(e) => {
            drop(slot.lock().take());
            warn!(
                connection = %id,
                backend = handle.id(),
                address = %handle.address(),
                error = %e,
                "Failed to bind connection to backend"
            );
            false
        }
    }
}
