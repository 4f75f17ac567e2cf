//! Proxy server: backend launch, accept loop and shutdown

use crate::backend::{BackendHandle, BackendStatus};
use crate::config::{Config, ServerConfig};
use crate::connection::{BoxedConnection, InboundConnection, TcpConnection};
use crate::dispatcher::{Backpressure, ConnectionDispatcher};
use crate::error::DispatchError;
use crate::pool::{BackendPool, SharedPool};
use crate::process;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct ProxyServer {
    config: ServerConfig,
    /// Every backend ever created, pruned ones included
    handles: Vec<Arc<BackendHandle>>,
    pool: SharedPool,
    shutdown_tx: watch::Sender<bool>,
    /// Stays locked while `wait` awaits the task
    dispatcher_task: tokio::sync::Mutex<Option<JoinHandle<Result<(), DispatchError>>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, handles: Vec<Arc<BackendHandle>>) -> Self {
        let pool = BackendPool::new(handles.clone()).shared();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handles,
            pool,
            shutdown_tx,
            dispatcher_task: tokio::sync::Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build one backend handle per configured backend, in order
    pub fn from_config(config: &Config) -> Self {
        let handles = config
            .backends
            .iter()
            .enumerate()
            .map(|(i, backend)| {
                BackendHandle::new(
                    i + 1,
                    process::from_config(backend, &config.defaults),
                    backend.probe_config(&config.defaults),
                )
            })
            .collect();
        Self::new(config.server.clone(), handles)
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn handles(&self) -> &[Arc<BackendHandle>] {
        &self.handles
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.handles.iter().map(|handle| handle.status()).collect()
    }

    /// Launch every backend, then start accepting connections.
    ///
    /// Backends are probed in the background, so connections may arrive
    /// before any backend is ready; those go through the backpressure policy.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Proxy server already started");
        }

        for handle in &self.handles {
            info!(backend = handle.id(), address = %handle.address(), "Launching backend");
            // A failed launch leaves the backend dead; the pool drops it later
            let _ = handle.launch();
        }

        let delay = self.config.startup_delay();
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs(), "Waiting before accepting connections");
            let mut stopping = self.shutdown_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut stopping) => {}
            }
        }
        if *self.shutdown_tx.borrow() {
            anyhow::bail!("Proxy server stopped during startup");
        }

        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port))
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to bind {}:{}: {}",
                    self.config.bind,
                    self.config.port,
                    e
                )
            })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let backpressure = Backpressure::from_config(&self.config);
        match &backpressure {
            Backpressure::Retry { delay } => {
                info!(retry_delay_ms = delay.as_millis() as u64, "Unroutable connections will be retried")
            }
            Backpressure::Reject(responder) => {
                info!(bytes = responder.payload().len(), "Unroutable connections will be rejected")
            }
        }

        let dispatcher = ConnectionDispatcher::new(Arc::clone(&self.pool), backpressure);
        let sender = dispatcher.sender();
        *self.dispatcher_task.lock().await = Some(tokio::spawn(
            dispatcher.run(self.shutdown_tx.subscribe()),
        ));
        *self.accept_task.lock() = Some(tokio::spawn(accept_loop(
            listener,
            sender,
            self.shutdown_tx.subscribe(),
        )));

        info!(addr = %local_addr, backends = self.handles.len(), "Proxy server listening");
        Ok(local_addr)
    }

    /// Wait until dispatching ends. Pool exhaustion comes back as a
    /// [`DispatchError`] inside the error.
    ///
    /// Cancelling this future leaves the dispatcher task in place for `stop`.
    pub async fn wait(&self) -> anyhow::Result<()> {
        let mut slot = self.dispatcher_task.lock().await;
        let Some(task) = slot.as_mut() else {
            return Ok(());
        };

        let result = task.await;
        *slot = None;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(anyhow::anyhow!("Dispatcher task failed: {}", e)),
        }
    }

    /// Stop accepting and terminate every backend. Only the first call
    /// does anything; in-flight connections are not drained.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping proxy server");
        self.shutdown_tx.send_replace(true);

        let accept = self.accept_task.lock().take();
        if let Some(task) = accept {
            let _ = task.await;
        }
        let dispatcher = self.dispatcher_task.lock().await.take();
        if let Some(task) = dispatcher {
            let _ = task.await;
        }

        for status in self.status() {
            info!(
                backend = status.id,
                address = %status.address,
                state = ?status.state,
                load = status.load,
                "Backend status at shutdown"
            );
        }

        join_all(self.handles.iter().map(|handle| handle.terminate())).await;
        info!(backends = self.handles.len(), "All backends terminated");
    }

    /// Start, serve until `shutdown` flips or the pool is exhausted, then stop
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let started = tokio::select! {
            result = self.start() => result.map(Some),
            _ = shutdown_requested(&mut shutdown) => Ok(None),
        };
        match started {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("Shutdown requested during startup");
                self.stop().await;
                return Ok(());
            }
            Err(e) => {
                self.stop().await;
                return Err(e);
            }
        }

        let result = tokio::select! {
            result = self.wait() => result,
            _ = shutdown_requested(&mut shutdown) => Ok(()),
        };

        self.stop().await;
        result
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: mpsc::UnboundedSender<BoxedConnection>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let conn = TcpConnection::new(stream, peer);
                        debug!(connection = %conn.id(), %peer, "Accepted connection");
                        if sender.send(Box::new(conn)).is_err() {
                            debug!("Dispatcher stopped, closing listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Listener shutting down");
                    break;
                }
            }
        }
    }
}
