//! Per-backend lifecycle, readiness and load tracking
//!
//! A [`BackendHandle`] moves through `Spawning -> Connecting -> Ready`, or
//! `Connecting -> Dead` when the readiness probe runs out of time. `Ready` and
//! `Dead` are final: a ready backend is never probed again.

use crate::address::BackendAddress;
use crate::probe::{self, ProbeConfig, ProbeOutcome};
use crate::process::BackendProcess;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Not launched yet
    Spawning,
    /// Launched, readiness probe running
    Connecting,
    /// Accepted a probe connection; eligible for traffic
    Ready,
    /// Failed to spawn or to become ready in time; never selected again
    Dead,
}

impl BackendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendState::Ready | BackendState::Dead)
    }
}

/// One backend, its readiness and its current load
pub struct BackendHandle {
    /// 1-based position in the configured backend list
    id: usize,
    process: Arc<dyn BackendProcess>,
    probe: ProbeConfig,
    state: Mutex<BackendState>,
    /// Connections currently bound to this backend
    load: AtomicUsize,
    launched_at: Mutex<Option<Instant>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    cancel_tx: watch::Sender<bool>,
    terminated: AtomicBool,
}

impl BackendHandle {
    pub fn new(id: usize, process: Arc<dyn BackendProcess>, probe: ProbeConfig) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            process,
            probe,
            state: Mutex::new(BackendState::Spawning),
            load: AtomicUsize::new(0),
            launched_at: Mutex::new(None),
            probe_task: Mutex::new(None),
            cancel_tx,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> &BackendAddress {
        self.process.address()
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn ready(&self) -> bool {
        self.state() == BackendState::Ready
    }

    pub fn dead(&self) -> bool {
        self.state() == BackendState::Dead
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// When spawning began, if the backend has been launched
    pub fn launched_at(&self) -> Option<Instant> {
        *self.launched_at.lock()
    }

    /// Spawn the backend and start probing it in the background.
    ///
    /// Returns as soon as the probe task is running, so launching several
    /// backends never waits on any of them becoming ready. A spawn failure
    /// marks the backend `Dead`. Calling this again after the first launch
    /// does nothing.
    pub fn launch(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            anyhow::bail!("Backend #{} was already terminated", self.id);
        }

        {
            let state = self.state.lock();
            if *state != BackendState::Spawning {
                debug!(backend = self.id, state = ?*state, "Backend already launched");
                return Ok(());
            }
            *self.launched_at.lock() = Some(Instant::now());
        }

        if let Err(e) = self.process.spawn() {
            self.transition(BackendState::Spawning, BackendState::Dead);
            warn!(
                backend = self.id,
                address = %self.address(),
                error = %e,
                "Backend failed to spawn"
            );
            return Err(e);
        }

        if !self.transition(BackendState::Spawning, BackendState::Connecting) {
            return Ok(());
        }

        let handle = Arc::clone(self);
        let cancel = self.cancel_tx.subscribe();
        let task = tokio::spawn(async move {
            debug!(backend = handle.id, address = %handle.address(), "Probing backend");
            let outcome = probe::wait_until_ready(handle.address(), &handle.probe, cancel).await;
            handle.finish_probe(outcome);
        });
        *self.probe_task.lock() = Some(task);

        Ok(())
    }

    fn transition(&self, from: BackendState, to: BackendState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn finish_probe(&self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Ready { attempts, elapsed } => {
                if self.transition(BackendState::Connecting, BackendState::Ready) {
                    info!(
                        backend = self.id,
                        address = %self.address(),
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Backend is ready"
                    );
                }
            }
            ProbeOutcome::TimedOut(err) => {
                if self.transition(BackendState::Connecting, BackendState::Dead) {
                    warn!(
                        backend = self.id,
                        address = %err.address,
                        timeout_secs = err.timeout.as_secs_f64(),
                        "Backend did not spin up in the required time"
                    );
                }
            }
            ProbeOutcome::Cancelled => {
                debug!(backend = self.id, "Probe cancelled");
            }
        }
    }

    /// Reserve a unit of load; released when the guard drops
    pub fn acquire(self: &Arc<Self>) -> LoadGuard {
        self.load.fetch_add(1, Ordering::SeqCst);
        LoadGuard {
            handle: Arc::clone(self),
        }
    }

    fn release(&self) {
        // Saturates at zero
        let _ = self
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Stop probing and terminate the backend process. Only the first call
    /// has any effect.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel_tx.send_replace(true);
        let task = self.probe_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(backend = self.id, error = %e, "Probe task failed");
            }
        }

        self.process.terminate().await;
        debug!(backend = self.id, address = %self.address(), "Backend terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            id: self.id,
            address: self.address().to_string(),
            state: self.state(),
            load: self.load(),
            uptime: self.launched_at().map(|t| t.elapsed()),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: BackendState) {
        *self.state.lock() = state;
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id)
            .field("address", self.address())
            .field("state", &self.state())
            .field("load", &self.load())
            .finish()
    }
}

/// A unit of load held on a backend for the lifetime of one connection
pub struct LoadGuard {
    handle: Arc<BackendHandle>,
}

impl LoadGuard {
    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.handle
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl fmt::Debug for LoadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadGuard")
            .field("backend", &self.handle.id)
            .finish()
    }
}

/// Point-in-time view of a backend
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub id: usize,
    pub address: String,
    pub state: BackendState,
    pub load: usize,
    /// Time since launch
    pub uptime: Option<Duration>,
}
