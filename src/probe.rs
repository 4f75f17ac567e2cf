//! Readiness probing for starting backends
//!
//! A backend only opens its socket once it has finished booting, so a
//! successful connect is taken as "ready". The probe connection is dropped
//! straight away and never carries traffic.

use crate::address::BackendAddress;
use crate::error::ProbeTimeout;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Probe timing for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Backoff between failed attempts
    pub interval: Duration,
    /// Deadline measured from the start of probing (`None` retries forever)
    pub timeout: Option<Duration>,
    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: None,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// How a probing run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend accepted a connection
    Ready { attempts: u32, elapsed: Duration },
    /// The deadline passed without a successful connection
    TimedOut(ProbeTimeout),
    /// Probing was cancelled (shutdown)
    Cancelled,
}

/// Attempt a single connection to the backend
pub async fn probe_once(address: &BackendAddress, connect_timeout: Duration) -> bool {
    match tokio::time::timeout(connect_timeout, address.connect()).await {
        Ok(Ok(_stream)) => {
            debug!(%address, "Probe connected");
            true
        }
        Ok(Err(e)) => {
            debug!(%address, error = %e, "Probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(%address, "Probe failed (timeout)");
            false
        }
    }
}

/// Probe until the backend accepts a connection, the deadline passes, or
/// `cancel` flips to `true`.
pub async fn wait_until_ready(
    address: &BackendAddress,
    config: &ProbeConfig,
    mut cancel: watch::Receiver<bool>,
) -> ProbeOutcome {
    let start = Instant::now();
    let deadline = config.timeout.map(|t| start + t);
    let mut attempts = 0u32;

    loop {
        if *cancel.borrow() {
            return ProbeOutcome::Cancelled;
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return ProbeOutcome::TimedOut(ProbeTimeout {
                    address: address.clone(),
                    timeout: config.timeout.unwrap_or_default(),
                });
            }
        }

        attempts += 1;
        if probe_once(address, config.connect_timeout).await {
            return ProbeOutcome::Ready {
                attempts,
                elapsed: start.elapsed(),
            };
        }

        // Never sleep past the deadline
        let wait = match deadline {
            Some(deadline) => config
                .interval
                .min(deadline.saturating_duration_since(Instant::now())),
            None => config.interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return ProbeOutcome::Cancelled;
                }
            }
        }
    }
}
