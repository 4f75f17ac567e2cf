//! Error types for backend management and connection dispatch

use crate::address::BackendAddress;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of the dispatch path as a whole.
///
/// Per-connection problems never surface here: a connection that cannot be
/// bound is dropped and one that cannot be routed yet is retried or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Every backend died; nothing can ever serve traffic again
    #[error("backend pool exhausted: no backend came up and none ever will")]
    BackendPoolExhausted,
}

impl DispatchError {
    /// Stable code for structured logs
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::BackendPoolExhausted => "BACKEND_POOL_EXHAUSTED",
        }
    }
}

/// A backend did not accept a probe connection before its deadline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backend at {address} did not spin up within {}s", .timeout.as_secs_f64())]
pub struct ProbeTimeout {
    pub address: BackendAddress,
    pub timeout: Duration,
}

/// Binding an accepted connection to a backend failed
#[derive(Debug, Error)]
pub enum BindError {
    /// The client side went away before it could be bound
    #[error("client connection is no longer usable: {0}")]
    ClientGone(#[source] io::Error),
    /// The backend address cannot be reached from this platform
    #[error("backend address {0} is not supported on this platform")]
    UnsupportedAddress(BackendAddress),
}

/// A backend address string that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid backend address '{0}': expected host:port, unix:<path> or an absolute socket path")]
pub struct InvalidAddress(pub String);
