//! Forwardgate - a TCP proxy that launches its own backends
//!
//! This library provides a connection-level proxy that:
//! - Spawns a fixed set of backend processes (or adopts external ones)
//! - Probes each backend until it accepts connections, off the accept path
//! - Routes every inbound connection to the ready backend with the least load
//! - Retries or rejects connections that arrive before any backend is ready
//! - Terminates every backend it launched on shutdown

pub mod address;
pub mod backend;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod responder;
