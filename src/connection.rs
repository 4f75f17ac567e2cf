//! Inbound client connections
//!
//! The dispatcher only sees [`InboundConnection`]: four hook registration
//! points plus the two ways a connection can leave the dispatcher (bound to a
//! backend, or rejected). [`TcpConnection`] is the adapter for accepted TCP
//! clients and relays raw bytes to the chosen backend.

use crate::address::BackendAddress;
use crate::error::BindError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Size of the relay buffer in each direction
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// How long a rejected client may keep sending before the socket is closed
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Fired once the connection is bound to a backend
pub type ConnectHook = Box<dyn FnOnce() + Send>;
/// Applied to every chunk relayed in one direction
pub type DataHook = Box<dyn FnMut(Vec<u8>) -> Vec<u8> + Send>;
/// Fired once the relay has ended, whichever side closed
pub type FinishHook = Box<dyn FnOnce() + Send>;

/// Identifier used to correlate log events of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live client connection waiting to be routed
pub trait InboundConnection: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn on_connect(&mut self, hook: ConnectHook);

    /// Client to backend direction
    fn on_data(&mut self, hook: DataHook);

    /// Backend to client direction
    fn on_response(&mut self, hook: DataHook);

    fn on_finish(&mut self, hook: FinishHook);

    /// Hand the connection's server side to `address`.
    ///
    /// On success the connect hook has already run when this returns, and
    /// the finish hook runs exactly once later. On error no hook may still
    /// be pending except ones the connection is dropped with.
    ///
    /// `Ok` only means the connection was handed over. Reaching the backend
    /// may happen afterwards; if that fails the connection closes and the
    /// finish hook runs, so load still returns to where it was.
    fn bind(self: Box<Self>, address: &BackendAddress) -> Result<(), BindError>;

    /// Write `payload` and close. No hooks are invoked.
    fn reject(self: Box<Self>, payload: Arc<[u8]>);
}

pub type BoxedConnection = Box<dyn InboundConnection>;

#[derive(Default)]
struct Hooks {
    connect: Option<ConnectHook>,
    data: Option<DataHook>,
    response: Option<DataHook>,
    finish: Option<FinishHook>,
}

/// Runs the finish hook when the relay task ends, however it ends
struct FinishOnDrop(Option<FinishHook>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        if let Some(finish) = self.0.take() {
            finish();
        }
    }
}

/// An accepted TCP client
pub struct TcpConnection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    hooks: Hooks,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            stream,
            peer,
            hooks: Hooks::default(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl InboundConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn on_connect(&mut self, hook: ConnectHook) {
        self.hooks.connect = Some(hook);
    }

    fn on_data(&mut self, hook: DataHook) {
        self.hooks.data = Some(hook);
    }

    fn on_response(&mut self, hook: DataHook) {
        self.hooks.response = Some(hook);
    }

    fn on_finish(&mut self, hook: FinishHook) {
        self.hooks.finish = Some(hook);
    }

    fn bind(self: Box<Self>, address: &BackendAddress) -> Result<(), BindError> {
        let TcpConnection {
            id,
            stream,
            peer,
            hooks,
        } = *self;

        if !address.is_supported() {
            return Err(BindError::UnsupportedAddress(address.clone()));
        }
        stream.peer_addr().map_err(BindError::ClientGone)?;

        let Hooks {
            connect,
            data,
            response,
            finish,
        } = hooks;

        if let Some(connect) = connect {
            connect();
        }

        let finish = FinishOnDrop(finish);
        let address = address.clone();
        tokio::spawn(async move {
            let _finish = finish;
            relay(id, peer, stream, &address, data, response).await;
        });

        Ok(())
    }

    fn reject(self: Box<Self>, payload: Arc<[u8]>) {
        let TcpConnection {
            id,
            mut stream,
            peer,
            ..
        } = *self;

        tokio::spawn(async move {
            if let Err(e) = stream.write_all(&payload).await {
                debug!(connection = %id, %peer, error = %e, "Failed to write rejection");
                return;
            }
            let _ = stream.shutdown().await;

            // Read off anything the client already sent so the close is not a reset
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(REJECT_LINGER, async {
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            })
            .await;
            debug!(connection = %id, %peer, "Rejected connection closed");
        });
    }
}

async fn relay(
    id: ConnectionId,
    peer: SocketAddr,
    client: TcpStream,
    address: &BackendAddress,
    data: Option<DataHook>,
    response: Option<DataHook>,
) {
    let backend = match address.connect().await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(connection = %id, %peer, %address, error = %e, "Failed to connect to backend");
            return;
        }
    };

    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = pump(&mut client_read, &mut backend_write, data);
    let downstream = pump(&mut backend_read, &mut client_write, response);

    match tokio::try_join!(upstream, downstream) {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                connection = %id,
                %peer,
                %address,
                client_to_backend,
                backend_to_client,
                "Connection closed normally"
            );
        }
        Err(e) => {
            debug!(connection = %id, %peer, %address, error = %e, "Connection closed with error");
        }
    }
}

/// Copy chunks until EOF, passing each through `hook`, then half-close the writer
async fn pump<R, W>(reader: &mut R, writer: &mut W, mut hook: Option<DataHook>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }

        let mut chunk = buf[..n].to_vec();
        if let Some(hook) = hook.as_mut() {
            chunk = hook(chunk);
        }
        writer.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
}
