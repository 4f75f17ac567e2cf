//! Backend endpoint addressing
//!
//! Backends listen either on a TCP socket or on a Unix domain socket. The
//! address is written in configuration as `host:port`, `unix:/path/to.sock`
//! or a bare filesystem path.

use crate::error::InvalidAddress;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream to a backend, whatever the socket family
pub trait BackendStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> BackendStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Connectable endpoint of a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum BackendAddress {
    /// TCP socket address
    Tcp(SocketAddr),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl BackendAddress {
    /// Open a client connection to the backend
    pub async fn connect(&self) -> io::Result<Box<dyn BackendStream>> {
        match self {
            BackendAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            BackendAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            BackendAddress::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets are not supported here: {}", path.display()),
            )),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, BackendAddress::Unix(_))
    }

    /// Whether a connection to this address can be attempted on this platform
    pub fn is_supported(&self) -> bool {
        cfg!(unix) || !self.is_unix()
    }
}

impl FromStr for BackendAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(path) = trimmed.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(InvalidAddress(s.to_string()));
            }
            return Ok(BackendAddress::Unix(PathBuf::from(path)));
        }
        if trimmed.starts_with('/') || trimmed.starts_with("./") || trimmed.starts_with("../") {
            return Ok(BackendAddress::Unix(PathBuf::from(trimmed)));
        }

        let host_port = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
        host_port
            .parse::<SocketAddr>()
            .map(BackendAddress::Tcp)
            .map_err(|_| InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for BackendAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketAddr> for BackendAddress {
    fn from(addr: SocketAddr) -> Self {
        BackendAddress::Tcp(addr)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddress::Tcp(addr) => write!(f, "{}", addr),
            BackendAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_tcp_address() {
        let addr: BackendAddress = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(addr, BackendAddress::Tcp("127.0.0.1:9001".parse().unwrap()));
        assert!(!addr.is_unix());

        let addr: BackendAddress = "tcp://[::1]:80".parse().unwrap();
        assert_eq!(addr, BackendAddress::Tcp("[::1]:80".parse().unwrap()));
    }

    #[test]
    fn test_parse_unix_address() {
        let addr: BackendAddress = "unix:/tmp/web.1.sock".parse().unwrap();
        assert_eq!(addr, BackendAddress::Unix(PathBuf::from("/tmp/web.1.sock")));

        let addr: BackendAddress = "/var/run/app.sock".parse().unwrap();
        assert!(addr.is_unix());

        let addr: BackendAddress = "./tmp/app.sock".parse().unwrap();
        assert_eq!(addr, BackendAddress::Unix(PathBuf::from("./tmp/app.sock")));
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!("localhost".parse::<BackendAddress>().is_err());
        assert!("unix:".parse::<BackendAddress>().is_err());
        assert!("".parse::<BackendAddress>().is_err());

        let err = "nope".parse::<BackendAddress>().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_display_round_trips() {
        for raw in ["127.0.0.1:3000", "unix:/tmp/a.sock"] {
            let addr: BackendAddress = raw.parse().unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = BackendAddress::from(listener.local_addr().unwrap());

        let (stream, accepted) = tokio::join!(addr.connect(), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = BackendAddress::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(addr.connect().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let addr = BackendAddress::Unix(path);

        let (stream, accepted) = tokio::join!(addr.connect(), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }
}
