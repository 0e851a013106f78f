//! Destinations and the dial capability.
//!
//! # Responsibilities
//! - Identify a pool key (`host:port`) from a request URL or config string
//! - Abstract connection establishment behind the [`Dialer`] trait
//! - Provide a plain TCP dialer
//!
//! # Design Decisions
//! - Dialers return boxed duplex streams so tests can plug in-memory pipes
//! - Name resolution and TLS are the dialer's business, not the pool's

use std::io;
use std::str::FromStr;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use crate::error::TransportError;

/// A duplex byte stream produced by a [`Dialer`].
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased byte stream.
pub type BoxedIo = Box<dyn Io>;

/// Pool key: where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Create a destination. The host is normalized to lowercase, IPv6
    /// brackets are stripped.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_lowercase(),
            port,
        }
    }

    /// Derive the destination of a request URL, using the scheme's
    /// default port when none is given.
    pub fn from_url(url: &Url) -> Result<Self, TransportError> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidRequest(format!("url has no host: {}", url)))?;
        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::InvalidRequest(format!("url has no port and unknown scheme: {}", url))
        })?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in destination '{}'", s))?;
        if host.trim_start_matches('[').trim_end_matches(']').is_empty() {
            return Err(format!("missing host in destination '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in destination '{}': {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// Capability that opens a raw byte stream to a destination.
pub trait Dialer: Send + Sync + 'static {
    fn open<'a>(&'a self, destination: &'a Destination) -> BoxFuture<'a, io::Result<BoxedIo>>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self { nodelay: true }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for TcpDialer {
    fn open<'a>(&'a self, destination: &'a Destination) -> BoxFuture<'a, io::Result<BoxedIo>> {
        Box::pin(async move {
            let stream = TcpStream::connect((destination.host(), destination.port())).await?;
            stream.set_nodelay(self.nodelay)?;
            tracing::debug!(
                destination = %destination,
                local_addr = ?stream.local_addr().ok(),
                "TCP connection established"
            );
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}
