//! Outbound TCP connections with ordered address fallback.
//!
//! The dialer asks the [`DnsCache`] for a hostname's addresses and tries
//! them one by one, in the order the cache returns them, until one
//! accepts. [`FallbackConnector`] plugs the dialer into the hyper client
//! as its connection function.

use crate::error::{ProxyError, Result};
use crate::resolver::DnsCache;
use http::Uri;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Address families a dial may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// IPv4 and IPv6.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => ip.is_ipv4(),
            Network::Tcp6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

impl FromStr for Network {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(ProxyError::InvalidAddress {
                addr: other.to_string(),
                reason: "unknown network",
            }),
        }
    }
}

/// Splits `host:port` or `[v6]:port`. The port is mandatory.
pub fn split_host_port(host_port: &str) -> Result<(String, u16)> {
    let invalid = |reason| ProxyError::InvalidAddress {
        addr: host_port.to_string(),
        reason,
    };

    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}

/// Dials hostnames through the cache, falling back across addresses.
#[derive(Clone)]
pub struct FallbackDialer {
    cache: DnsCache,
    connect_timeout: Duration,
}

impl FallbackDialer {
    pub fn new(cache: DnsCache, connect_timeout: Duration) -> Self {
        Self {
            cache,
            connect_timeout,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Connects to `host_port`, trying each resolved address in order.
    ///
    /// Dropping the returned future abandons the attempt in progress.
    pub async fn dial(&self, network: Network, host_port: &str) -> Result<TcpStream> {
        let (host, port) = split_host_port(host_port)?;
        self.dial_host(network, &host, port).await
    }

    /// Like [`FallbackDialer::dial`] with host and port already split.
    pub async fn dial_host(&self, network: Network, host: &str, port: u16) -> Result<TcpStream> {
        let candidates: Vec<IpAddr> = self
            .cache
            .lookup(host)
            .await?
            .into_iter()
            .filter(|ip| network.accepts(ip))
            .collect();

        if candidates.is_empty() {
            return Err(ProxyError::Dial {
                host: host.to_string(),
                port,
                attempted: Vec::new(),
                source: io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no {network} address for host"),
                ),
            });
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for ip in candidates {
            let addr = SocketAddr::new(ip, port);
            attempted.push(ip);

            match self.connect(addr).await {
                Ok(stream) => {
                    if attempted.len() > 1 {
                        info!(
                            host = %host,
                            address = %addr,
                            failed = attempted.len() - 1,
                            "Connected after falling back"
                        );
                    } else {
                        debug!(host = %host, address = %addr, "Connected");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(host = %host, address = %addr, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| io::Error::other("no connection attempted"));
        warn!(
            host = %host,
            port = port,
            attempted = ?attempted,
            error = %source,
            "All upstream addresses failed"
        );

        Err(ProxyError::Dial {
            host: host.to_string(),
            port,
            attempted,
            source,
        })
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out after {:?}", self.connect_timeout),
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// hyper-util connector that dials through a [`FallbackDialer`].
#[derive(Clone)]
pub struct FallbackConnector {
    dialer: FallbackDialer,
}

impl FallbackConnector {
    pub fn new(dialer: FallbackDialer) -> Self {
        Self { dialer }
    }
}

impl tower::Service<Uri> for FallbackConnector {
    type Response = TokioIo<TcpStream>;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let host = dst.host().ok_or_else(|| ProxyError::InvalidAddress {
                addr: dst.to_string(),
                reason: "missing host",
            })?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let port = dst.port_u16().unwrap_or(80);

            let stream = dialer.dial_host(Network::Tcp, host, port).await?;
            Ok(TokioIo::new(stream))
        })
    }
}
