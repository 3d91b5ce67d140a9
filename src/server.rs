//! Inbound HTTP server with graceful shutdown.
//!
//! [`GracefulServer`] accepts HTTP/1.1 connections and serves each on its own
//! task. When the shutdown future completes it stops accepting, lets live
//! connections finish their in-flight request, and aborts whatever is left
//! once the drain timeout expires.
//!
//! [`ProxyServer`] assembles the full handler chain from an [`AppConfig`].

use crate::config::AppConfig;
use crate::dialer::{FallbackConnector, FallbackDialer};
use crate::error::Result;
use crate::handler::Handler;
use crate::probe::ProbeHandler;
use crate::proxy::{HyperForwarder, ReverseProxy};
use crate::resolver::{CacheSettings, DnsCache, Resolve, SystemResolver};
use http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener waiting to be served.
pub struct GracefulServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GracefulServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections through `handler` until `shutdown` completes, then
    /// drains for at most `drain_timeout`.
    pub async fn serve<H, S>(self, handler: Arc<H>, drain_timeout: Duration, shutdown: S)
    where
        H: Handler<Incoming>,
        S: Future<Output = ()>,
    {
        let GracefulServer {
            listener,
            local_addr,
        } = self;
        let graceful = GracefulShutdown::new();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!(address = %local_addr, "Listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler.serve(req).await) }
                    });
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);

                    connections.spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }
                () = &mut shutdown => {
                    break;
                }
            }
        }

        drop(listener);
        info!(
            connections = connections.len(),
            drain_timeout_secs = drain_timeout.as_secs_f64(),
            "Stopped accepting, draining connections"
        );

        tokio::select! {
            () = graceful.shutdown() => {
                info!("All connections drained");
            }
            () = tokio::time::sleep(drain_timeout) => {
                warn!(
                    remaining = connections.len(),
                    "Drain timeout expired, closing remaining connections"
                );
                connections.abort_all();
            }
        }

        while connections.join_next().await.is_some() {}
    }
}

/// Binds `addr` and serves `handler` until `shutdown` completes.
pub async fn listen_and_serve_gracefully<A, H, S>(
    addr: A,
    handler: Arc<H>,
    drain_timeout: Duration,
    shutdown: S,
) -> Result<()>
where
    A: ToSocketAddrs,
    H: Handler<Incoming>,
    S: Future<Output = ()>,
{
    let server = GracefulServer::bind(addr).await?;
    server.serve(handler, drain_timeout, shutdown).await;
    Ok(())
}

/// Completes on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// The complete handler chain: probes are answered first, everything else
/// is reverse proxied.
pub type ProxyHandler = ProbeHandler<ReverseProxy<HyperForwarder<Incoming>>>;

/// The proxy process: a configured handler chain and the cache behind it.
pub struct ProxyServer {
    config: Arc<AppConfig>,
    cache: DnsCache,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Builds the chain using the operating system resolver.
    pub fn new(config: Arc<AppConfig>) -> Result<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: Arc<AppConfig>, resolver: Arc<dyn Resolve>) -> Result<Self> {
        let target = config.target()?;
        let cache = DnsCache::new(
            resolver,
            CacheSettings {
                ttl: config.dns_ttl(),
                resolve_timeout: config.resolve_timeout(),
            },
        );
        let dialer = FallbackDialer::new(cache.clone(), config.connect_timeout());
        let forwarder = HyperForwarder::new(
            target,
            FallbackConnector::new(dialer),
            config.pool_idle_timeout(),
        );
        let handler = Arc::new(ProbeHandler::new(ReverseProxy::new(forwarder)));

        Ok(Self {
            config,
            cache,
            handler,
        })
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn handler(&self) -> Arc<ProxyHandler> {
        self.handler.clone()
    }

    /// Binds the configured address and serves until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let server = GracefulServer::bind(self.config.listen_addr()).await?;
        self.serve(server, shutdown_signal()).await;
        Ok(())
    }

    /// Serves on an already bound listener until `shutdown` completes.
    pub async fn serve<S>(self, server: GracefulServer, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let refresher = self.config.refresh_interval().map(|interval| {
            debug!(interval_secs = interval.as_secs(), "Starting DNS cache refresher");
            self.cache.spawn_refresher(interval)
        });

        info!(
            upstream = %self.handler.inner().forwarder().target(),
            address = %server.local_addr(),
            "Proxy server started"
        );
        server
            .serve(self.handler.clone(), self.config.drain_timeout(), shutdown)
            .await;

        if let Some(refresher) = refresher {
            refresher.abort();
        }
        info!("Proxy server stopped");
    }
}
