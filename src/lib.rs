//! # Upstream Proxy Library
//!
//! A single-upstream HTTP reverse proxy. Every inbound request is forwarded
//! to one configured target host, with the `Host` header rewritten to that
//! target, while connections may be routed through a gateway address.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, overrides and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`resolver`]: TTL-bounded DNS cache with stale-while-refresh
//! - [`dialer`]: Outbound TCP dialing with ordered address fallback
//! - [`handler`]: The request handler contract shared by all layers
//! - [`probe`]: Network probe interception
//! - [`proxy`]: The reverse proxy core
//! - [`server`]: Inbound server with graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use upstream_proxy::{AppConfig, ProxyServer};
//!
//! let mut config = AppConfig::default();
//! config.upstream.target_host = Some("app.example.com".to_string());
//!
//! ProxyServer::new(Arc::new(config))?.run().await?;
//! ```
//!
//! ## Request Flow
//!
//! 1. **Probe check**: `K-Network-Probe: probe` requests are answered locally
//! 2. **Rewrite**: URI pointed at the routed host, `Host` set to the target
//! 3. **Dial**: cached addresses tried in order until one connects
//! 4. **Forward**: the upstream response is streamed back, failures become 502

pub mod config;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod logging;
pub mod probe;
pub mod proxy;
pub mod resolver;
pub mod server;

pub use config::{AppConfig, ConfigOverrides, ProxyTarget};
pub use dialer::{FallbackConnector, FallbackDialer, Network};
pub use error::{ProxyError, Result};
pub use handler::{Handler, ProxyBody};
pub use probe::{EchoHasher, ProbeHandler, ProbeHasher};
pub use proxy::{Forwarder, HyperForwarder, ReverseProxy};
pub use resolver::{CacheSettings, DnsCache, Resolve, SystemResolver};
pub use server::{listen_and_serve_gracefully, shutdown_signal, GracefulServer, ProxyServer};
