//! # Upstream Proxy
//!
//! A single-upstream HTTP reverse proxy with cached DNS resolution and
//! ordered address fallback.
//!
//! ## Features
//!
//! - **Host Rewriting**: Every request reaches the upstream with `Host` set
//!   to the configured target host
//! - **Gateway Routing**: Optionally dial a gateway instead of the target
//! - **DNS Caching**: TTL-bounded cache, stale answers served while refreshing
//! - **Address Fallback**: Resolved addresses are tried in order
//! - **Network Probes**: `K-Network-Probe` requests are answered locally
//! - **Graceful Shutdown**: In-flight requests drain on SIGINT/SIGTERM
//!
//! ## Usage
//!
//! ```bash
//! # Forward everything to app.example.com, listening on :8080
//! TARGET_HOST=app.example.com upstream-proxy
//!
//! # Keep Host: app.example.com but connect through a gateway
//! upstream-proxy --target-host app.example.com --gateway-host gw.internal:8081
//!
//! # Custom config and debug logging
//! upstream-proxy -c /etc/upstream-proxy/config.yaml -vv
//! ```

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use upstream_proxy::config::{
    AppConfig, ConfigOverrides, GATEWAY_HOST_ENV, PORT_ENV, TARGET_HOST_ENV,
};
use upstream_proxy::{logging, ProxyServer};

/// Config files picked up when no path is given.
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./config.yaml", "/etc/upstream-proxy/config.yaml"];

/// A single-upstream HTTP reverse proxy with DNS caching and address fallback.
#[derive(Parser, Debug)]
#[command(name = "upstream-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Host every request is forwarded to, also used as the Host header
    #[arg(long, env = TARGET_HOST_ENV)]
    target_host: Option<String>,

    /// Address to dial instead of the target host
    #[arg(long, env = GATEWAY_HOST_ENV)]
    gateway_host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = PORT_ENV)]
    port: Option<u16>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to a log level
    fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            target_host: self.target_host.clone(),
            gateway_host: self.gateway_host.clone(),
            port: self.port,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (mut config, config_path) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    config.apply_overrides(args.overrides());

    let target = match config.target() {
        Ok(target) => target,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = ?config_path,
        "Starting upstream-proxy"
    );
    info!(
        upstream = %target,
        host = ?target.host_header,
        gateway = target.is_gateway_routed(),
        "Proxy target"
    );

    let proxy_server = match ProxyServer::new(Arc::new(config)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to build proxy");
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy_server.run().await {
        error!(error = %e, "Proxy server error");
        std::process::exit(1);
    }
}

/// Loads the file named on the command line, else the first default path
/// that exists, else built-in defaults.
fn load_config(args: &Args) -> upstream_proxy::Result<(AppConfig, Option<PathBuf>)> {
    let path = args.config.clone().or_else(|| {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf)
    });

    match path {
        Some(path) => {
            let config = AppConfig::load(&path)?;
            Ok((config, Some(path)))
        }
        None => Ok((AppConfig::default(), None)),
    }
}
