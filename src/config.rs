//! Configuration management for the upstream-proxy application.
//!
//! Settings are layered once at startup: defaults, then an optional YAML
//! file, then environment variables and command-line flags. The result is
//! validated and frozen into an `Arc<AppConfig>` snapshot that every
//! component receives explicitly.

use crate::error::{ProxyError, Result};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the upstream host (required).
pub const TARGET_HOST_ENV: &str = "TARGET_HOST";

/// Environment variable holding the optional gateway override.
pub const GATEWAY_HOST_ENV: &str = "GATEWAY_HOST";

/// Environment variable holding the listen port.
pub const PORT_ENV: &str = "PORT";

/// Listen port used when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub listen_host: String,

    /// Port to listen on.
    pub port: u16,

    /// Timeout for each upstream connection attempt, in seconds.
    pub connect_timeout_secs: u64,

    /// How long in-flight requests may run after a shutdown signal, in seconds.
    pub drain_timeout_secs: u64,

    /// How long idle upstream connections are kept for reuse, in seconds.
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 30,
            drain_timeout_secs: 30,
            pool_idle_timeout_secs: 90,
        }
    }
}

/// Upstream selection section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Host (optionally `host:port`) the proxy forwards to. Also the value
    /// sent in the forwarded `Host` header.
    pub target_host: Option<String>,

    /// Optional host used for connection routing instead of the target.
    pub gateway_host: Option<String>,
}

/// DNS caching section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    /// How long a resolved address list stays fresh, in seconds.
    pub ttl_secs: u64,

    /// Upper bound on a single resolution, in seconds.
    pub resolve_timeout_secs: u64,

    /// Interval of the proactive background refresh, in seconds (0 = off).
    pub refresh_interval_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            resolve_timeout_secs: 5,
            refresh_interval_secs: 0,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// Values supplied by the process environment or command line. They win
/// over anything read from the configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub target_host: Option<String>,
    pub gateway_host: Option<String>,
    pub port: Option<u16>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Upstream selection.
    pub upstream: UpstreamConfig,

    /// DNS caching.
    pub dns: DnsConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Applies environment/CLI values on top of this configuration.
    /// Empty strings count as unset.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(target) = non_empty(overrides.target_host) {
            self.upstream.target_host = Some(target);
        }
        if let Some(gateway) = non_empty(overrides.gateway_host) {
            self.upstream.gateway_host = Some(gateway);
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    /// Validates the configuration.
    ///
    /// The target host is not checked here: it may still arrive through
    /// overrides. [`AppConfig::target`] enforces it.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_host.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen host cannot be empty",
            ));
        }

        if self.server.connect_timeout_secs == 0 {
            return Err(ProxyError::config_validation(
                "connect_timeout_secs must be greater than zero",
            ));
        }

        if self.dns.resolve_timeout_secs == 0 {
            return Err(ProxyError::config_validation(
                "resolve_timeout_secs must be greater than zero",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Builds the upstream target. Fails if no target host was configured.
    pub fn target(&self) -> Result<ProxyTarget> {
        let target_host = self
            .upstream
            .target_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ProxyError::MissingTargetHost {
                var: TARGET_HOST_ENV,
            })?;

        ProxyTarget::new(target_host, self.upstream.gateway_host.as_deref())
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.server.listen_host.contains(':') {
            format!("[{}]:{}", self.server.listen_host, self.server.port)
        } else {
            format!("{}:{}", self.server.listen_host, self.server.port)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.pool_idle_timeout_secs)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns.ttl_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.dns.resolve_timeout_secs)
    }

    /// Interval of the proactive DNS refresh, if enabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.dns.refresh_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Upstream URL scheme. Only plain HTTP is proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single upstream this process forwards to.
///
/// `host` and `port` decide where connections go; when a gateway override
/// is configured they describe the gateway. `host_header` is always the
/// original target host and is what the upstream sees in `Host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub host_header: HeaderValue,
}

impl ProxyTarget {
    /// Derives the target from the target host and an optional gateway.
    pub fn new(target_host: &str, gateway_host: Option<&str>) -> Result<Self> {
        let target_host = target_host.trim();
        if target_host.is_empty() {
            return Err(ProxyError::MissingTargetHost {
                var: TARGET_HOST_ENV,
            });
        }

        let host_header = HeaderValue::from_str(target_host).map_err(|_| {
            ProxyError::config_validation(format!(
                "Target host {target_host:?} is not a valid Host header value"
            ))
        })?;

        let routed = gateway_host
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(target_host);

        let (host, port) = parse_host_port(routed, 80)?;

        Ok(Self {
            scheme: Scheme::Http,
            host,
            port,
            host_header,
        })
    }

    /// `host:port` of the routed destination, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether connections are routed somewhere other than the Host header.
    pub fn is_gateway_routed(&self) -> bool {
        self.host_header.as_bytes() != self.authority().as_bytes()
            && self.host_header.as_bytes() != self.host.as_bytes()
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Parses `host`, `host:port`, `[v6]` or `[v6]:port`, falling back to
/// `default_port`. Brackets are stripped from the returned host.
fn parse_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = |reason| ProxyError::InvalidAddress {
        addr: value.to_string(),
        reason,
    };

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("missing ']'"))?;
        let host = &rest[..end];
        match &rest[end + 1..] {
            "" => (host, None),
            tail => {
                let port = tail.strip_prefix(':').ok_or_else(|| invalid("unexpected text after ']'"))?;
                (host, Some(port))
            }
        }
    } else if value.matches(':').count() == 1 {
        let (host, port) = value.split_once(':').ok_or_else(|| invalid("missing port"))?;
        (host, Some(port))
    } else {
        // No colon, or a bare IPv6 literal.
        (value, None)
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.dns.ttl_secs, 30);
        assert!(config.refresh_interval().is_none());
        assert!(config.upstream.target_host.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_config() {
        let yaml = r#"
server:
  listen_host: "127.0.0.1"
  port: 9000
  connect_timeout_secs: 2
upstream:
  target_host: "app.example.com"
  gateway_host: "10.0.0.7:8081"
dns:
  ttl_secs: 10
  refresh_interval_secs: 60
logging:
  level: "debug"
  format: "json"
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.dns_ttl(), Duration::from_secs(10));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.format, LogFormat::Json);

        let target = config.target().unwrap();
        assert_eq!(target.host, "10.0.0.7");
        assert_eq!(target.port, 8081);
        assert_eq!(target.host_header, "app.example.com");
    }

    #[test]
    fn test_missing_file() {
        let result = AppConfig::load("/nonexistent/upstream-proxy.yaml");
        assert!(matches!(result, Err(ProxyError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = r#"
logging:
  level: "invalid"
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let file = create_temp_config("server:\n  connect_timeout_secs: 0\n");
        assert!(AppConfig::load(file.path()).is_err());

        let file = create_temp_config("dns:\n  resolve_timeout_secs: 0\n");
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_target_host() {
        let config = AppConfig::default();
        let err = config.target().unwrap_err();
        assert!(matches!(err, ProxyError::MissingTargetHost { var: "TARGET_HOST" }));
        assert!(err.is_config());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = AppConfig {
            upstream: UpstreamConfig {
                target_host: Some("file.example.com".to_string()),
                gateway_host: None,
            },
            ..Default::default()
        };

        config.apply_overrides(ConfigOverrides {
            target_host: Some("env.example.com".to_string()),
            gateway_host: Some("  ".to_string()),
            port: Some(9090),
        });

        assert_eq!(config.upstream.target_host.as_deref(), Some("env.example.com"));
        assert!(config.upstream.gateway_host.is_none());
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_target_without_gateway() {
        let target = ProxyTarget::new("app.example.com", None).unwrap();
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.host, "app.example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header, "app.example.com");
        assert_eq!(target.to_string(), "http://app.example.com:80");
        assert!(!target.is_gateway_routed());
    }

    #[test]
    fn test_target_with_gateway() {
        let target = ProxyTarget::new("app.example.com:8080", Some("gateway.local")).unwrap();
        assert_eq!(target.host, "gateway.local");
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header, "app.example.com:8080");
        assert!(target.is_gateway_routed());

        // An empty gateway is ignored.
        let target = ProxyTarget::new("app.example.com:8080", Some("")).unwrap();
        assert_eq!(target.host, "app.example.com");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_target_ipv6_gateway() {
        let target = ProxyTarget::new("app.example.com", Some("[::1]:8081")).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8081);
        assert_eq!(target.authority(), "[::1]:8081");
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:8080", 80).unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            parse_host_port("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(parse_host_port("[::1]", 80).unwrap(), ("::1".to_string(), 80));
        assert_eq!(parse_host_port("::1", 80).unwrap(), ("::1".to_string(), 80));
        assert!(parse_host_port("example.com:http", 80).is_err());
        assert!(parse_host_port(":80", 80).is_err());
    }
}
