use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control protocol constants
pub mod control {
    /// Default SOCKS proxy port
    pub const DEFAULT_SOCKS_PORT: u16 = 9050;

    /// Default control port
    pub const DEFAULT_CONTROL_PORT: u16 = 9051;

    /// Upper bound on a single control-port command round trip
    pub const QUERY_TIMEOUT_SECS: u64 = 30;

    /// Tor refuses to honour NEWNYM more often than this
    pub const NEWNYM_RATE_LIMIT_SECS: u64 = 10;

    /// Added to the reported NEWNYM wait before re-checking
    pub const NEWNYM_SAFETY_MARGIN_SECS: u64 = 1;

    /// Capacity of the asynchronous event queue
    pub const EVENT_QUEUE_CAPACITY: usize = 256;
}

/// Tor process launch constants
pub mod launch {
    /// Give up on bootstrap after this long
    pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 90;

    /// Log line prefix Tor prints once bootstrap finishes
    pub const BOOTSTRAP_COMPLETE_MARKER: &str = "Bootstrapped 100%";

    /// Binary name looked up on PATH when none is configured
    pub const DEFAULT_TOR_BINARY: &str = "tor";

    /// Log sinks handed to Tor via `Log` options
    pub const DEFAULT_LOG_SINKS: &[&str] = &["NOTICE stdout", "ERR stderr"];
}

/// Rotation loop constants
pub mod rotation {
    /// Default NEWNYM interval
    pub const DEFAULT_IP_LIFETIME_SECS: u64 = 3600;

    /// Longest accepted NEWNYM interval, one year
    pub const MAX_IP_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

    /// Rotation events kept in memory; the oldest are evicted first
    pub const ROTATION_LOG_CAPACITY: usize = 1024;

    /// Default `ExitNodes` filter
    pub const DEFAULT_EXIT_NODE_LOCALES: &str = "{ar},{is},{ru},{ma},{mm},{ua}";

    /// IP echo service used to verify the exit address
    pub const IP_ECHO_URL: &str = "https://api.ipify.org/?format=json";

    /// User-Agent sent with the verification request
    pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";
}

/// TLS trust root discovery
pub mod tls {
    /// Well-known CA bundle locations, searched in order
    pub const CA_BUNDLE_LOCATIONS: &[&str] = &[
        "/etc/ssl/certs/ca-certificates.crt",
        "/etc/ssl/cert.pem",
        "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
        "/etc/pki/tls/certs/ca-bundle.crt",
        "/etc/ssl/ca-bundle.pem",
        "/usr/local/etc/ssl/cert.pem",
    ];

    /// Environment variable consulted before the well-known locations
    pub const CA_BUNDLE_ENV: &str = "CA_BUNDLE";
}

/// Rotation daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Path to the Tor executable
    pub tor_binary: PathBuf,

    /// Address the SOCKS and control listeners bind to
    pub bind_address: String,

    /// SOCKS proxy port
    pub socks_port: u16,

    /// Control protocol port
    pub control_port: u16,

    /// Seconds between NEWNYM signals
    pub ip_lifetime_secs: u64,

    /// Verify the exit address through the proxy after each rotation
    pub output_circuit_ip: bool,

    /// CA bundle used for the verification request
    pub ca_bundle: Option<PathBuf>,

    /// ISO country-code filter passed to Tor as `ExitNodes`
    pub exit_node_locales: String,

    /// Tor `Log` sinks
    pub log_sinks: Vec<String>,

    /// IP echo endpoint for verification
    pub ip_echo_url: String,

    /// User-Agent for the verification request
    pub user_agent: String,

    /// Per-command control port timeout
    pub query_timeout_secs: u64,

    /// Bootstrap timeout for a single launch attempt
    pub bootstrap_timeout_secs: u64,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            tor_binary: resolve_on_path(launch::DEFAULT_TOR_BINARY)
                .unwrap_or_else(|| PathBuf::from(launch::DEFAULT_TOR_BINARY)),
            bind_address: "127.0.0.1".to_string(),
            socks_port: control::DEFAULT_SOCKS_PORT,
            control_port: control::DEFAULT_CONTROL_PORT,
            ip_lifetime_secs: rotation::DEFAULT_IP_LIFETIME_SECS,
            output_circuit_ip: true,
            ca_bundle: find_ca_bundle(),
            exit_node_locales: rotation::DEFAULT_EXIT_NODE_LOCALES.to_string(),
            log_sinks: launch::DEFAULT_LOG_SINKS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ip_echo_url: rotation::IP_ECHO_URL.to_string(),
            user_agent: rotation::DEFAULT_USER_AGENT.to_string(),
            query_timeout_secs: control::QUERY_TIMEOUT_SECS,
            bootstrap_timeout_secs: launch::BOOTSTRAP_TIMEOUT_SECS,
        }
    }
}

impl RotatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tor_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.tor_binary = path.into();
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_ports(mut self, socks_port: u16, control_port: u16) -> Self {
        self.socks_port = socks_port;
        self.control_port = control_port;
        self
    }

    pub fn with_ip_lifetime(mut self, secs: u64) -> Self {
        self.ip_lifetime_secs = secs;
        self
    }

    pub fn with_output_circuit_ip(mut self, enabled: bool) -> Self {
        self.output_circuit_ip = enabled;
        self
    }

    pub fn with_ca_bundle(mut self, path: Option<PathBuf>) -> Self {
        self.ca_bundle = path;
        self
    }

    pub fn with_exit_node_locales(mut self, locales: impl Into<String>) -> Self {
        self.exit_node_locales = locales.into();
        self
    }

    pub fn ip_lifetime(&self) -> Duration {
        Duration::from_secs(self.ip_lifetime_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn control_addr(&self) -> String {
        host_port(&self.bind_address, self.control_port)
    }

    pub fn socks_addr(&self) -> String {
        host_port(&self.bind_address, self.socks_port)
    }

    /// SOCKS proxy URL with remote DNS resolution, so lookups go through Tor too.
    pub fn socks_proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks_addr())
    }

    /// Check the invariants the rest of the daemon relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip_lifetime_secs == 0 {
            return Err(ConfigError::Invalid(
                "ip lifetime must be at least one second".to_string(),
            ));
        }
        if self.ip_lifetime_secs > rotation::MAX_IP_LIFETIME_SECS {
            return Err(ConfigError::Invalid(format!(
                "ip lifetime must not exceed {} seconds",
                rotation::MAX_IP_LIFETIME_SECS
            )));
        }
        if self.socks_port == 0 || self.control_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        if self.socks_port == self.control_port {
            return Err(ConfigError::Invalid(format!(
                "socks and control port must differ (both {})",
                self.socks_port
            )));
        }
        if self.exit_node_locales.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "exit node locale filter is empty".to_string(),
            ));
        }
        if self.query_timeout_secs == 0 || self.bootstrap_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// `host:port`, bracketing IPv6 literals such as `::1`.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Locate a CA bundle: `CA_BUNDLE` first, then the well-known locations.
pub fn find_ca_bundle() -> Option<PathBuf> {
    let from_env = std::env::var(tls::CA_BUNDLE_ENV).ok();
    find_ca_bundle_in(from_env.as_deref(), tls::CA_BUNDLE_LOCATIONS)
}

pub fn find_ca_bundle_in(from_env: Option<&str>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = from_env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

/// Search `PATH` for an executable, like `which`.
pub fn resolve_on_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::RotateError {
    fn from(err: ConfigError) -> Self {
        crate::RotateError::config(err.to_string())
    }
}
