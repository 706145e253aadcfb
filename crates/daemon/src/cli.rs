use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::PathBuf;
use torrotate_common::{ConfigError, RotatorConfig};

/// Tor circuit rotation daemon
///
/// Every option can also come from its environment variable; a flag on
/// the command line wins over the environment, which wins over the
/// config file and built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "torrotate")]
#[command(author, version, about)]
pub struct Cli {
    /// TOML file with the base configuration
    #[arg(long = "config", env = "TORROTATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the tor executable
    #[arg(long = "torBinary", env = "TOR_BINARY_PATH")]
    pub tor_binary: Option<PathBuf>,

    /// Address Tor binds its SOCKS and control ports to
    #[arg(long = "bindAddress", env = "BIND_ADDRESS")]
    pub bind_address: Option<String>,

    #[arg(long = "socksPort", env = "SOCKS_PORT")]
    pub socks_port: Option<u16>,

    #[arg(long = "controlPort", env = "CONTROL_PORT")]
    pub control_port: Option<u16>,

    /// Seconds between identity rotations
    #[arg(long = "ipLifetime", env = "IP_LIFE_SECONDS")]
    pub ip_lifetime: Option<u64>,

    /// Verify the exit IP through the SOCKS port after each rotation
    #[arg(long = "outputCircuitIP", env = "OUTPUT_EXIT_IP", value_parser = BoolishValueParser::new())]
    pub output_circuit_ip: Option<bool>,

    /// CA bundle for the verification request
    #[arg(long = "caBundle", env = "REQUESTS_CA_BUNDLE")]
    pub ca_bundle: Option<PathBuf>,

    /// Tor ExitNodes filter, e.g. `{is},{ru}`
    #[arg(long = "exitNodeLocales", env = "EXIT_NODES_LOCALES")]
    pub exit_node_locales: Option<String>,

    /// User-Agent for the verification request
    #[arg(long = "userAgent", env = "USER_AGENT_STRING")]
    pub user_agent: Option<String>,

    /// Log filter, e.g. `info` or `torrotate_core=debug`
    #[arg(long = "logLevel", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Layer the parsed options over the config file (or defaults) and validate
    pub fn into_config(self) -> Result<RotatorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RotatorConfig::from_file(path)?,
            None => RotatorConfig::default(),
        };

        if let Some(tor_binary) = self.tor_binary {
            config.tor_binary = tor_binary;
        }
        if let Some(bind_address) = self.bind_address {
            config.bind_address = bind_address;
        }
        if let Some(socks_port) = self.socks_port {
            config.socks_port = socks_port;
        }
        if let Some(control_port) = self.control_port {
            config.control_port = control_port;
        }
        if let Some(ip_lifetime) = self.ip_lifetime {
            config.ip_lifetime_secs = ip_lifetime;
        }
        if let Some(output_circuit_ip) = self.output_circuit_ip {
            config.output_circuit_ip = output_circuit_ip;
        }
        if self.ca_bundle.is_some() {
            config.ca_bundle = self.ca_bundle;
        }
        if let Some(locales) = self.exit_node_locales {
            config.exit_node_locales = locales;
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }

        config.validate()?;
        Ok(config)
    }
}
