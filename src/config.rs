//! Server configuration
//!
//! Command line:
//!
//! ```text
//! vpn-server <port> [-m mtu] [-a network prefix] [-d dns] [-r route prefix]
//!            [-i interface] [--cert path] [--key path] [--ca path]
//!            [--timeout secs] [--prefix name] [--metrics-port port]
//! ```
//!
//! The result is validated once at startup and shared read-only afterwards.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::address_pool::NetworkSpec;
use crate::interface::{self, DEFAULT_INTERFACE_PREFIX};
use crate::liveness::{DEFAULT_PEER_TIMEOUT, MAX_PEER_TIMEOUT};
use crate::quic::MAX_TUNNEL_MTU;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_MTU: u16 = 1400;
pub const MIN_MTU: u16 = 1000;
/// Full-size packets must still fit one tunnel datagram
pub const MAX_MTU: u16 = MAX_TUNNEL_MTU;
pub const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
pub const DEFAULT_ROUTE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
pub const DEFAULT_ROUTE_PREFIX: u8 = 0;
pub const DEFAULT_PHYSICAL_INTERFACE: &str = "eth0";
pub const DEFAULT_CERT_PATH: &str = "certs/server-cert.pem";
pub const DEFAULT_KEY_PATH: &str = "certs/server-key.pem";

/// Largest virtual network prefix that still holds a server/client pair
pub const MAX_VIRTUAL_PREFIX: u8 = 30;

pub const USAGE: &str = "usage: vpn-server <port> [-m mtu] [-a network prefix] [-d dns] \
[-r route prefix] [-i interface] [--cert path] [--key path] [--ca path] \
[--timeout secs] [--prefix name] [--metrics-port port]";

/// Flags followed by one value
const SINGLE_VALUE_FLAGS: &[&str] = &[
    "-m",
    "-d",
    "-i",
    "--cert",
    "--key",
    "--ca",
    "--timeout",
    "--prefix",
    "--metrics-port",
];

/// Flags followed by an address and a prefix length
const PAIR_VALUE_FLAGS: &[&str] = &["-a", "-r"];

// ============================================================================
// Errors
// ============================================================================

/// Invalid or incomplete command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `-h` / `--help` was given
    HelpRequested,
    MissingPort,
    UnknownFlag(String),
    MissingValue(String),
    InvalidValue { flag: String, value: String },
    OutOfRange { what: &'static str, value: u64, min: u64, max: u64 },
    /// Physical interface does not exist on this host
    UnknownInterface(String),
    /// Prefix plus the largest slot number exceed the kernel name limit
    InterfacePrefixTooLong(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::HelpRequested => write!(f, "{}", USAGE),
            ConfigError::MissingPort => write!(f, "missing listening port\n{}", USAGE),
            ConfigError::UnknownFlag(flag) => write!(f, "unknown option '{}'\n{}", flag, USAGE),
            ConfigError::MissingValue(flag) => write!(f, "option '{}' needs a value", flag),
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value '{}' for '{}'", value, flag)
            }
            ConfigError::OutOfRange {
                what,
                value,
                min,
                max,
            } => write!(f, "{} {} out of range [{}, {}]", what, value, min, max),
            ConfigError::UnknownInterface(name) => {
                write!(f, "network interface '{}' does not exist", name)
            }
            ConfigError::InterfacePrefixTooLong(prefix) => {
                write!(f, "interface prefix '{}' is too long", prefix)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// ServerConfig
// ============================================================================

/// Validated, immutable server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub mtu: u16,
    /// Virtual network clients and tunnel endpoints are addressed from
    pub network: NetworkSpec,
    pub dns: Ipv4Addr,
    /// Route pushed to clients
    pub route: Ipv4Addr,
    pub route_prefix: u8,
    /// Physical interface NAT traffic leaves through
    pub physical_interface: String,
    pub cert_path: String,
    pub key_path: String,
    /// Client CA; when set, clients must present a certificate
    pub ca_path: Option<String>,
    pub peer_timeout: Duration,
    pub interface_prefix: String,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    /// Defaults for everything but the port
    pub fn new(port: u16) -> Self {
        ServerConfig {
            port,
            mtu: DEFAULT_MTU,
            network: NetworkSpec::private_class_a(),
            dns: DEFAULT_DNS,
            route: DEFAULT_ROUTE,
            route_prefix: DEFAULT_ROUTE_PREFIX,
            physical_interface: DEFAULT_PHYSICAL_INTERFACE.to_string(),
            cert_path: DEFAULT_CERT_PATH.to_string(),
            key_path: DEFAULT_KEY_PATH.to_string(),
            ca_path: None,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            interface_prefix: DEFAULT_INTERFACE_PREFIX.to_string(),
            metrics_port: None,
        }
    }

    /// Parse `std::env::args()`-style arguments (program name first).
    ///
    /// Checks syntax and value ranges only; see [`ServerConfig::check_host`]
    /// for checks against the running system.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        if args.iter().skip(1).any(|a| a == "-h" || a == "--help") {
            return Err(ConfigError::HelpRequested);
        }
        let port_arg = args.get(1).ok_or(ConfigError::MissingPort)?;
        if port_arg.starts_with('-') {
            return Err(ConfigError::MissingPort);
        }
        check_flags(args)?;

        let port: u16 = parse_value("port", port_arg)?;
        if port == 0 {
            return Err(out_of_range("port", 0, 1, u16::MAX as u64));
        }

        let mut config = ServerConfig::new(port);

        if let Some(mtu) = parse_arg(args, "-m") {
            let mtu: u16 = parse_value("-m", &mtu)?;
            if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                return Err(out_of_range("mtu", mtu as u64, MIN_MTU as u64, MAX_MTU as u64));
            }
            config.mtu = mtu;
        }

        if let Some((addr, prefix)) = parse_arg_pair(args, "-a") {
            let (addr, prefix) = parse_network("-a", &addr, &prefix)?;
            if prefix > MAX_VIRTUAL_PREFIX {
                return Err(out_of_range(
                    "virtual network prefix",
                    prefix as u64,
                    0,
                    MAX_VIRTUAL_PREFIX as u64,
                ));
            }
            config.network = NetworkSpec::new(addr, prefix)
                .ok_or_else(|| invalid("-a", &prefix.to_string()))?;
        }

        if let Some(dns) = parse_arg(args, "-d") {
            config.dns = parse_value("-d", &dns)?;
        }

        if let Some((addr, prefix)) = parse_arg_pair(args, "-r") {
            let (route, route_prefix) = parse_network("-r", &addr, &prefix)?;
            config.route = route;
            config.route_prefix = route_prefix;
        }

        if let Some(iface) = parse_arg(args, "-i") {
            if !interface::is_valid_interface_name(&iface) {
                return Err(invalid("-i", &iface));
            }
            config.physical_interface = iface;
        }

        if let Some(cert) = parse_arg(args, "--cert") {
            config.cert_path = cert;
        }
        if let Some(key) = parse_arg(args, "--key") {
            config.key_path = key;
        }
        config.ca_path = parse_arg(args, "--ca");

        if let Some(timeout) = parse_arg(args, "--timeout") {
            let secs: u64 = parse_value("--timeout", &timeout)?;
            let max = MAX_PEER_TIMEOUT.as_secs();
            if !(1..=max).contains(&secs) {
                return Err(out_of_range("timeout", secs, 1, max));
            }
            config.peer_timeout = Duration::from_secs(secs);
        }

        if let Some(prefix) = parse_arg(args, "--prefix") {
            // Slot numbers are appended, so the prefix must end in a non-digit
            let usable = prefix
                .bytes()
                .last()
                .map_or(false, |b| !b.is_ascii_digit());
            if !usable {
                return Err(invalid("--prefix", &prefix));
            }
            config.interface_prefix = prefix;
        }

        if let Some(port) = parse_arg(args, "--metrics-port") {
            let port: u16 = parse_value("--metrics-port", &port)?;
            if port == 0 {
                return Err(out_of_range("metrics port", 0, 1, u16::MAX as u64));
            }
            config.metrics_port = Some(port);
        }

        config.check_interface_prefix()?;
        Ok(config)
    }

    /// Checks that need the host: the physical interface must exist
    pub fn check_host(&self) -> Result<(), ConfigError> {
        if !interface::interface_exists(&self.physical_interface) {
            return Err(ConfigError::UnknownInterface(
                self.physical_interface.clone(),
            ));
        }
        Ok(())
    }

    /// Most sessions the virtual network can hold (two addresses each)
    pub fn max_sessions(&self) -> u32 {
        self.network.host_count() / 2
    }

    /// Name of the interface for the highest slot must still be valid
    fn check_interface_prefix(&self) -> Result<(), ConfigError> {
        let highest_slot = self.max_sessions().saturating_sub(1);
        let name = interface::interface_name(&self.interface_prefix, highest_slot);
        if !interface::is_valid_interface_name(&name) {
            return Err(ConfigError::InterfacePrefixTooLong(
                self.interface_prefix.clone(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Argument Scanning
// ============================================================================

/// Value following `flag`, if present
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Two values following `flag`, if present
fn parse_arg_pair(args: &[String], flag: &str) -> Option<(String, String)> {
    let i = args.iter().position(|a| a == flag)?;
    Some((args.get(i + 1)?.clone(), args.get(i + 2)?.clone()))
}

/// Reject unknown flags and flags missing their values
fn check_flags(args: &[String]) -> Result<(), ConfigError> {
    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        let values = if SINGLE_VALUE_FLAGS.contains(&flag) {
            1
        } else if PAIR_VALUE_FLAGS.contains(&flag) {
            2
        } else {
            return Err(ConfigError::UnknownFlag(flag.to_string()));
        };
        if i + values >= args.len() {
            return Err(ConfigError::MissingValue(flag.to_string()));
        }
        i += values + 1;
    }
    Ok(())
}

fn parse_value<T: FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(flag, value))
}

fn parse_network(flag: &str, addr: &str, prefix: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let addr: Ipv4Addr = parse_value(flag, addr)?;
    let prefix: u8 = parse_value(flag, prefix)?;
    if prefix > 32 {
        return Err(out_of_range("prefix", prefix as u64, 0, 32));
    }
    Ok((addr, prefix))
}

fn invalid(flag: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
    }
}

fn out_of_range(what: &'static str, value: u64, min: u64, max: u64) -> ConfigError {
    ConfigError::OutOfRange {
        what,
        value,
        min,
        max,
    }
}
