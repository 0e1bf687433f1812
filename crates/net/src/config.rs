//! Client and server configuration
//!
//! Fields are optional while the application fills them in; `validate()`
//! runs at `connect()`/`start()` and turns them into a resolved config or a
//! `Configuration` error naming the offending field.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Interface value meaning "every local interface"
pub const ANY_INTERFACE: &str = "*";

/// Longest accepted client id, in bytes
const MAX_CLIENT_ID_LEN: usize = 128;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Reconnection schedule: bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempt to re-establish a link that broke unexpectedly
    pub enabled: bool,
    /// Give up after this many failed attempts
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles after each failure
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 15_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP
    pub address: Option<String>,
    /// Server port
    pub port: Option<u16>,
    /// Identity presented to the server during handshake
    pub client_id: Option<String>,
    /// Local interface to bind the outbound socket to
    pub interface: Option<String>,
    /// Local port to bind the outbound socket to
    pub bind_port: Option<u16>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            client_id: None,
            interface: None,
            bind_port: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

/// Client configuration after validation
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub address: String,
    pub port: u16,
    pub client_id: String,
    /// Local address to bind before connecting, if any
    pub bind: Option<SocketAddr>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// All fields `connect()` cannot do without are present
    pub fn is_complete(&self) -> bool {
        self.address.is_some() && self.port.is_some() && self.client_id.is_some()
    }

    pub fn validate(&self) -> Result<ResolvedClientConfig> {
        let address = self
            .address
            .clone()
            .ok_or_else(|| Error::Configuration("Address not set".into()))?;
        validate_address(&address)?;

        let port = self
            .port
            .ok_or_else(|| Error::Configuration("Port not set".into()))?;
        validate_remote_port(port)?;

        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| Error::Configuration("Client ID not set".into()))?;
        validate_client_id(&client_id)?;

        let bind = match (&self.interface, self.bind_port) {
            (None, None) => None,
            (interface, bind_port) => {
                let ip = match interface {
                    Some(iface) => parse_interface(iface)?,
                    None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                };
                Some(SocketAddr::new(ip, bind_port.unwrap_or(0)))
            }
        };

        Ok(ResolvedClientConfig {
            address,
            port,
            client_id,
            bind,
            reconnect: self.reconnect.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        })
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on; `*` for all
    pub interface: Option<String>,
    /// Port to listen on; 0 lets the OS choose
    pub port: Option<u16>,
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: None,
            port: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

/// Server configuration after validation
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub bind: SocketAddr,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    pub fn is_complete(&self) -> bool {
        self.interface.is_some() && self.port.is_some()
    }

    pub fn validate(&self) -> Result<ResolvedServerConfig> {
        let interface = self
            .interface
            .as_deref()
            .ok_or_else(|| Error::Configuration("Interface not set".into()))?;
        let ip = parse_interface(interface)?;

        let port = self
            .port
            .ok_or_else(|| Error::Configuration("Port not set".into()))?;

        Ok(ResolvedServerConfig {
            bind: SocketAddr::new(ip, port),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        })
    }
}

pub fn validate_address(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(Error::Configuration("Address must not be empty".into()));
    }
    Ok(())
}

pub fn validate_remote_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::Configuration("Port must be between 1 and 65535".into()));
    }
    Ok(())
}

pub fn validate_client_id(client_id: &str) -> Result<()> {
    if client_id.is_empty() {
        return Err(Error::Configuration("Client ID must not be empty".into()));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(Error::Configuration(format!(
            "Client ID longer than {} bytes",
            MAX_CLIENT_ID_LEN
        )));
    }
    if client_id.chars().any(char::is_control) {
        return Err(Error::Configuration(
            "Client ID must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// `*` or empty means all interfaces; anything else must be an IP literal
pub fn parse_interface(interface: &str) -> Result<IpAddr> {
    let interface = interface.trim();
    if interface.is_empty() || interface == ANY_INTERFACE {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    interface
        .parse()
        .map_err(|_| Error::Configuration(format!("Invalid interface '{}'", interface)))
}
