//! Configuration for the upstream connector.

use super::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default capacity of the handover queue between the event loop and the
/// processing thread.
pub const DEFAULT_HANDOVER_CAPACITY: usize = 1024 * 5;

/// `host:port` of one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address '{}' is not host:port", s)))?;
        // IPv6 hosts are bracketed: [::1]:9000
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| Error::Config(format!("address '{}' has an unclosed '['", s)))?,
            None if host.contains(['[', ']', ':']) => {
                return Err(Error::Config(format!(
                    "address '{}' needs brackets around an IPv6 host",
                    s
                )));
            }
            None => host,
        };
        if host.is_empty() {
            return Err(Error::Config(format!("address '{}' has an empty host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("address '{}' has an invalid port: {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reconnection policy applied by the event loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to reconnect at all after a disconnect.
    pub enabled: bool,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub backoff_multiplier: f64,
    /// Give up after this many consecutive failures (`None` = never).
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Configuration for an upstream input operator.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Upstream endpoints bound to this instance. Exactly one is allowed at
    /// activation.
    pub connect_addresses: Vec<Address>,
    /// Capacity of the handover queue.
    pub handover_capacity: usize,
    /// Sleep applied on every idle tick.
    pub idle_backoff: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Largest accepted inbound frame.
    pub max_frame_size: usize,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_addresses: Vec::new(),
            handover_capacity: DEFAULT_HANDOVER_CAPACITY,
            idle_backoff: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 64 * 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl UpstreamConfig {
    /// Create a configuration bound to a single upstream address.
    pub fn new(address: Address) -> Self {
        Self {
            connect_addresses: vec![address],
            ..Default::default()
        }
    }

    /// Set the bound addresses.
    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.connect_addresses = addresses;
        self
    }

    /// Set the handover queue capacity.
    pub fn with_handover_capacity(mut self, capacity: usize) -> Self {
        self.handover_capacity = capacity;
        self
    }

    /// Set the idle tick sleep.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the largest accepted inbound frame.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// The single address this instance serves.
    ///
    /// Binding anything other than exactly one address is a configuration
    /// error.
    pub fn single_address(&self) -> Result<&Address, Error> {
        match self.connect_addresses.as_slice() {
            [address] => Ok(address),
            addresses => Err(Error::Config(format!(
                "an upstream input instance must be bound to exactly 1 address, got {}",
                addresses.len()
            ))),
        }
    }
}
