use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Transport protocol for the measured traffic.
///
/// # Examples
///
/// ```
/// use netmeter::{Config, Protocol};
///
/// let tcp = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Tcp);
///
/// let udp = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bitrate(10_000_000); // 10 Mbps
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Reliable, ordered delivery; throughput only
    Tcp,
    /// Best-effort delivery; throughput, loss and jitter
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Listens for control connections and receives data streams
    Server,
    /// Connects to a server and drives the test
    Client,
}

/// Default payload size for UDP data packets (excluding the header),
/// chosen to stay under the typical Ethernet MTU.
pub const DEFAULT_UDP_PAYLOAD: usize = 1400;

/// Default write-buffer size for TCP streams.
pub const DEFAULT_TCP_PAYLOAD: usize = 128 * 1024;

/// Configuration for one measurement session.
///
/// Holds every recognized option for both roles. Use the builder methods to
/// customize, then `validate()` rejects inconsistent combinations before any
/// network I/O happens.
///
/// # Examples
///
/// ```
/// use netmeter::{Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bitrate(50_000_000)
///     .with_parallel(4)
///     .with_duration(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol for the data streams
    pub protocol: Protocol,

    /// Control-channel port; data connections use the port the server
    /// assigns in its handshake reply (control port + 1 by default)
    pub port: u16,

    /// Server address (client mode)
    pub server_addr: Option<String>,

    /// Bind address (server mode)
    pub bind_addr: Option<IpAddr>,

    /// Test duration
    pub duration: Duration,

    /// Target bitrate in bits per second; required for UDP, invalid for TCP
    pub bitrate: Option<u64>,

    /// Payload size per write (TCP) or per packet excluding header (UDP)
    pub payload_size: usize,

    /// Number of parallel data streams
    pub parallel: usize,

    /// Cadence for interval samples
    pub interval: Duration,

    /// Bounded wait for the handshake and for all data connections to
    /// establish; the session aborts entirely when it elapses
    pub connect_timeout: Duration,

    /// Path to persist the result as JSON (stdout summary is always printed)
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: 5201,
            server_addr: None,
            bind_addr: None,
            duration: Duration::from_secs(10),
            bitrate: None,
            payload_size: DEFAULT_TCP_PAYLOAD,
            parallel: 1,
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            output: None,
        }
    }
}

impl Config {
    /// Creates a server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Sets the protocol and, when switching to UDP with the TCP default
    /// payload still in place, shrinks the payload to fit a datagram.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        if protocol == Protocol::Udp && self.payload_size == DEFAULT_TCP_PAYLOAD {
            self.payload_size = DEFAULT_UDP_PAYLOAD;
        }
        self.protocol = protocol;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the UDP target bitrate in bits per second.
    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    /// Rejects invalid parameter combinations before any network call.
    ///
    /// The same rules are applied by the server to an incoming handshake, so
    /// a client bypassing its own checks still gets a clean rejection.
    pub fn validate(&self) -> Result<()> {
        if self.parallel < 1 {
            return Err(Error::Config("parallel must be >= 1".to_string()));
        }
        if self.duration.is_zero() {
            return Err(Error::Config("duration must be > 0".to_string()));
        }
        if self.payload_size == 0 {
            return Err(Error::Config("payload size must be > 0".to_string()));
        }
        match self.protocol {
            Protocol::Udp => {
                match self.bitrate {
                    None | Some(0) => {
                        return Err(Error::Config(
                            "UDP tests require a target bitrate".to_string(),
                        ));
                    }
                    Some(_) => {}
                }
                // Stay within a single datagram: 65507 max UDP payload
                if self.payload_size + crate::packet::DataPacketHeader::SIZE > 65_507 {
                    return Err(Error::Config(format!(
                        "UDP payload size {} exceeds the datagram limit",
                        self.payload_size
                    )));
                }
            }
            Protocol::Tcp => {
                if self.bitrate.is_some() {
                    return Err(Error::Config(
                        "target bitrate is only valid with UDP".to_string(),
                    ));
                }
            }
        }
        if self.mode == Mode::Client && self.server_addr.is_none() {
            return Err(Error::Config(
                "server address is required for client mode".to_string(),
            ));
        }
        Ok(())
    }

    /// The port data connections are directed to when this end assigns it.
    pub fn data_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5201);
        assert_eq!(config.parallel, 1);
        assert_eq!(config.duration, Duration::from_secs(10));
        assert_eq!(config.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_builder() {
        let config = Config::client("10.0.0.1".to_string(), 5300)
            .with_protocol(Protocol::Udp)
            .with_bitrate(100_000_000)
            .with_parallel(4)
            .with_duration(Duration::from_secs(30));

        assert_eq!(config.port, 5300);
        assert_eq!(config.data_port(), 5301);
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.bitrate, Some(100_000_000));
        assert_eq!(config.parallel, 4);
        assert_eq!(config.payload_size, DEFAULT_UDP_PAYLOAD);
    }

    #[test]
    fn test_rejects_zero_parallel() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_parallel(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_duration() {
        let config =
            Config::client("127.0.0.1".to_string(), 5201).with_duration(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_udp_requires_bitrate() {
        let config =
            Config::client("127.0.0.1".to_string(), 5201).with_protocol(Protocol::Udp);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bitrate_without_udp_rejected() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_bitrate(1_000_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_needs_server_addr() {
        let mut config = Config::server(5201);
        config.mode = Mode::Client;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_udp_config() {
        let config = Config::client("127.0.0.1".to_string(), 5201)
            .with_protocol(Protocol::Udp)
            .with_bitrate(10_000_000);
        assert!(config.validate().is_ok());
    }
}
