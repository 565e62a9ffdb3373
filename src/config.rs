use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default multicast group used for stream advertisements
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 172, 215);

/// Default UDP port of the discovery service
pub const DEFAULT_DISCOVERY_PORT: u16 = 16571;

/// Transport configuration shared by discovery, outlets and inlets
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Multicast group for advertisements and queries
    pub multicast_group: Ipv4Addr,
    /// Join and send to the multicast group
    pub multicast_enabled: bool,
    /// Multicast TTL (1 keeps traffic on the local segment)
    pub multicast_ttl: u32,
    /// UDP port of the discovery socket (0 for an ephemeral port)
    pub discovery_port: u16,
    /// Unicast discovery peers that receive every advertisement and query
    pub known_peers: Vec<SocketAddr>,
    /// Local address for the discovery socket and outlet listeners
    pub bind_addr: Ipv4Addr,
    /// Interval between re-advertisements of local outlets
    pub advertise_interval: Duration,
    /// Remote entries not refreshed within this window are dropped
    pub liveness_window: Duration,
    /// Interval between repeated queries while a resolve is pending
    pub query_interval: Duration,
    /// Interval between clock probes on each inlet connection
    pub clock_probe_interval: Duration,
    /// Number of recent round-trip times kept for outlier detection
    pub clock_window: usize,
    /// Probes with a round-trip time above this percentile of the window are discarded
    pub clock_outlier_percentile: f64,
    /// Timeout for opening a connection and completing the handshake
    pub connect_timeout: Duration,
    /// First delay before an inlet reconnects
    pub reconnect_initial_backoff: Duration,
    /// Upper bound of the reconnect delay
    pub reconnect_max_backoff: Duration,
    /// Bounded wait when re-resolving a dropped stream
    pub reresolve_timeout: Duration,
    /// Hard cap on any ring or receive buffer
    pub max_buffered_samples: usize,
    /// Largest accepted TCP frame in bytes
    pub max_frame_bytes: usize,
    /// Worker threads of the transport runtime (None for one per core)
    pub worker_threads: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_enabled: true,
            multicast_ttl: 1,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            known_peers: Vec::new(),
            bind_addr: Ipv4Addr::UNSPECIFIED,
            advertise_interval: Duration::from_secs(1),
            liveness_window: Duration::from_secs(5),
            query_interval: Duration::from_millis(250),
            clock_probe_interval: Duration::from_secs(1),
            clock_window: 32,
            clock_outlier_percentile: 0.9,
            connect_timeout: Duration::from_secs(2),
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(5),
            reresolve_timeout: Duration::from_secs(1),
            max_buffered_samples: 1_000_000,
            max_frame_bytes: 16 * 1024 * 1024,
            worker_threads: None,
        }
    }
}

impl TransportConfig {
    /// Configuration confined to the loopback interface: no multicast and an
    /// ephemeral discovery port, so several transports can share one host.
    pub fn loopback() -> Self {
        Self {
            multicast_enabled: false,
            discovery_port: 0,
            bind_addr: Ipv4Addr::LOCALHOST,
            worker_threads: Some(2),
            ..Self::default()
        }
    }

    /// Add unicast discovery peers
    pub fn with_known_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.known_peers.extend(peers);
        self
    }

    /// Load configuration from environment variables (and a `.env` file if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            multicast_group: parse_var("LSL_MULTICAST_GROUP")?.unwrap_or(defaults.multicast_group),
            multicast_enabled: env::var("LSL_MULTICAST_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.multicast_enabled),
            multicast_ttl: parse_var("LSL_MULTICAST_TTL")?.unwrap_or(defaults.multicast_ttl),
            discovery_port: parse_var("LSL_DISCOVERY_PORT")?.unwrap_or(defaults.discovery_port),
            known_peers: match env::var("LSL_KNOWN_PEERS") {
                Ok(raw) => parse_peers(&raw)?,
                Err(_) => defaults.known_peers,
            },
            bind_addr: parse_var("LSL_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            advertise_interval: parse_millis("LSL_ADVERTISE_INTERVAL_MS")?
                .unwrap_or(defaults.advertise_interval),
            liveness_window: parse_millis("LSL_LIVENESS_WINDOW_MS")?
                .unwrap_or(defaults.liveness_window),
            query_interval: parse_millis("LSL_QUERY_INTERVAL_MS")?
                .unwrap_or(defaults.query_interval),
            clock_probe_interval: parse_millis("LSL_CLOCK_PROBE_INTERVAL_MS")?
                .unwrap_or(defaults.clock_probe_interval),
            connect_timeout: parse_millis("LSL_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout),
            reconnect_max_backoff: parse_millis("LSL_RECONNECT_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.reconnect_max_backoff),
            max_buffered_samples: parse_var("LSL_MAX_BUFFERED_SAMPLES")?
                .unwrap_or(defaults.max_buffered_samples),
            worker_threads: parse_var("LSL_WORKER_THREADS")?.or(defaults.worker_threads),
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("advertise_interval", self.advertise_interval),
            ("liveness_window", self.liveness_window),
            ("query_interval", self.query_interval),
            ("clock_probe_interval", self.clock_probe_interval),
            ("connect_timeout", self.connect_timeout),
            ("reconnect_initial_backoff", self.reconnect_initial_backoff),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }

        if self.liveness_window <= self.advertise_interval {
            return Err(ConfigError::InvalidValue(
                "liveness_window must be longer than advertise_interval".to_string(),
            ));
        }
        if self.reconnect_max_backoff < self.reconnect_initial_backoff {
            return Err(ConfigError::InvalidValue(
                "reconnect_max_backoff must not be shorter than reconnect_initial_backoff"
                    .to_string(),
            ));
        }
        if !(self.clock_outlier_percentile > 0.0 && self.clock_outlier_percentile <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "clock_outlier_percentile must be in (0, 1]".to_string(),
            ));
        }
        if self.clock_window == 0 || self.max_buffered_samples == 0 {
            return Err(ConfigError::InvalidValue(
                "clock_window and max_buffered_samples must be positive".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(
                "max_frame_bytes must be between 1 and 4 GiB".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::InvalidValue(
                "worker_threads must be positive".to_string(),
            ));
        }
        if self.multicast_enabled && !self.multicast_group.is_multicast() {
            return Err(ConfigError::InvalidValue(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        Ok(())
    }

    /// Every address that receives advertisements and queries
    pub fn discovery_targets(&self) -> Vec<SocketAddr> {
        let mut targets = Vec::with_capacity(self.known_peers.len() + 1);
        targets.extend(self.multicast_target());
        targets.extend(self.known_peers.iter().copied());
        targets
    }

    /// The multicast group and port, when multicast is enabled
    pub fn multicast_target(&self) -> Option<SocketAddr> {
        self.multicast_enabled
            .then(|| SocketAddr::from((self.multicast_group, self.discovery_port_or_default())))
    }

    fn discovery_port_or_default(&self) -> u16 {
        if self.discovery_port == 0 {
            DEFAULT_DISCOVERY_PORT
        } else {
            self.discovery_port
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

fn parse_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

fn parse_peers(raw: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidEnvVar {
                name: "LSL_KNOWN_PEERS".to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnvVar { name: String, value: String },
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
