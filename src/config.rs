//! Server configuration
//!
//! Defaults come from [`ServerConfig::default`]; `CHAT_RELAY_*` environment
//! variables (and a `.env` file, if present) override them through the
//! `config` crate. Every loaded configuration is validated before use.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Prefix of the environment variables read by [`ServerConfig::load`]
const ENV_PREFIX: &str = "CHAT_RELAY";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Request path accepted for WebSocket upgrades
    pub ws_path: String,

    /// Capacity of each session's outbound queue
    pub send_queue_capacity: usize,

    /// Capacity of the hub's command channel
    pub hub_channel_capacity: usize,

    /// Time allowed for a single write to the peer
    pub write_wait: Duration,

    /// Time allowed between frames from the peer
    pub pong_wait: Duration,

    /// Keepalive ping period, must be less than `pong_wait`
    pub ping_period: Duration,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ws_path: "/ws".to_string(),
            send_queue_capacity: 256,
            hub_channel_capacity: 256,
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: keepalive_period(pong_wait),
            max_message_size: 8 * 1024,
        }
    }
}

/// Ping at nine tenths of the read deadline
fn keepalive_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

/// Overrides as read from the environment, all optional
///
/// `CHAT_RELAY_PONG_WAIT_SECS` arrives here as `pong_wait_secs`.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    addr: Option<String>,
    ws_path: Option<String>,
    send_queue: Option<usize>,
    pong_wait_secs: Option<u64>,
    write_wait_secs: Option<u64>,
}

impl EnvOverrides {
    fn apply(self, mut config: ServerConfig) -> Result<ServerConfig, ConfigError> {
        if let Some(addr) = self.addr {
            let parsed = addr
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "CHAT_RELAY_ADDR",
                    value: addr.clone(),
                })?;
            config = config.bind(parsed);
        }
        if let Some(path) = self.ws_path {
            config = config.ws_path(path);
        }
        if let Some(capacity) = self.send_queue {
            config = config.send_queue_capacity(capacity);
        }
        if let Some(secs) = self.pong_wait_secs {
            config = config.pong_wait(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_wait_secs {
            config = config.write_wait(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

impl ServerConfig {
    /// Load configuration from `.env` and `CHAT_RELAY_*` variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration fails [`validate`](Self::validate).
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        Self::from_environment(::config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Defaults overridden by the given environment source, then validated
    pub fn from_environment(source: ::config::Environment) -> Result<Self, ConfigError> {
        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(source.try_parsing(true))
            .build()?
            .try_deserialize()?;

        let config = overrides.apply(Self::default())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pumps cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::MustBePositive("send_queue_capacity"));
        }
        if self.hub_channel_capacity == 0 {
            return Err(ConfigError::MustBePositive("hub_channel_capacity"));
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::MustBePositive("write_wait"));
        }
        if self.pong_wait.is_zero() {
            return Err(ConfigError::MustBePositive("pong_wait"));
        }
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(ConfigError::PingPeriod);
        }
        Ok(())
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the upgrade path
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set the outbound queue capacity
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set the write deadline
    pub fn write_wait(mut self, timeout: Duration) -> Self {
        self.write_wait = timeout;
        self
    }

    /// Set the read deadline; the keepalive period follows it
    pub fn pong_wait(mut self, timeout: Duration) -> Self {
        self.pong_wait = timeout;
        self.ping_period = keepalive_period(timeout);
        self
    }

    /// Set the maximum inbound message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}
