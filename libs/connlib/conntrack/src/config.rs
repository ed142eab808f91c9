use std::{env::VarError, str::FromStr, time::Duration};

use anyhow::{Context as _, Result};

use crate::{Error, tcp::State};

/// How long an established connection may stay idle before it is forgotten.
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// How long a handshake may take before the half-open connection is forgotten.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a closing connection may wait for its final ACKs (2 * MSL).
pub const DEFAULT_CLOSING_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// One entry is roughly 100 bytes, so a full table takes up ~6.5MB.
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub tcp_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub closing_timeout: Duration,
    /// Upper bound on the number of tracked connections.
    ///
    /// When reached, the connection that has been idle the longest is evicted to make room for a new one.
    pub max_connections: usize,
    pub reap_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_TCP_IDLE_TIMEOUT)
    }
}

impl Config {
    pub fn new(tcp_idle_timeout: Duration) -> Self {
        Self {
            tcp_idle_timeout,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            closing_timeout: DEFAULT_CLOSING_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reap_interval: DEFAULT_REAP_INTERVAL.min(tcp_idle_timeout),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_closing_timeout(mut self, closing_timeout: Duration) -> Self {
        self.closing_timeout = closing_timeout;
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Reads the configuration from `CONNTRACK_*` environment variables, falling back to the defaults.
    ///
    /// Durations are parsed in humantime format, e.g. `90s` or `2h 30m`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name))
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Result<String, VarError>) -> Result<Self> {
        let mut config = match read_duration(&lookup, "CONNTRACK_TCP_IDLE_TIMEOUT")? {
            Some(idle) => Config::new(idle),
            None => Config::default(),
        };

        if let Some(timeout) = read_duration(&lookup, "CONNTRACK_HANDSHAKE_TIMEOUT")? {
            config.handshake_timeout = timeout;
        }

        if let Some(timeout) = read_duration(&lookup, "CONNTRACK_CLOSING_TIMEOUT")? {
            config.closing_timeout = timeout;
        }

        if let Some(interval) = read_duration(&lookup, "CONNTRACK_REAP_INTERVAL")? {
            config.reap_interval = interval;
        }

        if let Some(max) = read_var::<usize>(&lookup, "CONNTRACK_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.tcp_idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("TCP idle timeout must be non-zero"));
        }

        if self.handshake_timeout.is_zero() {
            return Err(Error::InvalidConfig("handshake timeout must be non-zero"));
        }

        if self.closing_timeout.is_zero() {
            return Err(Error::InvalidConfig("closing timeout must be non-zero"));
        }

        if self.reap_interval.is_zero() {
            return Err(Error::InvalidConfig("reap interval must be non-zero"));
        }

        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max connections must be non-zero"));
        }

        Ok(())
    }

    /// How long a connection in the given state may stay idle.
    ///
    /// Never longer than [`Config::tcp_idle_timeout`].
    pub fn timeout_for(&self, state: State) -> Duration {
        if state.is_handshake() {
            return self.handshake_timeout.min(self.tcp_idle_timeout);
        }

        if state.is_closing() {
            return self.closing_timeout.min(self.tcp_idle_timeout);
        }

        self.tcp_idle_timeout
    }
}

fn read_duration(
    lookup: impl Fn(&str) -> Result<String, VarError>,
    name: &str,
) -> Result<Option<Duration>> {
    let duration = read_var::<humantime::Duration>(lookup, name)?;

    Ok(duration.map(Duration::from))
}

fn read_var<T>(lookup: impl Fn(&str) -> Result<String, VarError>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = match lookup(name) {
        Ok(var) => var,
        Err(VarError::NotPresent) => return Ok(None),
        Err(e @ VarError::NotUnicode(_)) => return Err(anyhow::Error::new(e)),
    };

    let value = var
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse `{name}`"))?;

    Ok(Some(value))
}
