//! Configuration for the horizon and its outbound connections.
//!
//! Values come from the process environment (`RELATIVITY_*`); everything has
//! a default except the identity of the local bounded context, which is only
//! required once outbound horizons are configured.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use relativity_core::{ApplicationId, BoundedContextId, EventArtifact};
use relativity_events::{GenerationMatch, InterestSet};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50051";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TUNNEL_CAPACITY: usize = 64;
pub const DEFAULT_INGRESS_CAPACITY: usize = 1024;

pub const ENV_LISTEN_ADDR: &str = "RELATIVITY_LISTEN_ADDR";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "RELATIVITY_HANDSHAKE_TIMEOUT_MS";
pub const ENV_DELIVERY_TIMEOUT_MS: &str = "RELATIVITY_DELIVERY_TIMEOUT_MS";
pub const ENV_TUNNEL_CAPACITY: &str = "RELATIVITY_TUNNEL_CAPACITY";
pub const ENV_INGRESS_CAPACITY: &str = "RELATIVITY_INGRESS_CAPACITY";
pub const ENV_GENERATION_MATCH: &str = "RELATIVITY_GENERATION_MATCH";
pub const ENV_APPLICATION: &str = "RELATIVITY_APPLICATION";
pub const ENV_BOUNDED_CONTEXT: &str = "RELATIVITY_BOUNDED_CONTEXT";
pub const ENV_REMOTE_HORIZONS: &str = "RELATIVITY_REMOTE_HORIZONS";
pub const ENV_INTEREST: &str = "RELATIVITY_INTEREST";
pub const ENV_RECONNECT_DELAY_MS: &str = "RELATIVITY_RECONNECT_DELAY_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "RELATIVITY_CONNECT_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is required when remote horizons are configured")]
    Missing(&'static str),
}

/// Settings of the serving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorizonConfig {
    pub listen_addr: SocketAddr,
    /// How long an accepted socket may take to send its `OpenTunnel` frame.
    pub handshake_timeout: Duration,
    /// Upper bound for a single delivery to a single singularity.
    pub delivery_timeout: Duration,
    /// Streams buffered per tunnel before deliveries start waiting.
    pub tunnel_capacity: usize,
    /// Streams buffered between `pass_through` and the dispatcher.
    pub ingress_capacity: usize,
    pub generation_match: GenerationMatch,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            tunnel_capacity: DEFAULT_TUNNEL_CAPACITY,
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            generation_match: GenerationMatch::default(),
        }
    }
}

impl HorizonConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (tests, embedding applications).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: parse_or(&lookup, ENV_LISTEN_ADDR, defaults.listen_addr)?,
            handshake_timeout: millis_or(&lookup, ENV_HANDSHAKE_TIMEOUT_MS, defaults.handshake_timeout)?,
            delivery_timeout: millis_or(&lookup, ENV_DELIVERY_TIMEOUT_MS, defaults.delivery_timeout)?,
            tunnel_capacity: positive_or(&lookup, ENV_TUNNEL_CAPACITY, defaults.tunnel_capacity)?,
            ingress_capacity: positive_or(&lookup, ENV_INGRESS_CAPACITY, defaults.ingress_capacity)?,
            generation_match: parse_or(&lookup, ENV_GENERATION_MATCH, defaults.generation_match)?,
        })
    }
}

/// Settings of one outbound subscription towards a remote horizon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub application: ApplicationId,
    pub bounded_context: BoundedContextId,
    /// `host:port` of the remote horizon.
    pub remote: String,
    pub interest: InterestSet,
    /// Pause between a broken stream and the next attempt.
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for the horizon to answer `OpenTunnel`.
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(
        application: ApplicationId,
        bounded_context: BoundedContextId,
        remote: impl Into<String>,
        interest: InterestSet,
    ) -> Self {
        Self {
            application,
            bounded_context,
            remote: remote.into(),
            interest,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// One config per remote listed in `RELATIVITY_REMOTE_HORIZONS`.
    pub fn all_from_env() -> Result<Vec<Self>, ConfigError> {
        Self::all_from_lookup(|key| std::env::var(key).ok())
    }

    pub fn all_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<Self>, ConfigError> {
        let remotes: Vec<String> = lookup(ENV_REMOTE_HORIZONS)
            .map(|raw| split_list(&raw).map(str::to_string).collect())
            .unwrap_or_default();
        if remotes.is_empty() {
            return Ok(Vec::new());
        }

        let application: ApplicationId = required(&lookup, ENV_APPLICATION)?;
        let bounded_context: BoundedContextId = required(&lookup, ENV_BOUNDED_CONTEXT)?;
        let interest = interest_from(&lookup)?;
        let reconnect_delay = millis_or(&lookup, ENV_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_DELAY)?;
        let connect_timeout = millis_or(&lookup, ENV_CONNECT_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT)?;
        let handshake_timeout = millis_or(&lookup, ENV_HANDSHAKE_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT)?;

        Ok(remotes
            .into_iter()
            .map(|remote| {
                Self::new(application, bounded_context, remote, interest.clone())
                    .with_reconnect_delay(reconnect_delay)
                    .with_connect_timeout(connect_timeout)
                    .with_handshake_timeout(handshake_timeout)
            })
            .collect())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn interest_from(lookup: &impl Fn(&str) -> Option<String>) -> Result<InterestSet, ConfigError> {
    let raw = lookup(ENV_INTEREST).ok_or(ConfigError::Missing(ENV_INTEREST))?;
    let artifacts = split_list(&raw)
        .map(|entry| {
            EventArtifact::from_str(entry).map_err(|e| ConfigError::Invalid {
                key: ENV_INTEREST,
                value: entry.to_string(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if artifacts.is_empty() {
        return Err(ConfigError::Missing(ENV_INTEREST));
    }
    Ok(InterestSet::new(artifacts))
}

fn required<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let raw = lookup(key).ok_or(ConfigError::Missing(key))?;
    parse(key, &raw)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_or(lookup, key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(millis))
}

fn positive_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let value: usize = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
