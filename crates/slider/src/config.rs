//! Proxy configuration, read from environment variables.

use std::env;
use std::time::Duration;

use slider_mc::codec::MAX_PACKET_SIZE;

use crate::connection::OverflowPolicy;
use crate::forwarding::Forwarding;

/// Error type for environment variable parsing.
pub type EnvError = Box<dyn std::error::Error + Send + Sync>;

/// Read an environment variable, returning `None` when it is unset.
fn env_raw(name: &str) -> Result<Option<String>, EnvError> {
    match env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(format!("{name}: {e}").into()),
    }
}

/// Parse an environment variable as a boolean, with a default value.
///
/// Valid values (case-insensitive): "true", "1", "false", "0".
/// Returns an error for any other value to prevent misconfiguration.
///
/// # Errors
///
/// Returns an error if the environment variable is set to an invalid value,
/// or if the value contains invalid Unicode.
pub fn env_bool(name: &str, default: bool) -> Result<bool, EnvError> {
    let Some(value) = env_raw(name)? else {
        return Ok(default);
    };

    match value.to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!(
            "{name}: invalid value '{value}' (expected 'true', 'false', '1', or '0')"
        )
        .into()),
    }
}

/// Parse an environment variable as a u32, with a default value.
///
/// # Errors
///
/// Returns an error if the environment variable is set to an invalid value,
/// or if the value contains invalid Unicode.
pub fn env_u32(name: &str, default: u32) -> Result<u32, EnvError> {
    env_raw(name)?.map_or(Ok(default), |value| {
        value.parse().map_err(|e| format!("{name}: {e}").into())
    })
}

/// Parse an environment variable as an i32, with a default value.
///
/// # Errors
///
/// Returns an error if the value is not an integer.
pub fn env_i32(name: &str, default: i32) -> Result<i32, EnvError> {
    env_raw(name)?.map_or(Ok(default), |value| {
        value.parse().map_err(|e| format!("{name}: {e}").into())
    })
}

/// Parse an environment variable as a non-zero usize, with a default value.
///
/// # Errors
///
/// Returns an error if the value is not a positive integer.
pub fn env_usize(name: &str, default: usize) -> Result<usize, EnvError> {
    let value = env_raw(name)?.map_or(Ok(default), |value| {
        value
            .parse::<usize>()
            .map_err(|e| EnvError::from(format!("{name}: {e}")))
    })?;

    if value == 0 {
        return Err(format!("{name}: must be greater than zero").into());
    }
    Ok(value)
}

/// Parse an environment variable holding milliseconds.
///
/// # Errors
///
/// Returns an error if the value is not a positive integer.
pub fn env_duration_ms(name: &str, default: Duration) -> Result<Duration, EnvError> {
    let Some(value) = env_raw(name)? else {
        return Ok(default);
    };

    match value.parse::<u64>() {
        Ok(0) => Err(format!("{name}: must be greater than zero").into()),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(format!("{name}: {e}").into()),
    }
}

/// Read an environment variable as a string, with a default value.
///
/// # Errors
///
/// Returns an error if the value contains invalid Unicode.
pub fn env_string(name: &str, default: &str) -> Result<String, EnvError> {
    Ok(env_raw(name)?.unwrap_or_else(|| default.to_string()))
}

/// Read a comma separated list. Blank entries are skipped.
///
/// # Errors
///
/// Returns an error if the value contains invalid Unicode.
pub fn env_list(name: &str) -> Result<Vec<String>, EnvError> {
    Ok(env_raw(name)?
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

/// Parse an overflow policy name.
fn env_overflow(name: &str, default: OverflowPolicy) -> Result<OverflowPolicy, EnvError> {
    let Some(value) = env_raw(name)? else {
        return Ok(default);
    };

    match value.to_lowercase().as_str() {
        "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
        "close" => Ok(OverflowPolicy::Close),
        _ => Err(format!(
            "{name}: invalid value '{value}' (expected 'drop_oldest' or 'close')"
        )
        .into()),
    }
}

/// Parse `name=host:port` entries.
///
/// # Errors
///
/// Returns an error for entries without a name or an address.
pub fn parse_servers(entries: &[String]) -> Result<Vec<(String, String)>, EnvError> {
    entries
        .iter()
        .map(|entry| {
            let (name, addr) = entry
                .split_once('=')
                .ok_or_else(|| format!("SERVERS: '{entry}' is not of the form name=host:port"))?;
            let (name, addr) = (name.trim(), addr.trim());
            if name.is_empty() || addr.is_empty() {
                return Err(format!("SERVERS: '{entry}' is missing a name or an address").into());
            }
            Ok((name.to_string(), addr.to_string()))
        })
        .collect()
}

/// Settings every [`Connection`](crate::connection::Connection) is opened with.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Largest frame accepted or produced.
    pub max_frame_len: usize,
    /// Capacity of each connection's event pipeline.
    pub event_queue_capacity: usize,
    /// Capacity of each connection's send queue.
    pub send_queue_capacity: usize,
    /// What to do when a bulk packet finds the send queue full.
    ///
    /// Bulk covers every packet relayed opaque, chunks and entity updates
    /// included, and the client is not told when one is dropped. Deployments
    /// that only relay should set `OVERFLOW_BULK=close` so a slow client is
    /// disconnected instead of silently desynced.
    pub bulk_overflow: OverflowPolicy,
    /// What to do when a critical packet finds the send queue full.
    pub critical_overflow: OverflowPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_PACKET_SIZE,
            event_queue_capacity: 256,
            send_queue_capacity: 1024,
            bulk_overflow: OverflowPolicy::DropOldest,
            critical_overflow: OverflowPolicy::Close,
        }
    }
}

/// Timeouts and limits of a player session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for a TCP connect to a backend.
    pub connect_timeout: Duration,
    /// Time allowed for a login, client or backend side.
    pub login_timeout: Duration,
    /// Time allowed between starting a backend switch and swapping backends.
    pub switch_timeout: Duration,
    /// Client packets held while a switch is in flight.
    pub switch_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(30),
            switch_timeout: Duration::from_secs(10),
            switch_queue_capacity: 256,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to accept players on.
    pub bind: String,
    /// Known backends as `(name, address)`.
    pub servers: Vec<(String, String)>,
    /// Backend new players join first.
    pub default_server: String,
    /// Backends tried, in order, when the default one is unavailable.
    pub fallback_servers: Vec<String>,
    /// Authenticate players against Mojang.
    pub online_mode: bool,
    /// Compression threshold for client connections, negative to disable.
    pub compression_threshold: i32,
    /// Player limit shown in the server list and enforced at login.
    pub max_players: u32,
    /// Server list description.
    pub motd: String,
    /// How player identity reaches backends.
    pub forwarding: Forwarding,
    /// Address of the operator REST API, if enabled.
    pub api_bind: Option<String>,
    /// Per-connection settings.
    pub network: NetworkConfig,
    /// Per-session settings.
    pub session: SessionConfig,
}

impl ProxyConfig {
    /// Build the configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid variable.
    pub fn from_env() -> Result<Self, EnvError> {
        let network_defaults = NetworkConfig::default();
        let session_defaults = SessionConfig::default();

        let servers = parse_servers(&env_list("SERVERS")?)?;
        let default_server = match env_raw("DEFAULT_SERVER")? {
            Some(name) => name,
            None => servers
                .first()
                .map(|(name, _)| name.clone())
                .ok_or("SERVERS: at least one backend server is required")?,
        };

        let forwarding = Forwarding::from_settings(
            &env_string("FORWARDING", "none")?,
            env_raw("FORWARDING_SECRET")?.as_deref(),
        )?;

        let max_frame_len = env_usize("MAX_FRAME_SIZE", network_defaults.max_frame_len)?;
        if max_frame_len > MAX_PACKET_SIZE {
            return Err(format!("MAX_FRAME_SIZE: must be at most {MAX_PACKET_SIZE}").into());
        }

        Ok(Self {
            bind: env_string("ADDR", "0.0.0.0:25565")?,
            servers,
            default_server,
            fallback_servers: env_list("FALLBACK_SERVERS")?,
            online_mode: env_bool("ONLINE_MODE", true)?,
            compression_threshold: env_i32("COMPRESSION_THRESHOLD", 256)?,
            max_players: env_u32("MAX_PLAYERS", 100)?,
            motd: env_string("MOTD", "A Slider Proxy Server")?,
            forwarding,
            api_bind: env_raw("API_ADDR")?,
            network: NetworkConfig {
                max_frame_len,
                event_queue_capacity: env_usize(
                    "EVENT_QUEUE_CAPACITY",
                    network_defaults.event_queue_capacity,
                )?,
                send_queue_capacity: env_usize(
                    "SEND_QUEUE_CAPACITY",
                    network_defaults.send_queue_capacity,
                )?,
                bulk_overflow: env_overflow("OVERFLOW_BULK", network_defaults.bulk_overflow)?,
                critical_overflow: env_overflow(
                    "OVERFLOW_CONTROL",
                    network_defaults.critical_overflow,
                )?,
            },
            session: SessionConfig {
                connect_timeout: env_duration_ms(
                    "CONNECT_TIMEOUT_MS",
                    session_defaults.connect_timeout,
                )?,
                login_timeout: env_duration_ms("LOGIN_TIMEOUT_MS", session_defaults.login_timeout)?,
                switch_timeout: env_duration_ms(
                    "SWITCH_TIMEOUT_MS",
                    session_defaults.switch_timeout,
                )?,
                switch_queue_capacity: env_usize(
                    "SWITCH_QUEUE_CAPACITY",
                    session_defaults.switch_queue_capacity,
                )?,
            },
        })
    }

    /// Backends to try for a new player, default first, without duplicates.
    #[must_use]
    pub fn join_order(&self) -> Vec<String> {
        let mut order = vec![self.default_server.clone()];
        for name in &self.fallback_servers {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }
}
