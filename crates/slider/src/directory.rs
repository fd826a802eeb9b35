//! Registry of backend servers and their health.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::connection::{Connection, Side};
use crate::error::BackendError;
use crate::pipeline::EventStream;

/// Result of the latest connection attempts to a backend.
#[derive(Debug, Clone, Default)]
pub struct BackendHealth {
    /// Whether the last attempt succeeded. Unknown backends count as available.
    pub available: bool,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// When the last attempt finished.
    pub last_attempt: Option<Instant>,
}

/// A backend server known to the proxy.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    /// Unique name (e.g., "lobby", "survival")
    pub name: String,
    /// Address (host:port, supports hostnames)
    pub addr: String,
    /// Disabled backends are skipped when players join or switch
    pub enabled: bool,
    /// Connection health
    pub health: BackendHealth,
}

impl BackendTarget {
    /// Create an enabled backend with the given name and address.
    #[must_use]
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            enabled: true,
            health: BackendHealth {
                available: true,
                ..BackendHealth::default()
            },
        }
    }
}

/// Thread-safe table of backend servers.
#[derive(Debug)]
pub struct BackendDirectory {
    servers: RwLock<Vec<BackendTarget>>,
    network: NetworkConfig,
}

impl BackendDirectory {
    /// Create an empty directory. Backend connections use `network`.
    #[must_use]
    pub const fn new(network: NetworkConfig) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            network,
        }
    }

    /// Register a new backend.
    /// Returns `true` if it was added, `false` if the name is already taken.
    pub fn register(&self, target: BackendTarget) -> bool {
        let mut servers = self.servers.write();
        if servers.iter().any(|s| s.name == target.name) {
            return false;
        }

        info!(server = %target.name, addr = %target.addr, "Registered backend");
        servers.push(target);
        true
    }

    /// Deregister a backend by name.
    /// Returns the removed backend, or `None` if not found.
    pub fn deregister(&self, name: &str) -> Option<BackendTarget> {
        let mut servers = self.servers.write();
        servers
            .iter()
            .position(|s| s.name == name)
            .map(|pos| servers.remove(pos))
    }

    /// Enable or disable a backend. Returns `false` if not found.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut servers = self.servers.write();
        servers
            .iter_mut()
            .find(|s| s.name == name)
            .map(|s| s.enabled = enabled)
            .is_some()
    }

    /// List all backends.
    pub fn list(&self) -> Vec<BackendTarget> {
        self.servers.read().clone()
    }

    /// Look a backend up by name.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownServer`] or [`BackendError::Disabled`].
    pub fn resolve(&self, name: &str) -> Result<BackendTarget, BackendError> {
        let servers = self.servers.read();
        let target = servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BackendError::UnknownServer(name.to_string()))?;

        if !target.enabled {
            return Err(BackendError::Disabled(name.to_string()));
        }
        Ok(target.clone())
    }

    /// Open a connection to `target`, recording the outcome in its health.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Connect`] or [`BackendError::Timeout`].
    pub async fn connect(
        &self,
        target: &BackendTarget,
        timeout: Duration,
    ) -> Result<(Connection, EventStream), BackendError> {
        debug!(server = %target.name, addr = %target.addr, "Connecting to backend");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                let err = BackendError::Connect {
                    server: target.name.clone(),
                    source,
                };
                self.record_failure(&target.name, &err);
                return Err(err);
            }
            Err(_) => {
                let err = BackendError::Timeout {
                    server: target.name.clone(),
                    after: timeout,
                };
                self.record_failure(&target.name, &err);
                return Err(err);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(server = %target.name, "Failed to set TCP_NODELAY: {e}");
        }

        self.record_success(&target.name);
        Ok(Connection::open(stream, Side::Backend, &self.network))
    }

    /// Record a failure that happened after the TCP connect, e.g. during login.
    pub fn record_failure(&self, name: &str, err: &BackendError) {
        warn!(server = %name, "Backend attempt failed: {err}");
        self.update_health(name, |health| {
            health.available = false;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_error = Some(err.to_string());
        });
    }

    fn record_success(&self, name: &str) {
        self.update_health(name, |health| {
            health.available = true;
            health.consecutive_failures = 0;
            health.last_error = None;
        });
    }

    fn update_health(&self, name: &str, update: impl FnOnce(&mut BackendHealth)) {
        let mut servers = self.servers.write();
        if let Some(target) = servers.iter_mut().find(|s| s.name == name) {
            update(&mut target.health);
            target.health.last_attempt = Some(Instant::now());
        }
    }
}
