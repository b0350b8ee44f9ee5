//! Connection settings for pvdd.

use std::time::Duration;

/// Port pvdd listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 10101;

/// Environment variable overriding the daemon port.
pub const PORT_ENV_VAR: &str = "PVDD_PORT";

/// Delay between two reconnection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Options accepted by [`PvddConnection::connect`](crate::PvddConnection::connect).
///
/// # Example
///
/// ```ignore
/// let options = ConnectOptions::default()
///     .with_port(10101)
///     .auto_reconnect(true);
/// connection.connect(options);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Explicit daemon port. Falls back to `PVDD_PORT`, then [`DEFAULT_PORT`].
    pub port: Option<u16>,
    /// Retry every [`RECONNECT_INTERVAL`] while no socket is open.
    pub auto_reconnect: bool,
    /// Send `PVD_CONNECTION_PROMOTE_CONTROL` once connected.
    pub control_connection: bool,
    /// Log lifecycle events and payloads at `info` level.
    pub verbose: bool,
}

impl ConnectOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn control_connection(mut self, enabled: bool) -> Self {
        self.control_connection = enabled;
        self
    }

    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Resolve the port to dial, reading the process environment.
    pub fn resolve_port(&self) -> u16 {
        let env_value = std::env::var(PORT_ENV_VAR).ok();
        resolve_port_from(self.port, env_value.as_deref())
    }
}

/// Resolve the daemon port.
///
/// Resolution order:
/// 1. the explicit port
/// 2. the `PVDD_PORT` value, if it parses as a port number
/// 3. [`DEFAULT_PORT`]
pub fn resolve_port_from(explicit: Option<u16>, env_value: Option<&str>) -> u16 {
    if let Some(port) = explicit {
        return port;
    }

    if let Some(raw) = env_value {
        match raw.trim().parse::<u16>() {
            Ok(port) => return port,
            Err(e) => {
                tracing::warn!("Ignoring {}={:?}: {}", PORT_ENV_VAR, raw, e);
            }
        }
    }

    DEFAULT_PORT
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explicit_port_wins() {
        assert_eq!(resolve_port_from(Some(4242), Some("5000")), 4242);
    }

    #[test]
    fn test_env_port_used_when_no_explicit() {
        assert_eq!(resolve_port_from(None, Some("5000")), 5000);
        assert_eq!(resolve_port_from(None, Some(" 5001 ")), 5001);
    }

    #[test]
    fn test_default_port_fallback() {
        assert_eq!(resolve_port_from(None, None), DEFAULT_PORT);
        assert_eq!(resolve_port_from(None, Some("not-a-port")), DEFAULT_PORT);
        assert_eq!(resolve_port_from(None, Some("70000")), DEFAULT_PORT);
    }

    #[test]
    fn test_builder_setters() {
        let options = ConnectOptions::default()
            .with_port(1234)
            .auto_reconnect(true)
            .control_connection(true)
            .verbose(true);

        assert_eq!(
            options,
            ConnectOptions {
                port: Some(1234),
                auto_reconnect: true,
                control_connection: true,
                verbose: true,
            }
        );
        assert_eq!(options.resolve_port(), 1234);
    }
}
