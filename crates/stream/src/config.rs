use std::time::Duration;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Shortest heartbeat interval the client will run with.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Construction parameters for an [`EventStreamClient`](crate::EventStreamClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Server endpoint, e.g. `ws://dashboard:8000/ws/updates`.
    pub endpoint: String,
    /// Fixed delay between a disconnect and the next connection attempt.
    pub reconnect_interval: Duration,
    /// Consecutive retries allowed after a failure before the client gives up.
    pub max_reconnect_attempts: u32,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Defaults overridden by `KDASH_RECONNECT_MS`, `KDASH_MAX_RECONNECTS` and
    /// `KDASH_HEARTBEAT_SECS` when set and parseable.
    pub fn from_env(endpoint: impl Into<String>) -> Self {
        let mut cfg = Self::new(endpoint);
        if let Some(ms) = env_parse::<u64>("KDASH_RECONNECT_MS") {
            cfg.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("KDASH_MAX_RECONNECTS") {
            cfg.max_reconnect_attempts = n;
        }
        if let Some(secs) = env_parse::<u64>("KDASH_HEARTBEAT_SECS") {
            cfg.heartbeat_interval = Duration::from_secs(secs).max(MIN_HEARTBEAT_INTERVAL);
        }
        cfg
    }

    pub fn with_reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, n: u32) -> Self {
        self.max_reconnect_attempts = n;
        self
    }

    /// Clamped to at least [`MIN_HEARTBEAT_INTERVAL`].
    pub fn with_heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d.max(MIN_HEARTBEAT_INTERVAL);
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded() {
        let cfg = StreamConfig::new("ws://localhost/ws");
        assert_eq!(cfg.reconnect_interval, Duration::from_secs(3));
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn builders_override() {
        let cfg = StreamConfig::new("ws://x")
            .with_reconnect_interval(Duration::from_millis(250))
            .with_max_reconnect_attempts(2)
            .with_heartbeat_interval(Duration::from_secs(5));
        assert_eq!(cfg.max_reconnect_attempts, 2);
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn heartbeat_builder_clamps_zero() {
        let cfg = StreamConfig::new("ws://x").with_heartbeat_interval(Duration::ZERO);
        assert_eq!(cfg.heartbeat_interval, MIN_HEARTBEAT_INTERVAL);
    }
}
