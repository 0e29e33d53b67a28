//! Pool configuration.
//!
//! Options are plain data: callers build them in code or deserialize them from
//! whatever configuration source the application uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_IDLE: u32 = 0;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum live connections (idle, in use and pending close). Default: 10
    pub max_connections: Option<u32>,
    /// Floor on live connections, idle or borrowed. Opened when the pool is
    /// created and replaced after an eviction. Default: 0
    pub min_idle: Option<u32>,
    /// How long `acquire_default` waits for an idle connection. Default: 30s
    pub acquire_timeout_ms: Option<u64>,
    /// Per-statement deadline applied by executors built from these options. Default: none
    pub statement_timeout_ms: Option<u64>,
    /// How long `shutdown` waits for borrowers to return connections. Default: 30s
    pub shutdown_timeout_ms: Option<u64>,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn min_idle(mut self, min: u32) -> Self {
        self.min_idle = Some(min);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get min_idle with default value.
    pub fn min_idle_or_default(&self) -> u32 {
        self.min_idle.unwrap_or(DEFAULT_MIN_IDLE)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_millis(
            self.acquire_timeout_ms
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS),
        )
    }

    pub fn statement_timeout_or_default(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Get shutdown_timeout with default value.
    pub fn shutdown_timeout_or_default(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_timeout_ms
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        )
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        let max = self.max_connections_or_default();
        if max == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        let min = self.min_idle_or_default();
        if min > max {
            return Err(format!(
                "min_idle ({}) cannot exceed max_connections ({})",
                min, max
            ));
        }
        if self.statement_timeout_ms == Some(0) {
            return Err("statement_timeout_ms must be greater than 0 when set".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(opts.min_idle_or_default(), DEFAULT_MIN_IDLE);
        assert_eq!(
            opts.acquire_timeout_or_default(),
            Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS)
        );
        assert_eq!(opts.statement_timeout_or_default(), None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let opts = PoolOptions::new()
            .max_connections(4)
            .min_idle(2)
            .acquire_timeout(Duration::from_millis(150))
            .statement_timeout(Duration::from_secs(2));
        assert_eq!(opts.max_connections_or_default(), 4);
        assert_eq!(opts.min_idle_or_default(), 2);
        assert_eq!(opts.acquire_timeout_or_default(), Duration::from_millis(150));
        assert_eq!(
            opts.statement_timeout_or_default(),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_validate_zero_max() {
        let opts = PoolOptions::new().max_connections(0);
        assert!(opts.validate().unwrap_err().contains("greater than 0"));
    }

    #[test]
    fn test_validate_min_exceeds_max() {
        let opts = PoolOptions::new().max_connections(2).min_idle(3);
        let err = opts.validate().unwrap_err();
        assert!(err.contains("min_idle (3)"));
    }

    #[test]
    fn test_validate_min_exceeds_default_max() {
        let opts = PoolOptions::new().min_idle(DEFAULT_MAX_CONNECTIONS + 1);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: PoolOptions =
            serde_json::from_str(r#"{"max_connections": 3, "acquire_timeout_ms": 500}"#).unwrap();
        assert_eq!(opts.max_connections_or_default(), 3);
        assert_eq!(opts.min_idle_or_default(), DEFAULT_MIN_IDLE);
        assert_eq!(opts.acquire_timeout_or_default(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_zero_statement_timeout() {
        let opts = PoolOptions {
            statement_timeout_ms: Some(0),
            ..PoolOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
