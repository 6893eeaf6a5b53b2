//! Environment-driven configuration

use std::env;
use uuid::Uuid;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    /// Identity of this process within the fleet
    pub instance_id: String,
    pub redis_url: String,
    pub presence: PresenceConfig,
    pub log_level: String,
}

/// Presence tuning
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// TTL on per-connection records and membership sets, refreshed by heartbeat
    pub connection_ttl_secs: u64,
    /// Idle-disconnect window enforced by the gateway's activity timer
    pub idle_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch: usize,
    pub heartbeat_interval_secs: u64,
    /// Per-command deadline against the shared store
    pub store_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let idle_window_secs: u64 = env::var("IDLE_WINDOW_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let connection_ttl_secs: u64 = env::var("CONNECTION_TTL_SECS")
            .unwrap_or_else(|_| "90".to_string())
            .parse()
            .unwrap_or(90);

        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "5510".to_string())
                .parse()
                .unwrap_or(5510),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            instance_id: env::var("INSTANCE_ID")
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            presence: PresenceConfig {
                // The TTL must outlive the idle window plus margin so that
                // entries left by a crashed instance always expire on their own.
                connection_ttl_secs: connection_ttl_secs.max(idle_window_secs + 30),
                idle_window_secs,
                sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                sweep_batch: env::var("SWEEP_BATCH")
                    .unwrap_or_else(|_| "200".to_string())
                    .parse()
                    .unwrap_or(200),
                heartbeat_interval_secs: env::var("HEARTBEAT_INTERVAL_SECS")
                    .unwrap_or_else(|_| "25".to_string())
                    .parse()
                    .unwrap_or(25),
                store_timeout_ms: env::var("STORE_TIMEOUT_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()
                    .unwrap_or(2000),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_outlives_idle_window() {
        let config = Config::from_env();
        assert!(
            config.presence.connection_ttl_secs > config.presence.idle_window_secs,
            "connection TTL must exceed the idle window"
        );
    }
}
