use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{HOUR_MS, Ms};

/// Business rules handed to every engine. Nothing in the engine reads the
/// environment directly.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Cancellations closer than this to class start are locked for
    /// non-privileged actors.
    pub free_cancellation_hours: u32,
    /// Credits charged for a class when the class itself does not say.
    pub default_credits_per_class: u32,
    /// Upper bound on waiting for any single row lock.
    pub lock_timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            free_cancellation_hours: 12,
            default_credits_per_class: 1,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl PolicyConfig {
    pub fn free_cancellation_window_ms(&self) -> Ms {
        self.free_cancellation_hours as Ms * HOUR_MS
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            free_cancellation_hours: env_or("STUDIODB_FREE_CANCEL_HOURS", defaults.free_cancellation_hours),
            default_credits_per_class: env_or("STUDIODB_CREDITS_PER_CLASS", defaults.default_credits_per_class)
                .max(1),
            lock_timeout: std::env::var("STUDIODB_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub policy: PolicyConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("STUDIODB_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("STUDIODB_PORT", 5433),
            data_dir: PathBuf::from(std::env::var("STUDIODB_DATA_DIR").unwrap_or_else(|_| "./data".into())),
            password: std::env::var("STUDIODB_PASSWORD").unwrap_or_else(|_| "studiodb".into()),
            max_connections: env_or("STUDIODB_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("STUDIODB_COMPACT_THRESHOLD", 1000),
            tls_cert: std::env::var("STUDIODB_TLS_CERT").ok(),
            tls_key: std::env::var("STUDIODB_TLS_KEY").ok(),
            metrics_port: std::env::var("STUDIODB_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            policy: PolicyConfig::from_env(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
