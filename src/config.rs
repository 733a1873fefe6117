//! Environment-driven configuration, read once at startup.

use std::env;
use std::time::Duration;

const DEFAULT_RELEASE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const DEFAULT_GRACEFUL_SHUTDOWN_MS: u64 = 5 * 1000;
const DEFAULT_QUEUE_INTERVAL_MS: u64 = 5 * 1000;
const DEFAULT_CLEANUP_DAYS: i64 = 30;

#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the SQLite database file.
    pub db_path: String,
    /// Address the HTTP control plane binds to.
    pub bind_addr: String,
    /// Shell command executed once per claimed release, via `sh -c`.
    pub release_command: String,
    /// Wall-clock budget for one release before timeout escalation starts.
    pub release_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL.
    pub term_grace: Duration,
    /// Period of the scheduler tick that drains the queue.
    pub drain_interval: Duration,
    /// Default retention window for `POST /cleanup`.
    pub default_cleanup_days: i64,
    /// Optional API key; when set, all routes except the healthcheck
    /// require a matching `x-api-key` header.
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
        Config {
            db_path: env::var("SQLITE_DB_PATH").unwrap_or_else(|_| "release-gate.db".to_string()),
            bind_addr: format!("0.0.0.0:{}", port),
            release_command: env::var("RELEASE_COMMAND")
                .unwrap_or_else(|_| "./release.sh".to_string()),
            release_timeout: Duration::from_millis(env_ms(
                "RELEASE_TIMEOUT_MS",
                DEFAULT_RELEASE_TIMEOUT_MS,
            )),
            term_grace: Duration::from_millis(env_ms(
                "GRACEFUL_SHUTDOWN_MS",
                DEFAULT_GRACEFUL_SHUTDOWN_MS,
            )),
            drain_interval: Duration::from_millis(env_ms(
                "QUEUE_INTERVAL_MS",
                DEFAULT_QUEUE_INTERVAL_MS,
            )),
            default_cleanup_days: env::var("DEFAULT_CLEANUP_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CLEANUP_DAYS),
            api_key: env::var("RELEASE_API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

fn env_ms(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // Only assert on knobs no test environment is expected to override.
        let config = Config::from_env();
        assert!(!config.release_command.is_empty());
        assert!(config.bind_addr.contains(':'));
        assert!(config.drain_interval > Duration::ZERO);
    }

    #[test]
    fn env_ms_falls_back_on_garbage() {
        assert_eq!(env_ms("RELEASE_GATE_TEST_UNSET_MS", 1234), 1234);
    }
}
