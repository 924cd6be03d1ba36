// ABOUTME: Daemon-level tunables populated from environment variables with typed defaults
// ABOUTME: Never sourced from the wire protocol itself — see the teacher's builder-style config structs

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

const ENV_LISTEN_ADDR: &str = "GUACD_LISTEN_ADDR";
const ENV_INSTRUCTION_TIMEOUT_MS: &str = "GUACD_INSTRUCTION_TIMEOUT_MS";
const ENV_HANDSHAKE_TIMEOUT_MS: &str = "GUACD_HANDSHAKE_TIMEOUT_MS";
const ENV_KEEPALIVE_INTERVAL_MS: &str = "GUACD_KEEPALIVE_INTERVAL_MS";
const ENV_SYNC_STALENESS_MS: &str = "GUACD_SYNC_STALENESS_MS";
const ENV_LOG_VERBOSITY: &str = "GUACD_LOG_LEVEL";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4822";

/// Daemon-level configuration (§3 "Configuration", §4.10). Outside the core
/// proper, but constructed by the same crate's binary target — mirrors the
/// builder-style config structs the teacher uses for `KeepAliveConfig` and
/// `FlowControlConfig`, except populated from the environment rather than
/// fluent setters, since a daemon has no caller to hand it a builder.
#[derive(Debug, Clone)]
pub struct GuacdConfig {
    pub listen_addr: SocketAddr,
    pub instruction_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub sync_staleness_threshold: Duration,
    pub log_verbosity: String,
}

impl Default for GuacdConfig {
    fn default() -> Self {
        GuacdConfig {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .expect("default listen address is valid"),
            instruction_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(5),
            sync_staleness_threshold: Duration::from_millis(500),
            log_verbosity: "info".to_string(),
        }
    }
}

impl GuacdConfig {
    /// Builds configuration from environment variables, falling back to
    /// [`GuacdConfig::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = GuacdConfig::default();

        GuacdConfig {
            listen_addr: env_addr(ENV_LISTEN_ADDR).unwrap_or(defaults.listen_addr),
            instruction_timeout: env_millis(ENV_INSTRUCTION_TIMEOUT_MS)
                .unwrap_or(defaults.instruction_timeout),
            handshake_timeout: env_millis(ENV_HANDSHAKE_TIMEOUT_MS)
                .unwrap_or(defaults.handshake_timeout),
            keepalive_interval: env_millis(ENV_KEEPALIVE_INTERVAL_MS)
                .unwrap_or(defaults.keepalive_interval),
            sync_staleness_threshold: env_millis(ENV_SYNC_STALENESS_MS)
                .unwrap_or(defaults.sync_staleness_threshold),
            log_verbosity: std::env::var(ENV_LOG_VERBOSITY).unwrap_or(defaults.log_verbosity),
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_addr(var: &str) -> Option<SocketAddr> {
    let raw = std::env::var(var).ok()?;
    raw.to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = GuacdConfig::default();
        assert_eq!(config.instruction_timeout, Duration::from_secs(15));
        assert_eq!(config.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.sync_staleness_threshold, Duration::from_millis(500));
        assert_eq!(config.listen_addr.port(), 4822);
    }

    #[test]
    fn env_millis_ignores_unset_variable() {
        unsafe { std::env::remove_var("GUACD_TEST_UNSET_DURATION") };
        assert_eq!(env_millis("GUACD_TEST_UNSET_DURATION"), None);
    }

    #[test]
    fn env_millis_parses_set_variable() {
        // SAFETY net: unique var name avoids clashing with parallel tests.
        unsafe { std::env::set_var("GUACD_TEST_KEEPALIVE_MS", "2500") };
        assert_eq!(
            env_millis("GUACD_TEST_KEEPALIVE_MS"),
            Some(Duration::from_millis(2500))
        );
        unsafe { std::env::remove_var("GUACD_TEST_KEEPALIVE_MS") };
    }
}
