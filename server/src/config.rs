use std::str::FromStr;

use relay_common::RelayConfig;
use tracing::warn;

/// Builds the runtime configuration from process environment variables.
pub fn load_from_env() -> RelayConfig {
    load_with(|name| std::env::var(name).ok())
}

fn load_with(lookup: impl Fn(&str) -> Option<String>) -> RelayConfig {
    let defaults = RelayConfig::default();

    let mut config = RelayConfig {
        port: parse_or(&lookup, "PORT", defaults.port),
        heartbeat_timeout_ms: parse_or(
            &lookup,
            "RELAY_HEARTBEAT_TIMEOUT_MS",
            defaults.heartbeat_timeout_ms,
        ),
        liveness_check_interval_ms: parse_or(
            &lookup,
            "RELAY_LIVENESS_INTERVAL_MS",
            defaults.liveness_check_interval_ms,
        ),
        log_capacity: parse_or(&lookup, "RELAY_LOG_CAPACITY", defaults.log_capacity),
        log_read_limit: parse_or(&lookup, "RELAY_LOG_READ_LIMIT", defaults.log_read_limit),
        broadcast_capacity: parse_or(
            &lookup,
            "RELAY_BROADCAST_CAPACITY",
            defaults.broadcast_capacity,
        ),
        timezone: lookup("RELAY_TIMEZONE"),
        data_dir: lookup("RELAY_DATA_DIR"),
        web_root: lookup("RELAY_WEB_ROOT"),
    };
    config.sanitize();
    config
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {name}={raw:?}");
            default
        }),
        None => default,
    }
}
