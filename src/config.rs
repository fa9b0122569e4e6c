// =============================================================================
// config.rs: THE KNOB PANEL
// =============================================================================
//
// Every tunable in the engine, read from the environment with a default that
// works out of the box against a local Redis. Variables are prefixed with
// POPULARITY_ so they do not trample the rest of the backend's settings.
//
// The defaults mirror how the platform has always behaved: a visitor counts
// once a day, the leaderboard forgets a subject after a quiet day, and likes
// reach the database every ten minutes.
// =============================================================================

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // CONNECTIONS
    // =========================================================================
    /// Redis connection URL for the counter cache.
    /// Default: redis://127.0.0.1:6379
    pub redis_url: String,

    /// PostgreSQL URL for the authoritative store. When unset the daemon
    /// runs against an in-memory store, which is only useful for demos.
    pub database_url: Option<String>,

    /// Pool size for the authoritative store.
    pub db_max_connections: u32,

    /// Prepended to every cache key, so several environments can share one
    /// Redis without stepping on each other. Empty by default.
    pub key_prefix: String,

    /// Page size for SCAN walks over like sets and dedup markers.
    pub scan_batch: usize,

    // =========================================================================
    // WINDOWS
    // =========================================================================
    /// How long a visitor's view marker lives. Default: 24 hours.
    pub dedup_window: Duration,

    /// How long a visitor's link click marker lives. Default: 10 minutes.
    pub click_dedup_window: Duration,

    /// Horizon the leaderboard TTL is pushed to on every counted view.
    /// Default: 24 hours.
    pub leaderboard_ttl: Duration,

    // =========================================================================
    // RECONCILER
    // =========================================================================
    /// How often live like sets are drained into the database.
    /// Default: 600 seconds.
    pub reconcile_interval: Duration,

    /// Delete persisted likes whose actor has left the live set.
    pub reconcile_prune_unliked: bool,

    /// Consecutive failed passes before the reconciler stops trying.
    pub circuit_breaker_failure_threshold: u32,

    /// How long the reconciler sits out once tripped.
    pub circuit_breaker_reset_timeout: Duration,

    /// Successful passes in half-open state before the circuit closes.
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // READ PATH
    // =========================================================================
    /// Default size of a trending answer.
    pub trending_limit: usize,

    /// Stands in for loopback addresses when deriving visitor keys, so local
    /// traffic from different machines does not collapse into one visitor.
    pub host_identity: String,

    // =========================================================================
    // OPERATIONS
    // =========================================================================
    /// Port for the JSON stats endpoint.
    pub metrics_port: u16,

    /// Emit logs as JSON lines instead of the human format.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            db_max_connections: 10,
            key_prefix: String::new(),
            scan_batch: 200,
            dedup_window: Duration::from_secs(24 * 60 * 60),
            click_dedup_window: Duration::from_secs(10 * 60),
            leaderboard_ttl: Duration::from_secs(24 * 60 * 60),
            reconcile_interval: Duration::from_secs(600),
            reconcile_prune_unliked: true,
            circuit_breaker_failure_threshold: 3,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            circuit_breaker_success_threshold: 1,
            trending_limit: 3,
            host_identity: "localhost".to_string(),
            metrics_port: 9090,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment (and a `.env` file, if one
    /// exists), falling back to [`Config::default`] for anything unset or
    /// unparseable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Config {
            redis_url: env_or_default("POPULARITY_REDIS_URL", &defaults.redis_url),
            database_url: env::var("POPULARITY_DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            db_max_connections: parse_or("POPULARITY_DB_MAX_CONNECTIONS", defaults.db_max_connections),
            key_prefix: env_or_default("POPULARITY_KEY_PREFIX", &defaults.key_prefix),
            scan_batch: parse_or("POPULARITY_SCAN_BATCH", defaults.scan_batch).max(1),

            dedup_window: secs_or("POPULARITY_DEDUP_WINDOW_SECS", defaults.dedup_window),
            click_dedup_window: secs_or(
                "POPULARITY_CLICK_DEDUP_WINDOW_SECS",
                defaults.click_dedup_window,
            ),
            leaderboard_ttl: secs_or("POPULARITY_LEADERBOARD_TTL_SECS", defaults.leaderboard_ttl),

            reconcile_interval: secs_or(
                "POPULARITY_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            ),
            reconcile_prune_unliked: flag_or("POPULARITY_RECONCILE_PRUNE", defaults.reconcile_prune_unliked),
            circuit_breaker_failure_threshold: parse_or(
                "POPULARITY_CB_FAILURE_THRESHOLD",
                defaults.circuit_breaker_failure_threshold,
            ),
            circuit_breaker_reset_timeout: secs_or(
                "POPULARITY_CB_RESET_TIMEOUT_SECS",
                defaults.circuit_breaker_reset_timeout,
            ),
            circuit_breaker_success_threshold: parse_or(
                "POPULARITY_CB_SUCCESS_THRESHOLD",
                defaults.circuit_breaker_success_threshold,
            ),

            trending_limit: parse_or("POPULARITY_TRENDING_LIMIT", defaults.trending_limit),
            host_identity: env::var("POPULARITY_HOST_IDENTITY")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or(defaults.host_identity),

            metrics_port: parse_or("POPULARITY_METRICS_PORT", defaults.metrics_port),
            log_json: flag_or("POPULARITY_LOG_JSON", defaults.log_json),
        }
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn flag_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => parse_flag(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_platform_behaviour() {
        let config = Config::default();
        assert_eq!(config.dedup_window, Duration::from_secs(86_400));
        assert_eq!(config.click_dedup_window, Duration::from_secs(600));
        assert_eq!(config.leaderboard_ttl, Duration::from_secs(86_400));
        assert_eq!(config.reconcile_interval, Duration::from_secs(600));
        assert_eq!(config.trending_limit, 3);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" on "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
