//! Configuration module for environment variable parsing.
//!
//! Everything is read from the environment with a default for each value.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::keys::{DEFAULT_FETCH_TIMEOUT, DEFAULT_KEY_TTL};
use crate::pipeline::KeyUnavailablePolicy;
use crate::signature::DEFAULT_MAX_SKEW;
use crate::store::DEFAULT_CAPACITY;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// URL of the signer's key document
    pub keys_url: String,

    /// How long a fetched key set is trusted before refreshing
    pub key_cache_ttl: Duration,

    /// Hard timeout for one key fetch
    pub key_fetch_timeout: Duration,

    /// Accepted clock skew for signature timestamps
    pub signature_max_skew: Duration,

    /// Behavior when no verification keys have ever been loaded
    pub key_unavailable_policy: KeyUnavailablePolicy,

    // =========================================================================
    // Submission Store
    // =========================================================================
    /// Maximum number of submissions kept in memory
    pub store_capacity: usize,

    /// Directory mirroring the store; persistence is off when unset
    pub store_data_dir: Option<PathBuf>,

    /// Depth of the background persistence queue
    pub persist_queue_depth: usize,

    /// Periodically drop submissions older than this many days
    pub retention_days: Option<u32>,

    /// Optional list of accepted form ids
    pub allowed_form_ids: Option<Vec<String>>,

    /// Bearer token for the submission query endpoints; they refuse every
    /// request when unset
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: parse_or("PORT", 8080),

            keys_url: env::var("KEYS_URL")
                .unwrap_or_else(|_| "https://example.invalid/keys.json".to_string()),

            key_cache_ttl: Duration::from_secs(parse_or(
                "KEY_CACHE_TTL_SECS",
                DEFAULT_KEY_TTL.as_secs(),
            )),

            key_fetch_timeout: Duration::from_millis(parse_or(
                "KEY_FETCH_TIMEOUT_MS",
                DEFAULT_FETCH_TIMEOUT.as_millis() as u64,
            )),

            signature_max_skew: Duration::from_secs(parse_or(
                "SIGNATURE_MAX_SKEW_SECS",
                DEFAULT_MAX_SKEW.as_secs(),
            )),

            key_unavailable_policy: parse_or("KEY_UNAVAILABLE_POLICY", KeyUnavailablePolicy::default()),

            store_capacity: parse_or("STORE_CAPACITY", DEFAULT_CAPACITY),

            store_data_dir: env::var("STORE_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),

            persist_queue_depth: parse_or("PERSIST_QUEUE_DEPTH", 1024),

            retention_days: env::var("RETENTION_DAYS").ok().and_then(|v| v.parse().ok()),

            allowed_form_ids: parse_csv("ALLOWED_FORM_IDS"),

            admin_token: env::var("ADMIN_TOKEN")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Parse `name`, falling back to `default` when unset or invalid.
fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
