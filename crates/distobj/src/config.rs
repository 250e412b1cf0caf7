//! Runtime configuration.
//!
//! All knobs can be set programmatically or picked up from `DISTOBJ_*`
//! environment variables. Nothing is persisted; configuration is read once
//! when the local node is created.

use std::time::Duration;
use tracing::warn;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DISTOBJ";

/// Tunable attributes of a local node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance cache capacity in megabytes; 0 disables caching.
    pub instance_cache_size_mb: u32,
    /// Send-on-register queue length in entries; 0 disables the feature.
    pub send_queue_size: u32,
    /// Advisory age limit for send-queue entries; zero means entries stay
    /// until send-on-register is explicitly disabled.
    pub send_queue_age: Duration,
    /// Relaxed handling of mid-frame peer loss and protocol violations:
    /// log and close instead of asserting.
    pub robustness: bool,
    /// Also cache one-shot push data, not just instance and commit data.
    pub aggressive_caching: bool,
    /// Default server contact description.
    pub server: Option<String>,
    /// Deadline for request/reply round trips.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_cache_size_mb: 100,
            send_queue_size: 0,
            send_queue_age: Duration::ZERO,
            robustness: false,
            aggressive_caching: false,
            server: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// The defaults overridden by any `DISTOBJ_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(value) = env_u32("INSTANCE_CACHE_SIZE") {
            config.instance_cache_size_mb = value;
        }
        if let Some(value) = env_u32("NODE_SEND_QUEUE_SIZE") {
            config.send_queue_size = value;
        }
        if let Some(value) = env_u32("NODE_SEND_QUEUE_AGE") {
            config.send_queue_age = Duration::from_millis(value as u64);
        }
        if let Some(value) = env_var("ROBUSTNESS") {
            config.robustness = matches!(value.as_str(), "1" | "on" | "true");
        }
        if let Some(value) = env_var("SERVER") {
            config.server = Some(value);
        }
        config
    }

    pub fn with_instance_cache_size_mb(mut self, mb: u32) -> Self {
        self.instance_cache_size_mb = mb;
        self
    }

    pub fn with_send_queue_size(mut self, entries: u32) -> Self {
        self.send_queue_size = entries;
        self
    }

    pub fn with_send_queue_age(mut self, age: Duration) -> Self {
        self.send_queue_age = age;
        self
    }

    pub fn with_robustness(mut self, on: bool) -> Self {
        self.robustness = on;
        self
    }

    pub fn with_aggressive_caching(mut self, on: bool) -> Self {
        self.aggressive_caching = on;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn env_u32(name: &str) -> Option<u32> {
    let value = env_var(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("ignoring non-numeric {ENV_PREFIX}_{name}={value:?}");
            None
        }
    }
}
