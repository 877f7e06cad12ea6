use std::env;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub worker_id: String,
    pub max_concurrent_runs: usize,
    pub queue_poll_timeout_secs: u64,
    pub stuck_after_secs: u64,
    /// `user:password` used when pulling images from a private registry
    pub registry_auth: Option<String>,
    pub port: u16,
    pub json_logs: bool,
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| "worker-0".to_string()),
            max_concurrent_runs: parsed("MAX_CONCURRENT_RUNS", 4usize).max(1),
            queue_poll_timeout_secs: parsed("QUEUE_POLL_TIMEOUT_SECS", 5),
            stuck_after_secs: parsed("STUCK_AFTER_SECS", 3600),
            registry_auth: env::var("DOCKER_REGISTRY_AUTH")
                .ok()
                .filter(|v| !v.is_empty()),
            port: parsed("PORT", 3000),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    /// Split `registry_auth` into username and password
    pub fn registry_credentials(&self) -> Option<(String, String)> {
        let auth = self.registry_auth.as_deref()?;
        let (user, password) = auth.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.queue_poll_timeout_secs, 5);
        assert_eq!(config.stuck_after_secs, 3600);
        assert!(config.max_concurrent_runs >= 1);
    }

    #[test]
    fn test_registry_credentials() {
        let mut config = Config::default();
        config.registry_auth = Some("ci:s3cr:et".to_string());
        assert_eq!(
            config.registry_credentials(),
            Some(("ci".to_string(), "s3cr:et".to_string()))
        );

        config.registry_auth = Some("no-separator".to_string());
        assert_eq!(config.registry_credentials(), None);
    }
}
