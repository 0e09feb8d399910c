//! Process configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockbook_events::RetryPolicy;

use crate::outbox::OutboxProcessorConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockbookConfig {
    /// Absent means the in-memory backend.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StockbookConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            worker_id: "outbox-processor".to_string(),
            batch_size: 20,
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(300),
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl StockbookConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(worker_id) = lookup("OUTBOX_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            config.worker_id = worker_id;
        }
        if let Some(n) = parse(&lookup, "DATABASE_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = parse(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "OUTBOX_LEASE_TIMEOUT_SECS")? {
            config.lease_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "OUTBOX_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }
        if let Some(ms) = parse(&lookup, "OUTBOX_BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "OUTBOX_MAX_DELAY_SECS")? {
            config.max_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.base_delay, self.max_delay)
    }

    pub fn processor_config(&self) -> OutboxProcessorConfig {
        OutboxProcessorConfig::default()
            .with_worker_id(self.worker_id.clone())
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
            .with_lease_timeout(self.lease_timeout)
            .with_retry_policy(self.retry_policy())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = StockbookConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StockbookConfig::default());
        assert_eq!(config.retry_policy().max_attempts, 5);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = StockbookConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/stockbook"),
            ("OUTBOX_WORKER_ID", "worker-7"),
            ("OUTBOX_BATCH_SIZE", "50"),
            ("OUTBOX_LEASE_TIMEOUT_SECS", "30"),
            ("OUTBOX_MAX_ATTEMPTS", " 3 "),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/stockbook"));
        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.batch_size, 50);

        let processor = config.processor_config();
        assert_eq!(processor.lease_timeout, Duration::from_secs(30));
        assert_eq!(processor.retry.max_attempts, 3);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = StockbookConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "OUTBOX_BATCH_SIZE",
                value: "lots".to_string()
            }
        );
    }
}
