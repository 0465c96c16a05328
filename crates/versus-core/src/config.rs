use crate::report::DEFAULT_MAX_INCOMPLETE;
use crate::response::CompareMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Run configuration. Every field has a default so a config file only needs
/// the values it changes; command line flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint URIs to compare
    pub endpoints: Vec<String>,
    /// Concurrent workers per endpoint
    pub concurrency: usize,
    /// Per-exchange timeout in milliseconds
    pub timeout_ms: u64,
    /// Stop after this many payloads (0 = until end of input)
    pub requests: u64,
    /// Stop reading input after this many milliseconds (0 = no limit)
    pub duration_ms: u64,
    /// How error-free bodies are compared
    pub compare: CompareMode,
    /// Capacity of the merged response channel
    pub response_buffer: usize,
    /// Pending request ids listed individually in the report
    pub max_incomplete: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            concurrency: 1,
            timeout_ms: 10_000,
            requests: 0,
            duration_ms: 0,
            compare: CompareMode::default(),
            response_buffer: 20,
            max_incomplete: DEFAULT_MAX_INCOMPLETE,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_ms > 0).then(|| Duration::from_millis(self.duration_ms))
    }

    pub fn request_limit(&self) -> Option<u64> {
        (self.requests > 0).then_some(self.requests)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("at least one endpoint is required");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than zero");
        }
        if self.response_buffer == 0 {
            anyhow::bail!("response_buffer must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
endpoints = ["http://localhost:8545", "https+get://example.com/api/"]
concurrency = 4
timeout_ms = 2500
requests = 1000
compare = "json"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.request_limit(), Some(1000));
        assert_eq!(config.duration(), None);
        assert_eq!(config.compare, CompareMode::Json);
        assert_eq!(config.response_buffer, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.compare, CompareMode::JsonObject);
        assert_eq!(config.max_incomplete, DEFAULT_MAX_INCOMPLETE);
        assert_eq!(config.request_limit(), None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_unknown_compare_mode() {
        assert!(toml::from_str::<Config>(r#"compare = "fuzzy""#).is_err());
    }
}
