//! Orchestrator configuration.
//!
//! Keys mirror the host platform's option tree (`orchestratorOptions`,
//! `queryCacheOptions`, ...) so one JSON/TOML document can configure both.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_CONTINUE_WAIT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_EXPIRE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_REFRESH_KEY_EVERY_SECS: u64 = 10;
pub const DEFAULT_RENEWAL_THRESHOLD_SECS: u64 = 120;
pub const DEFAULT_PROCESS_SUBSCRIPTIONS_INTERVAL_MS: u64 = 30_000;

/// Build queue options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalQueueOptions {
    /// Maximum builds running at once.
    pub concurrency: usize,
    /// Attempts per job, including the first one.
    pub max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// How long a query waits on a build before getting `ContinueWait`.
    pub continue_wait_timeout_secs: u64,
}

impl Default for ExternalQueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            continue_wait_timeout_secs: DEFAULT_CONTINUE_WAIT_TIMEOUT_SECS,
        }
    }
}

impl ExternalQueueOptions {
    pub fn continue_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.continue_wait_timeout_secs)
    }
}

/// Query cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryCacheOptions {
    /// Global override for SQL refresh key renewal, in seconds.
    pub refresh_key_renewal_threshold: Option<u64>,
    pub external_queue_options: ExternalQueueOptions,
    /// Maximum cache entries before LRU eviction.
    pub capacity: usize,
    /// Ready entries older than this are recomputed.
    pub expire_secs: u64,
    /// TTL used for raw queries without an explicit refresh key.
    pub default_refresh_key_every_secs: u64,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            refresh_key_renewal_threshold: None,
            external_queue_options: ExternalQueueOptions::default(),
            capacity: DEFAULT_CACHE_CAPACITY,
            expire_secs: DEFAULT_EXPIRE_SECS,
            default_refresh_key_every_secs: DEFAULT_REFRESH_KEY_EVERY_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreAggregationsOptions {
    /// Another process builds rollups; this one only reads them.
    pub external_refresh: bool,
    /// Build missing partitions when a query needs them.
    pub on_demand_refresh: bool,
}

impl Default for PreAggregationsOptions {
    fn default() -> Self {
        Self {
            external_refresh: false,
            on_demand_refresh: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorOptions {
    pub query_cache_options: QueryCacheOptions,
    pub pre_aggregations_options: PreAggregationsOptions,
    /// Never hit the source for raw queries.
    pub rollup_only_mode: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrismConfig {
    pub orchestrator_options: OrchestratorOptions,
    /// Refresh scheduler tick, in milliseconds.
    pub process_subscriptions_interval: u64,
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self {
            orchestrator_options: OrchestratorOptions::default(),
            process_subscriptions_interval: DEFAULT_PROCESS_SUBSCRIPTIONS_INTERVAL_MS,
        }
    }
}

impl PrismConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Defaults overridden by `PRISM_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary key lookup (environment, test map).
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());
        let parse_bool = |name: &str| lookup(name).map(|s| s.trim().eq_ignore_ascii_case("true"));

        let cache = &mut self.orchestrator_options.query_cache_options;
        if let Some(v) = parse_u64("PRISM_REFRESH_KEY_RENEWAL_THRESHOLD") {
            cache.refresh_key_renewal_threshold = Some(v);
        }
        if let Some(v) = parse_u64("PRISM_CACHE_CAPACITY") {
            cache.capacity = v as usize;
        }
        if let Some(v) = parse_u64("PRISM_CACHE_EXPIRE_SECS") {
            cache.expire_secs = v;
        }
        if let Some(v) = parse_u64("PRISM_DEFAULT_REFRESH_KEY_EVERY_SECS") {
            cache.default_refresh_key_every_secs = v;
        }

        let queue = &mut cache.external_queue_options;
        if let Some(v) = parse_u64("PRISM_CONCURRENCY") {
            queue.concurrency = v as usize;
        }
        if let Some(v) = parse_u64("PRISM_MAX_ATTEMPTS") {
            queue.max_attempts = v as u32;
        }
        if let Some(v) = parse_u64("PRISM_RETRY_INITIAL_BACKOFF_MS") {
            queue.retry_initial_backoff_ms = v;
        }
        if let Some(v) = parse_u64("PRISM_RETRY_MAX_BACKOFF_MS") {
            queue.retry_max_backoff_ms = v;
        }
        if let Some(v) = parse_u64("PRISM_CONTINUE_WAIT_TIMEOUT_SECS") {
            queue.continue_wait_timeout_secs = v;
        }

        let preaggs = &mut self.orchestrator_options.pre_aggregations_options;
        if let Some(v) = parse_bool("PRISM_EXTERNAL_REFRESH") {
            preaggs.external_refresh = v;
        }
        if let Some(v) = parse_bool("PRISM_ON_DEMAND_REFRESH") {
            preaggs.on_demand_refresh = v;
        }

        if let Some(v) = parse_bool("PRISM_ROLLUP_ONLY_MODE") {
            self.orchestrator_options.rollup_only_mode = v;
        }
        if let Some(v) = parse_u64("PRISM_PROCESS_SUBSCRIPTIONS_INTERVAL") {
            self.process_subscriptions_interval = v;
        }
        self
    }

    /// Settings for local development: frequent refresh, single build slot.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.process_subscriptions_interval = 5_000;
        config
            .orchestrator_options
            .query_cache_options
            .external_queue_options
            .concurrency = 1;
        config
    }

    /// Settings for a read-only API instance next to a dedicated refresh worker.
    pub fn api_instance() -> Self {
        let mut config = Self::default();
        config
            .orchestrator_options
            .pre_aggregations_options
            .external_refresh = true;
        config
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.queue_options_mut().concurrency = concurrency;
        self
    }

    pub fn with_rollup_only_mode(mut self, enabled: bool) -> Self {
        self.orchestrator_options.rollup_only_mode = enabled;
        self
    }

    pub fn with_external_refresh(mut self, enabled: bool) -> Self {
        self.orchestrator_options
            .pre_aggregations_options
            .external_refresh = enabled;
        self
    }

    pub fn with_on_demand_refresh(mut self, enabled: bool) -> Self {
        self.orchestrator_options
            .pre_aggregations_options
            .on_demand_refresh = enabled;
        self
    }

    pub fn with_process_subscriptions_interval(mut self, interval: Duration) -> Self {
        self.process_subscriptions_interval = interval.as_millis() as u64;
        self
    }

    pub fn with_renewal_threshold(mut self, secs: u64) -> Self {
        self.orchestrator_options
            .query_cache_options
            .refresh_key_renewal_threshold = Some(secs);
        self
    }

    pub fn queue_options(&self) -> &ExternalQueueOptions {
        &self
            .orchestrator_options
            .query_cache_options
            .external_queue_options
    }

    fn queue_options_mut(&mut self) -> &mut ExternalQueueOptions {
        &mut self
            .orchestrator_options
            .query_cache_options
            .external_queue_options
    }

    pub fn cache_options(&self) -> &QueryCacheOptions {
        &self.orchestrator_options.query_cache_options
    }

    pub fn external_refresh(&self) -> bool {
        self.orchestrator_options
            .pre_aggregations_options
            .external_refresh
    }

    /// On-demand builds only happen when this process is allowed to build.
    pub fn on_demand_refresh(&self) -> bool {
        !self.external_refresh()
            && self
                .orchestrator_options
                .pre_aggregations_options
                .on_demand_refresh
    }

    pub fn rollup_only_mode(&self) -> bool {
        self.orchestrator_options.rollup_only_mode
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.process_subscriptions_interval)
    }

    /// Validate that every knob is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = self.queue_options();
        if queue.concurrency == 0 {
            return Err(invalid("externalQueueOptions.concurrency", 0, "must be at least 1"));
        }
        if queue.max_attempts == 0 {
            return Err(invalid("externalQueueOptions.maxAttempts", 0, "must be at least 1"));
        }
        if queue.retry_initial_backoff_ms > queue.retry_max_backoff_ms {
            return Err(invalid(
                "externalQueueOptions.retryInitialBackoffMs",
                queue.retry_initial_backoff_ms,
                "must not exceed retryMaxBackoffMs",
            ));
        }
        let cache = self.cache_options();
        if cache.capacity == 0 {
            return Err(invalid("queryCacheOptions.capacity", 0, "must be at least 1"));
        }
        if cache.default_refresh_key_every_secs == 0 {
            return Err(invalid(
                "queryCacheOptions.defaultRefreshKeyEverySecs",
                0,
                "must be at least 1",
            ));
        }
        if self.process_subscriptions_interval == 0 {
            return Err(invalid("processSubscriptionsInterval", 0, "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PrismConfig::default();
        assert_eq!(config.queue_options().concurrency, 2);
        assert_eq!(config.cache_options().expire_secs, 86_400);
        assert_eq!(config.process_subscriptions_interval, 30_000);
        assert!(!config.external_refresh());
        assert!(config.on_demand_refresh());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_camel_case_keys() {
        let config = PrismConfig::from_json_str(
            r#"{
                "orchestratorOptions": {
                    "queryCacheOptions": {
                        "refreshKeyRenewalThreshold": 30,
                        "externalQueueOptions": { "concurrency": 4 }
                    },
                    "preAggregationsOptions": { "externalRefresh": true },
                    "rollupOnlyMode": true
                },
                "processSubscriptionsInterval": 1000
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_options().refresh_key_renewal_threshold, Some(30));
        assert_eq!(config.queue_options().concurrency, 4);
        assert_eq!(config.queue_options().max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(config.external_refresh());
        assert!(!config.on_demand_refresh());
        assert!(config.rollup_only_mode());
        assert_eq!(config.scheduler_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_toml() {
        let config = PrismConfig::from_toml_str(
            r#"
            processSubscriptionsInterval = 500

            [orchestratorOptions.queryCacheOptions.externalQueueOptions]
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_options().concurrency, 8);
        assert_eq!(config.process_subscriptions_interval, 500);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PRISM_CONCURRENCY", "6"),
            ("PRISM_EXTERNAL_REFRESH", "TRUE"),
            ("PRISM_CACHE_CAPACITY", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = PrismConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.queue_options().concurrency, 6);
        assert!(config.external_refresh());
        assert_eq!(config.cache_options().capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PrismConfig::default().with_concurrency(0).validate().is_err());

        let mut config = PrismConfig::default();
        config.process_subscriptions_interval = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            PrismConfig::from_json_str("{not json"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
