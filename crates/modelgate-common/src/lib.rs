use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
    #[error("unknown selection strategy: {0}")]
    UnknownStrategy(String),
}

/// Channel selection strategy used by the relay core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Weight,
    Priority,
    RoundRobin,
    LowestLatency,
    Random,
}

impl SelectionStrategy {
    pub fn parse(value: &str) -> Result<Self, GatewayConfigError> {
        match value {
            "weight" => Ok(SelectionStrategy::Weight),
            "priority" => Ok(SelectionStrategy::Priority),
            "round_robin" | "round-robin" => Ok(SelectionStrategy::RoundRobin),
            "lowest_latency" | "lowest-latency" => Ok(SelectionStrategy::LowestLatency),
            "random" => Ok(SelectionStrategy::Random),
            other => Err(GatewayConfigError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Weight => "weight",
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LowestLatency => "lowest_latency",
            SelectionStrategy::Random => "random",
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Database DSN used for this process.
    pub dsn: String,

    pub selector_strategy: SelectionStrategy,
    pub selector_max_attempts: u32,
    /// Consecutive retryable failures before a channel is auto-disabled.
    pub selector_auto_disable_threshold: u32,

    /// Balance multiple above which pre-consume reserves without deducting.
    pub quota_trust_threshold_multiple: u64,
    pub quota_pre_consume_ttl_secs: u64,

    pub stream_total_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub stream_first_chunk_wait_secs: u64,

    pub healthcheck_interval_secs: u64,
    pub healthcheck_concurrency: usize,

    pub pricing_cache_ttl_secs: u64,
}

impl GatewayConfig {
    pub fn pre_consume_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_pre_consume_ttl_secs)
    }

    pub fn stream_total_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_total_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn stream_first_chunk_wait(&self) -> Duration {
        Duration::from_secs(self.stream_first_chunk_wait_secs)
    }

    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }

    pub fn pricing_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pricing_cache_ttl_secs)
    }
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub dsn: Option<String>,
    pub selector_strategy: Option<SelectionStrategy>,
    pub selector_max_attempts: Option<u32>,
    pub selector_auto_disable_threshold: Option<u32>,
    pub quota_trust_threshold_multiple: Option<u64>,
    pub quota_pre_consume_ttl_secs: Option<u64>,
    pub stream_total_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub stream_first_chunk_wait_secs: Option<u64>,
    pub healthcheck_interval_secs: Option<u64>,
    pub healthcheck_concurrency: Option<usize>,
    pub pricing_cache_ttl_secs: Option<u64>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.selector_strategy.is_some() {
            self.selector_strategy = other.selector_strategy;
        }
        if other.selector_max_attempts.is_some() {
            self.selector_max_attempts = other.selector_max_attempts;
        }
        if other.selector_auto_disable_threshold.is_some() {
            self.selector_auto_disable_threshold = other.selector_auto_disable_threshold;
        }
        if other.quota_trust_threshold_multiple.is_some() {
            self.quota_trust_threshold_multiple = other.quota_trust_threshold_multiple;
        }
        if other.quota_pre_consume_ttl_secs.is_some() {
            self.quota_pre_consume_ttl_secs = other.quota_pre_consume_ttl_secs;
        }
        if other.stream_total_timeout_secs.is_some() {
            self.stream_total_timeout_secs = other.stream_total_timeout_secs;
        }
        if other.stream_idle_timeout_secs.is_some() {
            self.stream_idle_timeout_secs = other.stream_idle_timeout_secs;
        }
        if other.stream_first_chunk_wait_secs.is_some() {
            self.stream_first_chunk_wait_secs = other.stream_first_chunk_wait_secs;
        }
        if other.healthcheck_interval_secs.is_some() {
            self.healthcheck_interval_secs = other.healthcheck_interval_secs;
        }
        if other.healthcheck_concurrency.is_some() {
            self.healthcheck_concurrency = other.healthcheck_concurrency;
        }
        if other.pricing_cache_ttl_secs.is_some() {
            self.pricing_cache_ttl_secs = other.pricing_cache_ttl_secs;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8686),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GatewayConfigError::MissingField("admin_key_hash"))?,
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            selector_strategy: self.selector_strategy.unwrap_or(SelectionStrategy::Weight),
            selector_max_attempts: self.selector_max_attempts.unwrap_or(3),
            selector_auto_disable_threshold: self.selector_auto_disable_threshold.unwrap_or(3),
            quota_trust_threshold_multiple: self.quota_trust_threshold_multiple.unwrap_or(10),
            quota_pre_consume_ttl_secs: self.quota_pre_consume_ttl_secs.unwrap_or(15 * 60),
            stream_total_timeout_secs: self.stream_total_timeout_secs.unwrap_or(5 * 60),
            stream_idle_timeout_secs: self.stream_idle_timeout_secs.unwrap_or(30),
            stream_first_chunk_wait_secs: self.stream_first_chunk_wait_secs.unwrap_or(2),
            healthcheck_interval_secs: self.healthcheck_interval_secs.unwrap_or(30 * 60),
            healthcheck_concurrency: self.healthcheck_concurrency.unwrap_or(5),
            pricing_cache_ttl_secs: self.pricing_cache_ttl_secs.unwrap_or(5 * 60),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            dsn: Some(value.dsn),
            selector_strategy: Some(value.selector_strategy),
            selector_max_attempts: Some(value.selector_max_attempts),
            selector_auto_disable_threshold: Some(value.selector_auto_disable_threshold),
            quota_trust_threshold_multiple: Some(value.quota_trust_threshold_multiple),
            quota_pre_consume_ttl_secs: Some(value.quota_pre_consume_ttl_secs),
            stream_total_timeout_secs: Some(value.stream_total_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
            stream_first_chunk_wait_secs: Some(value.stream_first_chunk_wait_secs),
            healthcheck_interval_secs: Some(value.healthcheck_interval_secs),
            healthcheck_concurrency: Some(value.healthcheck_concurrency),
            pricing_cache_ttl_secs: Some(value.pricing_cache_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_patch() -> GatewayConfigPatch {
        GatewayConfigPatch {
            admin_key_hash: Some("hash".to_string()),
            dsn: Some("sqlite::memory:".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in() {
        let config = base_patch().into_config().unwrap();
        assert_eq!(config.selector_strategy, SelectionStrategy::Weight);
        assert_eq!(config.selector_max_attempts, 3);
        assert_eq!(config.quota_trust_threshold_multiple, 10);
        assert_eq!(config.quota_pre_consume_ttl_secs, 900);
        assert_eq!(config.stream_idle_timeout_secs, 30);
        assert_eq!(config.stream_first_chunk_wait_secs, 2);
        assert_eq!(config.healthcheck_concurrency, 5);
    }

    #[test]
    fn overlay_prefers_later_layer() {
        let mut merged = base_patch();
        merged.overlay(GatewayConfigPatch {
            port: Some(9000),
            selector_strategy: Some(SelectionStrategy::Priority),
            ..Default::default()
        });
        let config = merged.into_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.selector_strategy, SelectionStrategy::Priority);
    }

    #[test]
    fn missing_dsn_is_rejected() {
        let patch = GatewayConfigPatch {
            admin_key_hash: Some("hash".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GatewayConfigError::MissingField("dsn"))
        ));
    }

    #[test]
    fn strategy_parse_round_trip() {
        for name in ["weight", "priority", "round_robin", "lowest_latency", "random"] {
            let strategy = SelectionStrategy::parse(name).unwrap();
            assert_eq!(strategy.as_str(), name);
        }
        assert!(SelectionStrategy::parse("fastest").is_err());
    }
}
