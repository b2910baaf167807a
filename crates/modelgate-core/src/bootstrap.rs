//! Process assembly: config merge (CLI > ENV > defaults), storage connect,
//! component wiring, background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use modelgate_adapter::{AdapterRegistry, UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
use modelgate_common::{GatewayConfig, GatewayConfigPatch, SelectionStrategy};
use modelgate_storage::{Storage, UsageLogQueue, UsageLogQueueConfig};

use crate::health::{HealthCheckConfig, HealthChecker};
use crate::pricing::PricingService;
use crate::quota::{QuotaConfig, QuotaService};
use crate::relay::RelayOrchestrator;
use crate::selector::{ChannelSelector, SelectorConfig};
use crate::state::AppState;

pub struct Gateway {
    pub state: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<AdapterRegistry>,
    pub selector: Arc<ChannelSelector>,
    pub pricing: Arc<PricingService>,
    pub quota: Arc<QuotaService>,
    pub relay: Arc<RelayOrchestrator>,
    pub health: Arc<HealthChecker>,
}

pub fn patch_from_env() -> GatewayConfigPatch {
    let get = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    GatewayConfigPatch {
        host: get("MODELGATE_HOST"),
        port: get("MODELGATE_PORT").and_then(|v| v.parse().ok()),
        admin_key_hash: get("MODELGATE_ADMIN_KEY_HASH"),
        dsn: get("MODELGATE_DSN"),
        selector_strategy: get("MODELGATE_SELECTOR_STRATEGY")
            .and_then(|v| SelectionStrategy::parse(&v).ok()),
        selector_max_attempts: get("MODELGATE_SELECTOR_MAX_ATTEMPTS")
            .and_then(|v| v.parse().ok()),
        selector_auto_disable_threshold: get("MODELGATE_AUTO_DISABLE_THRESHOLD")
            .and_then(|v| v.parse().ok()),
        quota_trust_threshold_multiple: get("MODELGATE_TRUST_THRESHOLD")
            .and_then(|v| v.parse().ok()),
        quota_pre_consume_ttl_secs: get("MODELGATE_PRE_CONSUME_TTL_SECS")
            .and_then(|v| v.parse().ok()),
        stream_total_timeout_secs: get("MODELGATE_STREAM_TOTAL_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok()),
        stream_idle_timeout_secs: get("MODELGATE_STREAM_IDLE_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok()),
        stream_first_chunk_wait_secs: get("MODELGATE_FIRST_CHUNK_WAIT_SECS")
            .and_then(|v| v.parse().ok()),
        healthcheck_interval_secs: get("MODELGATE_HEALTHCHECK_INTERVAL_SECS")
            .and_then(|v| v.parse().ok()),
        healthcheck_concurrency: get("MODELGATE_HEALTHCHECK_CONCURRENCY")
            .and_then(|v| v.parse().ok()),
        pricing_cache_ttl_secs: get("MODELGATE_PRICING_CACHE_TTL_SECS")
            .and_then(|v| v.parse().ok()),
    }
}

/// Build the fully wired gateway. Config merges CLI > ENV > DB, and the
/// merged result is persisted back so the next boot can start from it.
pub async fn bootstrap(cli: GatewayConfigPatch) -> anyhow::Result<Gateway> {
    // The DSN itself can only come from CLI/ENV.
    let mut pre_db = patch_from_env();
    pre_db.overlay(cli.clone());
    let dsn = pre_db
        .dsn
        .clone()
        .ok_or_else(|| anyhow::anyhow!("missing required gateway config field: dsn"))?;

    let storage = modelgate_storage::connect(&dsn)
        .await
        .with_context(|| format!("connect storage dsn={dsn}"))?;
    storage.sync().await.context("schema sync")?;

    let mut merged = GatewayConfigPatch::default();
    if let Some(stored) = storage
        .load_gateway_config()
        .await
        .context("load persisted gateway config")?
        && let Ok(db_config) = serde_json::from_value::<GatewayConfig>(stored)
    {
        merged = GatewayConfigPatch::from(db_config);
    }
    merged.overlay(patch_from_env());
    merged.overlay(cli);
    merged.dsn = Some(dsn);
    let config: GatewayConfig = merged
        .into_config()
        .context("merge gateway configuration")?;
    storage
        .upsert_gateway_config(&serde_json::to_value(&config)?)
        .await
        .context("persist merged gateway config")?;

    let snapshot = storage.load_snapshot().await.context("load snapshot")?;

    let registry = Arc::new(modelgate_adapters::builtin_registry());

    let selector = Arc::new(ChannelSelector::new(
        storage.clone(),
        snapshot.channels.clone(),
        SelectorConfig {
            auto_disable_threshold: config.selector_auto_disable_threshold,
            ..SelectorConfig::default()
        },
    ));

    let pricing = Arc::new(PricingService::new(
        storage.clone(),
        config.pricing_cache_ttl(),
    ));
    pricing
        .force_refresh()
        .await
        .context("initial pricing load")?;

    let usage_queue = Arc::new(UsageLogQueue::spawn(
        storage.clone(),
        UsageLogQueueConfig::default(),
    ));
    let quota = Arc::new(QuotaService::new(
        storage.clone(),
        pricing.clone(),
        usage_queue,
        QuotaConfig {
            trust_multiple: config.quota_trust_threshold_multiple,
            pre_consume_ttl: config.pre_consume_ttl(),
            ..QuotaConfig::default()
        },
    ));
    quota.spawn_reaper(Duration::from_secs(60));

    let client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::default())
            .context("build upstream client")?,
    );

    let state = Arc::new(AppState::new(config.clone(), snapshot.users));

    let relay = Arc::new(RelayOrchestrator::new(
        state.config.clone(),
        registry.clone(),
        client.clone(),
        selector.clone(),
        pricing.clone(),
        quota.clone(),
    ));

    let health = Arc::new(HealthChecker::new(
        registry.clone(),
        client,
        selector.clone(),
        HealthCheckConfig {
            interval: config.healthcheck_interval(),
            concurrency: config.healthcheck_concurrency,
            ..HealthCheckConfig::default()
        },
    ));
    health.clone().spawn();

    Ok(Gateway {
        state,
        storage,
        registry,
        selector,
        pricing,
        quota,
        relay,
        health,
    })
}
