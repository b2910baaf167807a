//! Background channel health checker.
//!
//! Probes every channel at a fixed cadence (bounded concurrency), feeds the
//! results into the selector's stats, and re-enables channels whose probe
//! succeeds after an auto-disable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use modelgate_adapter::{AdapterRegistry, ChannelBinding, UpstreamClient};
use modelgate_storage::ChannelRow;

use crate::selector::ChannelSelector;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub concurrency: usize,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            concurrency: 5,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HealthChecker {
    registry: Arc<AdapterRegistry>,
    client: Arc<dyn UpstreamClient>,
    selector: Arc<ChannelSelector>,
    config: HealthCheckConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub channel_id: i64,
    pub ok: bool,
    pub latency_ms: i64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        client: Arc<dyn UpstreamClient>,
        selector: Arc<ChannelSelector>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            client,
            selector,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One full pass over all channels. Also used by the admin test
    /// endpoint, which probes a single channel via `probe`.
    pub async fn run_once(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();
        for channel in self.selector.channels() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = HealthChecker {
                registry: self.registry.clone(),
                client: self.client.clone(),
                selector: self.selector.clone(),
                config: self.config.clone(),
            };
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let was_enabled = channel.enabled;
                let result = this.probe(&channel).await;
                this.selector
                    .record(
                        result.channel_id,
                        result.ok,
                        Duration::from_millis(result.latency_ms.max(0) as u64),
                    )
                    .await;
                if result.ok && !was_enabled {
                    this.selector.set_enabled(result.channel_id, true).await;
                    tracing::info!(channel_id = result.channel_id, "channel recovered by health check");
                }
                if let Some(error) = &result.error {
                    tracing::debug!(channel_id = result.channel_id, error, "health probe failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn probe(&self, channel: &ChannelRow) -> ProbeResult {
        let started = Instant::now();
        let fail = |error: String, started: Instant| ProbeResult {
            channel_id: channel.id,
            ok: false,
            latency_ms: started.elapsed().as_millis() as i64,
            error: Some(error),
        };

        let Some(api_key) = channel.api_keys.first() else {
            return fail("channel has no api keys".to_string(), started);
        };
        let binding = ChannelBinding {
            channel_id: channel.id,
            base_url: channel.base_url.clone(),
            api_key: api_key.clone(),
            test_model: channel.test_model.clone(),
            request_timeout: self.config.probe_timeout,
        };
        let adapter = match self.registry.create(&channel.adapter, binding) {
            Ok(adapter) => adapter,
            Err(err) => return fail(err.to_string(), started),
        };
        let probe = match adapter.health_probe() {
            Ok(probe) => probe,
            Err(err) => return fail(err.to_string(), started),
        };

        let response =
            tokio::time::timeout(self.config.probe_timeout, self.client.send(probe.request)).await;
        let latency_ms = started.elapsed().as_millis() as i64;
        match response {
            Ok(Ok(resp)) if resp.status < 400 => ProbeResult {
                channel_id: channel.id,
                ok: true,
                latency_ms,
                error: None,
            },
            Ok(Ok(resp)) => ProbeResult {
                channel_id: channel.id,
                ok: false,
                latency_ms,
                error: Some(format!("probe returned status {}", resp.status)),
            },
            Ok(Err(failure)) => ProbeResult {
                channel_id: channel.id,
                ok: false,
                latency_ms,
                error: Some(failure.into_transport_error().to_string()),
            },
            Err(_) => ProbeResult {
                channel_id: channel.id,
                ok: false,
                latency_ms,
                error: Some("probe timed out".to_string()),
            },
        }
    }
}
