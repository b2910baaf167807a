//! Health-aware channel selection.
//!
//! Channel rows are read from an in-memory directory (refreshed from
//! storage on a sync interval or explicit invalidation); eligibility lists
//! are cached per (model, group). Stats are selector-owned and purely
//! in-memory; only the auto-disable flag is written back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use modelgate_adapter::AdapterError;
use modelgate_common::SelectionStrategy;
use modelgate_storage::{ChannelRow, Storage};

use crate::error::{RelayError, RelayResult};

const EMA_ALPHA: f64 = 0.3;
const RETRY_BACKOFF_MS: std::ops::Range<u64> = 20..80;

#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub ema_latency_ms: Option<f64>,
    pub last_error_at: Option<OffsetDateTime>,
}

impl ChannelStats {
    fn observe(&mut self, ok: bool, latency: Duration) {
        self.total += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.ema_latency_ms = Some(match self.ema_latency_ms {
            Some(ema) => ema + EMA_ALPHA * (latency_ms - ema),
            None => latency_ms,
        });
        if ok {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
            self.last_error_at = Some(OffsetDateTime::now_utc());
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failures as f64 / self.total as f64
    }
}

#[derive(Debug, Clone)]
pub struct SelectedChannel {
    pub channel: Arc<ChannelRow>,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub auto_disable_threshold: u32,
    /// Failure share of the rolling window that must also be exceeded
    /// before auto-disable fires.
    pub failure_rate_threshold: f64,
    pub directory_ttl: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            auto_disable_threshold: 3,
            failure_rate_threshold: 0.5,
            directory_ttl: Duration::from_secs(30),
        }
    }
}

type EligibleKey = (String, String);

pub struct ChannelSelector {
    storage: Arc<dyn Storage>,
    config: SelectorConfig,
    channels: ArcSwap<Vec<Arc<ChannelRow>>>,
    /// None forces a refresh on the next select.
    loaded_at: Mutex<Option<Instant>>,
    eligible_cache: Mutex<HashMap<EligibleKey, Arc<Vec<Arc<ChannelRow>>>>>,
    stats: std::sync::Mutex<HashMap<i64, ChannelStats>>,
    cursor: AtomicU64,
}

impl ChannelSelector {
    pub fn new(
        storage: Arc<dyn Storage>,
        initial: Vec<ChannelRow>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            storage,
            config,
            channels: ArcSwap::from_pointee(initial.into_iter().map(Arc::new).collect::<Vec<_>>()),
            loaded_at: Mutex::new(Some(Instant::now())),
            eligible_cache: Mutex::new(HashMap::new()),
            stats: std::sync::Mutex::new(HashMap::new()),
            cursor: AtomicU64::new(0),
        }
    }

    /// Recompute the directory from storage and drop cached lists.
    pub async fn refresh(&self) -> RelayResult<()> {
        let rows = self.storage.load_channels().await?;
        self.channels
            .store(Arc::new(rows.into_iter().map(Arc::new).collect()));
        self.eligible_cache.lock().await.clear();
        *self.loaded_at.lock().await = Some(Instant::now());
        Ok(())
    }

    /// Admin mutation hook: next select sees fresh rows.
    pub async fn invalidate(&self) {
        *self.loaded_at.lock().await = None;
        self.eligible_cache.lock().await.clear();
    }

    async fn maybe_refresh(&self) {
        let stale = {
            let loaded_at = self.loaded_at.lock().await;
            loaded_at.is_none_or(|at| at.elapsed() >= self.config.directory_ttl)
        };
        if stale && let Err(err) = self.refresh().await {
            tracing::warn!(error = %err, "channel directory refresh failed, serving stale");
        }
    }

    async fn eligible(&self, model: &str, group: &str) -> Arc<Vec<Arc<ChannelRow>>> {
        let key = (model.to_string(), group.to_string());
        {
            let cache = self.eligible_cache.lock().await;
            if let Some(list) = cache.get(&key) {
                return list.clone();
            }
        }
        let list: Vec<Arc<ChannelRow>> = self
            .channels
            .load()
            .iter()
            .filter(|channel| {
                channel.enabled
                    && channel.permits_group(group)
                    && channel.supports_model(model)
                    && !channel.api_keys.is_empty()
            })
            .cloned()
            .collect();
        let list = Arc::new(list);
        self.eligible_cache.lock().await.insert(key, list.clone());
        list
    }

    pub async fn select(
        &self,
        model: &str,
        group: &str,
        excluded: &[i64],
        strategy: SelectionStrategy,
    ) -> RelayResult<SelectedChannel> {
        self.maybe_refresh().await;
        let eligible = self.eligible(model, group).await;
        let candidates: Vec<&Arc<ChannelRow>> = eligible
            .iter()
            .filter(|channel| !excluded.contains(&channel.id))
            .collect();
        if candidates.is_empty() {
            return Err(RelayError::NoEligibleChannel {
                model: model.to_string(),
                group: group.to_string(),
            });
        }

        let chosen = match strategy {
            SelectionStrategy::Weight => self.pick_weighted(&candidates),
            SelectionStrategy::Priority => self.pick_priority(&candidates),
            SelectionStrategy::RoundRobin => self.pick_round_robin(&candidates),
            SelectionStrategy::LowestLatency => self.pick_lowest_latency(&candidates),
            SelectionStrategy::Random => self.pick_random(&candidates),
        };

        let keys = &chosen.api_keys;
        let key_idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % keys.len();
        Ok(SelectedChannel {
            channel: chosen.clone(),
            api_key: keys[key_idx].clone(),
        })
    }

    /// Run `attempt` against selected channels, excluding each failing
    /// channel and retrying while the failure is retryable. Failed attempts
    /// are recorded here; the *caller* records success once the response
    /// (or stream) actually completes.
    pub async fn select_with_retry<T, F, Fut>(
        &self,
        model: &str,
        group: &str,
        strategy: SelectionStrategy,
        max_attempts: u32,
        mut attempt: F,
    ) -> RelayResult<(T, u32)>
    where
        F: FnMut(SelectedChannel, u32) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut excluded: Vec<i64> = Vec::new();
        for attempt_no in 1..=max_attempts {
            let selected = match self.select(model, group, &excluded, strategy).await {
                Ok(selected) => selected,
                Err(err) if attempt_no == 1 => return Err(err),
                // Pool exhausted mid-retry: report in terms of attempts.
                Err(_) => break,
            };
            let channel_id = selected.channel.id;
            let started = Instant::now();
            match attempt(selected, attempt_no).await {
                Ok(value) => return Ok((value, attempt_no)),
                Err(err) => {
                    self.record(channel_id, false, started.elapsed()).await;
                    if !err.retryable {
                        return Err(RelayError::Upstream(err));
                    }
                    tracing::debug!(
                        channel_id,
                        attempt_no,
                        error = %err,
                        "retryable upstream failure, switching channel"
                    );
                    excluded.push(channel_id);
                    if attempt_no < max_attempts {
                        let backoff = rand::rng().random_range(RETRY_BACKOFF_MS);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(RelayError::UpstreamExhausted {
            attempts: max_attempts,
        })
    }

    /// Update rolling stats after an attempt; flips the channel off after
    /// too many consecutive retryable failures.
    pub async fn record(&self, channel_id: i64, ok: bool, latency: Duration) {
        let disable = {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            let entry = stats.entry(channel_id).or_default();
            entry.observe(ok, latency);
            !ok && entry.consecutive_failures >= self.config.auto_disable_threshold
                && entry.failure_rate() >= self.config.failure_rate_threshold
        };
        if disable {
            self.set_enabled(channel_id, false).await;
            tracing::warn!(channel_id, "channel auto-disabled after consecutive failures");
        }
    }

    /// Flip a channel's enabled flag in storage and in the live directory.
    /// Also used by the health checker for recovery.
    pub async fn set_enabled(&self, channel_id: i64, enabled: bool) {
        if let Err(err) = self.storage.set_channel_enabled(channel_id, enabled).await {
            tracing::warn!(channel_id, error = %err, "persisting enabled flag failed");
        }
        let current = self.channels.load();
        let next: Vec<Arc<ChannelRow>> = current
            .iter()
            .map(|channel| {
                if channel.id == channel_id {
                    let mut row = channel.as_ref().clone();
                    row.enabled = enabled;
                    Arc::new(row)
                } else {
                    channel.clone()
                }
            })
            .collect();
        self.channels.store(Arc::new(next));
        self.eligible_cache.lock().await.clear();
        if enabled {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = stats.get_mut(&channel_id) {
                entry.consecutive_failures = 0;
            }
        }
    }

    pub fn stats(&self, channel_id: i64) -> Option<ChannelStats> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_id)
            .cloned()
    }

    /// All channels (enabled or not), for `/v1/models` and the health
    /// checker.
    pub fn channels(&self) -> Vec<Arc<ChannelRow>> {
        self.channels.load().iter().cloned().collect()
    }

    /// Whether any enabled channel exposes the model at all; distinguishes
    /// 404 (unknown model) from 503 (known but nothing eligible).
    pub async fn model_known(&self, model: &str) -> bool {
        self.maybe_refresh().await;
        self.channels
            .load()
            .iter()
            .any(|channel| channel.enabled && channel.supports_model(model))
    }

    fn pick_weighted<'a>(&self, candidates: &[&'a Arc<ChannelRow>]) -> &'a Arc<ChannelRow> {
        let total: u64 = candidates
            .iter()
            .map(|c| c.weight.max(1) as u64)
            .sum();
        let mut draw = rand::rng().random_range(0..total);
        for candidate in candidates {
            let weight = candidate.weight.max(1) as u64;
            if draw < weight {
                return *candidate;
            }
            draw -= weight;
        }
        candidates[candidates.len() - 1]
    }

    fn pick_priority<'a>(&self, candidates: &[&'a Arc<ChannelRow>]) -> &'a Arc<ChannelRow> {
        let top = candidates
            .iter()
            .map(|c| c.priority)
            .max()
            .unwrap_or_default();
        let tier: Vec<&Arc<ChannelRow>> = candidates
            .iter()
            .filter(|c| c.priority == top)
            .copied()
            .collect();
        self.pick_weighted(&tier)
    }

    fn pick_round_robin<'a>(&self, candidates: &[&'a Arc<ChannelRow>]) -> &'a Arc<ChannelRow> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        candidates[idx]
    }

    fn pick_lowest_latency<'a>(&self, candidates: &[&'a Arc<ChannelRow>]) -> &'a Arc<ChannelRow> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let best = candidates
            .iter()
            .filter_map(|candidate| {
                stats
                    .get(&candidate.id)
                    .and_then(|s| s.ema_latency_ms)
                    .map(|ema| (*candidate, ema))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        drop(stats);
        match best {
            Some((candidate, _)) => candidate,
            // No latency data yet: fall back to the weighted draw.
            None => self.pick_weighted(candidates),
        }
    }

    fn pick_random<'a>(&self, candidates: &[&'a Arc<ChannelRow>]) -> &'a Arc<ChannelRow> {
        candidates[rand::rng().random_range(0..candidates.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_adapter::AdapterErrorCode;
    use modelgate_storage::MemStorage;

    fn channel(id: i64, weight: i32, priority: i32) -> ChannelRow {
        let now = OffsetDateTime::UNIX_EPOCH;
        ChannelRow {
            id,
            name: format!("ch{id}"),
            adapter: "openai".to_string(),
            base_url: None,
            api_keys: vec![format!("key-{id}")],
            models: vec!["gpt-3.5-turbo".to_string(), "gpt-4*".to_string()],
            groups: vec!["default".to_string()],
            test_model: None,
            priority,
            weight,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn selector(channels: Vec<ChannelRow>) -> ChannelSelector {
        let storage = Arc::new(MemStorage::new());
        for channel in &channels {
            storage.seed_channel(channel.clone());
        }
        ChannelSelector::new(storage, channels, SelectorConfig::default())
    }

    #[tokio::test]
    async fn eligibility_filters_model_group_excluded() {
        let selector = selector(vec![channel(1, 1, 0), channel(2, 1, 0)]);

        let err = selector
            .select("claude-3-haiku", "default", &[], SelectionStrategy::Random)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoEligibleChannel { .. }));

        let err = selector
            .select("gpt-3.5-turbo", "vip", &[], SelectionStrategy::Random)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoEligibleChannel { .. }));

        let picked = selector
            .select("gpt-3.5-turbo", "default", &[1], SelectionStrategy::Random)
            .await
            .unwrap();
        assert_eq!(picked.channel.id, 2);

        // Prefix pattern matches.
        assert!(
            selector
                .select("gpt-4o-mini", "default", &[], SelectionStrategy::Weight)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn weighted_draw_reaches_every_channel() {
        let selector = selector(vec![channel(1, 10, 0), channel(2, 10, 0), channel(3, 10, 0)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..60 {
            let picked = selector
                .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::Weight)
                .await
                .unwrap();
            seen.insert(picked.channel.id);
        }
        assert_eq!(seen.len(), 3, "every equal-weight channel should be hit");
    }

    #[tokio::test]
    async fn priority_wins_over_weight() {
        let selector = selector(vec![channel(1, 100, 0), channel(2, 1, 5)]);
        for _ in 0..10 {
            let picked = selector
                .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::Priority)
                .await
                .unwrap();
            assert_eq!(picked.channel.id, 2);
        }
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let selector = selector(vec![channel(1, 1, 0), channel(2, 1, 0)]);
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                selector
                    .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::RoundRobin)
                    .await
                    .unwrap()
                    .channel
                    .id,
            );
        }
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
    }

    #[tokio::test]
    async fn lowest_latency_prefers_fast_channel() {
        let selector = selector(vec![channel(1, 1, 0), channel(2, 1, 0)]);
        selector.record(1, true, Duration::from_millis(500)).await;
        selector.record(2, true, Duration::from_millis(20)).await;
        for _ in 0..5 {
            let picked = selector
                .select(
                    "gpt-3.5-turbo",
                    "default",
                    &[],
                    SelectionStrategy::LowestLatency,
                )
                .await
                .unwrap();
            assert_eq!(picked.channel.id, 2);
        }
    }

    #[tokio::test]
    async fn auto_disable_after_consecutive_failures() {
        let selector = selector(vec![channel(1, 1, 0)]);
        for _ in 0..3 {
            selector.record(1, false, Duration::from_millis(10)).await;
        }
        let err = selector
            .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::Weight)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoEligibleChannel { .. }));

        let stats = selector.stats(1).unwrap();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.consecutive_failures, 3);

        // Health checker recovery path.
        selector.set_enabled(1, true).await;
        assert!(
            selector
                .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::Weight)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let selector = selector(vec![channel(1, 1, 0)]);
        selector.record(1, false, Duration::from_millis(10)).await;
        selector.record(1, false, Duration::from_millis(10)).await;
        selector.record(1, true, Duration::from_millis(10)).await;
        selector.record(1, false, Duration::from_millis(10)).await;
        assert!(
            selector
                .select("gpt-3.5-turbo", "default", &[], SelectionStrategy::Weight)
                .await
                .is_ok(),
            "channel must stay enabled when failures are not consecutive"
        );
    }

    #[tokio::test]
    async fn retry_switches_channel_and_reports_exhaustion() {
        let selector = selector(vec![channel(1, 1, 0), channel(2, 1, 0)]);
        let mut tried: Vec<i64> = Vec::new();

        let result: RelayResult<(i64, u32)> = selector
            .select_with_retry(
                "gpt-3.5-turbo",
                "default",
                SelectionStrategy::Weight,
                3,
                |selected, _attempt| {
                    tried.push(selected.channel.id);
                    async move {
                        Err(AdapterError::from_status(503, "unavailable"))
                    }
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(RelayError::UpstreamExhausted { attempts: 3 })
        ));
        // Both channels were tried; the failing one was excluded.
        assert_eq!(tried.len(), 2);
        assert_ne!(tried[0], tried[1]);
    }

    #[tokio::test]
    async fn non_retryable_stops_the_loop() {
        let selector = selector(vec![channel(1, 1, 0), channel(2, 1, 0)]);
        let mut attempts = 0;
        let result: RelayResult<((), u32)> = selector
            .select_with_retry(
                "gpt-3.5-turbo",
                "default",
                SelectionStrategy::Weight,
                3,
                |_selected, _attempt| {
                    attempts += 1;
                    async move {
                        Err(AdapterError::from_status(400, "bad request"))
                    }
                },
            )
            .await;
        assert_eq!(attempts, 1);
        match result {
            Err(RelayError::Upstream(err)) => {
                assert_eq!(err.code, AdapterErrorCode::UpstreamClientError)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failover_succeeds_on_second_channel() {
        let selector = selector(vec![channel(1, 10, 0), channel(2, 10, 0)]);
        let mut failed_first: Option<i64> = None;

        let (winner, attempts) = selector
            .select_with_retry(
                "gpt-3.5-turbo",
                "default",
                SelectionStrategy::Weight,
                3,
                |selected, attempt| {
                    if attempt == 1 {
                        failed_first = Some(selected.channel.id);
                    }
                    async move {
                        if attempt == 1 {
                            Err(AdapterError::from_status(500, "boom"))
                        } else {
                            Ok(selected.channel.id)
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        assert_ne!(Some(winner), failed_first);
        // Failure was recorded against the first channel only.
        let failed = failed_first.unwrap();
        assert_eq!(selector.stats(failed).unwrap().failures, 1);
        assert!(selector.stats(winner).is_none());
    }
}
